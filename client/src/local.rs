//! Memory-map blocks from this node's cache directory.

use crate::{
    lock::{LockRegistry, Tracker},
    BlockLocator, Buffer, Lookup, Master,
};
use memmap2::Mmap;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tracing::{debug, info};

/// Reads blocks cached on this node.
pub struct LocalReader<M: Master> {
    master: Arc<M>,
    locks: Arc<LockRegistry>,
}

impl<M: Master> LocalReader<M> {
    pub fn new(master: Arc<M>, locks: Arc<LockRegistry>) -> Self {
        Self { master, locks }
    }

    /// Maps the block described by `locator`, if it is cached on this node.
    ///
    /// The block is locked before the cache directory is touched. If the block cannot be
    /// mapped, the lock is released before returning [Lookup::Miss]. If `tracker` is provided,
    /// the block index is tracked for as long as the lock is held.
    pub fn try_read(&self, locator: &BlockLocator, tracker: Option<&Arc<Tracker>>) -> Lookup {
        let Some(root) = self.master.cache_root() else {
            return Lookup::Miss;
        };

        // Lock before opening so the block cannot be evicted mid-map
        let lock = match self.locks.acquire(locator.block_id) {
            Ok(lock) => lock,
            Err(err) => {
                debug!(?err, block = locator.block_id, "failed to lock block");
                return Lookup::Miss;
            }
        };
        let lock = match tracker {
            Some(tracker) => lock.track(tracker.clone(), locator.index),
            None => lock,
        };

        let path = root.join(locator.block_id.to_string());
        let buffer = match map(&path) {
            Ok(Some(mmap)) => Buffer::mapped(locator.block_id, mmap, lock),
            Ok(None) => Buffer::empty(locator.block_id, lock),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "block is not on local disk");
                return Lookup::Miss;
            }
            Err(err) => {
                info!(?err, path = %path.display(), "failed to read local block");
                return Lookup::Miss;
            }
        };
        self.master.access_block(locator.block_id);
        Lookup::Found(buffer)
    }
}

/// Maps `path` read-only. Empty files cannot be mapped and yield `None`.
fn map(path: &Path) -> std::io::Result<Option<Mmap>> {
    let file = fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }

    // Safety: cache files are written to a staging path and renamed into place once complete,
    // so a mapped file is never modified. The held lock prevents eviction while mapped.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(mmap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks, Origin};
    use commonware_macros::test_traced;
    use prometheus_client::metrics::gauge::Gauge;
    use tempfile::TempDir;

    fn setup(root: Option<&Path>) -> (mocks::Master, mocks::Locker, LocalReader<mocks::Master>) {
        let master = mocks::Master::new(root.map(Path::to_path_buf));
        let locker = mocks::Locker::default();
        let locks = LockRegistry::new(Arc::new(locker.clone()), Gauge::default());
        let reader = LocalReader::new(Arc::new(master.clone()), locks);
        (master, locker, reader)
    }

    #[test_traced]
    fn test_found_holds_lock_until_close() {
        let dir = TempDir::new().unwrap();
        let (master, locker, reader) = setup(Some(dir.path()));
        let file = master.add_file(1, 16, 11, "unused");
        let locator = master.locator_of(file, 0);
        fs::write(dir.path().join(locator.block_id.to_string()), b"cached data").unwrap();

        let tracker = Arc::new(Tracker::default());
        let buffer = reader.try_read(&locator, Some(&tracker)).into_found().unwrap();
        assert_eq!(&buffer[..], b"cached data");
        assert_eq!(buffer.origin(), Origin::Local);
        assert_eq!(locker.held().len(), 1);
        assert!(tracker.contains(0));
        assert_eq!(master.accessed(), vec![locator.block_id]);

        buffer.close().unwrap();
        assert_eq!(locker.acquires(), locker.releases());
        assert!(tracker.is_empty());
    }

    #[test_traced]
    fn test_miss_releases_lock() {
        let dir = TempDir::new().unwrap();
        let (master, locker, reader) = setup(Some(dir.path()));
        let file = master.add_file(1, 16, 16, "unused");
        let locator = master.locator_of(file, 0);

        let tracker = Arc::new(Tracker::default());
        for _ in 0..3 {
            assert!(reader.try_read(&locator, Some(&tracker)).is_miss());
        }
        assert_eq!(locker.acquires(), 3);
        assert_eq!(locker.releases(), 3);
        assert!(locker.held().is_empty());
        assert!(tracker.is_empty());
        assert!(master.accessed().is_empty());
    }

    #[test]
    fn test_directory_in_place_of_block() {
        let dir = TempDir::new().unwrap();
        let (master, locker, reader) = setup(Some(dir.path()));
        let file = master.add_file(1, 16, 16, "unused");
        let locator = master.locator_of(file, 0);
        fs::create_dir(dir.path().join(locator.block_id.to_string())).unwrap();

        assert!(reader.try_read(&locator, None).is_miss());
        assert_eq!(locker.acquires(), locker.releases());
    }

    #[test]
    fn test_no_cache_root_skips_locking() {
        let (master, locker, reader) = setup(None);
        let file = master.add_file(1, 16, 16, "unused");
        let locator = master.locator_of(file, 0);
        assert!(reader.try_read(&locator, None).is_miss());
        assert_eq!(locker.acquires(), 0);
    }

    #[test]
    fn test_lock_failure_is_miss() {
        let dir = TempDir::new().unwrap();
        let (master, locker, reader) = setup(Some(dir.path()));
        let file = master.add_file(1, 16, 4, "unused");
        let locator = master.locator_of(file, 0);
        fs::write(dir.path().join(locator.block_id.to_string()), b"data").unwrap();
        locker.fail(true);
        assert!(reader.try_read(&locator, None).is_miss());
        assert_eq!(locker.releases(), 0);
    }

    #[test]
    fn test_empty_block() {
        let dir = TempDir::new().unwrap();
        let (master, locker, reader) = setup(Some(dir.path()));
        let file = master.add_file(1, 16, 0, "unused");
        let locator = master.locator_of(file, 0);
        fs::write(dir.path().join(locator.block_id.to_string()), b"").unwrap();

        let buffer = reader.try_read(&locator, None).into_found().unwrap();
        assert!(buffer.is_empty());
        drop(buffer);
        assert_eq!(locker.acquires(), 1);
        assert_eq!(locker.releases(), 1);
    }
}
