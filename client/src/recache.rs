//! Repopulate the cache from persistent storage.
//!
//! A recache streams one block's bytes from the file's checkpoint into a staged cache write.
//! The block only becomes visible (and is only reported to the [Master]) once every declared
//! byte has been written; on any failure the staged write is discarded.

use crate::{
    cache::{BlockWriter, Cache},
    store::{self, UnderStore},
    BlockLocator, Error, FileId, Master, Metrics,
};
use std::{
    io::{self, Read},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Copies blocks from an [UnderStore] into a [Cache].
pub struct Recacher<M: Master> {
    master: Arc<M>,
    store: Arc<dyn UnderStore>,
    cache: Option<Arc<dyn Cache>>,
    buffer_size: usize,
    metrics: Arc<Metrics>,
}

impl<M: Master> Recacher<M> {
    pub fn new(
        master: Arc<M>,
        store: Arc<dyn UnderStore>,
        cache: Option<Arc<dyn Cache>>,
        buffer_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            master,
            store,
            cache,
            buffer_size: buffer_size.max(1),
            metrics,
        }
    }

    /// Recaches block `index` of `file`. Returns true if the block is now cached.
    pub fn recache_block(&self, file: FileId, index: usize) -> bool {
        match self.try_recache(file, index) {
            Ok(locator) => {
                self.metrics.recache_success.inc();
                info!(file, index, block = locator.block_id, "recached block");
                true
            }
            Err(Error::NoCache) => {
                debug!(file, index, "no cache to recache into");
                self.metrics.recache_failure.inc();
                false
            }
            Err(err) => {
                self.metrics.recache_failure.inc();
                warn!(?err, file, index, "failed to recache block");
                false
            }
        }
    }

    /// Recaches every block of `file`. Returns true only if every block was recached.
    ///
    /// A failed block does not stop the remaining blocks from being attempted.
    pub fn recache_all(&self, file: FileId) -> bool {
        let count = match self.master.block_count(file) {
            Ok(count) => count,
            Err(err) => {
                warn!(?err, file, "failed to count blocks");
                return false;
            }
        };
        (0..count).fold(true, |ok, index| self.recache_block(file, index) & ok)
    }

    fn try_recache(&self, file: FileId, index: usize) -> Result<BlockLocator, Error> {
        let cache = self.cache.as_ref().ok_or(Error::NoCache)?;
        let count = self.master.block_count(file)?;
        if index >= count {
            return Err(Error::InvalidArgument(format!(
                "block index {index} out of range for file {file} with {count} blocks"
            )));
        }
        let locator = self.master.locator(file, index)?;
        let block_size = self.master.block_size(file)?;
        let path = self.master.checkpoint_path(file)?;
        let offset = (index as u64)
            .checked_mul(block_size)
            .ok_or_else(|| Error::InvalidArgument(format!("block {index} offset overflows")))?;

        let mut src = self.store.open(&path).map_err(Error::PersistentStore)?;
        store::skip(&mut src, offset).map_err(Error::PersistentStore)?;

        let mut writer = cache.create(&locator).map_err(Error::Cache)?;
        if let Err(err) = self.copy_block(&mut src, &mut writer, locator.length) {
            if let Err(err) = writer.cancel() {
                warn!(?err, block = locator.block_id, "failed to cancel cache write");
            }
            return Err(err);
        }
        writer.commit().map_err(Error::Cache)?;
        self.master.cache_block(locator.block_id, locator.length)?;
        Ok(locator)
    }

    /// Copies exactly `length` bytes from `src` to `dst`.
    fn copy_block(
        &self,
        src: &mut dyn Read,
        dst: &mut Box<dyn BlockWriter>,
        length: u64,
    ) -> Result<(), Error> {
        let mut buf = vec![0; self.buffer_size];
        let mut remaining = length;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
            let n = match src.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(Error::PersistentStore(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("checkpoint ended {remaining} bytes before end of block"),
                    )))
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::PersistentStore(err)),
            };
            dst.write_all(&buf[..n]).map_err(Error::Cache)?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::DirectoryCache, mocks};
    use commonware_macros::test_traced;
    use std::{fs, path::Path};
    use tempfile::TempDir;

    fn recacher(
        master: &mocks::Master,
        store: &mocks::Store,
        cache: Option<Arc<dyn Cache>>,
    ) -> (Recacher<mocks::Master>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::default());
        let recacher = Recacher::new(
            Arc::new(master.clone()),
            Arc::new(store.clone()),
            cache,
            3,
            metrics.clone(),
        );
        (recacher, metrics)
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test_traced]
    fn test_recache_all() {
        let dir = TempDir::new().unwrap();
        let master = mocks::Master::new(Some(dir.path().to_path_buf()));
        let store = mocks::Store::default();
        store.insert("ckpt", b"0123456789");
        let file = master.add_file(1, 4, 10, "ckpt");
        let cache = Arc::new(DirectoryCache::new(dir.path()));
        let (recacher, metrics) = recacher(&master, &store, Some(cache));

        assert!(recacher.recache_all(file));
        let blocks: Vec<_> = (0..3).map(|i| master.locator_of(file, i).block_id).collect();
        for (block, expected) in blocks.iter().zip([&b"0123"[..], b"4567", b"89"]) {
            assert_eq!(fs::read(dir.path().join(block.to_string())).unwrap(), expected);
        }
        assert_eq!(master.cached(), vec![(blocks[0], 4), (blocks[1], 4), (blocks[2], 2)]);
        assert_eq!(metrics.recache_success.get(), 3);
    }

    #[test_traced]
    fn test_short_checkpoint_fails_last_block() {
        let dir = TempDir::new().unwrap();
        let master = mocks::Master::new(Some(dir.path().to_path_buf()));
        let store = mocks::Store::default();
        store.insert("ckpt", b"0123456789");
        let file = master.add_file(1, 4, 12, "ckpt");
        let cache = Arc::new(DirectoryCache::new(dir.path()));
        let (recacher, metrics) = recacher(&master, &store, Some(cache));

        assert!(!recacher.recache_all(file));
        let blocks: Vec<_> = (0..3).map(|i| master.locator_of(file, i).block_id).collect();
        let mut expected = vec![blocks[0].to_string(), blocks[1].to_string()];
        expected.sort();
        assert_eq!(files(dir.path()), expected);
        assert_eq!(master.cached().len(), 2);
        assert_eq!(metrics.recache_success.get(), 2);
        assert_eq!(metrics.recache_failure.get(), 1);
    }

    #[test_traced]
    fn test_failed_write_is_canceled() {
        let master = mocks::Master::new(None);
        let store = mocks::Store::default();
        store.insert("ckpt", b"0123456789");
        let file = master.add_file(1, 10, 10, "ckpt");
        let cache = mocks::FailingCache::new(4);
        let (recacher, _) = recacher(&master, &store, Some(Arc::new(cache.clone())));

        assert!(!recacher.recache_block(file, 0));
        assert_eq!(cache.canceled(), 1);
        assert_eq!(cache.committed(), 0);
        assert!(master.cached().is_empty());
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let master = mocks::Master::new(Some(dir.path().to_path_buf()));
        let store = mocks::Store::default();
        let file = master.add_file(1, 4, 4, "missing");
        let cache = Arc::new(DirectoryCache::new(dir.path()));
        let (recacher, _) = recacher(&master, &store, Some(cache));

        assert!(!recacher.recache_block(file, 0));
        assert!(files(dir.path()).is_empty());
    }

    #[test]
    fn test_out_of_range_block() {
        let dir = TempDir::new().unwrap();
        let master = mocks::Master::new(Some(dir.path().to_path_buf()));
        let store = mocks::Store::default();
        store.insert("ckpt", b"0123456789");
        let file = master.add_file(1, 4, 10, "ckpt");
        let cache = Arc::new(DirectoryCache::new(dir.path()));
        let (recacher, metrics) = recacher(&master, &store, Some(cache));

        assert!(!recacher.recache_block(file, 3));
        assert_eq!(store.opens(), 0);
        assert!(master.cached().is_empty());
        assert!(files(dir.path()).is_empty());
        assert_eq!(metrics.recache_failure.get(), 1);
    }

    #[test]
    fn test_no_cache_skips_store() {
        let master = mocks::Master::new(None);
        let store = mocks::Store::default();
        store.insert("ckpt", b"0123");
        let file = master.add_file(1, 4, 4, "ckpt");
        let (recacher, _) = recacher(&master, &store, None);

        assert!(!recacher.recache_block(file, 0));
        assert_eq!(store.opens(), 0);
    }

    #[test]
    fn test_empty_file() {
        let master = mocks::Master::new(None);
        let store = mocks::Store::default();
        let file = master.add_file(1, 4, 0, "ckpt");
        let (recacher, _) = recacher(&master, &store, None);
        assert!(recacher.recache_all(file));
        assert_eq!(store.opens(), 0);
    }
}
