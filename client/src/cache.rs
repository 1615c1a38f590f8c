//! Write blocks into this node's cache directory.
//!
//! Blocks are never written in place. A [BlockWriter] stages the bytes under a hidden name and
//! only renames the staged file to `<root>/<block_id>` once it is complete, so a reader that maps
//! a cache file always sees a whole block.

use crate::BlockLocator;
use std::{
    fs,
    io::{self, BufWriter, Write},
    path::PathBuf,
};
use tracing::{debug, warn};

/// An in-progress write of a single block.
///
/// Dropping a writer without calling [BlockWriter::commit] discards it.
pub trait BlockWriter: Write + Send {
    /// Makes the written bytes visible as the cached block.
    fn commit(self: Box<Self>) -> io::Result<()>;

    /// Discards the written bytes.
    fn cancel(self: Box<Self>) -> io::Result<()>;
}

/// A destination for recached blocks.
pub trait Cache: Send + Sync + 'static {
    fn create(&self, locator: &BlockLocator) -> io::Result<Box<dyn BlockWriter>>;
}

/// Caches blocks as files in a directory.
#[derive(Clone, Debug)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl Cache for DirectoryCache {
    fn create(&self, locator: &BlockLocator) -> io::Result<Box<dyn BlockWriter>> {
        fs::create_dir_all(&self.root)?;
        let staging = self.root.join(format!(
            ".{}.{:016x}.staging",
            locator.block_id,
            rand::random::<u64>()
        ));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)?;
        debug!(path = %staging.display(), "staging block");
        Ok(Box::new(StagedWriter {
            file: Some(BufWriter::new(file)),
            staging,
            target: self.root.join(locator.block_id.to_string()),
        }))
    }
}

struct StagedWriter {
    file: Option<BufWriter<fs::File>>,
    staging: PathBuf,
    target: PathBuf,
}

impl StagedWriter {
    fn discard(&mut self) -> io::Result<()> {
        if self.file.take().is_none() {
            return Ok(());
        }
        match fs::remove_file(&self.staging) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

impl Write for StagedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("writer is finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl BlockWriter for StagedWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Err(io::Error::other("writer is finished"));
        };
        let result = file
            .into_inner()
            .map_err(|err| err.into_error())
            .and_then(|file| file.sync_all())
            .and_then(|_| fs::rename(&self.staging, &self.target));
        if result.is_err() {
            let _ = fs::remove_file(&self.staging);
        } else {
            debug!(path = %self.target.display(), "committed block");
        }
        result
    }

    fn cancel(mut self: Box<Self>) -> io::Result<()> {
        self.discard()
    }
}

impl Drop for StagedWriter {
    fn drop(&mut self) {
        if let Err(err) = self.discard() {
            warn!(?err, path = %self.staging.display(), "failed to remove staged block");
        }
    }
}
