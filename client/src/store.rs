//! Read checkpoints from persistent storage.

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

/// The persistent ("under") storage holding file checkpoints.
pub trait UnderStore: Send + Sync + 'static {
    /// Opens the checkpoint at `path` for sequential reading from its start.
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Resolves checkpoint paths on the local filesystem.
///
/// Paths may carry a `file://` scheme. Relative paths are resolved against the root, if any.
#[derive(Clone, Debug, Default)]
pub struct LocalStore {
    root: Option<PathBuf>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path.strip_prefix("file://").unwrap_or(path));
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl UnderStore for LocalStore {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = fs::File::open(self.resolve(path))?;
        Ok(Box::new(io::BufReader::new(file)))
    }
}

/// Discards the next `n` bytes of `src`.
///
/// Fails with [io::ErrorKind::UnexpectedEof] if `src` ends first.
pub(crate) fn skip<R: Read + ?Sized>(src: &mut R, n: u64) -> io::Result<()> {
    let skipped = io::copy(&mut (&mut *src).take(n), &mut io::sink())?;
    if skipped < n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("skipped {skipped} of {n} bytes"),
        ));
    }
    Ok(())
}
