//! Read blocks from local memory, remote cache nodes, or persistent storage.
//!
//! # Overview
//!
//! Files are split into fixed-size blocks. Each block may be resident in the memory tier of one
//! or more cache nodes (as a file named after its block id in the node's cache directory) and
//! is always recoverable from the file's checkpoint in persistent ("under") storage. Given a
//! [BlockLocator], the [Client] produces a read-only [Buffer] for the block by trying, in order:
//!
//! 1. A memory-mapped read of `<cache_root>/<block_id>` on this node ([local]).
//! 2. A fetch from each remote node the [Master] lists as holding the block ([remote]).
//! 3. Nothing: the read is a [Lookup::Miss] and the caller decides what to do next.
//!
//! [File] wraps these primitives into [std::io::Read] streams ([stream]) that fall back to
//! persistent storage on a miss and, when asked to, repopulate the cache in the background
//! ([recache]).
//!
//! # Locks
//!
//! A block's cache file must not be evicted while it is mapped. Before touching the cache
//! directory, the local reader acquires a lock with a fresh lock id from the [Locker]. The lock
//! is owned by the returned [Buffer] and is released exactly once: when the buffer is closed,
//! when it is dropped, or immediately if the block could not be mapped.
//!
//! # Services
//!
//! The metadata service ([Master]), the lock service ([Locker]), persistent storage
//! ([store::UnderStore]) and the cache write path ([cache::Cache]) are external collaborators
//! consumed through traits. [mocks] provides in-process implementations for testing.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use std::path::PathBuf;
use thiserror::Error;

mod buffer;
pub mod cache;
mod client;
mod config;
pub mod coordinator;
mod file;
pub mod local;
pub mod lock;
mod metrics;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod recache;
pub mod remote;
pub mod store;
pub mod stream;

pub use buffer::{Buffer, Origin};
pub use client::Client;
pub use config::Config;
pub use file::File;
pub use metrics::Metrics;
pub use stream::{InStream, ReadType};

/// Globally unique identifier of a block. Valid ids are never negative.
pub type BlockId = i64;

/// Identifier of a file.
pub type FileId = u64;

/// Identifier of a single lock acquisition.
pub type LockId = u64;

/// A node that may hold a block in memory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub host: String,
    /// Control port of the node, or [Location::NOT_IN_MEMORY].
    pub port: i32,
}

impl Location {
    /// Port reported for nodes that know of the block but do not hold it in memory.
    pub const NOT_IN_MEMORY: i32 = -1;

    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns true if the node holds the block in memory.
    pub fn is_resident(&self) -> bool {
        self.port != Self::NOT_IN_MEMORY
    }

    /// The port serving block data, which is always one above the control port.
    ///
    /// Returns `None` if the result is not a dialable TCP port.
    pub fn data_port(&self) -> Option<u16> {
        if self.port < 0 {
            return None;
        }
        let port = u16::try_from(self.port.checked_add(1)?).ok()?;
        (port != 0).then_some(port)
    }
}

/// Everything needed to locate a block.
///
/// Produced by the [Master]. The location list is a snapshot and may be stale by the time it
/// is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockLocator {
    pub block_id: BlockId,
    pub file_id: FileId,
    pub index: usize,
    /// Declared length of the block in bytes.
    pub length: u64,
    /// Candidate nodes, in the order they should be tried.
    pub locations: Vec<Location>,
}

/// Result of reading a block from the cache tiers.
#[derive(Debug)]
pub enum Lookup {
    Found(Buffer),
    Miss,
}

impl Lookup {
    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }

    pub fn into_found(self) -> Option<Buffer> {
        match self {
            Lookup::Found(buffer) => Some(buffer),
            Lookup::Miss => None,
        }
    }
}

/// The metadata service.
pub trait Master: Send + Sync + 'static {
    /// Returns the locator of block `index` of `file`.
    fn locator(&self, file: FileId, index: usize) -> Result<BlockLocator, Error>;

    /// Returns the number of blocks in `file`.
    fn block_count(&self, file: FileId) -> Result<usize, Error>;

    /// Returns true once every block of `file` has been written.
    fn is_complete(&self, file: FileId) -> Result<bool, Error>;

    /// Returns the length of `file` in bytes.
    fn file_length(&self, file: FileId) -> Result<u64, Error>;

    /// Returns the block size of `file` in bytes.
    fn block_size(&self, file: FileId) -> Result<u64, Error>;

    /// Returns the path of the checkpoint of `file` in persistent storage.
    fn checkpoint_path(&self, file: FileId) -> Result<String, Error>;

    /// Returns the cache directory of this node, if it has a memory tier.
    fn cache_root(&self) -> Option<PathBuf>;

    /// Records that a locally cached block was read (used for eviction recency).
    fn access_block(&self, block: BlockId);

    /// Records that `block` has been written to this node's cache.
    fn cache_block(&self, block: BlockId, length: u64) -> Result<(), Error>;
}

/// The lock service protecting cached blocks from eviction.
pub trait Locker: Send + Sync + 'static {
    fn lock(&self, block: BlockId, lock: LockId) -> Result<(), Error>;
    fn unlock(&self, block: BlockId, lock: LockId) -> Result<(), Error>;
}

/// Errors that can occur when reading blocks.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("file not complete: {0}")]
    NotComplete(FileId),
    #[error("wire error: {0}")]
    Wire(#[from] tiercache_wire::Error),
    #[error("response for block {received} does not match request for {requested}")]
    MismatchedResponse { requested: BlockId, received: BlockId },
    #[error("block {block} has length {expected}, remote sent {received} bytes")]
    LengthMismatch {
        block: BlockId,
        expected: u64,
        received: u64,
    },
    #[error("remote unreachable: {0}: {1}")]
    RemoteUnreachable(String, std::io::Error),
    #[error("persistent store error: {0}")]
    PersistentStore(std::io::Error),
    #[error("cache error: {0}")]
    Cache(std::io::Error),
    #[error("no cache directory configured")]
    NoCache,
    #[error("lock error: {0}")]
    Lock(String),
    #[error("master error: {0}")]
    Master(String),
    #[error("block unavailable: {0}")]
    BlockUnavailable(BlockId),
    #[error("thread pool build failed: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
    #[error("canceled")]
    Canceled,
}
