use crate::{lock::LockHandle, BlockId, Error, LockId};
use bytes::Bytes;
use memmap2::Mmap;
use std::{fmt, ops::Deref};

/// The tier a [Buffer] was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

enum Backing {
    Mapped(Mmap),
    Empty,
    Owned(Bytes),
}

/// A read-only view over the bytes of a block.
///
/// Buffers mapped from the local cache own the lock that keeps the cache file from being
/// evicted. The lock is released by [Buffer::close] or, failing that, when the buffer is dropped.
pub struct Buffer {
    block: BlockId,
    // Dropped before `lock` so the mapping is gone before the file may be evicted.
    backing: Backing,
    lock: Option<LockHandle>,
}

impl Buffer {
    pub(crate) fn mapped(block: BlockId, mmap: Mmap, lock: LockHandle) -> Self {
        Self {
            block,
            backing: Backing::Mapped(mmap),
            lock: Some(lock),
        }
    }

    pub(crate) fn empty(block: BlockId, lock: LockHandle) -> Self {
        Self {
            block,
            backing: Backing::Empty,
            lock: Some(lock),
        }
    }

    pub(crate) fn remote(block: BlockId, bytes: Bytes) -> Self {
        Self {
            block,
            backing: Backing::Owned(bytes),
            lock: None,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block
    }

    pub fn origin(&self) -> Origin {
        match self.backing {
            Backing::Owned(_) => Origin::Remote,
            Backing::Mapped(_) | Backing::Empty => Origin::Local,
        }
    }

    /// The `(block, lock)` pair held by this buffer, if it was read from the local cache.
    pub fn lock(&self) -> Option<(BlockId, LockId)> {
        self.lock
            .as_ref()
            .map(|lock| (lock.block_id(), lock.lock_id()))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Empty => &[],
            Backing::Owned(bytes) => &bytes[..],
        }
    }

    /// Copies (or, for remote buffers, shares) the contents.
    pub fn to_bytes(&self) -> Bytes {
        match &self.backing {
            Backing::Owned(bytes) => bytes.clone(),
            _ => Bytes::copy_from_slice(self.as_slice()),
        }
    }

    /// Reads a native-endian `u32` at `offset`.
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        let end = offset.checked_add(4)?;
        let bytes = self.as_slice().get(offset..end)?;
        Some(u32::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Reads a native-endian `u64` at `offset`.
    pub fn u64_at(&self, offset: usize) -> Option<u64> {
        let end = offset.checked_add(8)?;
        let bytes = self.as_slice().get(offset..end)?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Unmaps the buffer and releases its lock, if any.
    pub fn close(mut self) -> Result<(), Error> {
        self.backing = Backing::Empty;
        match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("block", &self.block)
            .field("origin", &self.origin())
            .field("len", &self.len())
            .field("lock", &self.lock())
            .finish()
    }
}
