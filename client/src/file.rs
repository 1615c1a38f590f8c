use crate::{
    lock::Tracker,
    stream::{BlockReader, FileStream},
    store, BlockId, Client, Error, FileId, InStream, Lookup, Master, ReadType,
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, warn};

/// A handle to an open file.
///
/// Cloning a [File] shares the set of blocks locked through it.
pub struct File<M: Master> {
    client: Client<M>,
    id: FileId,
    locked: Arc<Tracker>,
}

impl<M: Master> Clone for File<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            id: self.id,
            locked: self.locked.clone(),
        }
    }
}

impl<M: Master> File<M> {
    pub(crate) fn new(client: Client<M>, id: FileId) -> Self {
        Self {
            client,
            id,
            locked: Arc::new(Tracker::default()),
        }
    }

    pub(crate) fn client(&self) -> &Client<M> {
        &self.client
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn length(&self) -> Result<u64, Error> {
        self.client.master().file_length(self.id)
    }

    pub fn block_count(&self) -> Result<usize, Error> {
        self.client.master().block_count(self.id)
    }

    pub fn block_size(&self) -> Result<u64, Error> {
        self.client.master().block_size(self.id)
    }

    pub fn is_complete(&self) -> Result<bool, Error> {
        self.client.master().is_complete(self.id)
    }

    pub fn checkpoint_path(&self) -> Result<String, Error> {
        self.client.master().checkpoint_path(self.id)
    }

    /// Returns the id of block `index`.
    pub fn block_id(&self, index: usize) -> Result<BlockId, Error> {
        Ok(self.client.master().locator(self.id, index)?.block_id)
    }

    /// Returns the hosts holding each block in memory, in block order.
    pub fn location_hosts(&self) -> Result<Vec<Vec<String>>, Error> {
        (0..self.block_count()?)
            .map(|index| {
                let locator = self.client.master().locator(self.id, index)?;
                Ok(locator
                    .locations
                    .into_iter()
                    .filter(|location| location.is_resident())
                    .map(|location| location.host)
                    .collect())
            })
            .collect()
    }

    /// Indices of the blocks currently locked through this file.
    pub fn locked_blocks(&self) -> BTreeSet<usize> {
        self.locked.snapshot().into_iter().collect()
    }

    fn ensure_complete(&self) -> Result<(), Error> {
        if !self.is_complete()? {
            return Err(Error::NotComplete(self.id));
        }
        Ok(())
    }

    /// Opens a stream over the whole file.
    pub fn in_stream(&self, read_type: ReadType) -> Result<InStream<M>, Error> {
        self.ensure_complete()?;
        let count = self.block_count()?;
        debug!(file = self.id, count, %read_type, "opening stream");
        match count {
            0 => Ok(InStream::Empty),
            1 => Ok(InStream::Block(self.open_block(0, read_type)?)),
            _ => Ok(InStream::File(FileStream::new(
                self.clone(),
                read_type,
                count,
                self.client.config().readahead,
            ))),
        }
    }

    /// Reads block `index` from the cache tiers.
    pub fn read_block(&self, index: usize) -> Result<Lookup, Error> {
        self.ensure_complete()?;
        let count = self.block_count()?;
        if index >= count {
            return Err(Error::InvalidArgument(format!(
                "block index {index} out of range for file {} with {count} blocks",
                self.id
            )));
        }
        let locator = self.client.master().locator(self.id, index)?;
        Ok(self.client.read_tracked(&locator, Some(&self.locked)))
    }

    /// Reads a single-block file from the cache tiers.
    ///
    /// An empty file yields [Lookup::Miss].
    pub fn read_buffer(&self) -> Result<Lookup, Error> {
        self.ensure_complete()?;
        match self.block_count()? {
            0 => Ok(Lookup::Miss),
            1 => self.read_block(0),
            count => Err(Error::InvalidArgument(format!(
                "file {} has {count} blocks, expected at most one",
                self.id
            ))),
        }
    }

    /// Recaches every block of the file.
    pub fn recache(&self) -> bool {
        self.client.recache_all(self.id)
    }

    /// Recaches block `index`. Returns false if the file has no such block.
    pub fn recache_block(&self, index: usize) -> bool {
        self.client.recache_block(self.id, index)
    }

    /// Opens block `index` from the cache tiers, falling back to persistent storage.
    pub(crate) fn open_block(
        &self,
        index: usize,
        read_type: ReadType,
    ) -> Result<BlockReader, Error> {
        let master = self.client.master();
        let locator = master.locator(self.id, index)?;
        if let Lookup::Found(buffer) = self.client.read_tracked(&locator, Some(&self.locked)) {
            return Ok(BlockReader::cached(buffer, locator.length));
        }

        let block_size = master.block_size(self.id)?;
        let path = master.checkpoint_path(self.id)?;
        let offset = (index as u64)
            .checked_mul(block_size)
            .ok_or(Error::BlockUnavailable(locator.block_id))?;
        let src = self
            .client
            .store()
            .open(&path)
            .and_then(|mut src| store::skip(&mut src, offset).map(|_| src));
        let src = match src {
            Ok(src) => src,
            Err(err) => {
                warn!(?err, block = locator.block_id, %path, "block unavailable");
                return Err(Error::BlockUnavailable(locator.block_id));
            }
        };
        if read_type.is_cache() {
            // The receiver is dropped: the read never waits on the recache
            drop(self.client.spawn_recache(self.id, index));
        }
        Ok(BlockReader::persistent(src, locator.length))
    }
}
