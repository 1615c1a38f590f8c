//! Sequential readers over the blocks of a [File].
//!
//! [File::in_stream] picks the cheapest stream for the file's shape: files without blocks read
//! nothing, single-block files read one block, and longer files advance block by block,
//! optionally opening the next block in the background while the current one is consumed.

use crate::{Buffer, Error, File, Master};
use futures::{channel::oneshot, executor::block_on};
use std::{
    fmt,
    io::{self, Read},
    str::FromStr,
};
use tracing::debug;

/// Whether reads that miss every cache tier should repopulate the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadType {
    /// Recache blocks read from persistent storage.
    #[default]
    Cache,
    /// Read from persistent storage without recaching.
    NoCache,
}

impl ReadType {
    pub fn is_cache(&self) -> bool {
        matches!(self, ReadType::Cache)
    }
}

impl FromStr for ReadType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CACHE" => Ok(ReadType::Cache),
            "NO_CACHE" | "NOCACHE" => Ok(ReadType::NoCache),
            _ => Err(Error::InvalidArgument(format!("unknown read type: {s}"))),
        }
    }
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadType::Cache => f.write_str("CACHE"),
            ReadType::NoCache => f.write_str("NO_CACHE"),
        }
    }
}

enum Source {
    Cached { buffer: Buffer, position: usize },
    Persistent(io::Take<Box<dyn Read + Send>>),
}

/// Reads the bytes of a single block.
///
/// A source that holds fewer (or, if cached, more) bytes than the block's length fails with
/// [io::ErrorKind::UnexpectedEof] or [io::ErrorKind::InvalidData] instead of ending early.
pub struct BlockReader {
    source: Source,
    length: u64,
    delivered: u64,
}

impl BlockReader {
    pub(crate) fn cached(buffer: Buffer, length: u64) -> Self {
        Self {
            source: Source::Cached {
                buffer,
                position: 0,
            },
            length,
            delivered: 0,
        }
    }

    pub(crate) fn persistent(src: Box<dyn Read + Send>, length: u64) -> Self {
        Self {
            source: Source::Persistent(src.take(length)),
            length,
            delivered: 0,
        }
    }

    /// Returns true if the block is served by a cache tier.
    pub fn is_cached(&self) -> bool {
        matches!(self.source, Source::Cached { .. })
    }

    /// Bytes of the block not yet read.
    pub fn remaining(&self) -> u64 {
        self.length - self.delivered
    }
}

impl Read for BlockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = match &mut self.source {
            Source::Cached { buffer, position } => {
                if buffer.len() as u64 > self.length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "block {} holds {} bytes, expected {}",
                            buffer.block_id(),
                            buffer.len(),
                            self.length
                        ),
                    ));
                }
                let remaining = &buffer[*position..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *position += n;
                n
            }
            Source::Persistent(src) => src.read(buf)?,
        };
        if n == 0 && self.delivered < self.length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "block ended after {} of {} bytes",
                    self.delivered, self.length
                ),
            ));
        }
        self.delivered += n as u64;
        Ok(n)
    }
}

impl fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockReader")
            .field("cached", &self.is_cached())
            .field("length", &self.length)
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// A stream over the contents of a complete [File].
pub enum InStream<M: Master> {
    /// The file has no blocks.
    Empty,
    /// The file has exactly one block.
    Block(BlockReader),
    /// The file has more than one block.
    File(FileStream<M>),
}

impl<M: Master> Read for InStream<M> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InStream::Empty => Ok(0),
            InStream::Block(reader) => reader.read(buf),
            InStream::File(stream) => stream.read(buf),
        }
    }
}

/// Reads the blocks of a file in order.
pub struct FileStream<M: Master> {
    file: File<M>,
    read_type: ReadType,
    readahead: bool,
    count: usize,
    next: usize,
    current: Option<BlockReader>,
    pending: Option<oneshot::Receiver<Result<BlockReader, Error>>>,
}

impl<M: Master> FileStream<M> {
    pub(crate) fn new(file: File<M>, read_type: ReadType, count: usize, readahead: bool) -> Self {
        Self {
            file,
            read_type,
            readahead,
            count,
            next: 0,
            current: None,
            pending: None,
        }
    }

    /// Opens block `self.next`, preferring the result of a readahead if one is in flight.
    ///
    /// The stream only moves past a block once it has been opened, so a failed open is retried
    /// by the next read.
    fn advance(&mut self) -> Result<BlockReader, Error> {
        let index = self.next;
        let block = match self.pending.take().map(block_on) {
            Some(Ok(result)) => result,
            Some(Err(oneshot::Canceled)) => {
                debug!(file = self.file.id(), index, "readahead canceled");
                self.file.open_block(index, self.read_type)
            }
            None => self.file.open_block(index, self.read_type),
        }?;
        self.next += 1;
        Ok(block)
    }

    fn prefetch(&mut self) {
        if !self.readahead || self.next >= self.count {
            return;
        }
        let file = self.file.clone();
        let index = self.next;
        let read_type = self.read_type;
        self.pending = Some(
            self.file
                .client()
                .spawn(move || file.open_block(index, read_type)),
        );
    }
}

impl<M: Master> Read for FileStream<M> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                if self.next >= self.count {
                    return Ok(0);
                }
                let block = self.advance().map_err(io::Error::other)?;
                self.current = Some(block);
                self.prefetch();
            }
            let Some(current) = self.current.as_mut() else {
                continue;
            };
            let n = current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }

            // Release the finished block before opening the next
            self.current = None;
        }
    }
}
