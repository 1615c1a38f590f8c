//! In-process implementations of the services a [crate::Client] depends on.

use crate::{
    cache::{BlockWriter, Cache},
    store::UnderStore,
    BlockId, BlockLocator, Error, FileId, Location, LockId,
};
use bytes::Bytes;
use commonware_codec::Encode;
use std::{
    collections::{BTreeSet, HashMap},
    io::{self, Cursor, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tiercache_wire::{
    recv_frame, send_frame, Header, Kind, Message, Outgoing, Response, DEFAULT_MAX_PAYLOAD,
};

struct FileMeta {
    block_size: u64,
    length: u64,
    checkpoint: String,
    complete: bool,
    locations: HashMap<usize, Vec<Location>>,
}

#[derive(Default)]
struct MasterState {
    files: HashMap<FileId, FileMeta>,
    accessed: Vec<BlockId>,
    cached: Vec<(BlockId, u64)>,
}

/// A metadata service holding files in memory.
///
/// Block `index` of file `f` has id `f * 1000 + index`.
#[derive(Clone)]
pub struct Master {
    cache_root: Option<PathBuf>,
    state: Arc<Mutex<MasterState>>,
}

impl Master {
    pub fn new(cache_root: Option<PathBuf>) -> Self {
        Self {
            cache_root,
            state: Arc::default(),
        }
    }

    /// Registers a complete file and returns its id.
    pub fn add_file(&self, id: FileId, block_size: u64, length: u64, checkpoint: &str) -> FileId {
        self.state.lock().unwrap().files.insert(
            id,
            FileMeta {
                block_size,
                length,
                checkpoint: checkpoint.to_string(),
                complete: true,
                locations: HashMap::new(),
            },
        );
        id
    }

    pub fn set_complete(&self, file: FileId, complete: bool) {
        let mut state = self.state.lock().unwrap();
        state.files.get_mut(&file).unwrap().complete = complete;
    }

    pub fn set_locations(&self, file: FileId, index: usize, locations: Vec<Location>) {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .get_mut(&file)
            .unwrap()
            .locations
            .insert(index, locations);
    }

    pub fn locator_of(&self, file: FileId, index: usize) -> BlockLocator {
        crate::Master::locator(self, file, index).unwrap()
    }

    /// Blocks reported as read from the local cache, in order.
    pub fn accessed(&self) -> Vec<BlockId> {
        self.state.lock().unwrap().accessed.clone()
    }

    /// Blocks reported as recached, in order.
    pub fn cached(&self) -> Vec<(BlockId, u64)> {
        self.state.lock().unwrap().cached.clone()
    }

    fn with_file<T>(&self, file: FileId, f: impl FnOnce(&FileMeta) -> T) -> Result<T, Error> {
        let state = self.state.lock().unwrap();
        let meta = state
            .files
            .get(&file)
            .ok_or_else(|| Error::Master(format!("unknown file {file}")))?;
        Ok(f(meta))
    }
}

impl crate::Master for Master {
    fn locator(&self, file: FileId, index: usize) -> Result<BlockLocator, Error> {
        self.with_file(file, |meta| {
            let start = meta.block_size * index as u64;
            BlockLocator {
                block_id: (file * 1000 + index as u64) as BlockId,
                file_id: file,
                index,
                length: meta.length.saturating_sub(start).min(meta.block_size),
                locations: meta.locations.get(&index).cloned().unwrap_or_default(),
            }
        })
    }

    fn block_count(&self, file: FileId) -> Result<usize, Error> {
        self.with_file(file, |meta| match meta.block_size {
            0 => 0,
            size => meta.length.div_ceil(size) as usize,
        })
    }

    fn is_complete(&self, file: FileId) -> Result<bool, Error> {
        self.with_file(file, |meta| meta.complete)
    }

    fn file_length(&self, file: FileId) -> Result<u64, Error> {
        self.with_file(file, |meta| meta.length)
    }

    fn block_size(&self, file: FileId) -> Result<u64, Error> {
        self.with_file(file, |meta| meta.block_size)
    }

    fn checkpoint_path(&self, file: FileId) -> Result<String, Error> {
        self.with_file(file, |meta| meta.checkpoint.clone())
    }

    fn cache_root(&self) -> Option<PathBuf> {
        self.cache_root.clone()
    }

    fn access_block(&self, block: BlockId) {
        self.state.lock().unwrap().accessed.push(block);
    }

    fn cache_block(&self, block: BlockId, length: u64) -> Result<(), Error> {
        self.state.lock().unwrap().cached.push((block, length));
        Ok(())
    }
}

#[derive(Default)]
struct LockerState {
    held: BTreeSet<(BlockId, LockId)>,
    acquires: usize,
    releases: usize,
    fail: bool,
}

/// A lock service that records every lock and unlock.
#[derive(Clone, Default)]
pub struct Locker {
    state: Arc<Mutex<LockerState>>,
}

impl Locker {
    /// Makes subsequent lock attempts fail (or succeed again).
    pub fn fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    pub fn held(&self) -> Vec<(BlockId, LockId)> {
        self.state.lock().unwrap().held.iter().copied().collect()
    }

    pub fn acquires(&self) -> usize {
        self.state.lock().unwrap().acquires
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }
}

impl crate::Locker for Locker {
    fn lock(&self, block: BlockId, lock: LockId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(Error::Lock(format!("refused lock {lock} on block {block}")));
        }
        if !state.held.insert((block, lock)) {
            return Err(Error::Lock(format!("lock {lock} on block {block} already held")));
        }
        state.acquires += 1;
        Ok(())
    }

    fn unlock(&self, block: BlockId, lock: LockId) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.held.remove(&(block, lock)) {
            return Err(Error::Lock(format!("lock {lock} on block {block} not held")));
        }
        state.releases += 1;
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    files: HashMap<String, Bytes>,
    opens: usize,
}

/// Persistent storage holding checkpoints in memory.
#[derive(Clone, Default)]
pub struct Store {
    state: Arc<Mutex<StoreState>>,
}

impl Store {
    pub fn insert(&self, path: &str, data: impl AsRef<[u8]>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), Bytes::copy_from_slice(data.as_ref()));
    }

    /// Removes the checkpoint at `path`, returning its contents.
    pub fn remove(&self, path: &str) -> Option<Bytes> {
        self.state.lock().unwrap().files.remove(path)
    }

    /// Number of open attempts, successful or not.
    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }
}

impl UnderStore for Store {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        match state.files.get(path) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, path.to_string())),
        }
    }
}

/// A cache whose writers fail once more than `after` bytes have been written.
#[derive(Clone)]
pub struct FailingCache {
    after: usize,
    canceled: Arc<AtomicUsize>,
    committed: Arc<AtomicUsize>,
}

impl FailingCache {
    pub fn new(after: usize) -> Self {
        Self {
            after,
            canceled: Arc::default(),
            committed: Arc::default(),
        }
    }

    pub fn canceled(&self) -> usize {
        self.canceled.load(Ordering::Relaxed)
    }

    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }
}

impl Cache for FailingCache {
    fn create(&self, _: &BlockLocator) -> io::Result<Box<dyn BlockWriter>> {
        Ok(Box::new(FailingWriter {
            cache: self.clone(),
            written: 0,
        }))
    }
}

struct FailingWriter {
    cache: FailingCache,
    written: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() > self.cache.after {
            return Err(io::Error::other("injected write failure"));
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlockWriter for FailingWriter {
    fn commit(self: Box<Self>) -> io::Result<()> {
        self.cache.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cancel(self: Box<Self>) -> io::Result<()> {
        self.cache.canceled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// How a [Server] answers requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Behavior {
    /// Serve held blocks and answer not-found otherwise.
    #[default]
    Serve,
    /// Close the connection halfway through the response payload.
    Truncate,
    /// Reply with a header of an unknown kind.
    Garbage,
    /// Never reply.
    Silent,
    /// Reply with the given block instead of the requested one.
    Answer(BlockId),
}

#[derive(Default)]
struct ServerState {
    blocks: HashMap<BlockId, Bytes>,
    requests: Vec<BlockId>,
    behavior: Behavior,
}

/// A cache node's data port, listening on localhost.
pub struct Server {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Server {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state: Arc<Mutex<ServerState>> = Arc::default();
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = {
            let state = state.clone();
            let stopped = stopped.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    let Ok(stream) = stream else {
                        continue;
                    };
                    let state = state.clone();
                    thread::spawn(move || serve(stream, state));
                }
            })
        };
        Self {
            addr,
            state,
            stopped,
            handle: Some(handle),
        }
    }

    pub fn insert(&self, block: BlockId, data: Bytes) {
        self.state.lock().unwrap().blocks.insert(block, data);
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    /// Block ids requested so far, in order.
    pub fn requests(&self) -> Vec<BlockId> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn data_port(&self) -> u16 {
        self.addr.port()
    }

    /// The location advertised for this node (its control port is one below the data port).
    pub fn location(&self) -> Location {
        Location::new("127.0.0.1", i32::from(self.data_port()) - 1)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
        // Wake the accept loop
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(mut stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let Ok(Message::Request(request)) =
        recv_frame(&mut stream, Kind::Request, DEFAULT_MAX_PAYLOAD)
    else {
        return;
    };
    let (behavior, held, answer) = {
        let mut state = state.lock().unwrap();
        state.requests.push(request.block_id());
        let answer = match state.behavior {
            Behavior::Answer(other) => state.blocks.get(&other).cloned(),
            _ => None,
        };
        (
            state.behavior,
            state.blocks.get(&request.block_id()).cloned(),
            answer,
        )
    };

    match behavior {
        Behavior::Serve => {
            let response = match held {
                Some(data) => Response::found(request.block_id(), 0, data),
                None => Response::not_found(request.block_id()),
            };
            if let Ok(response) = response {
                let mut frame = Outgoing::new(&Message::Response(response));
                let _ = send_frame(&mut stream, &mut frame);
            }
        }
        Behavior::Truncate => {
            let data = held.unwrap_or_else(|| Bytes::from_static(b"partial"));
            if let Ok(response) = Response::found(request.block_id(), 0, data) {
                let encoded = Message::Response(response).encode();
                let cut = Header::LEN + (encoded.len() - Header::LEN) / 2;
                let _ = stream.write_all(&encoded[..cut]);
            }
        }
        Behavior::Garbage => {
            let _ = stream.write_all(&[0xff; Header::LEN]);
        }
        Behavior::Silent => {
            // Wait for the client to give up
            let mut buf = [0u8; 64];
            while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
        }
        Behavior::Answer(other) => {
            let data = answer.unwrap_or_default();
            if let Ok(response) = Response::found(other, 0, data) {
                let mut frame = Outgoing::new(&Message::Response(response));
                let _ = send_frame(&mut stream, &mut frame);
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Write);
}

/// A location whose data port refuses connections.
pub fn unreachable_location() -> Location {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Location::new("127.0.0.1", i32::from(port) - 1)
}
