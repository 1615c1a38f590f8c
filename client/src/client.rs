use crate::{
    cache::{Cache, DirectoryCache},
    coordinator::Coordinator,
    lock::{LockRegistry, Tracker},
    recache::Recacher,
    store::UnderStore,
    BlockLocator, Config, Error, File, FileId, Locker, Lookup, Master, Metrics,
};
use futures::channel::oneshot;
use prometheus_client::registry::Registry;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::debug;

struct Inner<M: Master> {
    cfg: Config,
    master: Arc<M>,
    store: Arc<dyn UnderStore>,
    locks: Arc<LockRegistry>,
    coordinator: Coordinator<M>,
    recacher: Recacher<M>,
    pool: ThreadPool,
}

/// Reads blocks through the cache tiers of a single node.
///
/// Cloning a [Client] is cheap: clones share the same lock registry, worker pool, and metrics.
pub struct Client<M: Master> {
    inner: Arc<Inner<M>>,
}

impl<M: Master> Clone for Client<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Master> Client<M> {
    /// Creates a client that recaches into the node's cache directory, if it has one.
    pub fn new(
        cfg: Config,
        master: Arc<M>,
        locker: Arc<dyn Locker>,
        store: Arc<dyn UnderStore>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let cache = master
            .cache_root()
            .map(|root| Arc::new(DirectoryCache::new(root)) as Arc<dyn Cache>);
        Self::init(cfg, master, locker, store, cache, registry)
    }

    /// Creates a client with an explicit recache destination.
    pub fn init(
        cfg: Config,
        master: Arc<M>,
        locker: Arc<dyn Locker>,
        store: Arc<dyn UnderStore>,
        cache: Option<Arc<dyn Cache>>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let metrics = Arc::new(Metrics::init(registry));
        let pool = ThreadPoolBuilder::new()
            .num_threads(cfg.worker_threads)
            .thread_name(|i| format!("tiercache-worker-{i}"))
            .build()?;
        let locks = LockRegistry::new(locker, metrics.locks_outstanding.clone());
        let coordinator = Coordinator::new(&cfg, master.clone(), locks.clone(), metrics.clone());
        let recacher = Recacher::new(
            master.clone(),
            store.clone(),
            cache,
            cfg.recache_buffer_size,
            metrics,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                cfg,
                master,
                store,
                locks,
                coordinator,
                recacher,
                pool,
            }),
        })
    }

    /// Opens `file` for reading.
    pub fn open(&self, file: FileId) -> File<M> {
        File::new(self.clone(), file)
    }

    /// Returns the locator of block `index` of `file`.
    pub fn locator(&self, file: FileId, index: usize) -> Result<BlockLocator, Error> {
        self.inner.master.locator(file, index)
    }

    /// Reads a block from the first cache tier that holds it.
    pub fn read_block(&self, locator: &BlockLocator) -> Lookup {
        self.read_tracked(locator, None)
    }

    /// Reads a block on the worker pool.
    ///
    /// Dropping the receiver abandons the result (releasing any lock it holds) but does not
    /// interrupt the read.
    pub fn read_block_async(&self, locator: BlockLocator) -> oneshot::Receiver<Lookup> {
        let client = self.clone();
        self.spawn(move || client.read_block(&locator))
    }

    /// Recaches block `index` of `file` from persistent storage.
    pub fn recache_block(&self, file: FileId, index: usize) -> bool {
        self.inner.recacher.recache_block(file, index)
    }

    /// Recaches every block of `file`. Returns true only if every block was recached.
    pub fn recache_all(&self, file: FileId) -> bool {
        self.inner.recacher.recache_all(file)
    }

    /// Recaches block `index` of `file` on the worker pool.
    pub fn spawn_recache(&self, file: FileId, index: usize) -> oneshot::Receiver<bool> {
        debug!(file, index, "scheduling recache");
        let client = self.clone();
        self.spawn(move || client.recache_block(file, index))
    }

    /// Number of block locks held by buffers of this client.
    pub fn outstanding_locks(&self) -> i64 {
        self.inner.locks.outstanding()
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub(crate) fn master(&self) -> &M {
        &self.inner.master
    }

    pub(crate) fn store(&self) -> &Arc<dyn UnderStore> {
        &self.inner.store
    }

    pub(crate) fn read_tracked(
        &self,
        locator: &BlockLocator,
        tracker: Option<&Arc<Tracker>>,
    ) -> Lookup {
        self.inner.coordinator.read_block(locator, tracker)
    }

    /// Runs `f` on the worker pool and returns a receiver for its result.
    pub(crate) fn spawn<T, F>(&self, f: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.inner.pool.spawn(move || {
            // The receiver may have been dropped
            let _ = sender.send(f());
        });
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{self, Server},
        Origin,
    };
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use futures::executor::block_on;
    use prometheus_client::encoding::text::encode;
    use std::fs;
    use tempfile::TempDir;

    fn client(master: &mocks::Master, locker: &mocks::Locker) -> Client<mocks::Master> {
        Client::new(
            Config::default().with_local_identities(false),
            Arc::new(master.clone()),
            Arc::new(locker.clone()),
            Arc::new(mocks::Store::default()),
            &mut Registry::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let master = mocks::Master::new(None);
        let result = Client::new(
            Config::default().with_worker_threads(0),
            Arc::new(master),
            Arc::new(mocks::Locker::default()),
            Arc::new(mocks::Store::default()),
            &mut Registry::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test_traced]
    fn test_read_block_async() {
        let dir = TempDir::new().unwrap();
        let master = mocks::Master::new(Some(dir.path().to_path_buf()));
        let locker = mocks::Locker::default();
        let client = client(&master, &locker);
        let file = master.add_file(1, 5, 5, "ckpt");
        let locator = client.locator(file, 0).unwrap();
        fs::write(dir.path().join(locator.block_id.to_string()), b"async").unwrap();

        let buffer = block_on(client.read_block_async(locator))
            .unwrap()
            .into_found()
            .unwrap();
        assert_eq!(&buffer[..], b"async");
        assert_eq!(client.outstanding_locks(), 1);
        drop(buffer);
        assert_eq!(client.outstanding_locks(), 0);
        assert_eq!(locker.acquires(), locker.releases());
    }

    #[test_traced]
    fn test_remote_data_port() {
        let master = mocks::Master::new(None);
        let locker = mocks::Locker::default();
        let client = client(&master, &locker);
        let server = Server::start();
        server.insert(42, Bytes::from_static(b"forty-two"));
        let locator = BlockLocator {
            block_id: 42,
            file_id: 9,
            index: 0,
            length: 9,
            locations: vec![server.location()],
        };
        assert_eq!(server.location().port + 1, i32::from(server.data_port()));

        let buffer = client.read_block(&locator).into_found().unwrap();
        assert_eq!(buffer.origin(), Origin::Remote);
        assert_eq!(&buffer[..], b"forty-two");
        assert_eq!(server.requests(), vec![42]);
        assert_eq!(locker.acquires(), 0);
    }

    #[test_traced]
    fn test_spawn_recache_and_metrics() {
        let dir = TempDir::new().unwrap();
        let master = mocks::Master::new(Some(dir.path().to_path_buf()));
        let store = mocks::Store::default();
        store.insert("ckpt", b"abcdefgh");
        let mut registry = Registry::default();
        let client = Client::new(
            Config::default(),
            Arc::new(master.clone()),
            Arc::new(mocks::Locker::default()),
            Arc::new(store),
            &mut registry,
        )
        .unwrap();
        let file = master.add_file(1, 4, 8, "ckpt");

        assert!(block_on(client.spawn_recache(file, 1)).unwrap());
        let block = client.locator(file, 1).unwrap().block_id;
        assert_eq!(fs::read(dir.path().join(block.to_string())).unwrap(), b"efgh");
        assert_eq!(master.cached(), vec![(block, 4)]);

        let buffer = client
            .read_block(&client.locator(file, 1).unwrap())
            .into_found()
            .unwrap();
        assert_eq!(&buffer[..], b"efgh");
        buffer.close().unwrap();

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains("recache_success_total 1"));
        assert!(out.contains("local_hits_total 1"));
        assert!(out.contains("locks_outstanding 0"));
    }
}
