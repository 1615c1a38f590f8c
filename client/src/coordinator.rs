//! Serve a block from the fastest cache tier that holds it.

use crate::{
    local::LocalReader,
    lock::{LockRegistry, Tracker},
    remote::RemoteClient,
    BlockLocator, Buffer, Config, Lookup, Master, Metrics,
};
use bytes::Bytes;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, warn};

/// Tries the local cache, then every remote node listed in the locator, in order.
///
/// The coordinator keeps no per-read state and may be shared by any number of readers.
pub struct Coordinator<M: Master> {
    local: LocalReader<M>,
    remote: RemoteClient,
    identities: HashSet<String>,
    metrics: Arc<Metrics>,
}

impl<M: Master> Coordinator<M> {
    pub fn new(
        cfg: &Config,
        master: Arc<M>,
        locks: Arc<LockRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local: LocalReader::new(master, locks),
            remote: RemoteClient::new(cfg),
            identities: cfg.all_identities(),
            metrics,
        }
    }

    /// Reads the block described by `locator` from the first tier that holds it.
    ///
    /// If `tracker` is provided, a local hit is tracked in it until the returned buffer is closed.
    pub fn read_block(&self, locator: &BlockLocator, tracker: Option<&Arc<Tracker>>) -> Lookup {
        if let Lookup::Found(buffer) = self.local.try_read(locator, tracker) {
            self.metrics.local_hits.inc();
            return Lookup::Found(buffer);
        }
        if let Some(payload) = self.read_remote(locator) {
            self.metrics.remote_hits.inc();
            return Lookup::Found(Buffer::remote(locator.block_id, payload));
        }
        self.metrics.misses.inc();
        debug!(block = locator.block_id, "block not cached");
        Lookup::Miss
    }

    fn read_remote(&self, locator: &BlockLocator) -> Option<Bytes> {
        for location in &locator.locations {
            if !location.is_resident() {
                continue;
            }
            if self.identities.contains(&location.host) {
                // We would have found it locally
                warn!(
                    block = locator.block_id,
                    host = location.host,
                    "location refers to this node"
                );
                continue;
            }
            let Some(port) = location.data_port() else {
                warn!(
                    block = locator.block_id,
                    host = location.host,
                    port = location.port,
                    "invalid location port"
                );
                continue;
            };

            self.metrics.remote_attempts.inc();
            match self.remote.fetch(&location.host, port, locator) {
                Ok(Some(payload)) => return Some(payload),
                Ok(None) => {
                    self.metrics.remote_misses.inc();
                }
                Err(err) => {
                    self.metrics.remote_failures.inc();
                    debug!(
                        ?err,
                        block = locator.block_id,
                        host = location.host,
                        port,
                        "remote read failed"
                    );
                }
            }
        }
        None
    }
}
