use crate::Error;
use std::{collections::HashSet, time::Duration};
use tiercache_wire::DEFAULT_MAX_PAYLOAD;

/// Names every host uses for itself.
const LOOPBACK: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Configuration for a [crate::Client].
#[derive(Clone, Debug)]
pub struct Config {
    /// Additional host names and addresses this node is known by.
    ///
    /// Remote locations matching one of these are skipped: if the block were cached here, the
    /// local read would have found it.
    pub identities: Vec<String>,

    /// Whether this node's hostname and loopback addresses are treated as identities.
    pub local_identities: bool,

    /// Maximum time to wait when connecting to a remote node.
    pub connect_timeout: Duration,

    /// Maximum time to wait for a single read from a remote node.
    pub read_timeout: Duration,

    /// Maximum time to wait for a single write to a remote node.
    pub write_timeout: Duration,

    /// Largest response payload accepted from a remote node.
    pub max_payload: u32,

    /// Size of the chunks copied from persistent storage during a recache.
    pub recache_buffer_size: usize,

    /// Number of threads used for background reads and recaches.
    pub worker_threads: usize,

    /// Whether multi-block streams fetch the next block in the background.
    pub readahead: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            local_identities: true,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_payload: DEFAULT_MAX_PAYLOAD,
            recache_buffer_size: 1024 * 1024,
            worker_threads: 4,
            readahead: true,
        }
    }
}

impl Config {
    // Setters
    /// See [Config]
    pub fn with_identities(mut self, identities: Vec<String>) -> Self {
        self.identities = identities;
        self
    }
    /// See [Config]
    pub const fn with_local_identities(mut self, local_identities: bool) -> Self {
        self.local_identities = local_identities;
        self
    }
    /// See [Config]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    /// See [Config]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
    /// See [Config]
    pub const fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
    /// See [Config]
    pub const fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }
    /// See [Config]
    pub const fn with_recache_buffer_size(mut self, recache_buffer_size: usize) -> Self {
        self.recache_buffer_size = recache_buffer_size;
        self
    }
    /// See [Config]
    pub const fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }
    /// See [Config]
    pub const fn with_readahead(mut self, readahead: bool) -> Self {
        self.readahead = readahead;
        self
    }

    /// Every name a remote location may use to refer to this node.
    pub fn all_identities(&self) -> HashSet<String> {
        let mut identities: HashSet<String> = self.identities.iter().cloned().collect();
        if self.local_identities {
            identities.extend(LOOPBACK.iter().map(|name| name.to_string()));
            if let Ok(hostname) = gethostname::gethostname().into_string() {
                identities.insert(hostname);
            }
        }
        identities
    }

    /// Rejects configurations that could never make progress.
    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_threads == 0 {
            return Err(Error::InvalidArgument("worker_threads must be positive".into()));
        }
        if self.recache_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "recache_buffer_size must be positive".into(),
            ));
        }
        if self.max_payload == 0 {
            return Err(Error::InvalidArgument("max_payload must be positive".into()));
        }
        for timeout in [self.connect_timeout, self.read_timeout, self.write_timeout] {
            // Zero socket timeouts are rejected by the platform
            if timeout.is_zero() {
                return Err(Error::InvalidArgument("timeouts must be positive".into()));
            }
        }
        Ok(())
    }
}
