use std::time::Duration;
use tokio::runtime::Handle;

/// Default time a zombie session is kept for migration.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between reaper sweeps.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of listener callbacks that may run at once.
pub const DEFAULT_CALLBACK_LIMIT: usize = 10;

/// Default delay before connect and disconnect callbacks run.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Default length of generated client IDs.
pub const DEFAULT_ID_LEN: usize = 16;

/// Default number of collisions tolerated before IDs are widened.
pub const DEFAULT_ID_PROBES: usize = 1000;

/// Default outbound queue size per client.
pub const DEFAULT_OUTBOUND_BUFFER_PER_CLIENT: usize = 64;

/// Configuration for a [`Server`].
///
/// The only required value is the origin. Every other setting has a default
/// and can be overridden with the `with_*` methods.
///
/// ```
/// # use std::time::Duration;
/// # use evsock::ServerConfig;
/// let config = ServerConfig::new("http://localhost:3000")
///     .with_reconnect_timeout(Duration::from_secs(10))
///     .with_callback_limit(32)
///     .with_compression(false);
/// assert_eq!(config.origin(), "http://localhost:3000");
/// ```
///
/// [`Server`]: crate::Server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) origin: String,
    pub(crate) reconnect_timeout: Duration,
    pub(crate) reap_interval: Duration,
    pub(crate) callback_limit: usize,
    pub(crate) grace_period: Duration,
    pub(crate) compression: bool,
    pub(crate) id_len: usize,
    pub(crate) id_probes: usize,
    pub(crate) outbound_buffer_per_client: usize,
    pub(crate) handle: Option<Handle>,
}

impl ServerConfig {
    /// Create a configuration accepting connections from `origin` only.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            callback_limit: DEFAULT_CALLBACK_LIMIT,
            grace_period: DEFAULT_GRACE_PERIOD,
            compression: true,
            id_len: DEFAULT_ID_LEN,
            id_probes: DEFAULT_ID_PROBES,
            outbound_buffer_per_client: DEFAULT_OUTBOUND_BUFFER_PER_CLIENT,
            handle: None,
        }
    }

    /// The accepted origin.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Set how long a session that dropped without a clean close is kept
    /// for migration.
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Set the interval between reaper sweeps. Intervals shorter than a
    /// millisecond are rounded up.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set how many listener callbacks may run at once across every
    /// connection of the server. Values below 1 are treated as 1.
    pub fn with_callback_limit(mut self, limit: usize) -> Self {
        self.callback_limit = limit;
        self
    }

    /// Set the delay applied before connect and disconnect callbacks run,
    /// giving in-flight sends a chance to complete.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Enable or disable gzip compression. When disabled, clients are told
    /// they cannot compress and inbound frames are never decompressed.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Set the initial length of generated client IDs.
    pub fn with_id_len(mut self, len: usize) -> Self {
        self.id_len = len;
        self
    }

    /// Set how many ID collisions are tolerated before IDs are widened.
    pub fn with_id_probes(mut self, probes: usize) -> Self {
        self.id_probes = probes;
        self
    }

    /// Set the outbound queue size per client. A client whose queue is full
    /// backpressures whoever is sending to it. Values below 1 are treated
    /// as 1.
    pub fn with_outbound_buffer_per_client(mut self, size: usize) -> Self {
        self.outbound_buffer_per_client = size;
        self
    }

    /// Set the runtime handle on which server tasks are spawned. Defaults to
    /// the runtime current at construction.
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }
}
