//! Fluent builder for Runtime construction.
//!
//! Every tunable the scheduler, the reactor and the I/O helpers consult lives
//! in [`Config`]. The builder starts from the defaults below and each setter
//! overrides one knob.

use crate::error::Result;
use crate::runtime::Runtime;

use std::time::Duration;

/// Inbox capacity used when a fiber is created with capacity `0`.
pub const DEFAULT_INBOX_CAPACITY: usize = 64;

/// Maximum number of nested `call`s before the runtime aborts.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 8;

/// Allocated bytes in a fiber's active region that trigger a swap on `gc`.
pub const DEFAULT_REGION_SWAP_THRESHOLD: usize = 128 * 1024;

/// Delay between bind attempts while a port is in use.
pub const DEFAULT_BIND_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Backlog handed to `listen(2)`.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 1024;

/// Bytes reserved per read by `read_at_least`.
pub const DEFAULT_READAHEAD: usize = 16 * 1024;

/// Largest datagram the UDP acceptor receives; longer ones are truncated.
pub const DEFAULT_UDP_MAX_DATAGRAM: usize = 128;

/// Readiness events collected per poller wait.
pub const DEFAULT_MAX_EVENTS: usize = 64;

/// Upper bound on a poller wait while child watchers are armed.
pub const DEFAULT_CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runtime tunables, fixed at build time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub default_inbox_capacity: usize,
    pub max_call_depth: usize,
    pub region_swap_threshold: usize,
    pub bind_retry_interval: Duration,
    pub listen_backlog: i32,
    pub readahead: usize,
    pub udp_max_datagram: usize,
    pub max_events: usize,
    pub child_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_inbox_capacity: DEFAULT_INBOX_CAPACITY,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            region_swap_threshold: DEFAULT_REGION_SWAP_THRESHOLD,
            bind_retry_interval: DEFAULT_BIND_RETRY_INTERVAL,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            readahead: DEFAULT_READAHEAD,
            udp_max_datagram: DEFAULT_UDP_MAX_DATAGRAM,
            max_events: DEFAULT_MAX_EVENTS,
            child_poll_interval: DEFAULT_CHILD_POLL_INTERVAL,
        }
    }
}

/// Builder for constructing Runtime instances with fluent API.
///
/// # Example
/// ```ignore
/// let rt = RuntimeBuilder::new()
///     .default_inbox_capacity(16)
///     .region_swap_threshold(64 * 1024)
///     .build()?;
/// ```
#[derive(Clone, Debug, Default)]
pub struct RuntimeBuilder {
    config: Config,
}

impl RuntimeBuilder {
    /// Creates a builder holding the default [`Config`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the inbox capacity used for fibers created with capacity `0`.
    ///
    /// A ring of capacity `C` holds at most `C - 1` messages.
    pub fn default_inbox_capacity(mut self, capacity: usize) -> Self {
        self.config.default_inbox_capacity = capacity.max(1);
        self
    }

    /// Sets how deep `call` may nest before the runtime panics.
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.config.max_call_depth = depth.max(1);
        self
    }

    /// Sets the allocation level at which `gc` swaps a fiber's regions.
    ///
    /// `0` forces a swap on every collection.
    pub fn region_swap_threshold(mut self, bytes: usize) -> Self {
        self.config.region_swap_threshold = bytes;
        self
    }

    /// Sets the pause between bind attempts on a busy port.
    pub fn bind_retry_interval(mut self, interval: Duration) -> Self {
        self.config.bind_retry_interval = interval;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.config.listen_backlog = backlog;
        self
    }

    pub fn readahead(mut self, bytes: usize) -> Self {
        self.config.readahead = bytes.max(1);
        self
    }

    pub fn udp_max_datagram(mut self, bytes: usize) -> Self {
        self.config.udp_max_datagram = bytes.max(1);
        self
    }

    pub fn max_events(mut self, events: usize) -> Self {
        self.config.max_events = events.max(1);
        self
    }

    /// Sets the longest the poller sleeps while a child process is watched.
    pub fn child_poll_interval(mut self, interval: Duration) -> Self {
        self.config.child_poll_interval = interval;
        self
    }

    /// Returns the configuration collected so far.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the runtime, creating its poller.
    ///
    /// # Errors
    /// Fails when the kernel refuses to create the readiness queue.
    pub fn build(self) -> Result<Runtime> {
        Runtime::with_config(self.config)
    }
}
