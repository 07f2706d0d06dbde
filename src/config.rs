//! Tunables for sockets and the readiness dispatcher.

use std::time::Duration;

/// Fixed listen backlog and accepted-connection cap used by default.
pub const MAX_PENDING_CONNECTIONS: usize = 32;

/// Default read chunk size per wake-up.
pub const BUFFER_CAPACITY: usize = 32 * 1024;

/// Socket level configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketConfig {
    /// Listen backlog, and the number of accepted children a listener keeps
    /// before it stops admitting new connections.
    pub max_pending_connections: usize,
    /// Maximum bytes read from the descriptor per read wake-up.
    pub buffer_capacity: usize,
    /// Upper bound of bytes queued by [`write`](crate::net::Socket::write) and not yet sent.
    pub write_queue_limit: usize,
    /// Keep calling `accept` until it would block, instead of one connection
    /// per wake-up.
    pub drain_accept_backlog: bool,
    /// Bind listeners to the IPv6 wildcard address instead of the IPv4 one.
    pub prefer_ipv6: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_pending_connections: MAX_PENDING_CONNECTIONS,
            buffer_capacity: BUFFER_CAPACITY,
            write_queue_limit: 4 * 1024 * 1024,
            drain_accept_backlog: true,
            prefer_ipv6: false,
        }
    }
}

impl SocketConfig {
    pub fn with_max_pending_connections(mut self, value: usize) -> Self {
        self.max_pending_connections = value;
        self
    }

    pub fn with_buffer_capacity(mut self, value: usize) -> Self {
        // A zero sized chunk would never make progress.
        self.buffer_capacity = value.max(1);
        self
    }

    pub fn with_write_queue_limit(mut self, value: usize) -> Self {
        self.write_queue_limit = value;
        self
    }

    pub fn with_drain_accept_backlog(mut self, value: bool) -> Self {
        self.drain_accept_backlog = value;
        self
    }

    pub fn with_prefer_ipv6(mut self, value: bool) -> Self {
        self.prefer_ipv6 = value;
        self
    }
}

/// Readiness dispatcher configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Worker threads executing serialized queues.
    pub worker_threads: usize,
    /// Upper bound of one blocking poll call.
    pub poll_timeout: Duration,
    /// Maximum events fetched from the OS per poll call.
    pub max_events: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_threads,
            poll_timeout: Duration::from_millis(200),
            max_events: 256,
        }
    }
}

impl DispatcherConfig {
    pub fn with_worker_threads(mut self, value: usize) -> Self {
        self.worker_threads = value.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, value: Duration) -> Self {
        self.poll_timeout = value;
        self
    }

    pub fn with_max_events(mut self, value: usize) -> Self {
        self.max_events = value.max(1);
        self
    }
}
