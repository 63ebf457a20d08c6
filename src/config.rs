//! Configuration
//!
//! Fixed protocol constants and the tunable [`RpcConfig`] shared by the
//! client and the server.
//!
//! ## Defaults
//!
//! | Setting           | Default  |
//! |-------------------|----------|
//! | `buffer_pages`    | 64 (4 MiB of registered memory per connection) |
//! | `backlog`         | 8        |
//! | `max_connections` | 8        |
//! | `resolve_timeout` | 3000 ms  |
//! | `connect_timeout` | 10 s     |
//! | `poll_mode`       | busy     |

use crate::error::RpcError;
use crate::transport::Device;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Size of one page of registered memory.
pub const PAGE_SIZE: usize = 65536;

/// Entries in each connection's completion queue.
pub const CQ_CAPACITY: u32 = 64;

/// Send queue depth of each queue pair.
pub const MAX_SEND_WR: u32 = 64;

/// Receive queue depth of each queue pair.
pub const MAX_RECV_WR: u32 = 64;

/// Pages registered per connection unless configured otherwise.
pub const DEFAULT_BUFFER_PAGES: usize = 64;

/// Connection requests the listener holds while waiting for a decision.
pub const DEFAULT_BACKLOG: usize = 8;

/// Connections the server serves at once.
pub const MAX_CONNECTIONS: usize = 8;

/// Time allowed for each address and route resolution step.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Time allowed for the peer to answer a connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const RESPONDER_RESOURCES: u8 = 16;
pub const INITIATOR_DEPTH: u8 = 16;

/// 7 means retry a receiver-not-ready peer indefinitely.
pub const RNR_RETRY_COUNT: u8 = 7;

/// How pollers spend passes that find no work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollMode {
    /// Poll continuously; lowest latency, one core per poller
    #[default]
    Busy,
    /// Spin briefly, then back off to short sleeps
    Backoff,
}

impl FromStr for PollMode {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "busy" => Ok(PollMode::Busy),
            "backoff" => Ok(PollMode::Backoff),
            other => Err(RpcError::InvalidConfig(format!(
                "unknown poll mode '{other}' (expected busy or backoff)"
            ))),
        }
    }
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollMode::Busy => f.write_str("busy"),
            PollMode::Backoff => f.write_str("backoff"),
        }
    }
}

/// Settings shared by [`Client`](crate::Client) and [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Pages of `PAGE_SIZE` bytes registered per connection (default: 64)
    pub buffer_pages: usize,

    /// Undecided connection requests the listener holds (default: 8)
    pub backlog: usize,

    /// Connections the server serves at once (default: 8)
    pub max_connections: usize,

    /// Wait for each resolution event (default: 3000ms)
    pub resolve_timeout: Duration,

    /// Wait for the peer to accept (default: 10s)
    pub connect_timeout: Duration,

    /// Idle behavior of the pollers (default: busy)
    pub poll_mode: PollMode,

    /// Device every connection allocates on (default: the process-wide device)
    pub device: Arc<Device>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            buffer_pages: DEFAULT_BUFFER_PAGES,
            backlog: DEFAULT_BACKLOG,
            max_connections: MAX_CONNECTIONS,
            resolve_timeout: RESOLVE_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            poll_mode: PollMode::Busy,
            device: Device::default_device(),
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_pages(mut self, pages: usize) -> Self {
        self.buffer_pages = pages;
        self
    }

    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_mode(mut self, mode: PollMode) -> Self {
        self.poll_mode = mode;
        self
    }

    pub fn with_device(mut self, device: Arc<Device>) -> Self {
        self.device = device;
        self
    }

    /// Size in bytes of each connection's registered buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_pages.saturating_mul(PAGE_SIZE)
    }

    /// Checks that the settings can be honored.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.buffer_pages == 0 {
            return Err(RpcError::InvalidConfig(
                "buffer_pages must be at least 1".to_string(),
            ));
        }
        if self.buffer_pages.checked_mul(PAGE_SIZE).is_none() {
            return Err(RpcError::InvalidConfig(format!(
                "buffer_pages {} overflows the address space",
                self.buffer_pages
            )));
        }
        if self.backlog == 0 {
            return Err(RpcError::InvalidConfig(
                "backlog must be at least 1".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(RpcError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.resolve_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(RpcError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RpcConfig::default();
        assert_eq!(config.buffer_pages, 64);
        assert_eq!(config.backlog, 8);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.resolve_timeout, Duration::from_millis(3000));
        assert_eq!(config.poll_mode, PollMode::Busy);
        assert_eq!(config.buffer_size(), 64 * 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(RpcConfig::new().with_buffer_pages(0).validate().is_err());
        assert!(RpcConfig::new().with_backlog(0).validate().is_err());
        assert!(RpcConfig::new().with_max_connections(0).validate().is_err());
        assert!(RpcConfig::new()
            .with_resolve_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_poll_mode_parse() {
        assert_eq!("busy".parse::<PollMode>().unwrap(), PollMode::Busy);
        assert_eq!("BACKOFF".parse::<PollMode>().unwrap(), PollMode::Backoff);
        assert!("sleepy".parse::<PollMode>().is_err());
    }
}
