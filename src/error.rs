//! Error Types
//!
//! Every failure in the core is an [`RpcError`]. Each carries a
//! [`Severity`]: fatal errors abort the operation (or the connection) they
//! happened in, warnings are logged and the caller carries on. Teardown never
//! stops at a warning; every remaining step still runs.

use crate::connection::{ConnectionId, HandshakeState, ProtocolState, Role};
use crate::protocol::MessageError;
use crate::transport::{CmEventKind, TransportError, WcStatus};
use std::time::Duration;
use thiserror::Error;

/// How an error affects the work that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation, handshake or connection cannot continue
    Fatal,
    /// Logged; processing continues
    Warning,
}

/// Errors produced by the messaging layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Allocating a transport resource failed
    #[error("failed to {op}: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: TransportError,
    },

    /// The registered buffer could not be allocated
    #[error("failed to allocate a {size} byte buffer")]
    BufferAllocation { size: usize },

    /// The resource set was already released
    #[error("connection resources already released")]
    Released,

    /// A handshake step saw a different event than the one it waits for
    #[error("expected {expected} event, got {actual}")]
    UnexpectedEvent {
        expected: CmEventKind,
        actual: CmEventKind,
    },

    /// The awaited event arrived with a non-zero status
    #[error("{kind} event reported status {status}")]
    EventStatus { kind: CmEventKind, status: i32 },

    /// The awaited event did not arrive in time
    #[error("timed out after {timeout:?} waiting for {expected} event")]
    EventTimeout {
        expected: CmEventKind,
        timeout: Duration,
    },

    /// Reading from the event channel failed
    #[error("event channel error: {0}")]
    EventChannel(#[source] TransportError),

    /// A handshake transition out of order
    #[error("handshake cannot move from {from} to {to}")]
    HandshakeOrder {
        from: HandshakeState,
        to: HandshakeState,
    },

    /// The peer's private data is not a 4-byte remote key
    #[error("expected 4 bytes of private data, got {len}")]
    PrivateData { len: usize },

    /// A transport call failed outside resource allocation and teardown
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Polling a connection's completion queue failed
    #[error("connection {conn}: completion queue error: {source}")]
    CompletionQueue {
        conn: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// A work request finished with an error status
    #[error("connection {conn}: work request {wr_id:#x} failed: {status}")]
    WorkCompletion {
        conn: ConnectionId,
        wr_id: u64,
        status: WcStatus,
    },

    /// A completion names an operation that is not outstanding
    #[error("unknown or stale operation id {0:#x}")]
    UnknownOperation(u64),

    /// No room to track another outstanding operation
    #[error("pending operation table is full")]
    PendingTableFull,

    /// A completion that the connection's current state cannot accept
    #[error("{role} connection in state {state} cannot handle {event}")]
    IllegalTransition {
        role: Role,
        state: ProtocolState,
        event: String,
    },

    /// A message could not be built or decoded
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// The request handler returned more than one message worth of bytes
    #[error("handler returned {len} bytes, limit is 64")]
    HandlerContract { len: usize },

    /// One teardown step failed
    #[error("teardown step '{step}' failed: {source}")]
    Teardown {
        step: &'static str,
        #[source]
        source: TransportError,
    },

    /// The connection an event refers to is no longer registered
    #[error("connection {0} is already gone")]
    ConnectionGone(ConnectionId),

    /// A connection with the same id replaced an existing one
    #[error("connection {0} registered twice")]
    DuplicateConnection(ConnectionId),

    /// The client already holds a connection
    #[error("client is already connected")]
    AlreadyConnected,

    /// The client holds no connection
    #[error("client is not connected")]
    NotConnected,

    /// The connection died while a caller depended on it
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A later request's response replaced the one this ticket waited for
    #[error("response for request {0} was superseded")]
    ResponseSuperseded(u64),

    /// The server refused a connection because it is full
    #[error("server at capacity ({0} connections)")]
    AtCapacity(usize),

    /// A configuration value cannot be honored
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The connection-manager reactor could not run
    #[error("reactor error: {0}")]
    Reactor(String),
}

impl RpcError {
    pub fn severity(&self) -> Severity {
        match self {
            RpcError::Teardown { .. }
            | RpcError::ConnectionGone(_)
            | RpcError::DuplicateConnection(_)
            | RpcError::AtCapacity(_)
            | RpcError::ResponseSuperseded(_) => Severity::Warning,
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Result type for the messaging layer.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classes() {
        let teardown = RpcError::Teardown {
            step: "destroy queue pair",
            source: TransportError::NotConnected,
        };
        assert_eq!(teardown.severity(), Severity::Warning);
        assert_eq!(RpcError::AtCapacity(8).severity(), Severity::Warning);

        assert!(RpcError::UnknownOperation(3).is_fatal());
        assert!(RpcError::HandlerContract { len: 65 }.is_fatal());
        assert!(RpcError::EventStatus {
            kind: CmEventKind::AddrResolved,
            status: -113
        }
        .is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RpcError::UnexpectedEvent {
            expected: CmEventKind::RouteResolved,
            actual: CmEventKind::AddrError,
        };
        assert_eq!(err.to_string(), "expected route-resolved event, got addr-error");
        assert_eq!(
            RpcError::HandlerContract { len: 70 }.to_string(),
            "handler returned 70 bytes, limit is 64"
        );
    }
}
