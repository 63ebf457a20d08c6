//! Software Verbs Provider
//!
//! This module provides the reliable-connected transport the rest of the
//! crate is written against. It follows the object model of a verbs provider
//! (device, protection domain, completion queue, queue pair, memory region,
//! connection-manager identifier and event channel) and emulates it in
//! software: every connected queue pair is backed by one TCP stream, and
//! connection-manager events are delivered through an [`EventChannel`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── Device ────────────────────────────┐
//! │  live resource counters (pd / cq / qp / mr)                    │
//! │                                                                │
//! │  ┌──────────────────┐        ┌─────────────────┐               │
//! │  │ ProtectionDomain │◄───────│  MemoryRegion   │ lkey / rkey   │
//! │  └────────┬─────────┘        └─────────────────┘               │
//! │           │                                                    │
//! │  ┌────────▼─────────┐  posts ┌─────────────────┐               │
//! │  │    QueuePair     │───────>│ CompletionQueue │◄── poller     │
//! │  └────────┬─────────┘        └─────────────────┘               │
//! └───────────┼────────────────────────────────────────────────────┘
//!             │ link (TCP stream, framed)
//!   ┌─────────▼─────────┐   events   ┌──────────────┐
//!   │       CmId        │───────────>│ EventChannel │◄── reactor
//!   │ resolve / connect │            └──────────────┘
//!   │ listen / accept   │
//!   └───────────────────┘
//! ```
//!
//! ## Ordering Rules
//!
//! The provider enforces the same teardown rules as hardware: a protection
//! domain cannot be deallocated while a memory region or queue pair still
//! uses it, and a completion queue cannot be destroyed while a queue pair is
//! attached to it. A failed destroy leaves the resource allocated, so leaks
//! show up in [`Device::resource_counts`].

pub mod cm;
pub mod cq;
pub mod device;
pub mod qp;
pub(crate) mod wire;

// Re-export commonly used types
pub use cm::{CmEvent, CmEventKind, CmId, ConnParam, EndpointId, EventChannel};
pub use cq::{CompletionQueue, WcOpcode, WcStatus, WorkCompletion};
pub use device::{
    AccessFlags, Device, MemoryRegion, ProtectionDomain, ResourceCounts, ResourceLimits,
};
pub use qp::{QpCaps, QueuePair, Sge};

use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors reported by the transport provider.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure on a link or listener
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The resource is still referenced by another resource
    #[error("resource busy: {0}")]
    Busy(&'static str),

    /// The device refused to allocate another resource of this type
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A verb was called with an argument the provider cannot honour
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A verb was called in a state that does not allow it
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The completion queue overflowed and is now in the error state
    #[error("completion queue overrun (capacity {capacity})")]
    CqOverrun { capacity: usize },

    /// The work queue already holds its maximum number of requests
    #[error("{queue} queue full ({max} outstanding)")]
    QueueFull { queue: &'static str, max: u32 },

    /// A scatter/gather entry points outside its memory region
    #[error("access of {len} bytes at offset {offset} is outside a {size} byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// The address or route has not been resolved yet
    #[error("address not resolved")]
    NotResolved,

    /// The endpoint has no live link
    #[error("endpoint is not connected")]
    NotConnected,

    /// Every sender of the event channel is gone
    #[error("event channel closed")]
    ChannelClosed,
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
