//! Request Handler Module
//!
//! The server does not interpret payloads. Every request is handed to a
//! [`RequestHandler`], and whatever bytes the handler returns become the
//! payload of the response.
//!
//! ## Where Handlers Run
//!
//! ```text
//! ┌─────────────────┐  receive completed  ┌──────────────────┐
//! │ Server poller   │───────────────────> │  Connection      │
//! │ (one thread)    │                     │  state machine   │
//! └─────────────────┘                     └────────┬─────────┘
//!                                                  │ Respond(request)
//!                                                  ▼
//!                                         ┌──────────────────┐
//!                                         │ RequestHandler   │  (this module)
//!                                         │   handle(&[u8])  │
//!                                         └────────┬─────────┘
//!                                                  │ Bytes (≤ 64)
//!                                                  ▼
//!                                           response posted
//! ```
//!
//! Handlers run synchronously on the poller thread, so a slow handler
//! delays every connection of the server. A handler must return at most
//! [`MESSAGE_BUF_SIZE`](crate::protocol::MESSAGE_BUF_SIZE) bytes; a longer
//! output fails the connection it was produced for.
//!
//! ## Built-in Handlers
//!
//! - [`SortHandler`]: returns the request bytes in ascending order
//! - [`EchoHandler`]: returns the request unchanged
//!
//! Any `Fn(&[u8]) -> Bytes` closure is also a handler.

pub mod builtin;

pub use builtin::{EchoHandler, SortHandler};

use bytes::Bytes;

/// Computes a response payload from a request payload.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> Bytes;
}

impl<F> RequestHandler for F
where
    F: Fn(&[u8]) -> Bytes + Send + Sync,
{
    fn handle(&self, payload: &[u8]) -> Bytes {
        self(payload)
    }
}
