//! Wire Protocol
//!
//! This module defines the single record type exchanged between peers.
//!
//! ## Overview
//!
//! Unlike a stream protocol, nothing here is incremental: a connection's
//! registered buffer holds exactly one fixed-size record at a time, the
//! sender copies a [`Message`] into it before posting a send, and the
//! receiver copies it back out when the receive completes.
//!
//! ## Example
//!
//! ```
//! use flashrpc::protocol::{Message, MessageKind, WIRE_SIZE};
//!
//! let request = Message::immediate_request(b"hello").unwrap();
//! let wire = request.encode();
//! assert_eq!(wire.len(), WIRE_SIZE);
//!
//! let decoded = Message::decode(&wire).unwrap();
//! assert_eq!(decoded.kind(), MessageKind::ImmediateRequest);
//! assert_eq!(decoded.payload(), b"hello");
//! ```

pub mod message;

// Re-export commonly used types for convenience
pub use message::{Message, MessageError, MessageKind, HEADER_SIZE, MESSAGE_BUF_SIZE, WIRE_SIZE};
