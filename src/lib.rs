//! # FlashRPC - Minimal RPC over a Reliable-Connected Transport
//!
//! FlashRPC exchanges small fixed-size requests and responses through
//! pre-registered memory over a kernel-bypass style, reliable-connected
//! transport. A client opens one connection to a server; the server serves
//! many connections at once.
//!
//! ## Features
//!
//! - **Completion-driven**: every step of a request is triggered by a
//!   work completion, never by a blocking read
//! - **Fixed buffers**: each connection registers one buffer up front and
//!   reuses it for every message
//! - **Checked state machines**: an out-of-order completion is reported,
//!   never silently absorbed
//! - **Software provider**: the bundled [`transport`] emulates the verbs
//!   object model over TCP, so everything runs without RDMA hardware
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FlashRPC                                   │
//! │                                                                         │
//! │  ┌─────────────┐  CM events  ┌─────────────────┐                        │
//! │  │  Reactor    │───────────> │ ConnectionReg.  │ <─── passes ───┐       │
//! │  │ (server.rs) │  register   │ id -> Connection│                │       │
//! │  └─────────────┘             └────────┬────────┘        ┌───────┴─────┐ │
//! │                                       │                 │ServerPoller │ │
//! │                                       ▼                 └─────────────┘ │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                        Connection                                │   │
//! │  │  ┌────────────┐  ┌──────────────┐  ┌──────────┐  ┌────────────┐  │   │
//! │  │  │ Handshake  │  │ ResourceSet  │  │ Pending  │  │ State      │  │   │
//! │  │  │            │  │ PD CQ QP MR  │  │ Table    │  │ Machine    │  │   │
//! │  │  └────────────┘  └──────────────┘  └──────────┘  └─────┬──────┘  │   │
//! │  └────────────────────────────────────────────────────────┼─────────┘   │
//! │                                                           ▼             │
//! │                                                  ┌─────────────────┐    │
//! │                                                  │ RequestHandler  │    │
//! │                                                  └─────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashrpc::{Client, RpcConfig, Server, SortHandler};
//! use std::thread;
//!
//! let server = Server::bind("127.0.0.1", 0, SortHandler, RpcConfig::default())?;
//! let addr = server.local_addr();
//! let stop = server.shutdown_handle();
//! let reactor = thread::spawn(move || server.run());
//!
//! let mut client = Client::new(RpcConfig::default())?;
//! client.connect("127.0.0.1", addr.port())?;
//! let response = client.call(b"hello")?;
//! assert_eq!(response.payload(), b"ehllo");
//! client.disconnect()?;
//!
//! stop.shutdown();
//! reactor.join().unwrap()?;
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: the 72-byte wire message
//! - [`transport`]: the software verbs provider
//! - [`connection`]: handshake, resources, pending operations, state machines
//! - [`poller`]: completion polling and wait strategies
//! - [`handler`]: the request handler capability
//! - [`server`] and [`client`]: the two façades
//!
//! ## Design Highlights
//!
//! ### One Request at a Time
//!
//! A client connection never has more than one request in flight. The
//! request gate is taken before the send is posted and released only when
//! the response completion is observed.
//!
//! ### Ordered Teardown
//!
//! Resources are released in reverse acquisition order, queue pair first.
//! A failing step is logged and the remaining steps still run, so repeated
//! connect and disconnect cycles leave no resources behind.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod poller;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types for convenience
pub use client::{random_payload, Client};
pub use config::{PollMode, RpcConfig};
pub use connection::{Connection, ConnectionId};
pub use error::{Result, RpcError, Severity};
pub use handler::{EchoHandler, RequestHandler, SortHandler};
pub use poller::RequestTicket;
pub use protocol::{Message, MessageError, MessageKind, MESSAGE_BUF_SIZE};
pub use server::{Server, ServerStats, ShutdownHandle};

/// The default port FlashRPC listens on
pub const DEFAULT_PORT: u16 = 20079;

/// The default host FlashRPC binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashRPC
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
