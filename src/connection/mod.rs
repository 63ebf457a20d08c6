//! Connection Module
//!
//! Everything one connection owns, and the rules it follows once it is
//! established.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Connection                             │
//! │                                                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ ResourceSet  │  │ PendingTable │  │ Machine          │   │
//! │  │ PD CQ QP MR  │  │ wr_id -> op  │  │ server | client  │   │
//! │  └──────┬───────┘  └──────┬───────┘  └────────┬─────────┘   │
//! │         │ poll CQ         │ match id          │ advance     │
//! │         └────────────────>└──────────────────>│             │
//! │                                               ▼             │
//! │                                 post recv / respond / deliver│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submodules
//!
//! - [`handshake`]: connection-manager steps and the remote-key exchange
//! - [`resources`]: acquiring and releasing transport resources
//! - [`pending`]: outstanding work requests
//! - [`state`]: the request/response state machines
//! - [`conn`]: the [`Connection`] that ties them together

pub mod conn;
pub mod handshake;
pub mod pending;
pub mod resources;
pub mod state;

pub use conn::{Connection, ConnectionId};
pub use handshake::{expect_event, ClientHandshake, HandshakeState};
pub use pending::{OpKind, PendingOperation, PendingTable};
pub use resources::ResourceSet;
pub use state::{
    Action, ClientMachine, CompletionEvent, Machine, ProtocolState, Role, ServerMachine,
    StateMachine,
};
