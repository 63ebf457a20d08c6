//! Request/Response State Machines
//!
//! Every completion a connection observes is fed to its state machine,
//! which answers with the one [`Action`] the connection must carry out.
//! The machines never touch the transport themselves.
//!
//! ## Server
//!
//! ```text
//!              request received / Respond
//!   ┌───────────────────┐ ───────────────────────> ┌─────────────────┐
//!   │ WaitingForRequest │                          │ HandlingRequest │
//!   └───────────────────┘ <─────────────────────── └─────────────────┘
//!                          send completed / PostRecv
//! ```
//!
//! ## Client
//!
//! ```text
//!   ┌────────┐ submit ┌────────────────┐ send completed ┌────────────────────┐
//!   │ Vacant │──────> │ SendingRequest │──────────────> │ WaitingForResponse │
//!   └────────┘        └────────────────┘   / PostRecv   └─────────┬──────────┘
//!       ^                                                         │
//!       └──────────────── response received / Deliver ────────────┘
//! ```
//!
//! Remote read and write completions change nothing. Any other pairing of
//! state and completion is an [`RpcError::IllegalTransition`].

use crate::error::{Result, RpcError};
use crate::protocol::{Message, MessageKind};
use crate::transport::WcOpcode;
use std::fmt;

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Client: no request outstanding
    Vacant,
    /// Server: a receive is posted for the next request
    WaitingForRequest,
    /// Client: the request went out, a receive is posted for the response
    WaitingForResponse,
    /// Server: the response send is outstanding
    HandlingRequest,
    /// Reserved; neither machine enters it
    WritingResponse,
    /// Client: the request send is outstanding
    SendingRequest,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Vacant => "vacant",
            ProtocolState::WaitingForRequest => "waiting-for-request",
            ProtocolState::WaitingForResponse => "waiting-for-response",
            ProtocolState::HandlingRequest => "handling-request",
            ProtocolState::WritingResponse => "writing-response",
            ProtocolState::SendingRequest => "sending-request",
        };
        f.write_str(name)
    }
}

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    ServerSide,
    ClientSide,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::ServerSide => f.write_str("server-side"),
            Role::ClientSide => f.write_str("client-side"),
        }
    }
}

/// A successful completion, as the state machines see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    SendCompleted,
    /// A receive completed and its bytes decoded to this message
    Received(Message),
    /// A remote read or write finished
    RemoteAccess(WcOpcode),
}

impl fmt::Display for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionEvent::SendCompleted => f.write_str("send-completed"),
            CompletionEvent::Received(msg) => write!(f, "receive-completed ({})", msg.kind()),
            CompletionEvent::RemoteAccess(op) => write!(f, "remote-access ({op:?})"),
        }
    }
}

/// What the connection must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Post a receive for the next message
    PostRecv,
    /// Run the handler on this request and send back its output
    Respond(Message),
    /// Hand this response to the waiting caller
    Deliver(Message),
    Nothing,
}

/// One side's transition table.
pub trait StateMachine {
    fn role(&self) -> Role;

    fn state(&self) -> ProtocolState;

    /// Applies one completion.
    ///
    /// On error the state is left unchanged.
    fn advance(&mut self, event: CompletionEvent) -> Result<Action>;
}

fn illegal(role: Role, state: ProtocolState, event: &CompletionEvent) -> RpcError {
    RpcError::IllegalTransition {
        role,
        state,
        event: event.to_string(),
    }
}

/// Transition table of a server-side connection.
#[derive(Debug, Clone)]
pub struct ServerMachine {
    state: ProtocolState,
}

impl ServerMachine {
    /// A machine that is waiting for its first request.
    pub fn new() -> Self {
        Self {
            state: ProtocolState::WaitingForRequest,
        }
    }
}

impl Default for ServerMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for ServerMachine {
    fn role(&self) -> Role {
        Role::ServerSide
    }

    fn state(&self) -> ProtocolState {
        self.state
    }

    fn advance(&mut self, event: CompletionEvent) -> Result<Action> {
        match (self.state, event) {
            (_, CompletionEvent::RemoteAccess(_)) => Ok(Action::Nothing),
            (ProtocolState::WaitingForRequest, CompletionEvent::Received(msg))
                if msg.kind().is_request() =>
            {
                self.state = ProtocolState::HandlingRequest;
                Ok(Action::Respond(msg))
            }
            (ProtocolState::HandlingRequest, CompletionEvent::SendCompleted) => {
                self.state = ProtocolState::WaitingForRequest;
                Ok(Action::PostRecv)
            }
            (state, event) => Err(illegal(Role::ServerSide, state, &event)),
        }
    }
}

/// Transition table of a client-side connection.
#[derive(Debug, Clone)]
pub struct ClientMachine {
    state: ProtocolState,
}

impl ClientMachine {
    /// A machine with no request outstanding.
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Vacant,
        }
    }

    /// Records that a request is being sent.
    pub fn begin_request(&mut self) -> Result<()> {
        match self.state {
            ProtocolState::Vacant => {
                self.state = ProtocolState::SendingRequest;
                Ok(())
            }
            state => Err(RpcError::IllegalTransition {
                role: Role::ClientSide,
                state,
                event: "request-submitted".to_string(),
            }),
        }
    }
}

impl Default for ClientMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for ClientMachine {
    fn role(&self) -> Role {
        Role::ClientSide
    }

    fn state(&self) -> ProtocolState {
        self.state
    }

    fn advance(&mut self, event: CompletionEvent) -> Result<Action> {
        match (self.state, event) {
            (_, CompletionEvent::RemoteAccess(_)) => Ok(Action::Nothing),
            (ProtocolState::SendingRequest, CompletionEvent::SendCompleted) => {
                self.state = ProtocolState::WaitingForResponse;
                Ok(Action::PostRecv)
            }
            (ProtocolState::WaitingForResponse, CompletionEvent::Received(msg))
                if msg.kind() == MessageKind::Response =>
            {
                self.state = ProtocolState::Vacant;
                Ok(Action::Deliver(msg))
            }
            (state, event) => Err(illegal(Role::ClientSide, state, &event)),
        }
    }
}

/// The machine a connection was built with.
#[derive(Debug, Clone)]
pub enum Machine {
    Server(ServerMachine),
    Client(ClientMachine),
}

impl Machine {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::ServerSide => Machine::Server(ServerMachine::new()),
            Role::ClientSide => Machine::Client(ClientMachine::new()),
        }
    }
}

impl StateMachine for Machine {
    fn role(&self) -> Role {
        match self {
            Machine::Server(m) => m.role(),
            Machine::Client(m) => m.role(),
        }
    }

    fn state(&self) -> ProtocolState {
        match self {
            Machine::Server(m) => m.state(),
            Machine::Client(m) => m.state(),
        }
    }

    fn advance(&mut self, event: CompletionEvent) -> Result<Action> {
        match self {
            Machine::Server(m) => m.advance(event),
            Machine::Client(m) => m.advance(event),
        }
    }
}
