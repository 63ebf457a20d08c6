//! Connection
//!
//! A [`Connection`] ties one connection-manager endpoint to the resources,
//! state machine and pending-operation table that serve it. Pollers call
//! [`Connection::poll`]; everything else happens on the connection-manager
//! side.
//!
//! ## Buffer Use
//!
//! Requests and responses strictly alternate on a connection, so a single
//! wire record at offset 0 of the registered buffer serves every send and
//! every receive.

use super::handshake::{self, ClientHandshake, HandshakeState};
use super::pending::{OpKind, PendingOperation, PendingTable};
use super::resources::ResourceSet;
use super::state::{Action, CompletionEvent, Machine, ProtocolState, Role, StateMachine};
use crate::config::CQ_CAPACITY;
use crate::error::{Result, RpcError, Severity};
use crate::handler::RequestHandler;
use crate::poller::RequestGate;
use crate::protocol::{Message, MESSAGE_BUF_SIZE, WIRE_SIZE};
use crate::transport::{
    CmId, ConnParam, EndpointId, Sge, TransportError, WcOpcode, WorkCompletion,
};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Offset of the wire record inside the registered buffer.
const RECORD_OFFSET: usize = 0;

/// Stable identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<EndpointId> for ConnectionId {
    fn from(endpoint: EndpointId) -> Self {
        Self(endpoint.as_u64())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What the connection hands its results to.
enum Side {
    Server { handler: Arc<dyn RequestHandler> },
    Client { gate: Arc<RequestGate> },
}

/// One live connection and everything it owns.
pub struct Connection {
    /// Identifier derived from the endpoint
    id: ConnectionId,

    /// The connection-manager endpoint (None once torn down)
    cm_id: Option<CmId>,

    /// Transport resources (None once released)
    resources: Option<ResourceSet>,

    /// Request/response state machine, fixed by role
    machine: Machine,

    /// Posts awaiting their completion
    pending: PendingTable,

    /// Connection-establishment progress
    handshake: HandshakeState,

    /// The peer's memory-region key, learned during the handshake
    remote_rkey: Option<u32>,

    side: Side,

    /// Set once the connection stopped serving
    failed: bool,

    /// Completions drained by the last poll
    scratch: Vec<WorkCompletion>,

    /// Responses sent (server) or received (client)
    exchanges: u64,
}

impl Connection {
    /// Wraps a connection request the server is about to accept.
    pub fn server(cm_id: CmId, resources: ResourceSet, handler: Arc<dyn RequestHandler>) -> Self {
        Self::new(
            cm_id,
            resources,
            Role::ServerSide,
            HandshakeState::ConnectRequest,
            Side::Server { handler },
        )
    }

    /// Wraps a client endpoint whose route is resolved.
    pub fn client(cm_id: CmId, resources: ResourceSet, gate: Arc<RequestGate>) -> Self {
        Self::new(
            cm_id,
            resources,
            Role::ClientSide,
            HandshakeState::RouteResolved,
            Side::Client { gate },
        )
    }

    fn new(
        cm_id: CmId,
        resources: ResourceSet,
        role: Role,
        handshake: HandshakeState,
        side: Side,
    ) -> Self {
        Self {
            id: ConnectionId::from(cm_id.endpoint()),
            cm_id: Some(cm_id),
            resources: Some(resources),
            machine: Machine::for_role(role),
            pending: PendingTable::new(),
            handshake,
            remote_rkey: None,
            side,
            failed: false,
            scratch: Vec::with_capacity(CQ_CAPACITY as usize),
            exchanges: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.machine.role()
    }

    pub fn state(&self) -> ProtocolState {
        self.machine.state()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    pub fn remote_rkey(&self) -> Option<u32> {
        self.remote_rkey
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Responses sent (server side) or delivered (client side).
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Number of posts still waiting for their completion.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn resources(&self) -> Result<&ResourceSet> {
        self.resources.as_ref().ok_or(RpcError::Released)
    }

    fn cm_id_mut(&mut self) -> Result<&mut CmId> {
        self.cm_id
            .as_mut()
            .ok_or(RpcError::ConnectionGone(self.id))
    }

    pub fn local_rkey(&self) -> Result<u32> {
        self.resources()?.rkey()
    }

    /// Connect/accept parameters carrying this connection's key.
    pub fn conn_param(&self) -> Result<ConnParam> {
        Ok(handshake::conn_param(self.local_rkey()?))
    }

    /// Moves the handshake to `next`.
    pub fn advance_handshake(&mut self, next: HandshakeState) -> Result<()> {
        self.handshake.advance(next)
    }

    /// Records the peer's key from its private data.
    pub fn set_remote_rkey(&mut self, private_data: &[u8]) -> Result<()> {
        self.remote_rkey = Some(handshake::decode_rkey(private_data)?);
        Ok(())
    }

    /// Posts the receive for the first request. Server side only.
    pub fn arm(&mut self) -> Result<()> {
        if self.role() != Role::ServerSide || self.state() != ProtocolState::WaitingForRequest {
            return Err(RpcError::IllegalTransition {
                role: self.role(),
                state: self.state(),
                event: "arm".to_string(),
            });
        }
        self.post_recv()
    }

    /// Accepts the connection request. Server side only.
    pub fn accept(&mut self) -> Result<()> {
        let param = self.conn_param()?;
        self.handshake.advance(HandshakeState::Accepting)?;
        let id = self.id;
        let cm_id = self.cm_id_mut()?;
        if let Err(e) = cm_id.accept(&param) {
            self.handshake = HandshakeState::Closed;
            return Err(e.into());
        }
        debug!(conn = %id, "Accepted connection request");
        Ok(())
    }

    /// Refuses the connection request. Server side only; failures are logged.
    pub fn reject(&mut self) {
        let id = self.id;
        if let Some(cm_id) = self.cm_id.as_mut() {
            if let Err(source) = cm_id.reject(Bytes::new()) {
                let err = RpcError::Teardown {
                    step: "reject",
                    source,
                };
                warn!(conn = %id, error = %err, "Reject failed");
            }
        }
        self.handshake = HandshakeState::Closed;
    }

    /// Runs the client's connect step and records the server's key.
    pub fn establish(&mut self, driver: &ClientHandshake<'_>) -> Result<()> {
        let local_rkey = self.local_rkey()?;
        let cm_id = self
            .cm_id
            .as_mut()
            .ok_or(RpcError::ConnectionGone(self.id))?;
        let remote_rkey = driver.connect(&mut self.handshake, cm_id, local_rkey)?;
        self.remote_rkey = Some(remote_rkey);
        Ok(())
    }

    /// Runs the client's disconnect step. Failures are logged.
    pub fn disconnect(&mut self, driver: &ClientHandshake<'_>) {
        if let Some(cm_id) = self.cm_id.as_mut() {
            driver.disconnect(&mut self.handshake, cm_id);
        }
    }

    /// Sends a request. Client side only.
    ///
    /// The caller must hold the request gate.
    pub fn submit(&mut self, request: &Message) -> Result<()> {
        if self.failed {
            return Err(RpcError::ConnectionFailed(format!("{} is down", self.id)));
        }
        match &mut self.machine {
            Machine::Client(machine) => machine.begin_request()?,
            Machine::Server(machine) => {
                return Err(RpcError::IllegalTransition {
                    role: Role::ServerSide,
                    state: machine.state(),
                    event: "request-submitted".to_string(),
                })
            }
        }

        if let Err(e) = self.post_send(request) {
            self.fail(&e);
            return Err(e);
        }
        trace!(conn = %self.id, len = request.data_len(), "Request submitted");
        Ok(())
    }

    /// Drains the completion queue once and applies every completion.
    ///
    /// Returns how many completions were taken. A failed connection polls
    /// nothing.
    pub fn poll(&mut self) -> Result<usize> {
        if self.failed {
            return Ok(0);
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let polled = self
            .resources()?
            .cq()?
            .poll(&mut scratch, CQ_CAPACITY as usize)
            .map_err(|source| RpcError::CompletionQueue {
                conn: self.id,
                source,
            });

        let result = match polled {
            Ok(n) => {
                let mut outcome = Ok(n);
                for wc in scratch.drain(..) {
                    if let Err(e) = self.process(wc) {
                        outcome = Err(e);
                        break;
                    }
                    if self.failed {
                        break;
                    }
                }
                outcome
            }
            Err(e) => Err(e),
        };

        self.scratch = scratch;
        result
    }

    /// Applies one completion.
    pub fn process(&mut self, wc: WorkCompletion) -> Result<()> {
        let op = self.pending.take(wc.wr_id)?;

        if !wc.status.is_success() {
            if wc.status.is_flush() {
                trace!(conn = %self.id, wr_id = wc.wr_id, kind = %op.kind, "Flushed work request");
                self.fail_quietly();
                return Ok(());
            }
            return Err(RpcError::WorkCompletion {
                conn: self.id,
                wr_id: wc.wr_id,
                status: wc.status,
            });
        }

        let event = match wc.opcode {
            WcOpcode::Send => CompletionEvent::SendCompleted,
            WcOpcode::Recv => {
                let bytes = self
                    .resources()?
                    .mr()?
                    .read(op.offset, wc.byte_len as usize)?;
                CompletionEvent::Received(Message::decode(&bytes)?)
            }
            other => CompletionEvent::RemoteAccess(other),
        };

        trace!(conn = %self.id, state = %self.state(), event = %event, "Completion");
        let action = self.machine.advance(event)?;
        self.execute(action)
    }

    fn execute(&mut self, action: Action) -> Result<()> {
        match action {
            Action::PostRecv => self.post_recv(),
            Action::Respond(request) => {
                let Side::Server { handler } = &self.side else {
                    return Err(RpcError::IllegalTransition {
                        role: self.role(),
                        state: self.state(),
                        event: "respond".to_string(),
                    });
                };
                let output = handler.handle(request.payload());
                if output.len() > MESSAGE_BUF_SIZE {
                    return Err(RpcError::HandlerContract { len: output.len() });
                }
                let response = Message::response(&output)?;
                self.post_send(&response)?;
                self.exchanges += 1;
                Ok(())
            }
            Action::Deliver(response) => {
                if let Side::Client { gate } = &self.side {
                    gate.complete(response);
                }
                self.exchanges += 1;
                Ok(())
            }
            Action::Nothing => Ok(()),
        }
    }

    fn post_recv(&mut self) -> Result<()> {
        let op = PendingOperation {
            kind: OpKind::Recv,
            offset: RECORD_OFFSET,
            len: WIRE_SIZE,
        };
        let wr_id = self.pending.insert(op)?;
        let resources = self.resources.as_ref().ok_or(RpcError::Released)?;
        let sge = Sge {
            mr: resources.mr()?,
            offset: RECORD_OFFSET,
            length: WIRE_SIZE as u32,
        };
        if let Err(e) = resources.qp()?.post_recv(wr_id, &sge) {
            let _ = self.pending.take(wr_id);
            return Err(e.into());
        }
        Ok(())
    }

    fn post_send(&mut self, message: &Message) -> Result<()> {
        let resources = self.resources.as_ref().ok_or(RpcError::Released)?;
        let mr = resources.mr()?;
        mr.write(RECORD_OFFSET, &message.encode())?;

        let op = PendingOperation {
            kind: OpKind::Send,
            offset: RECORD_OFFSET,
            len: WIRE_SIZE,
        };
        let wr_id = self.pending.insert(op)?;
        let resources = self.resources.as_ref().ok_or(RpcError::Released)?;
        let sge = Sge {
            mr: resources.mr()?,
            offset: RECORD_OFFSET,
            length: WIRE_SIZE as u32,
        };
        if let Err(e) = resources.qp()?.post_send(wr_id, &sge) {
            let _ = self.pending.take(wr_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stops serving after `err`: wakes any waiting caller and disconnects so
    /// the connection manager reports the connection gone.
    pub fn fail(&mut self, err: &RpcError) {
        if self.failed {
            return;
        }
        match err.severity() {
            Severity::Fatal => error!(conn = %self.id, error = %err, "Connection failed"),
            Severity::Warning => warn!(conn = %self.id, error = %err, "Connection failed"),
        }
        self.shut_down(err.to_string());
    }

    /// Stops serving because the link went down.
    fn fail_quietly(&mut self) {
        if self.failed {
            return;
        }
        debug!(conn = %self.id, "Link went down");
        self.shut_down("link went down".to_string());
    }

    fn shut_down(&mut self, reason: String) {
        self.failed = true;
        if let Side::Client { gate } = &self.side {
            gate.fail(reason);
        }
        let id = self.id;
        if let Some(cm_id) = self.cm_id.as_mut() {
            match cm_id.disconnect() {
                Ok(()) | Err(TransportError::NotConnected) => {}
                Err(e) => warn!(conn = %id, error = %e, "Disconnect after failure failed"),
            }
        }
    }

    /// Releases the resources, then destroys the endpoint.
    ///
    /// Returns the warnings of every failed step. Calling this again is a
    /// no-op.
    pub fn teardown(&mut self) -> Vec<RpcError> {
        let mut warnings = Vec::new();
        if let Some(mut resources) = self.resources.take() {
            warnings.extend(resources.release());
        }
        if let Some(cm_id) = self.cm_id.take() {
            if let Err(source) = cm_id.destroy() {
                let err = RpcError::Teardown {
                    step: "destroy endpoint",
                    source,
                };
                warn!(conn = %self.id, error = %err, "Teardown step failed");
                warnings.push(err);
            }
        }
        if let Side::Client { gate } = &self.side {
            gate.fail("connection closed".to_string());
        }
        if !self.pending.is_empty() {
            debug!(
                conn = %self.id,
                sends = self.pending.outstanding(OpKind::Send),
                recvs = self.pending.outstanding(OpKind::Recv),
                "Discarding outstanding work requests"
            );
            self.pending.clear();
        }
        self.handshake = HandshakeState::Closed;
        info!(conn = %self.id, exchanges = self.exchanges, "Connection torn down");
        warnings
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.resources.is_some() || self.cm_id.is_some() {
            self.teardown();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role())
            .field("state", &self.state())
            .field("handshake", &self.handshake)
            .field("outstanding", &self.pending.len())
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EchoHandler;
    use crate::poller::ConnectionRegistry;
    use crate::transport::{Device, EventChannel, WcStatus};

    fn server_conn(channel: &EventChannel) -> Connection {
        let mut cm_id = channel.create_id();
        let resources = ResourceSet::acquire(&mut cm_id, 1).unwrap();
        Connection::server(cm_id, resources, Arc::new(EchoHandler))
    }

    fn client_conn(channel: &EventChannel, gate: &Arc<RequestGate>) -> Connection {
        let mut cm_id = channel.create_id();
        let resources = ResourceSet::acquire(&mut cm_id, 1).unwrap();
        Connection::client(cm_id, resources, Arc::clone(gate))
    }

    fn op(kind: OpKind) -> PendingOperation {
        PendingOperation {
            kind,
            offset: RECORD_OFFSET,
            len: WIRE_SIZE,
        }
    }

    fn completion(
        conn: &Connection,
        wr_id: u64,
        opcode: WcOpcode,
        status: WcStatus,
    ) -> WorkCompletion {
        let byte_len = match (opcode, status) {
            (WcOpcode::Recv, WcStatus::Success) => WIRE_SIZE as u32,
            _ => 0,
        };
        WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num: conn.resources().unwrap().qp().unwrap().qp_num(),
        }
    }

    fn enqueue(conn: &Connection, wc: WorkCompletion) {
        conn.resources().unwrap().cq().unwrap().inner().push(wc);
    }

    /// Moves a client connection to SendingRequest as if its request went
    /// out, returning the send's id.
    fn request_in_flight(conn: &mut Connection) -> u64 {
        match &mut conn.machine {
            Machine::Client(machine) => machine.begin_request().unwrap(),
            Machine::Server(_) => panic!("not a client connection"),
        }
        conn.pending.insert(op(OpKind::Send)).unwrap()
    }

    #[test]
    fn test_unknown_work_request_id() {
        let channel = EventChannel::with_device(Device::open("conn-unknown"));
        let mut conn = server_conn(&channel);

        let wc = completion(&conn, 0xdead_beef, WcOpcode::Recv, WcStatus::Success);
        assert!(matches!(
            conn.process(wc),
            Err(RpcError::UnknownOperation(id)) if id == 0xdead_beef
        ));

        // An id whose completion was already applied
        let wr_id = conn.pending.insert(op(OpKind::Recv)).unwrap();
        conn.pending.take(wr_id).unwrap();
        let wc = completion(&conn, wr_id, WcOpcode::Recv, WcStatus::Success);
        assert!(matches!(
            conn.process(wc),
            Err(RpcError::UnknownOperation(id)) if id == wr_id
        ));
        assert_eq!(conn.state(), ProtocolState::WaitingForRequest);
    }

    #[test]
    fn test_error_status_is_fatal() {
        let channel = EventChannel::with_device(Device::open("conn-error-status"));
        let mut conn = server_conn(&channel);

        let wr_id = conn.pending.insert(op(OpKind::Recv)).unwrap();
        let wc = completion(&conn, wr_id, WcOpcode::Recv, WcStatus::RetryExceeded);
        assert!(matches!(
            conn.process(wc),
            Err(RpcError::WorkCompletion {
                status: WcStatus::RetryExceeded,
                wr_id: id,
                ..
            }) if id == wr_id
        ));
        assert_eq!(conn.outstanding(), 0);
    }

    #[test]
    fn test_flush_fails_quietly() {
        let channel = EventChannel::with_device(Device::open("conn-flush"));
        let gate = Arc::new(RequestGate::new());
        let mut conn = client_conn(&channel, &gate);
        let ticket = gate.acquire().unwrap();
        let wr_id = request_in_flight(&mut conn);

        let wc = completion(&conn, wr_id, WcOpcode::Send, WcStatus::WrFlushError);
        assert!(conn.process(wc).is_ok());
        assert!(conn.is_failed());
        assert!(matches!(
            gate.wait(ticket),
            Err(RpcError::ConnectionFailed(_))
        ));
        assert_eq!(conn.poll().unwrap(), 0);
    }

    #[test]
    fn test_receive_while_sending_is_illegal() {
        let device = Device::open("conn-illegal");
        let channel = EventChannel::with_device(Arc::clone(&device));
        let gate = Arc::new(RequestGate::new());
        let mut conn = client_conn(&channel, &gate);
        let ticket = gate.acquire().unwrap();
        request_in_flight(&mut conn);

        // A response lands before the request's send completed
        let wr_id = conn.pending.insert(op(OpKind::Recv)).unwrap();
        let response = Message::response(b"early").unwrap().encode();
        conn.resources()
            .unwrap()
            .mr()
            .unwrap()
            .write(RECORD_OFFSET, &response)
            .unwrap();
        enqueue(&conn, completion(&conn, wr_id, WcOpcode::Recv, WcStatus::Success));

        let id = conn.id();
        let registry = ConnectionRegistry::new();
        registry.register(conn);
        registry.poll_pass();

        let (failed, state) = registry
            .with_connection(id, |conn| (conn.is_failed(), conn.state()))
            .unwrap();
        assert!(failed);
        assert_eq!(state, ProtocolState::SendingRequest);
        assert!(matches!(
            gate.wait(ticket),
            Err(RpcError::ConnectionFailed(_))
        ));

        drop(registry.drain());
        assert!(device.resource_counts().is_empty());
    }

    #[test]
    fn test_failing_connection_does_not_stop_pass() {
        let device = Device::open("conn-isolation");
        let channel = EventChannel::with_device(Arc::clone(&device));
        let registry = ConnectionRegistry::new();

        // A server connection handed a completion nobody posted
        let broken = server_conn(&channel);
        enqueue(
            &broken,
            completion(&broken, 0xdead_beef, WcOpcode::Recv, WcStatus::Success),
        );
        let broken_id = broken.id();

        // A client connection with its request sent and the response inbound
        let gate = Arc::new(RequestGate::new());
        let mut healthy = client_conn(&channel, &gate);
        let ticket = gate.acquire().unwrap();
        let send_id = request_in_flight(&mut healthy);
        enqueue(
            &healthy,
            completion(&healthy, send_id, WcOpcode::Send, WcStatus::Success),
        );
        let response = Message::response(b"pong").unwrap().encode();
        healthy
            .resources()
            .unwrap()
            .qp()
            .unwrap()
            .inner()
            .deliver(Bytes::copy_from_slice(&response));
        let healthy_id = healthy.id();

        registry.register(broken);
        registry.register(healthy);

        // First pass posts the receive, second applies the response
        registry.poll_pass();
        registry.poll_pass();

        assert!(registry
            .with_connection(broken_id, |conn| conn.is_failed())
            .unwrap());
        let (failed, state, exchanges) = registry
            .with_connection(healthy_id, |conn| {
                (conn.is_failed(), conn.state(), conn.exchanges())
            })
            .unwrap();
        assert!(!failed);
        assert_eq!(state, ProtocolState::Vacant);
        assert_eq!(exchanges, 1);
        assert_eq!(gate.wait(ticket).unwrap().payload(), b"pong");

        drop(registry.drain());
        assert!(device.resource_counts().is_empty());
    }
}
