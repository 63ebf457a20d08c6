//! Connection Manager
//!
//! Connection establishment is asynchronous. Every call on a [`CmId`] that
//! starts a step (address resolution, route resolution, connect, accept,
//! disconnect) returns immediately; its outcome arrives later as a
//! [`CmEvent`] on the [`EventChannel`] the identifier was created from.
//!
//! ## Client Side
//!
//! ```text
//! resolve_addr ──> AddrResolved
//! resolve_route ─> RouteResolved
//! connect ───────> Established (private data of the accept)
//!              └─> Rejected / Unreachable / ConnectError
//! disconnect ────> Disconnected
//! ```
//!
//! ## Server Side
//!
//! A bound identifier starts listening with [`CmId::listen`]. Each incoming
//! connection request arrives as a `ConnectRequest` event that carries a new
//! identifier for the connection ([`CmEvent::take_id`]); the server either
//! accepts or rejects it. While `backlog` requests are still waiting for a
//! decision, further requests are rejected by the listener itself.
//!
//! Whichever side notices a dead link first reports exactly one
//! `Disconnected` event for it.

use super::{lock, Result, TransportError};
use crate::transport::cq::CompletionQueue;
use crate::transport::device::{Device, ProtectionDomain};
use crate::transport::qp::{QpCaps, QpInner, QueuePair};
use crate::transport::wire::{Frame, Link};
use bytes::Bytes;
use std::fmt;
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Event status: the address did not resolve.
pub const STATUS_HOST_UNREACHABLE: i32 = -113;
/// Event status: the step did not finish in time.
pub const STATUS_TIMED_OUT: i32 = -110;
/// Event status: nothing is listening at the destination.
pub const STATUS_CONNECTION_REFUSED: i32 = -111;
/// Event status: the peer dropped the connection mid-handshake.
pub const STATUS_CONNECTION_RESET: i32 = -104;
/// Event status carried by `Rejected`: the peer's consumer refused.
pub const STATUS_CONSUMER_REJECT: i32 = 28;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(2);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection-manager endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    fn next() -> Self {
        Self(NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection-manager event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmEventKind::AddrResolved => "addr-resolved",
            CmEventKind::AddrError => "addr-error",
            CmEventKind::RouteResolved => "route-resolved",
            CmEventKind::RouteError => "route-error",
            CmEventKind::ConnectRequest => "connect-request",
            CmEventKind::ConnectError => "connect-error",
            CmEventKind::Unreachable => "unreachable",
            CmEventKind::Rejected => "rejected",
            CmEventKind::Established => "established",
            CmEventKind::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Parameters exchanged by connect and accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParam {
    /// Opaque bytes handed to the peer
    pub private_data: Bytes,
    /// Outstanding inbound remote reads the responder allows
    pub responder_resources: u8,
    /// Outstanding outbound remote reads the initiator issues
    pub initiator_depth: u8,
    /// How often a receiver-not-ready peer is retried (7 = forever)
    pub rnr_retry_count: u8,
}

impl ConnParam {
    pub fn with_private_data(private_data: impl Into<Bytes>) -> Self {
        Self {
            private_data: private_data.into(),
            ..Self::default()
        }
    }
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            private_data: Bytes::new(),
            responder_resources: 16,
            initiator_depth: 16,
            rnr_retry_count: 7,
        }
    }
}

/// One connection-manager event.
///
/// Every event taken from a channel must be handed back with
/// [`EventChannel::ack`].
#[derive(Debug)]
pub struct CmEvent {
    pub kind: CmEventKind,
    /// Zero on success, a negative errno-style code or a reject reason
    pub status: i32,
    /// The endpoint the event is about
    pub endpoint: EndpointId,
    /// For connection requests, the listening endpoint
    pub listen_endpoint: Option<EndpointId>,
    pub private_data: Bytes,
    /// For connection requests, the initiator's parameters
    pub param: Option<ConnParam>,
    new_id: Option<CmId>,
}

impl CmEvent {
    fn new(kind: CmEventKind, endpoint: EndpointId) -> Self {
        Self {
            kind,
            status: 0,
            endpoint,
            listen_endpoint: None,
            private_data: Bytes::new(),
            param: None,
            new_id: None,
        }
    }

    fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    fn with_private_data(mut self, private_data: Bytes) -> Self {
        self.private_data = private_data;
        self
    }

    /// Takes the identifier of the new connection out of a
    /// `ConnectRequest` event.
    ///
    /// An identifier left in the event is destroyed with it, which drops the
    /// pending request.
    pub fn take_id(&mut self) -> Option<CmId> {
        self.new_id.take()
    }
}

#[derive(Clone)]
struct EventSink {
    tx: Sender<CmEvent>,
}

impl EventSink {
    fn post(&self, event: CmEvent) {
        trace!(kind = %event.kind, endpoint = %event.endpoint, status = event.status, "Posting CM event");
        // A closed channel means nobody is left to care
        let _ = self.tx.send(event);
    }
}

/// Delivers connection-manager events to their consumer.
pub struct EventChannel {
    device: Arc<Device>,
    sink: EventSink,
    rx: Mutex<Receiver<CmEvent>>,
    unacked: AtomicUsize,
}

impl EventChannel {
    /// Creates a channel bound to the process-wide default device.
    pub fn new() -> Self {
        Self::with_device(Device::default_device())
    }

    /// Creates a channel whose identifiers allocate on `device`.
    pub fn with_device(device: Arc<Device>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            device,
            sink: EventSink { tx },
            rx: Mutex::new(rx),
            unacked: AtomicUsize::new(0),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Creates a fresh identifier that reports to this channel.
    pub fn create_id(&self) -> CmId {
        CmId::new(Arc::clone(&self.device), self.sink.clone())
    }

    /// Blocks until the next event arrives.
    pub fn get_event(&self) -> Result<CmEvent> {
        let event = lock(&self.rx)
            .recv()
            .map_err(|_| TransportError::ChannelClosed)?;
        self.unacked.fetch_add(1, Ordering::AcqRel);
        Ok(event)
    }

    /// Waits up to `timeout` for the next event.
    pub fn get_event_timeout(&self, timeout: Duration) -> Result<Option<CmEvent>> {
        match lock(&self.rx).recv_timeout(timeout) {
            Ok(event) => {
                self.unacked.fetch_add(1, Ordering::AcqRel);
                Ok(Some(event))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::ChannelClosed),
        }
    }

    /// Acknowledges an event taken from this channel.
    pub fn ack(&self, event: CmEvent) {
        let _ = self
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        drop(event);
    }

    /// Number of events taken but not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.unacked.load(Ordering::Acquire)
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("device", &self.device.name())
            .field("unacked", &self.unacked())
            .finish()
    }
}

/// Releases one backlog slot of the listener when dropped.
struct BacklogSlot(Arc<AtomicUsize>);

impl Drop for BacklogSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection request that has not been accepted or rejected yet.
struct PendingRequest {
    stream: TcpStream,
    slot: BacklogSlot,
}

#[derive(Default)]
struct CmState {
    remote: Option<SocketAddr>,
    route_resolved: bool,
    local: Option<SocketAddr>,
    listener: Option<TcpListener>,
    qp: Option<Arc<QpInner>>,
    link: Option<Arc<Link>>,
    pending: Option<PendingRequest>,
    connecting: bool,
}

#[derive(Default)]
struct CmShared {
    state: Mutex<CmState>,
    destroyed: AtomicBool,
}

/// Posts events for one endpoint until the endpoint is destroyed.
#[derive(Clone)]
struct Notifier {
    endpoint: EndpointId,
    sink: EventSink,
    shared: Arc<CmShared>,
}

impl Notifier {
    fn event(&self, kind: CmEventKind) -> CmEvent {
        CmEvent::new(kind, self.endpoint)
    }

    fn post(&self, event: CmEvent) {
        if !self.shared.destroyed.load(Ordering::Acquire) {
            self.sink.post(event);
        }
    }
}

/// A connection-manager identifier: one endpoint of one connection, or a
/// listening endpoint.
pub struct CmId {
    endpoint: EndpointId,
    device: Arc<Device>,
    notifier: Notifier,
    stop_listener: Option<Arc<AtomicBool>>,
    connect_timeout: Duration,
}

impl CmId {
    fn new(device: Arc<Device>, sink: EventSink) -> Self {
        let endpoint = EndpointId::next();
        Self {
            endpoint,
            device,
            notifier: Notifier {
                endpoint,
                sink,
                shared: Arc::new(CmShared::default()),
            },
            stop_listener: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    fn shared(&self) -> &CmShared {
        &self.notifier.shared
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// The device resources for this endpoint must be allocated on.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Bounds how long [`connect`](Self::connect) tries to reach the peer.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared().state).local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared().state).remote
    }

    /// Resolves `host:port`. Completes with `AddrResolved` or `AddrError`.
    pub fn resolve_addr(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let resolved = pick_address(host, port);
        let elapsed = started.elapsed();

        let event = match resolved {
            Ok(addr) if elapsed <= timeout => {
                let mut state = lock(&self.shared().state);
                state.remote = Some(addr);
                state.route_resolved = false;
                debug!(endpoint = %self.endpoint, %addr, "Address resolved");
                self.notifier.event(CmEventKind::AddrResolved)
            }
            Ok(_) => self
                .notifier
                .event(CmEventKind::AddrError)
                .with_status(STATUS_TIMED_OUT),
            Err(e) => {
                debug!(endpoint = %self.endpoint, host, port, error = %e, "Address resolution failed");
                self.notifier
                    .event(CmEventKind::AddrError)
                    .with_status(STATUS_HOST_UNREACHABLE)
            }
        };
        self.notifier.post(event);
        Ok(())
    }

    /// Resolves the route to the resolved address. Completes with
    /// `RouteResolved`.
    pub fn resolve_route(&mut self) -> Result<()> {
        let mut state = lock(&self.shared().state);
        if state.remote.is_none() {
            return Err(TransportError::NotResolved);
        }
        state.route_resolved = true;
        drop(state);
        self.notifier.post(self.notifier.event(CmEventKind::RouteResolved));
        Ok(())
    }

    /// Binds the endpoint to a local address. Port 0 picks a free port.
    pub fn bind_addr(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        let addr = pick_address(host, port)?;
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;

        let mut state = lock(&self.shared().state);
        state.local = Some(local);
        state.listener = Some(listener);
        debug!(endpoint = %self.endpoint, addr = %local, "Endpoint bound");
        Ok(local)
    }

    /// Starts accepting connection requests on the bound address.
    pub fn listen(&mut self, backlog: usize) -> Result<()> {
        if backlog == 0 {
            return Err(TransportError::InvalidArgument("backlog must be non-zero"));
        }
        let listener = lock(&self.shared().state)
            .listener
            .take()
            .ok_or(TransportError::InvalidState("endpoint is not bound"))?;
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = ListenContext {
            endpoint: self.endpoint,
            device: Arc::clone(&self.device),
            sink: self.notifier.sink.clone(),
            backlog,
            pending: Arc::new(AtomicUsize::new(0)),
            stop: Arc::clone(&stop),
        };
        thread::Builder::new()
            .name(format!("cm-listen-{}", self.endpoint))
            .spawn(move || accept_loop(listener, ctx))?;

        self.stop_listener = Some(stop);
        debug!(endpoint = %self.endpoint, backlog, "Listening");
        Ok(())
    }

    /// Creates the endpoint's queue pair.
    pub fn create_qp(
        &mut self,
        pd: &ProtectionDomain,
        cq: &CompletionQueue,
        caps: QpCaps,
    ) -> Result<QueuePair> {
        if !Arc::ptr_eq(pd.device(), &self.device) {
            return Err(TransportError::InvalidArgument(
                "protection domain belongs to another device",
            ));
        }
        let mut state = lock(&self.shared().state);
        if state.qp.as_ref().is_some_and(|qp| !qp.is_destroyed()) {
            return Err(TransportError::InvalidState("endpoint already has a queue pair"));
        }
        let qp = QueuePair::create(pd, cq, caps)?;
        state.qp = Some(Arc::clone(qp.inner()));
        Ok(qp)
    }

    /// Starts connecting to the resolved route.
    ///
    /// Completes with `Established` (carrying the accept's private data),
    /// `Rejected`, `Unreachable` or `ConnectError`.
    pub fn connect(&mut self, param: &ConnParam) -> Result<()> {
        let (remote, qp) = {
            let mut state = lock(&self.shared().state);
            if !state.route_resolved {
                return Err(TransportError::NotResolved);
            }
            let remote = state.remote.ok_or(TransportError::NotResolved)?;
            if state.connecting || state.link.is_some() {
                return Err(TransportError::InvalidState("endpoint is already connecting"));
            }
            let qp = state
                .qp
                .clone()
                .ok_or(TransportError::InvalidState("endpoint has no queue pair"))?;
            state.connecting = true;
            (remote, qp)
        };

        let notifier = self.notifier.clone();
        let request = Frame::ConnectRequest(param.clone());
        let timeout = self.connect_timeout;
        thread::Builder::new()
            .name(format!("cm-link-{}", self.endpoint))
            .spawn(move || connect_link(remote, timeout, request, qp, notifier))?;
        Ok(())
    }

    /// Accepts the connection request this identifier was created for.
    pub fn accept(&mut self, param: &ConnParam) -> Result<()> {
        let mut state = lock(&self.shared().state);
        let qp = state
            .qp
            .clone()
            .ok_or(TransportError::InvalidState("endpoint has no queue pair"))?;
        let PendingRequest { stream, slot } = state
            .pending
            .take()
            .ok_or(TransportError::InvalidState("no connection request to accept"))?;

        let reader = stream.try_clone()?;
        let link = Arc::new(Link::new(stream));
        link.send(&Frame::Accept(param.private_data.clone()))?;
        qp.attach_link(Arc::clone(&link));
        state.link = Some(Arc::clone(&link));
        drop(state);
        drop(slot);

        self.notifier
            .post(self.notifier.event(CmEventKind::Established));

        let notifier = self.notifier.clone();
        thread::Builder::new()
            .name(format!("cm-link-{}", self.endpoint))
            .spawn(move || pump(reader, link, qp, notifier))?;
        Ok(())
    }

    /// Refuses the connection request this identifier was created for.
    pub fn reject(&mut self, private_data: Bytes) -> Result<()> {
        let PendingRequest { stream, slot } = lock(&self.shared().state)
            .pending
            .take()
            .ok_or(TransportError::InvalidState("no connection request to reject"))?;
        let result = (&stream).write_all(&Frame::Reject(private_data).encode());
        let _ = stream.shutdown(Shutdown::Both);
        drop(slot);
        result.map_err(TransportError::from)
    }

    /// Disconnects the endpoint. Completes with `Disconnected`.
    ///
    /// Fails with [`TransportError::NotConnected`] when there is no link or
    /// the disconnect was already reported.
    pub fn disconnect(&mut self) -> Result<()> {
        let (link, qp) = {
            let state = lock(&self.shared().state);
            (state.link.clone(), state.qp.clone())
        };
        let link = link.ok_or(TransportError::NotConnected)?;
        if !link.mark_disconnected() {
            return Err(TransportError::NotConnected);
        }

        if let Err(e) = link.send(&Frame::Disconnect) {
            debug!(endpoint = %self.endpoint, error = %e, "Disconnect frame not sent");
        }
        link.close();
        if let Some(qp) = qp {
            qp.enter_error();
        }
        self.notifier
            .post(self.notifier.event(CmEventKind::Disconnected));
        Ok(())
    }

    /// Destroys the identifier, closing its link and stopping its listener.
    pub fn destroy(self) -> Result<()> {
        trace!(endpoint = %self.endpoint, "Destroying CM identifier");
        drop(self);
        Ok(())
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop_listener {
            stop.store(true, Ordering::Release);
        }
        let shared = &self.notifier.shared;
        shared.destroyed.store(true, Ordering::Release);

        let mut state = lock(&shared.state);
        if let Some(link) = state.link.take() {
            link.mark_disconnected();
            link.close();
        }
        state.pending = None;
        state.listener = None;
        state.qp = None;
    }
}

impl fmt::Debug for CmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared().state);
        f.debug_struct("CmId")
            .field("endpoint", &self.endpoint)
            .field("local", &state.local)
            .field("remote", &state.remote)
            .field("connected", &state.link.is_some())
            .finish()
    }
}

/// Resolves `host:port`, preferring IPv4.
fn pick_address(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or(TransportError::InvalidArgument("address did not resolve"))
}

fn connect_status(err: &io::Error) -> i32 {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => STATUS_TIMED_OUT,
        ErrorKind::ConnectionRefused => STATUS_CONNECTION_REFUSED,
        _ => STATUS_HOST_UNREACHABLE,
    }
}

/// Initiator side of a link: connect, exchange the handshake, then pump.
fn connect_link(
    remote: SocketAddr,
    timeout: Duration,
    request: Frame,
    qp: Arc<QpInner>,
    notifier: Notifier,
) {
    let stream = match TcpStream::connect_timeout(&remote, timeout) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(endpoint = %notifier.endpoint, %remote, error = %e, "Peer unreachable");
            let event = notifier
                .event(CmEventKind::Unreachable)
                .with_status(connect_status(&e));
            notifier.post(event);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!(endpoint = %notifier.endpoint, error = %e, "Failed to clone link stream");
            let event = notifier
                .event(CmEventKind::ConnectError)
                .with_status(STATUS_CONNECTION_RESET);
            notifier.post(event);
            return;
        }
    };
    let link = Arc::new(Link::new(writer));
    {
        let mut state = lock(&notifier.shared.state);
        if notifier.shared.destroyed.load(Ordering::Acquire) {
            link.close();
            return;
        }
        state.link = Some(Arc::clone(&link));
    }

    let mut reader = stream;
    let reply = link
        .send(&request)
        .map_err(|e| io::Error::other(e.to_string()))
        .and_then(|()| Frame::read_from(&mut reader));

    match reply {
        Ok(Some(Frame::Accept(private_data))) => {
            qp.attach_link(Arc::clone(&link));
            let event = notifier
                .event(CmEventKind::Established)
                .with_private_data(private_data);
            notifier.post(event);
            pump(reader, link, qp, notifier);
        }
        Ok(Some(Frame::Reject(private_data))) => {
            link.close();
            if link.mark_disconnected() {
                let event = notifier
                    .event(CmEventKind::Rejected)
                    .with_status(STATUS_CONSUMER_REJECT)
                    .with_private_data(private_data);
                notifier.post(event);
            }
        }
        other => {
            if let Err(e) = &other {
                debug!(endpoint = %notifier.endpoint, error = %e, "Handshake failed");
            }
            link.close();
            if link.mark_disconnected() {
                let event = notifier
                    .event(CmEventKind::ConnectError)
                    .with_status(STATUS_CONNECTION_RESET);
                notifier.post(event);
            }
        }
    }
}

/// Moves inbound data into the queue pair until the link dies.
fn pump(mut reader: TcpStream, link: Arc<Link>, qp: Arc<QpInner>, notifier: Notifier) {
    loop {
        match Frame::read_from(&mut reader) {
            Ok(Some(Frame::Data(data))) => qp.deliver(data),
            Ok(Some(Frame::Disconnect)) | Ok(None) => break,
            Ok(Some(other)) => {
                debug!(endpoint = %notifier.endpoint, frame = ?other, "Unexpected frame on connected link");
                break;
            }
            Err(e) => {
                if !link.is_disconnected() {
                    debug!(endpoint = %notifier.endpoint, error = %e, "Link read failed");
                }
                break;
            }
        }
    }

    qp.enter_error();
    if link.mark_disconnected() {
        notifier.post(notifier.event(CmEventKind::Disconnected));
    }
    link.close();
    trace!(endpoint = %notifier.endpoint, "Link reader finished");
}

struct ListenContext {
    endpoint: EndpointId,
    device: Arc<Device>,
    sink: EventSink,
    backlog: usize,
    pending: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
}

fn accept_loop(listener: TcpListener, ctx: ListenContext) {
    while !ctx.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = admit(stream, peer, &ctx) {
                    debug!(listener = %ctx.endpoint, %peer, error = %e, "Dropped incoming connection");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                warn!(listener = %ctx.endpoint, error = %e, "Accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    trace!(listener = %ctx.endpoint, "Listener stopped");
}

/// Reads the connect request off a new stream and raises it as an event.
fn admit(stream: TcpStream, peer: SocketAddr, ctx: &ListenContext) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let param = match Frame::read_from(&mut &stream)? {
        Some(Frame::ConnectRequest(param)) => param,
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "expected a connect request",
            ))
        }
    };
    stream.set_read_timeout(None)?;

    let admitted = ctx
        .pending
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < ctx.backlog).then_some(n + 1)
        })
        .is_ok();
    if !admitted {
        warn!(listener = %ctx.endpoint, %peer, backlog = ctx.backlog, "Listen backlog full, rejecting");
        (&stream).write_all(&Frame::Reject(Bytes::new()).encode())?;
        return Ok(());
    }

    let child = CmId::new(Arc::clone(&ctx.device), ctx.sink.clone());
    {
        let mut state = lock(&child.notifier.shared.state);
        state.remote = Some(peer);
        state.local = stream.local_addr().ok();
        state.pending = Some(PendingRequest {
            stream,
            slot: BacklogSlot(Arc::clone(&ctx.pending)),
        });
    }

    let mut event = CmEvent::new(CmEventKind::ConnectRequest, child.endpoint)
        .with_private_data(param.private_data.clone());
    event.listen_endpoint = Some(ctx.endpoint);
    event.param = Some(param);
    event.new_id = Some(child);
    debug!(listener = %ctx.endpoint, %peer, "Connection request");
    ctx.sink.post(event);
    Ok(())
}
