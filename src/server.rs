//! Server
//!
//! The server side of the messaging layer: a listening endpoint, a
//! connection-manager reactor and one [`ServerPoller`].
//!
//! ## Event Handling
//!
//! ```text
//!  ConnectRequest ─> at capacity? ── yes ──> reject
//!                         │ no
//!                         ▼
//!                   acquire resources ─> arm first receive ─> accept ─> register
//!
//!  Established ───> advance handshake
//!  Disconnected ──> deregister ─> release resources ─> destroy endpoint
//! ```
//!
//! A connection attempt that fails at any step is rejected and logged; the
//! reactor keeps serving everyone else.

use crate::config::RpcConfig;
use crate::connection::{Connection, ConnectionId, HandshakeState, ResourceSet};
use crate::error::{Result, RpcError, Severity};
use crate::handler::RequestHandler;
use crate::poller::{strategy_for, ConnectionRegistry, ServerPoller};
use crate::transport::{CmEvent, CmEventKind, CmId, EventChannel};
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the reactor blocks on the event channel before checking for
/// shutdown.
const EVENT_WAIT: Duration = Duration::from_millis(100);

/// Statistics for the server
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted
    pub connections_accepted: AtomicU64,
    /// Connections currently registered
    pub active_connections: AtomicU64,
    /// Connection requests refused
    pub connections_rejected: AtomicU64,
    /// Responses sent by connections that have closed
    pub requests_served: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, requests_served: u64) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.requests_served
            .fetch_add(requests_served, Ordering::Relaxed);
    }

    /// Takes back an opened connection whose accept failed.
    pub fn connection_aborted(&self) {
        self.connections_accepted.fetch_sub(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Stops a running server from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A bound, listening server.
pub struct Server {
    config: RpcConfig,
    channel: EventChannel,
    listener: Option<CmId>,
    local_addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ServerStats>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Binds to `host:port` and starts listening. Port 0 picks a free port.
    pub fn bind(
        host: &str,
        port: u16,
        handler: impl RequestHandler + 'static,
        config: RpcConfig,
    ) -> Result<Self> {
        config.validate()?;

        let channel = EventChannel::with_device(Arc::clone(&config.device));
        let mut listener = channel.create_id();
        let local_addr = listener.bind_addr(host, port)?;
        listener.listen(config.backlog)?;

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            max_connections = config.max_connections,
            state = %HandshakeState::ListenAck,
            "Server listening"
        );

        Ok(Self {
            config,
            channel,
            listener: Some(listener),
            local_addr,
            handler: Arc::new(handler),
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(ServerStats::new()),
            shutdown: ShutdownHandle(Arc::new(AtomicBool::new(false))),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves until the shutdown handle fires, then tears every connection
    /// down.
    ///
    /// Blocks the calling thread, which becomes the reactor.
    pub fn run(mut self) -> Result<()> {
        let mut poller = ServerPoller::start(
            Arc::clone(&self.registry),
            strategy_for(self.config.poll_mode),
        )?;
        info!(addr = %self.local_addr, poll_mode = %self.config.poll_mode, "Server running");

        let result = self.event_loop();

        poller.stop();
        self.close();
        result
    }

    /// Runs the server on a blocking task until `signal` completes.
    pub async fn serve_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handle = self.shutdown_handle();
        let mut reactor = tokio::task::spawn_blocking(move || self.run());

        tokio::select! {
            joined = &mut reactor => return joined_result(joined),
            _ = signal => {
                info!("Shutdown signal received, stopping server...");
                handle.shutdown();
            }
        }
        joined_result(reactor.await)
    }

    fn event_loop(&mut self) -> Result<()> {
        while !self.shutdown.is_shutdown() {
            match self.channel.get_event_timeout(EVENT_WAIT) {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {}
                Err(e) => {
                    let err = RpcError::EventChannel(e);
                    error!(error = %err, "Reactor stopped");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, mut event: CmEvent) {
        let id = ConnectionId::from(event.endpoint);
        let status = event.status;
        let result = match event.kind {
            CmEventKind::ConnectRequest if status == 0 => self.on_connect_request(&mut event),
            CmEventKind::Established if status == 0 => self.on_established(id),
            CmEventKind::Disconnected => self.on_disconnected(id),
            kind if status != 0 => {
                warn!(conn = %id, kind = %kind, status, "Event reported an error");
                Ok(())
            }
            kind => {
                debug!(conn = %id, kind = %kind, "Ignoring event");
                Ok(())
            }
        };

        if let Err(e) = result {
            match e.severity() {
                Severity::Fatal => error!(conn = %id, error = %e, "Connection event failed"),
                Severity::Warning => warn!(conn = %id, error = %e, "Connection event failed"),
            }
        }
        self.channel.ack(event);
    }

    fn on_connect_request(&mut self, event: &mut CmEvent) -> Result<()> {
        let mut cm_id = event
            .take_id()
            .ok_or_else(|| RpcError::Reactor("connection request carries no endpoint".into()))?;

        if self.registry.len() >= self.config.max_connections {
            self.stats.connection_rejected();
            reject(&mut cm_id);
            return Err(RpcError::AtCapacity(self.config.max_connections));
        }

        let resources = match ResourceSet::acquire(&mut cm_id, self.config.buffer_pages) {
            Ok(resources) => resources,
            Err(e) => {
                self.stats.connection_rejected();
                reject(&mut cm_id);
                return Err(e);
            }
        };

        let mut conn = Connection::server(cm_id, resources, Arc::clone(&self.handler));
        let admitted = conn
            .set_remote_rkey(&event.private_data)
            .and_then(|()| conn.arm());
        if let Err(e) = admitted {
            self.stats.connection_rejected();
            conn.reject();
            return Err(e);
        }

        // Counted and registered before the peer can observe the accept
        let id = conn.id();
        let remote_rkey = conn.remote_rkey();
        self.registry.register(conn);
        self.stats.connection_opened();

        let accepted = self
            .registry
            .with_connection(id, Connection::accept)
            .and_then(|accepted| accepted);
        if let Err(e) = accepted {
            if let Ok(mut conn) = self.registry.deregister(id) {
                conn.teardown();
            }
            self.stats.connection_aborted();
            return Err(e);
        }

        info!(conn = %id, remote_rkey = ?remote_rkey, "Client connected");
        Ok(())
    }

    fn on_established(&mut self, id: ConnectionId) -> Result<()> {
        self.registry
            .with_connection(id, |conn| conn.advance_handshake(HandshakeState::Established))??;
        debug!(conn = %id, "Connection established");
        Ok(())
    }

    fn on_disconnected(&mut self, id: ConnectionId) -> Result<()> {
        let mut conn = self.registry.deregister(id)?;
        if let Err(e) = conn.advance_handshake(HandshakeState::Disconnecting) {
            debug!(conn = %id, error = %e, "Disconnected before establishment");
        }
        let served = conn.exchanges();
        conn.teardown();
        self.stats.connection_closed(served);
        info!(conn = %id, requests = served, "Client disconnected");
        Ok(())
    }

    /// Tears down every connection and the listener.
    fn close(&mut self) {
        for mut conn in self.registry.drain() {
            let served = conn.exchanges();
            conn.teardown();
            self.stats.connection_closed(served);
        }
        if let Some(listener) = self.listener.take() {
            if let Err(source) = listener.destroy() {
                let err = RpcError::Teardown {
                    step: "destroy listener",
                    source,
                };
                warn!(error = %err, "Teardown step failed");
            }
        }
        info!(
            accepted = self.stats.connections_accepted.load(Ordering::Relaxed),
            "Server shutdown complete"
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.listener.is_some() {
            self.close();
        }
    }
}

fn reject(cm_id: &mut CmId) {
    if let Err(source) = cm_id.reject(Bytes::new()) {
        let err = RpcError::Teardown {
            step: "reject",
            source,
        };
        warn!(endpoint = %cm_id.endpoint(), error = %err, "Reject failed");
    }
}

fn joined_result(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| RpcError::Reactor(format!("reactor task failed: {e}")))?
}
