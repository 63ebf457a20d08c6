//! Client
//!
//! A client holds at most one connection at a time:
//!
//! ```text
//! Client::connect(host, port)
//!     resolve address ─> resolve route ─> acquire resources ─> connect
//!     ─> register with the poller
//!
//! Client::call(payload)
//!     send_request ─> (poller) send completed ─> post recv
//!                 ─> (poller) response received ─> wait_response returns
//!
//! Client::disconnect()
//!     deregister ─> disconnect ─> wait for disconnect event ─> release
//! ```
//!
//! Requests are serialized by the connection's request gate: a second
//! `send_request` blocks until the first one's response arrived.

use crate::config::RpcConfig;
use crate::connection::{ClientHandshake, Connection, ConnectionId, HandshakeState, ResourceSet};
use crate::error::{Result, RpcError};
use crate::poller::{strategy_for, ClientPoller, RequestGate, RequestTicket};
use crate::protocol::Message;
use crate::transport::EventChannel;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// The client side of the messaging layer.
pub struct Client {
    config: RpcConfig,
    channel: EventChannel,
    poller: ClientPoller,
    gate: Option<Arc<RequestGate>>,
    conn_id: Option<ConnectionId>,
}

impl Client {
    pub fn new(config: RpcConfig) -> Result<Self> {
        config.validate()?;
        let channel = EventChannel::with_device(Arc::clone(&config.device));
        Ok(Self {
            config,
            channel,
            poller: ClientPoller::new(),
            gate: None,
            conn_id: None,
        })
    }

    /// Connects to the server at `host:port`.
    ///
    /// Fails with [`RpcError::AlreadyConnected`] while a connection is open.
    /// Any handshake failure is fatal to the attempt and leaves the client
    /// disconnected.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.poller.is_registered() {
            return Err(RpcError::AlreadyConnected);
        }

        let driver = ClientHandshake::new(
            &self.channel,
            self.config.resolve_timeout,
            self.config.connect_timeout,
        );
        let mut cm_id = self.channel.create_id();
        let mut state = HandshakeState::Idle;
        driver.resolve(&mut state, &mut cm_id, host, port)?;

        let resources = ResourceSet::acquire(&mut cm_id, self.config.buffer_pages)?;
        let gate = Arc::new(RequestGate::new());
        let mut conn = Connection::client(cm_id, resources, Arc::clone(&gate));
        conn.establish(&driver)?;

        let id = conn.id();
        self.poller.register(conn)?;
        self.poller.start(strategy_for(self.config.poll_mode))?;
        self.gate = Some(gate);
        self.conn_id = Some(id);

        info!(conn = %id, host, port, "Connected to server");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn_id.is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.conn_id
    }

    fn gate(&self) -> Result<&Arc<RequestGate>> {
        self.gate.as_ref().ok_or(RpcError::NotConnected)
    }

    /// Sends `request` and returns a ticket for its response.
    ///
    /// Blocks, without a timeout, while an earlier request is outstanding.
    /// Returns as soon as the send is posted.
    pub fn send_request(&self, request: &Message) -> Result<RequestTicket> {
        let gate = self.gate()?;
        let ticket = gate.acquire()?;

        let submitted = self
            .poller
            .with_connection(|conn| conn.submit(request))
            .and_then(|result| result);
        match submitted {
            Ok(()) => Ok(ticket),
            Err(e) => {
                gate.abandon(ticket);
                Err(e)
            }
        }
    }

    /// Sends `payload` as an immediate request.
    pub fn send(&self, payload: &[u8]) -> Result<RequestTicket> {
        self.send_request(&Message::immediate_request(payload)?)
    }

    /// Blocks until the response to `ticket` arrives.
    pub fn wait_response(&self, ticket: RequestTicket) -> Result<Message> {
        self.gate()?.wait(ticket)
    }

    /// Sends `payload` and waits for the response.
    pub fn call(&self, payload: &[u8]) -> Result<Message> {
        let ticket = self.send(payload)?;
        self.wait_response(ticket)
    }

    /// Disconnects and releases the connection.
    ///
    /// Teardown problems are logged as warnings and do not fail the call.
    pub fn disconnect(&mut self) -> Result<()> {
        let mut conn = self.poller.deregister().ok_or(RpcError::NotConnected)?;
        self.poller.stop();

        let driver = ClientHandshake::new(
            &self.channel,
            self.config.resolve_timeout,
            self.config.connect_timeout,
        );
        conn.disconnect(&driver);
        let warnings = conn.teardown();
        if !warnings.is_empty() {
            debug!(conn = %conn.id(), warnings = warnings.len(), "Teardown finished with warnings");
        }

        self.gate = None;
        self.conn_id = None;
        info!(conn = %conn.id(), "Disconnected from server");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.poller.is_registered() {
            let _ = self.disconnect();
        }
    }
}

/// A payload of `len` random lowercase ASCII letters.
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random_range(b'a'..=b'z')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Device;

    fn config(name: &str) -> RpcConfig {
        RpcConfig::default()
            .with_device(Device::open(name))
            .with_buffer_pages(1)
    }

    #[test]
    fn test_random_payload() {
        let payload = random_payload(10);
        assert_eq!(payload.len(), 10);
        assert!(payload.iter().all(|b| b.is_ascii_lowercase()));
        assert!(random_payload(0).is_empty());
    }

    #[test]
    fn test_requests_need_connection() {
        let mut client = Client::new(config("client-idle")).unwrap();
        assert!(!client.is_connected());
        assert!(matches!(client.send(b"x"), Err(RpcError::NotConnected)));
        assert!(matches!(client.disconnect(), Err(RpcError::NotConnected)));
    }

    #[test]
    fn test_oversized_payload() {
        let client = Client::new(config("client-big")).unwrap();
        // Message construction fails before the connection is consulted
        assert!(matches!(
            client.send(&[0u8; 65]),
            Err(RpcError::Message(_))
        ));
    }

    #[test]
    fn test_connect_refused_leaves_client_usable() {
        let device = Device::open("client-refused");
        let mut client = Client::new(
            RpcConfig::default()
                .with_device(Arc::clone(&device))
                .with_buffer_pages(1),
        )
        .unwrap();

        // Nothing listens on port 1
        assert!(client.connect("127.0.0.1", 1).is_err());
        assert!(!client.is_connected());
        assert!(device.resource_counts().is_empty());
    }
}
