//! Connection-Establishment Handshake
//!
//! The client walks a fixed sequence of connection-manager steps and waits
//! for one specific event after each:
//!
//! ```text
//! Idle ─> AddressResolving ─> AddressResolved ─> RouteResolving ─> RouteResolved
//!      ─> Connecting ─> Established ─> Disconnecting ─> Closed
//! ```
//!
//! A server-side connection starts from the listener's connection request:
//!
//! ```text
//! (ListenAck) ConnectRequest ─> Accepting ─> Established ─> Disconnecting ─> Closed
//! ```
//!
//! Any state may drop straight to `Closed` when an attempt is abandoned.
//! Both sides put their memory region's remote key in the private data of
//! the connect request or the accept.

use crate::config::{INITIATOR_DEPTH, RESPONDER_RESOURCES, RNR_RETRY_COUNT};
use crate::error::{Result, RpcError};
use crate::transport::{CmEvent, CmEventKind, CmId, ConnParam, EventChannel, TransportError};
use bytes::{Buf, Bytes};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Length of the handshake private data.
pub const PRIVATE_DATA_LEN: usize = 4;

/// Where an endpoint is in connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    AddressResolving,
    AddressResolved,
    RouteResolving,
    RouteResolved,
    Connecting,
    /// The listening endpoint
    ListenAck,
    ConnectRequest,
    Accepting,
    Established,
    Disconnecting,
    Closed,
}

impl HandshakeState {
    /// Returns true when `next` may directly follow `self`.
    pub fn can_advance_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;

        if next == Closed {
            return true;
        }
        matches!(
            (self, next),
            (Idle, AddressResolving)
                | (AddressResolving, AddressResolved)
                | (AddressResolved, RouteResolving)
                | (RouteResolving, RouteResolved)
                | (RouteResolved, Connecting)
                | (Connecting, Established)
                | (ConnectRequest, Accepting)
                | (Accepting, Established)
                | (Established, Disconnecting)
                | (Disconnecting, Closed)
        )
    }

    /// Moves to `next`, or fails with [`RpcError::HandshakeOrder`].
    pub fn advance(&mut self, next: HandshakeState) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(RpcError::HandshakeOrder {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::AddressResolving => "address-resolving",
            HandshakeState::AddressResolved => "address-resolved",
            HandshakeState::RouteResolving => "route-resolving",
            HandshakeState::RouteResolved => "route-resolved",
            HandshakeState::Connecting => "connecting",
            HandshakeState::ListenAck => "listen-ack",
            HandshakeState::ConnectRequest => "connect-request",
            HandshakeState::Accepting => "accepting",
            HandshakeState::Established => "established",
            HandshakeState::Disconnecting => "disconnecting",
            HandshakeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Waits for the next event and checks that it is `expected` with status 0.
///
/// Any other event is acknowledged before the error is returned. The
/// returned event still has to be acknowledged by the caller.
pub fn expect_event(
    channel: &EventChannel,
    expected: CmEventKind,
    timeout: Duration,
) -> Result<CmEvent> {
    let event = channel
        .get_event_timeout(timeout)
        .map_err(RpcError::EventChannel)?
        .ok_or(RpcError::EventTimeout { expected, timeout })?;

    if event.kind != expected {
        let actual = event.kind;
        channel.ack(event);
        return Err(RpcError::UnexpectedEvent { expected, actual });
    }
    if event.status != 0 {
        let status = event.status;
        channel.ack(event);
        return Err(RpcError::EventStatus {
            kind: expected,
            status,
        });
    }
    Ok(event)
}

/// Private data carrying a remote key.
pub fn encode_rkey(rkey: u32) -> Bytes {
    Bytes::copy_from_slice(&rkey.to_le_bytes())
}

/// Reads the remote key out of a peer's private data.
pub fn decode_rkey(private_data: &[u8]) -> Result<u32> {
    if private_data.len() != PRIVATE_DATA_LEN {
        return Err(RpcError::PrivateData {
            len: private_data.len(),
        });
    }
    let mut buf = private_data;
    Ok(buf.get_u32_le())
}

/// Connection parameters advertising `rkey`.
pub fn conn_param(rkey: u32) -> ConnParam {
    ConnParam {
        private_data: encode_rkey(rkey),
        responder_resources: RESPONDER_RESOURCES,
        initiator_depth: INITIATOR_DEPTH,
        rnr_retry_count: RNR_RETRY_COUNT,
    }
}

/// Drives the client's side of the handshake over one event channel.
#[derive(Debug)]
pub struct ClientHandshake<'a> {
    channel: &'a EventChannel,
    resolve_timeout: Duration,
    connect_timeout: Duration,
}

impl<'a> ClientHandshake<'a> {
    pub fn new(
        channel: &'a EventChannel,
        resolve_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            resolve_timeout,
            connect_timeout,
        }
    }

    /// Resolves the address and the route to `host:port`.
    pub fn resolve(
        &self,
        state: &mut HandshakeState,
        cm_id: &mut CmId,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let result = self.try_resolve(state, cm_id, host, port);
        if result.is_err() {
            *state = HandshakeState::Closed;
        }
        result
    }

    fn try_resolve(
        &self,
        state: &mut HandshakeState,
        cm_id: &mut CmId,
        host: &str,
        port: u16,
    ) -> Result<()> {
        state.advance(HandshakeState::AddressResolving)?;
        cm_id.resolve_addr(host, port, self.resolve_timeout)?;
        let event = expect_event(self.channel, CmEventKind::AddrResolved, self.resolve_timeout)?;
        self.channel.ack(event);
        state.advance(HandshakeState::AddressResolved)?;
        debug!(host, port, "Address resolved");

        state.advance(HandshakeState::RouteResolving)?;
        cm_id.resolve_route()?;
        let event = expect_event(self.channel, CmEventKind::RouteResolved, self.resolve_timeout)?;
        self.channel.ack(event);
        state.advance(HandshakeState::RouteResolved)?;
        debug!(host, port, "Route resolved");
        Ok(())
    }

    /// Connects, advertising `local_rkey`, and returns the server's key.
    pub fn connect(
        &self,
        state: &mut HandshakeState,
        cm_id: &mut CmId,
        local_rkey: u32,
    ) -> Result<u32> {
        let result = self.try_connect(state, cm_id, local_rkey);
        if result.is_err() {
            *state = HandshakeState::Closed;
        }
        result
    }

    fn try_connect(
        &self,
        state: &mut HandshakeState,
        cm_id: &mut CmId,
        local_rkey: u32,
    ) -> Result<u32> {
        state.advance(HandshakeState::Connecting)?;
        cm_id.set_connect_timeout(self.connect_timeout);
        cm_id.connect(&conn_param(local_rkey))?;

        // The peer has the full connect timeout to show up, then a resolve
        // timeout to decide
        let wait = self.connect_timeout + self.resolve_timeout;
        let event = expect_event(self.channel, CmEventKind::Established, wait)?;
        let remote_rkey = decode_rkey(&event.private_data);
        self.channel.ack(event);
        let remote_rkey = remote_rkey?;

        state.advance(HandshakeState::Established)?;
        info!(endpoint = %cm_id.endpoint(), remote_rkey, "Connection established");
        Ok(remote_rkey)
    }

    /// Disconnects and waits for the disconnect event.
    ///
    /// Every failure here is a warning. If the peer already disconnected, the
    /// queued event is consumed and teardown proceeds.
    pub fn disconnect(&self, state: &mut HandshakeState, cm_id: &mut CmId) {
        if let Err(e) = state.advance(HandshakeState::Disconnecting) {
            warn!(error = %e, "Disconnect out of order");
            *state = HandshakeState::Disconnecting;
        }

        match cm_id.disconnect() {
            Ok(()) => {}
            Err(TransportError::NotConnected) => {
                debug!(endpoint = %cm_id.endpoint(), "Peer disconnected first");
            }
            Err(source) => {
                let err = RpcError::Teardown {
                    step: "disconnect",
                    source,
                };
                warn!(error = %err, "Disconnect failed");
            }
        }

        loop {
            match self
                .channel
                .get_event_timeout(self.resolve_timeout)
            {
                Ok(Some(event)) if event.kind == CmEventKind::Disconnected => {
                    self.channel.ack(event);
                    break;
                }
                Ok(Some(event)) => {
                    debug!(kind = %event.kind, "Skipping event while disconnecting");
                    self.channel.ack(event);
                }
                Ok(None) => {
                    warn!(
                        endpoint = %cm_id.endpoint(),
                        timeout = ?self.resolve_timeout,
                        "No disconnect event"
                    );
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Event channel failed during disconnect");
                    break;
                }
            }
        }

        *state = HandshakeState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Device;

    #[test]
    fn test_client_sequence() {
        use HandshakeState::*;

        let mut state = Idle;
        for next in [
            AddressResolving,
            AddressResolved,
            RouteResolving,
            RouteResolved,
            Connecting,
            Established,
            Disconnecting,
            Closed,
        ] {
            state.advance(next).unwrap();
        }
        assert_eq!(state, Closed);
    }

    #[test]
    fn test_server_sequence() {
        use HandshakeState::*;

        let mut state = ConnectRequest;
        state.advance(Accepting).unwrap();
        state.advance(Established).unwrap();
        state.advance(Disconnecting).unwrap();
        state.advance(Closed).unwrap();
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut state = HandshakeState::Idle;
        let err = state.advance(HandshakeState::Connecting).unwrap_err();
        assert!(matches!(
            err,
            RpcError::HandshakeOrder {
                from: HandshakeState::Idle,
                to: HandshakeState::Connecting
            }
        ));
        assert_eq!(state, HandshakeState::Idle);
        assert!(!HandshakeState::Established.can_advance_to(HandshakeState::Connecting));
    }

    #[test]
    fn test_any_state_may_close() {
        for state in [
            HandshakeState::AddressResolving,
            HandshakeState::Connecting,
            HandshakeState::ListenAck,
            HandshakeState::Accepting,
        ] {
            assert!(state.can_advance_to(HandshakeState::Closed));
        }
    }

    #[test]
    fn test_rkey_private_data() {
        let data = encode_rkey(0x1234_5678);
        assert_eq!(&data[..], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(decode_rkey(&data).unwrap(), 0x1234_5678);
        assert!(matches!(
            decode_rkey(&[1, 2, 3]),
            Err(RpcError::PrivateData { len: 3 })
        ));
    }

    #[test]
    fn test_conn_param_constants() {
        let param = conn_param(7);
        assert_eq!(param.responder_resources, 16);
        assert_eq!(param.initiator_depth, 16);
        assert_eq!(param.rnr_retry_count, 7);
        assert_eq!(param.private_data.len(), PRIVATE_DATA_LEN);
    }

    #[test]
    fn test_expect_event_wrong_kind_is_acked() {
        let channel = EventChannel::with_device(Device::open("hs-kind"));
        let mut id = channel.create_id();
        id.resolve_addr("127.0.0.1", 9, Duration::from_secs(3)).unwrap();

        let err = expect_event(&channel, CmEventKind::RouteResolved, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::UnexpectedEvent {
                expected: CmEventKind::RouteResolved,
                actual: CmEventKind::AddrResolved
            }
        ));
        assert_eq!(channel.unacked(), 0);
    }

    #[test]
    fn test_expect_event_timeout() {
        let channel = EventChannel::with_device(Device::open("hs-timeout"));
        let err = expect_event(&channel, CmEventKind::AddrResolved, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, RpcError::EventTimeout { .. }));
    }

    #[test]
    fn test_resolve_then_refused_connect() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let device = Device::open("hs-refused");
        let channel = EventChannel::with_device(device.clone());
        let mut id = channel.create_id();
        let pd = device.alloc_pd().unwrap();
        let cq = device.create_cq(4).unwrap();
        let _qp = id
            .create_qp(&pd, &cq, crate::transport::QpCaps::default())
            .unwrap();

        let handshake =
            ClientHandshake::new(&channel, Duration::from_secs(3), Duration::from_secs(3));
        let mut state = HandshakeState::Idle;
        handshake.resolve(&mut state, &mut id, "127.0.0.1", port).unwrap();
        assert_eq!(state, HandshakeState::RouteResolved);

        let err = handshake.connect(&mut state, &mut id, 1).unwrap_err();
        assert!(matches!(
            err,
            RpcError::UnexpectedEvent {
                actual: CmEventKind::Unreachable,
                ..
            }
        ));
        assert_eq!(state, HandshakeState::Closed);
    }
}
