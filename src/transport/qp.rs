//! Queue Pair
//!
//! A reliable-connected queue pair: a send queue and a receive queue bound
//! to one completion queue and one protection domain. Sends copy bytes out of
//! a registered region onto the link; inbound data lands in the oldest posted
//! receive. Data that arrives before any receive is posted is held until one
//! is, the way a hardware responder keeps retrying a receiver-not-ready peer.
//!
//! Once the link goes down the queue pair enters the error state: every
//! outstanding receive completes with [`WcStatus::WrFlushError`], and so does
//! every request posted afterwards.

use super::{lock, Result, TransportError};
use crate::transport::cq::{CompletionQueue, CqInner, WcOpcode, WcStatus, WorkCompletion};
use crate::transport::device::{Device, MemoryRegion, MrInner, PdInner, ProtectionDomain, ResourceClass};
use crate::transport::wire::{Frame, Link};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Queue pair capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 64,
            max_recv_wr: 64,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// A scatter/gather entry: `length` bytes at `offset` inside `mr`.
#[derive(Debug, Clone, Copy)]
pub struct Sge<'a> {
    pub mr: &'a MemoryRegion,
    pub offset: usize,
    pub length: u32,
}

struct PostedRecv {
    wr_id: u64,
    mr: Arc<MrInner>,
    offset: usize,
    length: u32,
}

#[derive(Default)]
struct QpState {
    recv_queue: VecDeque<PostedRecv>,
    /// Data that arrived before a receive was posted
    inbound: VecDeque<Bytes>,
    link: Option<Arc<Link>>,
    error: bool,
    destroyed: bool,
}

pub(crate) struct QpInner {
    qp_num: u32,
    device: Arc<Device>,
    pd: Arc<PdInner>,
    cq: Arc<CqInner>,
    caps: QpCaps,
    state: Mutex<QpState>,
}

impl QpInner {
    fn complete(&self, wr_id: u64, opcode: WcOpcode, status: WcStatus, byte_len: u32) {
        self.cq.push(WorkCompletion {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num: self.qp_num,
        });
    }

    /// Pairs buffered inbound data with posted receives, oldest first.
    fn drain_inbound(&self, state: &mut QpState) {
        while !state.inbound.is_empty() && !state.recv_queue.is_empty() {
            let (Some(data), Some(recv)) = (state.inbound.pop_front(), state.recv_queue.pop_front())
            else {
                break;
            };

            if data.len() > recv.length as usize {
                debug!(
                    qp = self.qp_num,
                    len = data.len(),
                    posted = recv.length,
                    "Inbound data larger than posted receive"
                );
                self.complete(recv.wr_id, WcOpcode::Recv, WcStatus::LocalLengthError, 0);
                continue;
            }

            match recv.mr.write(recv.offset, &data) {
                Ok(()) => self.complete(
                    recv.wr_id,
                    WcOpcode::Recv,
                    WcStatus::Success,
                    data.len() as u32,
                ),
                Err(_) => {
                    self.complete(recv.wr_id, WcOpcode::Recv, WcStatus::LocalProtectionError, 0)
                }
            }
        }
    }

    /// Hands one inbound message to the receive queue.
    pub(crate) fn deliver(&self, data: Bytes) {
        let mut state = lock(&self.state);
        if state.destroyed || state.error {
            return;
        }
        trace!(qp = self.qp_num, len = data.len(), "Inbound data");
        state.inbound.push_back(data);
        self.drain_inbound(&mut state);
    }

    /// Moves the queue pair to the error state, flushing posted receives.
    pub(crate) fn enter_error(&self) {
        let mut state = lock(&self.state);
        if state.error || state.destroyed {
            return;
        }
        state.error = true;
        state.link = None;
        state.inbound.clear();
        let flushed: Vec<PostedRecv> = state.recv_queue.drain(..).collect();
        debug!(qp = self.qp_num, flushed = flushed.len(), "Queue pair entered error state");
        for recv in flushed {
            self.complete(recv.wr_id, WcOpcode::Recv, WcStatus::WrFlushError, 0);
        }
    }

    pub(crate) fn attach_link(&self, link: Arc<Link>) {
        let mut state = lock(&self.state);
        if !state.destroyed && !state.error {
            state.link = Some(link);
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }
}

/// A reliable-connected queue pair.
pub struct QueuePair {
    inner: Arc<QpInner>,
}

impl QueuePair {
    /// Creates a queue pair in `pd` whose send and receive queues both
    /// complete on `cq`.
    pub(crate) fn create(pd: &ProtectionDomain, cq: &CompletionQueue, caps: QpCaps) -> Result<Self> {
        if caps.max_send_sge > 1 || caps.max_recv_sge > 1 {
            return Err(TransportError::InvalidArgument(
                "at most one scatter/gather entry per request",
            ));
        }
        if caps.max_inline_data > 0 {
            return Err(TransportError::InvalidArgument("inline data is not supported"));
        }
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(TransportError::InvalidArgument("work queue depth must be non-zero"));
        }
        let device = pd.device();
        if !Arc::ptr_eq(device, cq.inner().device()) {
            return Err(TransportError::InvalidArgument(
                "protection domain and completion queue belong to different devices",
            ));
        }

        device.charge(ResourceClass::QueuePair)?;
        pd.inner().add_user();
        cq.inner().attach();

        let inner = Arc::new(QpInner {
            qp_num: device.next_qp_num(),
            device: Arc::clone(device),
            pd: Arc::clone(pd.inner()),
            cq: Arc::clone(cq.inner()),
            caps,
            state: Mutex::new(QpState::default()),
        });
        trace!(qp = inner.qp_num, cq = cq.handle(), pd = pd.handle(), "Created queue pair");
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<QpInner> {
        &self.inner
    }

    pub fn qp_num(&self) -> u32 {
        self.inner.qp_num
    }

    pub fn caps(&self) -> QpCaps {
        self.inner.caps
    }

    /// Returns true once the queue pair has entered the error state.
    pub fn is_error(&self) -> bool {
        lock(&self.inner.state).error
    }

    fn check_region(&self, sge: &Sge<'_>) -> Result<()> {
        if !Arc::ptr_eq(sge.mr.inner().pd(), &self.inner.pd) {
            return Err(TransportError::InvalidArgument(
                "memory region belongs to another protection domain",
            ));
        }
        let len = sge.length as usize;
        match sge.offset.checked_add(len) {
            Some(end) if end <= sge.mr.len() => Ok(()),
            _ => Err(TransportError::OutOfBounds {
                offset: sge.offset,
                len,
                size: sge.mr.len(),
            }),
        }
    }

    /// Posts a send of the bytes described by `sge`.
    ///
    /// The completion is delivered to the queue pair's completion queue.
    pub fn post_send(&self, wr_id: u64, sge: &Sge<'_>) -> Result<()> {
        self.check_region(sge)?;

        let link = {
            let state = lock(&self.inner.state);
            if state.destroyed {
                return Err(TransportError::InvalidState("queue pair destroyed"));
            }
            if state.error {
                self.inner.complete(wr_id, WcOpcode::Send, WcStatus::WrFlushError, 0);
                return Ok(());
            }
            match &state.link {
                Some(link) => Arc::clone(link),
                None => return Err(TransportError::InvalidState("queue pair is not connected")),
            }
        };

        let data = match sge.mr.read(sge.offset, sge.length as usize) {
            Ok(data) => data,
            Err(_) => {
                self.inner
                    .complete(wr_id, WcOpcode::Send, WcStatus::LocalProtectionError, 0);
                return Ok(());
            }
        };

        match link.send(&Frame::Data(data)) {
            Ok(()) => {
                self.inner
                    .complete(wr_id, WcOpcode::Send, WcStatus::Success, sge.length);
            }
            Err(e) => {
                debug!(qp = self.inner.qp_num, error = %e, "Send failed on link");
                self.inner
                    .complete(wr_id, WcOpcode::Send, WcStatus::RetryExceeded, 0);
                self.inner.enter_error();
            }
        }
        Ok(())
    }

    /// Posts a receive into the bytes described by `sge`.
    pub fn post_recv(&self, wr_id: u64, sge: &Sge<'_>) -> Result<()> {
        self.check_region(sge)?;

        let mut state = lock(&self.inner.state);
        if state.destroyed {
            return Err(TransportError::InvalidState("queue pair destroyed"));
        }
        if state.error {
            self.inner.complete(wr_id, WcOpcode::Recv, WcStatus::WrFlushError, 0);
            return Ok(());
        }
        if state.recv_queue.len() >= self.inner.caps.max_recv_wr as usize {
            return Err(TransportError::QueueFull {
                queue: "receive",
                max: self.inner.caps.max_recv_wr,
            });
        }

        state.recv_queue.push_back(PostedRecv {
            wr_id,
            mr: Arc::clone(sge.mr.inner()),
            offset: sge.offset,
            length: sge.length,
        });
        self.inner.drain_inbound(&mut state);
        Ok(())
    }

    /// Destroys the queue pair, discarding outstanding work requests.
    pub fn destroy(self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.destroyed {
                return Err(TransportError::InvalidState("queue pair already destroyed"));
            }
            state.destroyed = true;
            state.recv_queue.clear();
            state.inbound.clear();
            state.link = None;
        }
        self.inner.cq.detach();
        self.inner.pd.remove_user();
        self.inner.device.uncharge(ResourceClass::QueuePair);
        trace!(qp = self.inner.qp_num, "Destroyed queue pair");
        Ok(())
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.inner.qp_num)
            .field("caps", &self.inner.caps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::AccessFlags;
    use std::net::{TcpListener, TcpStream};

    struct Fixture {
        device: Arc<Device>,
        pd: ProtectionDomain,
        cq: CompletionQueue,
        mr: MemoryRegion,
        qp: QueuePair,
    }

    fn fixture(name: &str) -> Fixture {
        let device = Device::open(name);
        let pd = device.alloc_pd().unwrap();
        let cq = device.create_cq(16).unwrap();
        let mr = pd
            .register(vec![0u8; 256], AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE)
            .unwrap();
        let qp = QueuePair::create(&pd, &cq, QpCaps::default()).unwrap();
        Fixture { device, pd, cq, mr, qp }
    }

    fn poll_all(cq: &CompletionQueue) -> Vec<WorkCompletion> {
        let mut out = Vec::new();
        cq.poll(&mut out, 64).unwrap();
        out
    }

    #[test]
    fn test_inbound_before_receive_is_held() {
        let f = fixture("qp-held");
        f.qp.inner().deliver(Bytes::from_static(b"early"));
        assert!(poll_all(&f.cq).is_empty());

        let sge = Sge { mr: &f.mr, offset: 0, length: 72 };
        f.qp.post_recv(7, &sge).unwrap();

        let wcs = poll_all(&f.cq);
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id, 7);
        assert_eq!(wcs[0].status, WcStatus::Success);
        assert_eq!(wcs[0].byte_len, 5);
        assert_eq!(&f.mr.read(0, 5).unwrap()[..], b"early");
    }

    #[test]
    fn test_oversized_inbound() {
        let f = fixture("qp-length");
        let sge = Sge { mr: &f.mr, offset: 0, length: 4 };
        f.qp.post_recv(1, &sge).unwrap();
        f.qp.inner().deliver(Bytes::from_static(b"too long"));

        let wcs = poll_all(&f.cq);
        assert_eq!(wcs[0].status, WcStatus::LocalLengthError);
    }

    #[test]
    fn test_error_state_flushes() {
        let f = fixture("qp-flush");
        let sge = Sge { mr: &f.mr, offset: 0, length: 72 };
        f.qp.post_recv(1, &sge).unwrap();
        f.qp.post_recv(2, &sge).unwrap();
        f.qp.inner().enter_error();
        f.qp.post_send(3, &sge).unwrap();

        let wcs = poll_all(&f.cq);
        let ids: Vec<u64> = wcs.iter().map(|c| c.wr_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(wcs.iter().all(|c| c.status == WcStatus::WrFlushError));
        assert!(f.qp.is_error());
    }

    #[test]
    fn test_send_requires_link() {
        let f = fixture("qp-unconnected");
        let sge = Sge { mr: &f.mr, offset: 0, length: 8 };
        assert!(matches!(
            f.qp.post_send(1, &sge),
            Err(TransportError::InvalidState(_))
        ));
    }

    #[test]
    fn test_send_over_link() {
        let f = fixture("qp-send");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        f.qp.inner().attach_link(Arc::new(Link::new(stream)));

        f.mr.write(0, b"payload").unwrap();
        f.qp
            .post_send(11, &Sge { mr: &f.mr, offset: 0, length: 7 })
            .unwrap();

        let wcs = poll_all(&f.cq);
        assert_eq!(wcs[0].opcode, WcOpcode::Send);
        assert_eq!(wcs[0].status, WcStatus::Success);
        assert_eq!(
            Frame::read_from(&mut peer).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"payload")))
        );
    }

    #[test]
    fn test_receive_queue_depth() {
        let f = fixture("qp-depth");
        let sge = Sge { mr: &f.mr, offset: 0, length: 1 };
        for id in 0..64 {
            f.qp.post_recv(id, &sge).unwrap();
        }
        assert!(matches!(
            f.qp.post_recv(64, &sge),
            Err(TransportError::QueueFull { queue: "receive", max: 64 })
        ));
    }

    #[test]
    fn test_out_of_bounds_sge() {
        let f = fixture("qp-bounds");
        let sge = Sge { mr: &f.mr, offset: 250, length: 72 };
        assert!(matches!(
            f.qp.post_recv(1, &sge),
            Err(TransportError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_teardown_order() {
        let Fixture { device, pd, cq, mr, qp } = fixture("qp-teardown");
        assert_eq!(device.resource_counts().queue_pairs, 1);

        qp.destroy().unwrap();
        cq.destroy().unwrap();
        mr.deregister().unwrap();
        pd.dealloc().unwrap();
        assert!(device.resource_counts().is_empty());
    }
}
