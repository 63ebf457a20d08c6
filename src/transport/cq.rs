//! Completion Queue
//!
//! Work requests finish asynchronously. When the provider is done with one it
//! appends a [`WorkCompletion`] to the completion queue the queue pair was
//! bound to, and the owner drains the queue with [`CompletionQueue::poll`].
//!
//! A queue holds at most `capacity` entries. Pushing into a full queue puts
//! it into the overrun state; every later poll fails with
//! [`TransportError::CqOverrun`], which the caller must treat as fatal for
//! everything attached to the queue.

use super::{lock, Result, TransportError};
use crate::transport::device::{Device, ResourceClass};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{trace, warn};

/// The operation a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcOpcode {
    Send,
    Recv,
    RdmaWrite,
    RdmaRead,
}

/// Outcome of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    /// Inbound data did not fit the posted receive
    LocalLengthError,
    /// The memory region referenced by the request is no longer valid
    LocalProtectionError,
    /// The queue pair entered the error state before the request ran
    WrFlushError,
    /// The peer could not be reached
    RetryExceeded,
    RemoteAccessError,
    General,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }

    /// Flushed requests never ran; they only report that the queue pair died.
    pub fn is_flush(self) -> bool {
        self == WcStatus::WrFlushError
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WcStatus::Success => "success",
            WcStatus::LocalLengthError => "local length error",
            WcStatus::LocalProtectionError => "local protection error",
            WcStatus::WrFlushError => "work request flushed",
            WcStatus::RetryExceeded => "transport retry counter exceeded",
            WcStatus::RemoteAccessError => "remote access error",
            WcStatus::General => "general error",
        };
        f.write_str(name)
    }
}

/// One finished work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Identifier supplied when the request was posted
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Bytes transferred (receives only)
    pub byte_len: u32,
    /// Queue pair the request was posted on
    pub qp_num: u32,
}

#[derive(Debug, Default)]
struct CqState {
    entries: VecDeque<WorkCompletion>,
    overrun: bool,
    destroyed: bool,
}

pub(crate) struct CqInner {
    handle: u32,
    capacity: usize,
    device: Arc<Device>,
    state: Mutex<CqState>,
    ready: Condvar,
    /// Queue pairs currently bound to this queue
    attached: AtomicUsize,
}

impl CqInner {
    pub(crate) fn new(handle: u32, capacity: usize, device: Arc<Device>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            capacity,
            device,
            state: Mutex::new(CqState::default()),
            ready: Condvar::new(),
            attached: AtomicUsize::new(0),
        })
    }

    pub(crate) fn handle(&self) -> u32 {
        self.handle
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn attach(&self) {
        self.attached.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        self.attached.fetch_sub(1, Ordering::AcqRel);
    }

    /// Appends a completion. A full queue drops it and enters overrun.
    pub(crate) fn push(&self, wc: WorkCompletion) {
        let mut state = lock(&self.state);
        if state.destroyed {
            return;
        }
        if state.entries.len() >= self.capacity {
            if !state.overrun {
                warn!(cq = self.handle, capacity = self.capacity, "Completion queue overrun");
            }
            state.overrun = true;
            return;
        }
        trace!(
            cq = self.handle,
            wr_id = wc.wr_id,
            opcode = ?wc.opcode,
            status = %wc.status,
            "Completion queued"
        );
        state.entries.push_back(wc);
        drop(state);
        self.ready.notify_all();
    }
}

/// A completion queue.
pub struct CompletionQueue {
    inner: Arc<CqInner>,
}

impl CompletionQueue {
    pub(crate) fn from_inner(inner: Arc<CqInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<CqInner> {
        &self.inner
    }

    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Moves up to `max` completions into `out`, oldest first.
    ///
    /// Returns how many were moved. Zero means the queue was empty.
    pub fn poll(&self, out: &mut Vec<WorkCompletion>, max: usize) -> Result<usize> {
        let mut state = lock(&self.inner.state);
        if state.destroyed {
            return Err(TransportError::InvalidState("completion queue destroyed"));
        }
        if state.overrun {
            return Err(TransportError::CqOverrun {
                capacity: self.inner.capacity,
            });
        }

        let n = max.min(state.entries.len());
        out.extend(state.entries.drain(..n));
        Ok(n)
    }

    /// Blocks until at least one completion is queued or `timeout` passes.
    ///
    /// Returns true when completions are available.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = lock(&self.inner.state);
        let (state, _) = self
            .inner
            .ready
            .wait_timeout_while(state, timeout, |s| {
                s.entries.is_empty() && !s.overrun && !s.destroyed
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !state.entries.is_empty() || state.overrun
    }

    /// Destroys the queue.
    ///
    /// Fails with [`TransportError::Busy`] while a queue pair is still bound
    /// to it; the queue stays allocated in that case.
    pub fn destroy(self) -> Result<()> {
        if self.inner.attached.load(Ordering::Acquire) > 0 {
            return Err(TransportError::Busy(
                "completion queue still has queue pairs attached",
            ));
        }
        {
            let mut state = lock(&self.inner.state);
            state.destroyed = true;
            state.entries.clear();
        }
        self.inner.ready.notify_all();
        self.inner.device.uncharge(ResourceClass::CompletionQueue);
        trace!(cq = self.inner.handle, "Destroyed completion queue");
        Ok(())
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("handle", &self.inner.handle)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wc(wr_id: u64) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len: 72,
            qp_num: 1,
        }
    }

    #[test]
    fn test_poll_in_order() {
        let device = Device::open("cq-order");
        let cq = device.create_cq(8).unwrap();
        for id in 0..5 {
            cq.inner().push(wc(id));
        }

        let mut out = Vec::new();
        assert_eq!(cq.poll(&mut out, 3).unwrap(), 3);
        assert_eq!(cq.poll(&mut out, 16).unwrap(), 2);
        let ids: Vec<u64> = out.iter().map(|c| c.wr_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(cq.poll(&mut out, 16).unwrap(), 0);
    }

    #[test]
    fn test_overrun_is_sticky() {
        let device = Device::open("cq-overrun");
        let cq = device.create_cq(2).unwrap();
        for id in 0..3 {
            cq.inner().push(wc(id));
        }

        let mut out = Vec::new();
        assert!(matches!(
            cq.poll(&mut out, 16),
            Err(TransportError::CqOverrun { capacity: 2 })
        ));
        assert!(cq.poll(&mut out, 16).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let device = Device::open("cq-zero");
        assert!(matches!(
            device.create_cq(0),
            Err(TransportError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_destroy_busy_while_attached() {
        let device = Device::open("cq-busy");
        let cq = device.create_cq(4).unwrap();
        cq.inner().attach();
        // Keep a handle so the queue can be released after the failed attempt
        let again = CompletionQueue::from_inner(Arc::clone(cq.inner()));
        assert!(matches!(cq.destroy(), Err(TransportError::Busy(_))));
        assert_eq!(device.resource_counts().completion_queues, 1);

        again.inner().detach();
        again.destroy().unwrap();
        assert!(device.resource_counts().is_empty());
    }

    #[test]
    fn test_wait_times_out_when_empty() {
        let device = Device::open("cq-wait");
        let cq = device.create_cq(4).unwrap();
        assert!(!cq.wait(Duration::from_millis(5)));
        cq.inner().push(wc(9));
        assert!(cq.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_status_helpers() {
        assert!(WcStatus::Success.is_success());
        assert!(WcStatus::WrFlushError.is_flush());
        assert!(!WcStatus::RetryExceeded.is_flush());
        assert_eq!(WcStatus::WrFlushError.to_string(), "work request flushed");
    }
}
