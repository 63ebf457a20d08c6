//! Per-Connection Resources
//!
//! A connection owns exactly one of each transport resource. They are
//! acquired in dependency order and released in reverse:
//!
//! ```text
//! acquire:  protection domain ─> completion queue ─> queue pair ─> buffer ─> memory region
//! release:  queue pair ─> completion queue ─> memory region ─> protection domain
//! ```
//!
//! The queue pair goes first because the completion queue and protection
//! domain refuse to go while it is attached to them.

use crate::config::{CQ_CAPACITY, MAX_RECV_WR, MAX_SEND_WR, PAGE_SIZE};
use crate::error::{Result, RpcError};
use crate::transport::{
    AccessFlags, CmId, CompletionQueue, MemoryRegion, ProtectionDomain, QpCaps, QueuePair,
    TransportError,
};
use std::sync::Arc;
use tracing::{debug, warn};

fn resource(op: &'static str) -> impl FnOnce(TransportError) -> RpcError {
    move |source| RpcError::Resource { op, source }
}

/// The transport resources of one connection.
#[derive(Debug)]
pub struct ResourceSet {
    pd: Option<ProtectionDomain>,
    cq: Option<CompletionQueue>,
    qp: Option<QueuePair>,
    mr: Option<MemoryRegion>,
    buffer_size: usize,
}

impl ResourceSet {
    /// Acquires everything a connection on `cm_id` needs, with a registered
    /// buffer of `n_pages` pages.
    ///
    /// On failure, whatever was already acquired is released before the
    /// error is returned.
    pub fn acquire(cm_id: &mut CmId, n_pages: usize) -> Result<Self> {
        let size = n_pages
            .checked_mul(PAGE_SIZE)
            .filter(|size| *size > 0)
            .ok_or(RpcError::BufferAllocation {
                size: n_pages.saturating_mul(PAGE_SIZE),
            })?;

        let mut set = Self {
            pd: None,
            cq: None,
            qp: None,
            mr: None,
            buffer_size: size,
        };
        match set.fill(cm_id, size) {
            Ok(()) => {
                debug!(endpoint = %cm_id.endpoint(), pages = n_pages, "Acquired connection resources");
                Ok(set)
            }
            Err(e) => {
                set.release();
                Err(e)
            }
        }
    }

    fn fill(&mut self, cm_id: &mut CmId, size: usize) -> Result<()> {
        let device = Arc::clone(cm_id.device());
        let pd = self
            .pd
            .insert(device.alloc_pd().map_err(resource("allocate protection domain"))?);
        let cq = self.cq.insert(
            device
                .create_cq(CQ_CAPACITY)
                .map_err(resource("create completion queue"))?,
        );

        let caps = QpCaps {
            max_send_wr: MAX_SEND_WR,
            max_recv_wr: MAX_RECV_WR,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let qp = cm_id
            .create_qp(pd, cq, caps)
            .map_err(resource("create queue pair"))?;
        self.qp = Some(qp);

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|_| RpcError::BufferAllocation { size })?;
        buffer.resize(size, 0);

        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        let mr = pd
            .register(buffer, access)
            .map_err(resource("register memory region"))?;
        self.mr = Some(mr);
        Ok(())
    }

    /// Releases every resource still held, in teardown order.
    ///
    /// Failed steps are logged and returned; they never stop later steps.
    /// Calling this again is a no-op.
    pub fn release(&mut self) -> Vec<RpcError> {
        let mut failures = Vec::new();
        let mut step = |name: &'static str, result: std::result::Result<(), TransportError>| {
            if let Err(source) = result {
                let err = RpcError::Teardown { step: name, source };
                warn!(error = %err, "Resource teardown step failed");
                failures.push(err);
            }
        };

        if let Some(qp) = self.qp.take() {
            step("destroy queue pair", qp.destroy());
        }
        if let Some(cq) = self.cq.take() {
            step("destroy completion queue", cq.destroy());
        }
        if let Some(mr) = self.mr.take() {
            step("deregister memory region", mr.deregister());
        }
        if let Some(pd) = self.pd.take() {
            step("deallocate protection domain", pd.dealloc());
        }
        failures
    }

    pub fn is_released(&self) -> bool {
        self.pd.is_none() && self.cq.is_none() && self.qp.is_none() && self.mr.is_none()
    }

    pub fn pd(&self) -> Result<&ProtectionDomain> {
        self.pd.as_ref().ok_or(RpcError::Released)
    }

    pub fn cq(&self) -> Result<&CompletionQueue> {
        self.cq.as_ref().ok_or(RpcError::Released)
    }

    pub fn qp(&self) -> Result<&QueuePair> {
        self.qp.as_ref().ok_or(RpcError::Released)
    }

    pub fn mr(&self) -> Result<&MemoryRegion> {
        self.mr.as_ref().ok_or(RpcError::Released)
    }

    /// The key the peer needs to address this connection's buffer.
    pub fn rkey(&self) -> Result<u32> {
        Ok(self.mr()?.rkey())
    }

    /// Size of the registered buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        if !self.is_released() {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Device, EventChannel, ResourceLimits};

    #[test]
    fn test_acquire_and_release() {
        let device = Device::open("res-basic");
        let channel = EventChannel::with_device(Arc::clone(&device));
        let mut id = channel.create_id();

        let mut set = ResourceSet::acquire(&mut id, 1).unwrap();
        let counts = device.resource_counts();
        assert_eq!(counts.protection_domains, 1);
        assert_eq!(counts.completion_queues, 1);
        assert_eq!(counts.queue_pairs, 1);
        assert_eq!(counts.memory_regions, 1);
        assert_eq!(set.buffer_size(), PAGE_SIZE);
        assert_eq!(set.mr().unwrap().len(), PAGE_SIZE);
        assert_eq!(set.cq().unwrap().capacity(), 64);

        assert!(set.release().is_empty());
        assert!(set.is_released());
        assert!(device.resource_counts().is_empty());

        // Second release has nothing left to do
        assert!(set.release().is_empty());
        assert!(matches!(set.qp(), Err(RpcError::Released)));
    }

    #[test]
    fn test_failed_acquire_releases_partial() {
        let limits = ResourceLimits {
            memory_regions: 0,
            ..ResourceLimits::default()
        };
        let device = Device::with_limits("res-partial", limits);
        let channel = EventChannel::with_device(Arc::clone(&device));
        let mut id = channel.create_id();

        let err = ResourceSet::acquire(&mut id, 1).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Resource { op: "register memory region", .. }
        ));
        assert!(device.resource_counts().is_empty());
    }

    #[test]
    fn test_queue_pair_limit() {
        let limits = ResourceLimits {
            queue_pairs: 0,
            ..ResourceLimits::default()
        };
        let device = Device::with_limits("res-qp", limits);
        let channel = EventChannel::with_device(Arc::clone(&device));
        let mut id = channel.create_id();

        let err = ResourceSet::acquire(&mut id, 1).unwrap_err();
        assert!(matches!(err, RpcError::Resource { op: "create queue pair", .. }));
        assert!(device.resource_counts().is_empty());
    }

    #[test]
    fn test_zero_pages() {
        let device = Device::open("res-zero");
        let channel = EventChannel::with_device(Arc::clone(&device));
        let mut id = channel.create_id();
        assert!(matches!(
            ResourceSet::acquire(&mut id, 0),
            Err(RpcError::BufferAllocation { size: 0 })
        ));
    }

    #[test]
    fn test_drop_releases() {
        let device = Device::open("res-drop");
        let channel = EventChannel::with_device(Arc::clone(&device));
        let mut id = channel.create_id();
        drop(ResourceSet::acquire(&mut id, 2).unwrap());
        assert!(device.resource_counts().is_empty());
    }
}
