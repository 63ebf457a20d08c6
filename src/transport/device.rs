//! Device, Protection Domain and Memory Region
//!
//! A [`Device`] is the transport context every other resource hangs off. It
//! hands out protection domains and completion queues and keeps a live count
//! of everything it has allocated. A [`ProtectionDomain`] scopes which memory
//! regions and queue pairs may work together; a [`MemoryRegion`] owns one
//! buffer and the key pair that makes it addressable.

use super::{lock, Result, TransportError};
use crate::transport::cq::{CompletionQueue, CqInner};
use bitflags::bitflags;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::trace;

bitflags! {
    /// Memory access flags for memory region registration.
    ///
    /// Local read access is always granted. `REMOTE_WRITE` requires
    /// `LOCAL_WRITE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// The local side may write into the region (receives land here)
        const LOCAL_WRITE = 1 << 0;
        /// The peer may write into the region
        const REMOTE_WRITE = 1 << 1;
        /// The peer may read from the region
        const REMOTE_READ = 1 << 2;
    }
}

/// Per-type caps on how many resources a device will hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub protection_domains: usize,
    pub completion_queues: usize,
    pub queue_pairs: usize,
    pub memory_regions: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            protection_domains: usize::MAX,
            completion_queues: usize::MAX,
            queue_pairs: usize::MAX,
            memory_regions: usize::MAX,
        }
    }
}

/// Snapshot of the resources currently allocated on a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub protection_domains: usize,
    pub completion_queues: usize,
    pub queue_pairs: usize,
    pub memory_regions: usize,
}

impl ResourceCounts {
    /// Returns true when nothing is allocated.
    pub fn is_empty(&self) -> bool {
        *self == ResourceCounts::default()
    }
}

#[derive(Debug, Default)]
struct Counters {
    protection_domains: AtomicUsize,
    completion_queues: AtomicUsize,
    queue_pairs: AtomicUsize,
    memory_regions: AtomicUsize,
}

/// Resource classes tracked by a device.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResourceClass {
    ProtectionDomain,
    CompletionQueue,
    QueuePair,
    MemoryRegion,
}

impl ResourceClass {
    fn name(self) -> &'static str {
        match self {
            ResourceClass::ProtectionDomain => "protection domain",
            ResourceClass::CompletionQueue => "completion queue",
            ResourceClass::QueuePair => "queue pair",
            ResourceClass::MemoryRegion => "memory region",
        }
    }
}

/// A software verbs device.
///
/// Devices are shared through `Arc`. Every connection-manager endpoint that
/// resolves an address is bound to the device of its event channel.
pub struct Device {
    name: String,
    limits: ResourceLimits,
    counters: Counters,
    next_key: AtomicU32,
    next_qp_num: AtomicU32,
    next_handle: AtomicU32,
}

impl Device {
    /// Opens a fresh device with no resource limits.
    pub fn open(name: impl Into<String>) -> Arc<Self> {
        Self::with_limits(name, ResourceLimits::default())
    }

    /// Opens a fresh device that refuses allocations beyond `limits`.
    pub fn with_limits(name: impl Into<String>, limits: ResourceLimits) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limits,
            counters: Counters::default(),
            next_key: AtomicU32::new(0x1000),
            // Queue pair numbers are 24-bit; skip the reserved low numbers
            next_qp_num: AtomicU32::new(0x100),
            next_handle: AtomicU32::new(1),
        })
    }

    /// The process-wide default device, opened on first use.
    pub fn default_device() -> Arc<Self> {
        static DEFAULT: OnceLock<Arc<Device>> = OnceLock::new();
        Arc::clone(DEFAULT.get_or_init(|| Device::open("soft0")))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the resources currently allocated on this device.
    pub fn resource_counts(&self) -> ResourceCounts {
        ResourceCounts {
            protection_domains: self.counters.protection_domains.load(Ordering::Acquire),
            completion_queues: self.counters.completion_queues.load(Ordering::Acquire),
            queue_pairs: self.counters.queue_pairs.load(Ordering::Acquire),
            memory_regions: self.counters.memory_regions.load(Ordering::Acquire),
        }
    }

    /// Allocates a protection domain.
    pub fn alloc_pd(self: &Arc<Self>) -> Result<ProtectionDomain> {
        self.charge(ResourceClass::ProtectionDomain)?;
        let inner = Arc::new(PdInner {
            handle: self.next_handle(),
            device: Arc::clone(self),
            users: AtomicUsize::new(0),
        });
        trace!(device = %self.name, pd = inner.handle, "Allocated protection domain");
        Ok(ProtectionDomain { inner })
    }

    /// Creates a completion queue able to hold `capacity` entries.
    pub fn create_cq(self: &Arc<Self>, capacity: u32) -> Result<CompletionQueue> {
        if capacity == 0 {
            return Err(TransportError::InvalidArgument(
                "completion queue capacity must be non-zero",
            ));
        }
        self.charge(ResourceClass::CompletionQueue)?;
        let inner = CqInner::new(self.next_handle(), capacity as usize, Arc::clone(self));
        trace!(device = %self.name, cq = inner.handle(), capacity, "Created completion queue");
        Ok(CompletionQueue::from_inner(inner))
    }

    pub(crate) fn next_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_qp_num(&self) -> u32 {
        self.next_qp_num.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF
    }

    fn next_key(&self) -> u32 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Counts one more resource of `class`, failing at the device limit.
    pub(crate) fn charge(&self, class: ResourceClass) -> Result<()> {
        let (counter, limit) = match class {
            ResourceClass::ProtectionDomain => (
                &self.counters.protection_domains,
                self.limits.protection_domains,
            ),
            ResourceClass::CompletionQueue => (
                &self.counters.completion_queues,
                self.limits.completion_queues,
            ),
            ResourceClass::QueuePair => (&self.counters.queue_pairs, self.limits.queue_pairs),
            ResourceClass::MemoryRegion => {
                (&self.counters.memory_regions, self.limits.memory_regions)
            }
        };

        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| TransportError::ResourceExhausted(class.name()))
    }

    /// Returns one resource of `class` to the device.
    pub(crate) fn uncharge(&self, class: ResourceClass) {
        let counter = match class {
            ResourceClass::ProtectionDomain => &self.counters.protection_domains,
            ResourceClass::CompletionQueue => &self.counters.completion_queues,
            ResourceClass::QueuePair => &self.counters.queue_pairs,
            ResourceClass::MemoryRegion => &self.counters.memory_regions,
        };
        counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("resources", &self.resource_counts())
            .finish()
    }
}

pub(crate) struct PdInner {
    handle: u32,
    device: Arc<Device>,
    /// Memory regions and queue pairs created in this domain
    users: AtomicUsize,
}

impl PdInner {
    pub(crate) fn add_user(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_user(&self) {
        self.users.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A protection domain.
///
/// Deallocation fails with [`TransportError::Busy`] while any memory region
/// or queue pair created in the domain is still alive.
pub struct ProtectionDomain {
    inner: Arc<PdInner>,
}

impl ProtectionDomain {
    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    pub(crate) fn inner(&self) -> &Arc<PdInner> {
        &self.inner
    }

    /// Registers `buffer` with this domain.
    ///
    /// The region takes ownership of the buffer and frees it on
    /// deregistration.
    pub fn register(&self, buffer: Vec<u8>, access: AccessFlags) -> Result<MemoryRegion> {
        if access.contains(AccessFlags::REMOTE_WRITE) && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(TransportError::InvalidArgument(
                "remote write access requires local write access",
            ));
        }
        if buffer.is_empty() {
            return Err(TransportError::InvalidArgument(
                "cannot register an empty buffer",
            ));
        }

        let device = &self.inner.device;
        device.charge(ResourceClass::MemoryRegion)?;
        self.inner.add_user();

        let inner = Arc::new(MrInner {
            pd: Arc::clone(&self.inner),
            lkey: device.next_key(),
            rkey: device.next_key(),
            access,
            len: buffer.len(),
            buffer: Mutex::new(buffer.into_boxed_slice()),
            registered: AtomicBool::new(true),
        });
        trace!(
            pd = self.inner.handle,
            lkey = inner.lkey,
            rkey = inner.rkey,
            len = inner.len,
            "Registered memory region"
        );
        Ok(MemoryRegion { inner })
    }

    /// Deallocates the domain.
    pub fn dealloc(self) -> Result<()> {
        if self.inner.users.load(Ordering::Acquire) > 0 {
            return Err(TransportError::Busy(
                "protection domain still has memory regions or queue pairs",
            ));
        }
        self.inner.device.uncharge(ResourceClass::ProtectionDomain);
        trace!(pd = self.inner.handle, "Deallocated protection domain");
        Ok(())
    }
}

impl fmt::Debug for ProtectionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionDomain")
            .field("handle", &self.inner.handle)
            .field("users", &self.inner.users.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct MrInner {
    pd: Arc<PdInner>,
    lkey: u32,
    rkey: u32,
    access: AccessFlags,
    len: usize,
    buffer: Mutex<Box<[u8]>>,
    registered: AtomicBool,
}

impl MrInner {
    pub(crate) fn pd(&self) -> &Arc<PdInner> {
        &self.pd
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if !self.registered.load(Ordering::Acquire) {
            return Err(TransportError::InvalidState("memory region is deregistered"));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TransportError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        let mut buffer = lock(&self.buffer);
        buffer[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        self.check(offset, len)?;
        let buffer = lock(&self.buffer);
        Ok(Bytes::copy_from_slice(&buffer[offset..offset + len]))
    }
}

/// A registered memory region.
///
/// The region owns its buffer. Local code moves bytes in and out with
/// [`write`](Self::write) and [`read`](Self::read); queue pairs reference it
/// through [`Sge`](crate::transport::Sge) entries.
pub struct MemoryRegion {
    inner: Arc<MrInner>,
}

impl MemoryRegion {
    /// Key used by local work requests.
    pub fn lkey(&self) -> u32 {
        self.inner.lkey
    }

    /// Key a peer presents for remote access.
    pub fn rkey(&self) -> u32 {
        self.inner.rkey
    }

    pub fn access(&self) -> AccessFlags {
        self.inner.access
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Copies `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.inner.write(offset, data)
    }

    /// Copies `len` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        self.inner.read(offset, len)
    }

    pub(crate) fn inner(&self) -> &Arc<MrInner> {
        &self.inner
    }

    /// Deregisters the region and frees its buffer.
    pub fn deregister(self) -> Result<()> {
        if !self.inner.registered.swap(false, Ordering::AcqRel) {
            return Err(TransportError::InvalidState(
                "memory region already deregistered",
            ));
        }
        *lock(&self.inner.buffer) = Box::default();
        self.inner.pd.remove_user();
        self.inner.pd.device.uncharge(ResourceClass::MemoryRegion);
        trace!(lkey = self.inner.lkey, "Deregistered memory region");
        Ok(())
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("lkey", &self.inner.lkey)
            .field("rkey", &self.inner.rkey)
            .field("len", &self.inner.len)
            .field("access", &self.inner.access)
            .finish()
    }
}
