//! Pending Operation Table
//!
//! Every post carries a work-request id, and the completion for that post
//! carries the same id back. The table maps ids to what was posted, so a
//! completion can be matched with the buffer range it touched.
//!
//! ## Id Layout
//!
//! ```text
//!  63                               16 15            0
//! ┌───────────────────────────────────┬───────────────┐
//! │        sequence number            │   slab key    │
//! └───────────────────────────────────┴───────────────┘
//! ```
//!
//! Slab keys are reused as soon as an entry is taken, so the sequence number
//! is what tells a live id from a stale one.

use crate::error::{Result, RpcError};
use slab::Slab;
use std::fmt;

const KEY_BITS: u32 = 16;
const KEY_MASK: u64 = (1 << KEY_BITS) - 1;

/// Most operations one connection may have outstanding.
pub const MAX_PENDING: usize = 1 << KEY_BITS;

/// Direction of a posted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Send,
    Recv,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Send => f.write_str("send"),
            OpKind::Recv => f.write_str("recv"),
        }
    }
}

/// One outstanding post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperation {
    pub kind: OpKind,
    /// Offset of the range inside the registered region
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    op: PendingOperation,
}

/// Outstanding operations of one connection, keyed by work-request id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Slab<Entry>,
    next_seq: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `op` and returns the id to post it with.
    pub fn insert(&mut self, op: PendingOperation) -> Result<u64> {
        if self.entries.len() >= MAX_PENDING {
            return Err(RpcError::PendingTableFull);
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1) & (u64::MAX >> KEY_BITS);
        let key = self.entries.insert(Entry { seq, op });
        Ok((seq << KEY_BITS) | key as u64)
    }

    /// Removes and returns the operation posted with `wr_id`.
    ///
    /// Fails with [`RpcError::UnknownOperation`] for ids that were never
    /// issued or were already taken.
    pub fn take(&mut self, wr_id: u64) -> Result<PendingOperation> {
        let key = (wr_id & KEY_MASK) as usize;
        let seq = wr_id >> KEY_BITS;
        match self.entries.get(key) {
            Some(entry) if entry.seq == seq => Ok(self.entries.remove(key).op),
            _ => Err(RpcError::UnknownOperation(wr_id)),
        }
    }

    /// Number of outstanding operations of `kind`.
    pub fn outstanding(&self, kind: OpKind) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.op.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every outstanding operation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv() -> PendingOperation {
        PendingOperation {
            kind: OpKind::Recv,
            offset: 0,
            len: 72,
        }
    }

    #[test]
    fn test_insert_then_take() {
        let mut table = PendingTable::new();
        let id = table.insert(recv()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(id).unwrap(), recv());
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_twice_fails() {
        let mut table = PendingTable::new();
        let id = table.insert(recv()).unwrap();
        table.take(id).unwrap();
        assert!(matches!(table.take(id), Err(RpcError::UnknownOperation(x)) if x == id));
    }

    #[test]
    fn test_stale_id_after_slot_reuse() {
        let mut table = PendingTable::new();
        let old = table.insert(recv()).unwrap();
        table.take(old).unwrap();

        // Same slab slot, newer sequence number
        let send = PendingOperation {
            kind: OpKind::Send,
            offset: 0,
            len: 72,
        };
        let new = table.insert(send).unwrap();
        assert_eq!(old & KEY_MASK, new & KEY_MASK);
        assert_ne!(old, new);

        assert!(table.take(old).is_err());
        assert_eq!(table.take(new).unwrap().kind, OpKind::Send);
    }

    #[test]
    fn test_never_issued_id() {
        let mut table = PendingTable::new();
        assert!(table.take(0xdead_beef).is_err());
    }

    #[test]
    fn test_outstanding_by_kind() {
        let mut table = PendingTable::new();
        table.insert(recv()).unwrap();
        table
            .insert(PendingOperation {
                kind: OpKind::Send,
                offset: 0,
                len: 72,
            })
            .unwrap();
        table.insert(recv()).unwrap();
        assert_eq!(table.outstanding(OpKind::Recv), 2);
        assert_eq!(table.outstanding(OpKind::Send), 1);
    }
}
