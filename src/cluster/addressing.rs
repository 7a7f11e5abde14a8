//! Peer index / connection slot / global offset arithmetic.

use crate::error::{RdsmError, Result};
use crate::types::{PeerIndex, Slot};

/// Where a global offset lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translated {
    pub peer: PeerIndex,
    pub slot: Slot,
    /// Offset inside the peer's heap.
    pub offset: usize,
}

/// Maps between peers, slots and global offsets for one server.
///
/// `slot(p) = p` for `p < self`, `p - 1` for `p > self`; self has no slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMap {
    self_index: PeerIndex,
    cluster_size: usize,
    heap_size: usize,
}

impl AddressMap {
    pub fn new(self_index: PeerIndex, cluster_size: usize, heap_size: usize) -> Result<Self> {
        if self_index >= cluster_size {
            return Err(RdsmError::InvalidServerIndex {
                index: self_index,
                cluster_size,
            });
        }
        if heap_size == 0 {
            return Err(RdsmError::Config("heap size must be non-zero".into()));
        }
        Ok(Self {
            self_index,
            cluster_size,
            heap_size,
        })
    }

    pub fn self_index(&self) -> PeerIndex {
        self.self_index
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Number of peer connections (`cluster_size - 1`).
    pub fn peer_count(&self) -> usize {
        self.cluster_size - 1
    }

    pub fn slot_for_peer(&self, peer: PeerIndex) -> Result<Slot> {
        if peer >= self.cluster_size {
            return Err(RdsmError::InvalidPeer {
                peer,
                cluster_size: self.cluster_size,
            });
        }
        match peer.cmp(&self.self_index) {
            std::cmp::Ordering::Less => Ok(peer),
            std::cmp::Ordering::Greater => Ok(peer - 1),
            std::cmp::Ordering::Equal => Err(RdsmError::SelfDestination { peer }),
        }
    }

    pub fn peer_for_slot(&self, slot: Slot) -> Result<PeerIndex> {
        if slot >= self.peer_count() {
            return Err(RdsmError::InvalidPeer {
                peer: slot,
                cluster_size: self.cluster_size,
            });
        }
        Ok(if slot < self.self_index { slot } else { slot + 1 })
    }

    /// Split `global = peer * heap_size + offset` and resolve the slot.
    pub fn translate(&self, global: usize) -> Result<Translated> {
        let peer = global / self.heap_size;
        let offset = global % self.heap_size;
        let slot = self.slot_for_peer(peer)?;
        Ok(Translated { peer, slot, offset })
    }

    /// Inverse of [`translate`](Self::translate).
    pub fn global_offset(&self, peer: PeerIndex, offset: usize) -> usize {
        peer * self.heap_size + offset
    }
}
