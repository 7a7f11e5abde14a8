//! One-sided data operations and the flag synchronization protocol.
//!
//! Every operation takes a local heap offset and a global offset
//! (`peer * heap_size + offset`) and returns the absolute local address it
//! touched. Plain variants return once the work request is posted. `_sync`
//! variants additionally read the peer's remote sentinel into local flag
//! `flag` after the operation and wait for it to turn non-zero; the read is
//! ordered behind the operation on the same queue pair.

use super::connection::Connection;
use super::node::Cluster;
use crate::error::{RdsmError, Result};
use crate::transport::fabric::{Fabric, WorkOp};
use crate::types::{ATOMIC_WIDTH, FlagId, PeerIndex};
use crate::wait::wait_until;
use std::sync::Arc;

/// A posted data operation.
struct Issued<F: Fabric> {
    conn: Arc<Connection<F>>,
    local_addr: usize,
}

impl<F: Fabric> Cluster<F> {
    /// Write `len` bytes at local `local_off` to global `dst`.
    pub fn write(&self, local_off: usize, dst: usize, len: usize) -> Result<usize> {
        Ok(self.issue(WorkOp::Write, local_off, dst, len)?.local_addr)
    }

    pub fn write_sync(&self, local_off: usize, dst: usize, len: usize, flag: FlagId) -> Result<usize> {
        self.begin_sync(flag)?;
        let issued = self.issue(WorkOp::Write, local_off, dst, len)?;
        self.finish_sync(&issued, flag)
    }

    /// Read `len` bytes at global `src` into local `local_off`.
    pub fn read(&self, local_off: usize, src: usize, len: usize) -> Result<usize> {
        Ok(self.issue(WorkOp::Read, local_off, src, len)?.local_addr)
    }

    pub fn read_sync(&self, local_off: usize, src: usize, len: usize, flag: FlagId) -> Result<usize> {
        self.begin_sync(flag)?;
        let issued = self.issue(WorkOp::Read, local_off, src, len)?;
        self.finish_sync(&issued, flag)
    }

    /// Compare-and-swap the 8-byte word at global `dst`; the prior value
    /// lands at local `local_off`.
    pub fn atomic_compare_exchange(
        &self,
        local_off: usize,
        dst: usize,
        expected: u64,
        new_value: u64,
    ) -> Result<usize> {
        let op = WorkOp::CompareSwap {
            compare: expected,
            swap: new_value,
        };
        Ok(self.issue(op, local_off, dst, ATOMIC_WIDTH)?.local_addr)
    }

    pub fn atomic_compare_exchange_sync(
        &self,
        local_off: usize,
        dst: usize,
        expected: u64,
        new_value: u64,
        flag: FlagId,
    ) -> Result<usize> {
        self.begin_sync(flag)?;
        let op = WorkOp::CompareSwap {
            compare: expected,
            swap: new_value,
        };
        let issued = self.issue(op, local_off, dst, ATOMIC_WIDTH)?;
        self.finish_sync(&issued, flag)
    }

    /// Add `add` to the 8-byte word at global `dst`; the prior value lands
    /// at local `local_off`.
    pub fn atomic_fetch_add(&self, local_off: usize, dst: usize, add: u64) -> Result<usize> {
        Ok(self
            .issue(WorkOp::FetchAdd { add }, local_off, dst, ATOMIC_WIDTH)?
            .local_addr)
    }

    pub fn atomic_fetch_add_sync(
        &self,
        local_off: usize,
        dst: usize,
        add: u64,
        flag: FlagId,
    ) -> Result<usize> {
        self.begin_sync(flag)?;
        let issued = self.issue(WorkOp::FetchAdd { add }, local_off, dst, ATOMIC_WIDTH)?;
        self.finish_sync(&issued, flag)
    }

    /// Compare-and-swap on this server's own heap at `dst % heap_size`,
    /// executed by the adapter through the first link.
    ///
    /// Waits for the local completion rather than a peer sentinel. `flag`
    /// is only range-checked: it is neither reset nor waited on.
    pub fn local_atomic_compare_exchange_sync(
        &self,
        local_off: usize,
        dst: usize,
        expected: u64,
        new_value: u64,
        flag: FlagId,
    ) -> Result<usize> {
        self.stop.check()?;
        let region = self.ready_region()?;
        region.flag_addr(flag)?;
        let offset = dst % self.config.heap_size;
        let local_addr = region.heap_addr(local_off, ATOMIC_WIDTH)?;
        let target_off = region.layout().heap_range(offset, ATOMIC_WIDTH)?;
        let conn = self.link(0).map_err(|e| match e {
            RdsmError::InvalidPeer { .. } => {
                RdsmError::Config("local atomics need at least one peer link".into())
            }
            other => other,
        })?;
        let target = conn.own_target(target_off);
        if target.addr % ATOMIC_WIDTH as u64 != 0 {
            return Err(RdsmError::Misaligned {
                what: "local atomic",
                offset,
            });
        }
        let op = WorkOp::CompareSwap {
            compare: expected,
            swap: new_value,
        };
        let ticket = conn.post_data(op, local_addr, ATOMIC_WIDTH, target)?;
        conn.wait_data(ticket, self.config.sync_timeout, flag)?;
        Ok(local_addr)
    }

    /// [`read_sync`](Self::read_sync) split into chunks of at most
    /// `max_transfer_bytes`.
    pub fn read_large_sync(
        &self,
        local_off: usize,
        src: usize,
        len: usize,
        flag: FlagId,
    ) -> Result<usize> {
        let start = self.ready_region()?.heap_addr(local_off, len)?;
        for (done, chunk) in self.chunks(len) {
            self.read_sync(local_off + done, src + done, chunk, flag)?;
        }
        Ok(start)
    }

    /// [`write_sync`](Self::write_sync) split into chunks of at most
    /// `max_transfer_bytes`.
    pub fn write_large_sync(
        &self,
        local_off: usize,
        dst: usize,
        len: usize,
        flag: FlagId,
    ) -> Result<usize> {
        let start = self.ready_region()?.heap_addr(local_off, len)?;
        for (done, chunk) in self.chunks(len) {
            self.write_sync(local_off + done, dst + done, chunk, flag)?;
        }
        Ok(start)
    }

    fn chunks(&self, len: usize) -> impl Iterator<Item = (usize, usize)> + use<F> {
        let max = self.config.max_transfer_bytes;
        (0..len)
            .step_by(max)
            .map(move |done| (done, max.min(len - done)))
    }

    /// Copy `len` bytes inside the local heap; ranges may overlap.
    pub fn copy_local(&self, src_off: usize, dst_off: usize, len: usize) -> Result<usize> {
        let region = self.regions.region()?;
        region.copy_within(src_off, dst_off, len)?;
        region.heap_addr(dst_off, len)
    }

    /// Copy `data` into the local heap at `local_off`.
    pub fn write_local(&self, local_off: usize, data: &[u8]) -> Result<()> {
        self.regions.region()?.write_heap(local_off, data)
    }

    /// Copy local heap bytes at `local_off` into `out`.
    pub fn read_local(&self, local_off: usize, out: &mut [u8]) -> Result<()> {
        self.regions.region()?.read_heap(local_off, out)
    }

    /// The 8-byte word at `local_off`, as deposited by an atomic.
    pub fn read_local_u64(&self, local_off: usize) -> Result<u64> {
        let mut buf = [0u8; ATOMIC_WIDTH];
        self.read_local(local_off, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write_local_u64(&self, local_off: usize, value: u64) -> Result<()> {
        self.write_local(local_off, &value.to_ne_bytes())
    }

    /// Start of the local heap.
    pub fn heap_ptr(&self) -> Result<*mut u8> {
        Ok(self.regions.region()?.heap_ptr())
    }

    /// Address of the local heap.
    pub fn heap_start(&self) -> Result<usize> {
        Ok(self.regions.region()?.heap_start())
    }

    pub fn heap_size(&self) -> usize {
        self.config.heap_size
    }

    pub fn self_index(&self) -> PeerIndex {
        self.addresses.self_index()
    }

    /// Absolute address of local heap offset `local_off`.
    pub fn local_address(&self, local_off: usize) -> Result<usize> {
        self.regions.region()?.heap_addr(local_off, 0)
    }

    /// Inverse of the peer-to-slot mapping.
    pub fn peer_for_slot(&self, slot: usize) -> Result<PeerIndex> {
        self.addresses.peer_for_slot(slot)
    }

    /// Validate `flag` and reset its local copy.
    fn begin_sync(&self, flag: FlagId) -> Result<()> {
        self.ready_region()?.clear_flag(flag)
    }

    /// Read the peer sentinel behind `issued` and wait for it to land.
    fn finish_sync(&self, issued: &Issued<F>, flag: FlagId) -> Result<usize> {
        let region = self.ready_region()?;
        let flag_addr = region.flag_addr(flag)?;
        let sentinel = issued
            .conn
            .peer_target(region.layout().remote_flag_offset(), 1)?;
        issued.conn.post_data(WorkOp::Read, flag_addr, 1, sentinel)?;
        let timeout = self.config.sync_timeout;
        wait_until(
            timeout,
            &self.stop,
            || Ok(region.flag_is_set(flag)?.then_some(())),
            || RdsmError::SyncTimeout {
                flag,
                timeout_ms: timeout.as_millis() as u64,
            },
        )?;
        Ok(issued.local_addr)
    }

    /// Resolve `global`, check bounds and alignment, post `op`.
    fn issue(&self, op: WorkOp, local_off: usize, global: usize, len: usize) -> Result<Issued<F>> {
        self.stop.check()?;
        let region = self.ready_region()?;
        let dest = self.addresses.translate(global)?;
        let local_addr = region.heap_addr(local_off, len)?;
        let remote_off = region.layout().heap_range(dest.offset, len)?;
        let conn = self.link(dest.slot)?;
        let target = conn.peer_target(remote_off, len)?;
        if matches!(op, WorkOp::CompareSwap { .. } | WorkOp::FetchAdd { .. })
            && target.addr % ATOMIC_WIDTH as u64 != 0
        {
            return Err(RdsmError::Misaligned {
                what: "remote atomic",
                offset: dest.offset,
            });
        }
        conn.post_data(op, local_addr, len, target)?;
        Ok(Issued { conn, local_addr })
    }
}
