//! Simulated verbs: completion devices, queue pairs and registrations.
//!
//! Work requests execute synchronously when posted: the bytes move (or the
//! atomic applies) and a completion is pushed before `post_send` returns.

use super::Shared;
use crate::error::{RdsmError, Result};
use crate::transport::fabric::{
    Access, CompletionDevice, CompletionKind, CompletionStatus, MemoryRegistration, QpCaps,
    QueuePair, RecvRequest, RemoteTarget, WorkCompletion, WorkOp, WorkRequest,
};
use crossbeam_queue::ArrayQueue;
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

/// A registered range, keyed by its (shared) lkey/rkey.
#[derive(Debug, Clone, Copy)]
pub(super) struct RegionEntry {
    pub(super) addr: usize,
    pub(super) len: usize,
    pub(super) access: Access,
}

pub(super) struct DeviceState {
    cq: ArrayQueue<WorkCompletion>,
    overrun: AtomicBool,
    lock: Mutex<()>,
    ready: Condvar,
}

impl DeviceState {
    fn push(&self, wc: WorkCompletion) {
        if self.cq.push(wc).is_err() {
            self.overrun.store(true, Ordering::Release);
        }
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    fn check_overrun(&self) -> Result<()> {
        if self.overrun.load(Ordering::Acquire) {
            return Err(RdsmError::device(format!(
                "completion queue overrun (depth {})",
                self.cq.capacity()
            )));
        }
        Ok(())
    }
}

/// Simulated completion queue plus completion channel.
pub struct SimDevice(pub(super) Arc<DeviceState>);

impl SimDevice {
    pub(super) fn new(cq_depth: u32) -> Result<Self> {
        if cq_depth == 0 {
            return Err(RdsmError::device("ibv_create_cq: zero depth"));
        }
        Ok(Self(Arc::new(DeviceState {
            cq: ArrayQueue::new(cq_depth as usize),
            overrun: AtomicBool::new(false),
            lock: Mutex::new(()),
            ready: Condvar::new(),
        })))
    }
}

impl CompletionDevice for SimDevice {
    fn wait_completions(&self, timeout: Duration, out: &mut Vec<WorkCompletion>) -> Result<()> {
        self.0.check_overrun()?;
        {
            let guard = self
                .0
                .lock
                .lock()
                .map_err(|_| RdsmError::LockPoisoned("sim completion channel"))?;
            let _ = self
                .0
                .ready
                .wait_timeout_while(guard, timeout, |_| self.0.cq.is_empty())
                .map_err(|_| RdsmError::LockPoisoned("sim completion channel"))?;
        }
        while let Some(wc) = self.0.cq.pop() {
            out.push(wc);
        }
        self.0.check_overrun()
    }
}

#[derive(Default)]
struct Inbox {
    posted: VecDeque<RecvRequest>,
    // Messages that arrived with no receive posted (receiver not ready).
    pending: VecDeque<Vec<u8>>,
}

pub(super) struct QpState {
    qp_num: u32,
    caps: QpCaps,
    device: Arc<DeviceState>,
    shared: Weak<Shared>,
    peer: Mutex<Option<Weak<QpState>>>,
    inbox: Mutex<Inbox>,
}

impl QpState {
    pub(super) fn new(
        qp_num: u32,
        caps: QpCaps,
        device: &SimDevice,
        shared: &Arc<Shared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            qp_num,
            caps,
            device: Arc::clone(&device.0),
            shared: Arc::downgrade(shared),
            peer: Mutex::new(None),
            inbox: Mutex::new(Inbox::default()),
        })
    }

    pub(super) fn wire(a: &Arc<QpState>, b: &Arc<QpState>) -> Result<()> {
        *a.peer.lock().map_err(|_| RdsmError::LockPoisoned("sim qp"))? = Some(Arc::downgrade(b));
        *b.peer.lock().map_err(|_| RdsmError::LockPoisoned("sim qp"))? = Some(Arc::downgrade(a));
        Ok(())
    }

    pub(super) fn unwire(&self) {
        if let Ok(mut peer) = self.peer.lock() {
            *peer = None;
        }
    }

    fn peer(&self) -> Result<Arc<QpState>> {
        self.peer
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("sim qp"))?
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                RdsmError::device(format!("ibv_post_send: qp {} is not connected", self.qp_num))
            })
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| RdsmError::device("simulated fabric was dropped"))
    }

    fn complete(&self, wr_id: u64, kind: CompletionKind, byte_len: u32, status: CompletionStatus) {
        self.device.push(WorkCompletion {
            wr_id,
            status,
            kind,
            byte_len,
        });
    }

    /// Hand an incoming SEND payload to the oldest posted receive.
    fn deliver(&self, shared: &Shared, payload: Vec<u8>) -> Result<()> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("sim qp inbox"))?;
        match inbox.posted.pop_front() {
            Some(wr) => self.land(shared, &wr, &payload),
            None => inbox.pending.push_back(payload),
        }
        Ok(())
    }

    fn land(&self, shared: &Shared, wr: &RecvRequest, payload: &[u8]) {
        let status = if payload.len() > wr.local.len as usize {
            CompletionStatus::Failed("local length error".into())
        } else {
            match shared.resolve(wr.local.lkey, wr.local.addr, payload.len(), Access::LOCAL_WRITE) {
                Ok(dst) => {
                    unsafe { ptr::copy(payload.as_ptr(), dst as *mut u8, payload.len()) };
                    CompletionStatus::Success
                }
                Err(status) => CompletionStatus::Failed(status.into()),
            }
        };
        self.complete(wr.wr_id, CompletionKind::Recv, payload.len() as u32, status);
    }

    fn execute(&self, shared: &Shared, wr: &WorkRequest) -> Result<CompletionStatus> {
        let local = wr.local;
        let len = local.len as usize;
        let remote = |access: Access| -> std::result::Result<usize, &'static str> {
            let RemoteTarget { addr, rkey } = wr.remote.ok_or("remote invalid request")?;
            shared
                .resolve(rkey, addr, len, access)
                .map_err(|_| "remote access error")
        };
        let status = match wr.op {
            WorkOp::Send => match shared.resolve(local.lkey, local.addr, len, Access::NONE) {
                Ok(src) => {
                    let mut payload = vec![0u8; len];
                    unsafe { ptr::copy(src as *const u8, payload.as_mut_ptr(), len) };
                    self.peer()?.deliver(shared, payload)?;
                    CompletionStatus::Success
                }
                Err(e) => CompletionStatus::Failed(e.into()),
            },
            WorkOp::Write => {
                let src = shared.resolve(local.lkey, local.addr, len, Access::NONE);
                match (src, remote(Access::REMOTE_WRITE)) {
                    (Ok(src), Ok(dst)) => {
                        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) };
                        CompletionStatus::Success
                    }
                    (Err(e), _) | (_, Err(e)) => CompletionStatus::Failed(e.into()),
                }
            }
            WorkOp::Read => {
                let dst = shared.resolve(local.lkey, local.addr, len, Access::LOCAL_WRITE);
                match (dst, remote(Access::REMOTE_READ)) {
                    (Ok(dst), Ok(src)) => {
                        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) };
                        CompletionStatus::Success
                    }
                    (Err(e), _) | (_, Err(e)) => CompletionStatus::Failed(e.into()),
                }
            }
            WorkOp::CompareSwap { .. } | WorkOp::FetchAdd { .. } => {
                self.atomic(shared, wr, remote(Access::REMOTE_ATOMIC))
            }
        };
        Ok(status)
    }

    fn atomic(
        &self,
        shared: &Shared,
        wr: &WorkRequest,
        target: std::result::Result<usize, &'static str>,
    ) -> CompletionStatus {
        if wr.local.len != 8 {
            return CompletionStatus::Failed("local length error".into());
        }
        let dst = match shared.resolve(wr.local.lkey, wr.local.addr, 8, Access::LOCAL_WRITE) {
            Ok(dst) => dst,
            Err(e) => return CompletionStatus::Failed(e.into()),
        };
        let target = match target {
            Ok(t) if t % 8 == 0 => t,
            Ok(_) => return CompletionStatus::Failed("remote invalid request".into()),
            Err(e) => return CompletionStatus::Failed(e.into()),
        };
        let word = unsafe { &*(target as *const AtomicU64) };
        let old = match wr.op {
            WorkOp::CompareSwap { compare, swap } => {
                match word.compare_exchange(compare, swap, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(v) | Err(v) => v,
                }
            }
            WorkOp::FetchAdd { add } => word.fetch_add(add, Ordering::SeqCst),
            _ => return CompletionStatus::Failed("remote invalid request".into()),
        };
        unsafe { ptr::write_unaligned(dst as *mut u64, old) };
        CompletionStatus::Success
    }
}

/// Simulated reliable-connected queue pair.
pub struct SimQp(pub(super) Arc<QpState>);

impl QueuePair for SimQp {
    fn qp_num(&self) -> u32 {
        self.0.qp_num
    }

    fn post_send(&self, wr: &WorkRequest) -> Result<()> {
        let shared = self.0.shared()?;
        if wr.local.len as usize > 0 && wr.local.addr == 0 {
            return Err(RdsmError::device("ibv_post_send: null scatter entry"));
        }
        // Posting to an unconnected qp fails synchronously, as on hardware.
        self.0.peer()?;
        let status = self.0.execute(&shared, wr)?;
        if let CompletionStatus::Failed(reason) = &status {
            tracing::debug!(qp = self.0.qp_num, wr_id = wr.wr_id, %reason, "sim work request failed");
        }
        self.0
            .complete(wr.wr_id, wr.op.completion_kind(), wr.local.len, status);
        Ok(())
    }

    fn post_recv(&self, wr: &RecvRequest) -> Result<()> {
        let shared = self.0.shared()?;
        let mut inbox = self
            .0
            .inbox
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("sim qp inbox"))?;
        if inbox.posted.len() >= self.0.caps.max_recv_wr as usize {
            return Err(RdsmError::device(format!(
                "ibv_post_recv: receive queue full ({})",
                self.0.caps.max_recv_wr
            )));
        }
        match inbox.pending.pop_front() {
            Some(payload) => self.0.land(&shared, wr, &payload),
            None => inbox.posted.push_back(*wr),
        }
        Ok(())
    }
}

/// Simulated memory registration; the same key serves as lkey and rkey.
pub struct SimMr {
    key: u32,
    addr: usize,
    len: usize,
    shared: Weak<Shared>,
}

impl SimMr {
    pub(super) fn new(shared: &Arc<Shared>, addr: usize, len: usize, access: Access) -> Result<Self> {
        let key = shared.next_key.fetch_add(1, Ordering::Relaxed);
        shared
            .regions
            .write()
            .map_err(|_| RdsmError::LockPoisoned("sim regions"))?
            .insert(key, RegionEntry { addr, len, access });
        Ok(Self {
            key,
            addr,
            len,
            shared: Arc::downgrade(shared),
        })
    }
}

impl MemoryRegistration for SimMr {
    fn addr(&self) -> usize {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }
}

impl Drop for SimMr {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade()
            && let Ok(mut regions) = shared.regions.write()
        {
            regions.remove(&self.key);
        }
    }
}

impl Shared {
    /// Absolute address of `[addr, addr + len)` inside registration `key`,
    /// provided the registration grants `access`.
    pub(super) fn resolve(
        &self,
        key: u32,
        addr: u64,
        len: usize,
        access: Access,
    ) -> std::result::Result<usize, &'static str> {
        let regions = self.regions.read().map_err(|_| "local protection error")?;
        let entry = regions.get(&key).ok_or("protection key error")?;
        let start = usize::try_from(addr).map_err(|_| "protection key error")?;
        let end = start.checked_add(len).ok_or("protection key error")?;
        if start < entry.addr || end > entry.addr + entry.len {
            return Err("protection key error");
        }
        if !entry.access.contains(access) {
            return Err("access violation");
        }
        Ok(start)
    }
}
