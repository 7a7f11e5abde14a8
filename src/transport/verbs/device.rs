//! Protection domain, completion queue, queue pairs and registrations.

use super::cm::VerbsId;
use super::{set_nonblocking, wait_readable};
use crate::error::{RdsmError, Result};
use crate::transport::fabric::{
    Access, CompletionDevice, CompletionKind, CompletionStatus, MemoryRegistration, QpCaps,
    QueuePair, RecvRequest, Sge, WorkCompletion, WorkOp, WorkRequest,
};
use rdma_sys::{
    ibv_access_flags, ibv_ack_cq_events, ibv_alloc_pd, ibv_comp_channel, ibv_cq,
    ibv_create_comp_channel, ibv_create_cq, ibv_dealloc_pd, ibv_dereg_mr,
    ibv_destroy_comp_channel, ibv_destroy_cq, ibv_get_cq_event, ibv_mr, ibv_pd, ibv_poll_cq,
    ibv_post_recv, ibv_post_send, ibv_qp, ibv_qp_init_attr, ibv_qp_type, ibv_recv_wr,
    ibv_reg_mr, ibv_req_notify_cq, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wc, ibv_wc_opcode,
    ibv_wc_status, ibv_wc_status_str, ibv_wr_opcode, rdma_create_qp, rdma_destroy_qp,
};
use std::ffi::CStr;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

/// Completions drained per `ibv_poll_cq` call.
const POLL_BATCH: usize = 32;

pub(super) struct DeviceInner {
    pd: *mut ibv_pd,
    channel: *mut ibv_comp_channel,
    cq: *mut ibv_cq,
}

unsafe impl Send for DeviceInner {}
unsafe impl Sync for DeviceInner {}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        unsafe {
            if !self.cq.is_null() {
                ibv_destroy_cq(self.cq);
            }
            if !self.channel.is_null() {
                ibv_destroy_comp_channel(self.channel);
            }
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
        }
    }
}

/// One context slot's protection domain, completion channel and queue.
pub struct VerbsDevice(Arc<DeviceInner>);

impl VerbsDevice {
    pub(super) fn open(id: &VerbsId, cq_depth: u32) -> Result<Self> {
        let ctx = unsafe { (*id.raw()).verbs };
        if ctx.is_null() {
            return Err(RdsmError::device("identifier is not bound to an RDMA device"));
        }
        // Partially built handles are released by DeviceInner's Drop.
        let mut inner = DeviceInner {
            pd: ptr::null_mut(),
            channel: ptr::null_mut(),
            cq: ptr::null_mut(),
        };
        inner.pd = unsafe { ibv_alloc_pd(ctx) };
        if inner.pd.is_null() {
            return Err(RdsmError::last_os_device("ibv_alloc_pd"));
        }
        inner.channel = unsafe { ibv_create_comp_channel(ctx) };
        if inner.channel.is_null() {
            return Err(RdsmError::last_os_device("ibv_create_comp_channel"));
        }
        set_nonblocking(unsafe { (*inner.channel).fd }, "completion channel")?;
        let depth = libc::c_int::try_from(cq_depth)
            .map_err(|_| RdsmError::Config(format!("cq depth {cq_depth} too large")))?;
        inner.cq = unsafe { ibv_create_cq(ctx, depth, ptr::null_mut(), inner.channel, 0) };
        if inner.cq.is_null() {
            return Err(RdsmError::last_os_device("ibv_create_cq"));
        }
        if unsafe { ibv_req_notify_cq(inner.cq, 0) } != 0 {
            return Err(RdsmError::last_os_device("ibv_req_notify_cq"));
        }
        Ok(Self(Arc::new(inner)))
    }

    fn drain(&self, out: &mut Vec<WorkCompletion>) -> Result<()> {
        let mut wcs: [ibv_wc; POLL_BATCH] = unsafe { std::mem::zeroed() };
        loop {
            let n = unsafe { ibv_poll_cq(self.0.cq, POLL_BATCH as libc::c_int, wcs.as_mut_ptr()) };
            if n < 0 {
                return Err(RdsmError::device(format!("ibv_poll_cq returned {n}")));
            }
            for wc in &wcs[..n as usize] {
                out.push(convert(wc)?);
            }
            if (n as usize) < POLL_BATCH {
                return Ok(());
            }
        }
    }
}

fn convert(wc: &ibv_wc) -> Result<WorkCompletion> {
    if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
        let text = unsafe { CStr::from_ptr(ibv_wc_status_str(wc.status)) };
        return Ok(WorkCompletion {
            wr_id: wc.wr_id,
            status: CompletionStatus::Failed(text.to_string_lossy().into_owned()),
            // The opcode is undefined on error completions.
            kind: CompletionKind::Send,
            byte_len: wc.byte_len,
        });
    }
    let kind = match wc.opcode {
        ibv_wc_opcode::IBV_WC_SEND => CompletionKind::Send,
        ibv_wc_opcode::IBV_WC_RECV => CompletionKind::Recv,
        ibv_wc_opcode::IBV_WC_RDMA_WRITE => CompletionKind::Write,
        ibv_wc_opcode::IBV_WC_RDMA_READ => CompletionKind::Read,
        ibv_wc_opcode::IBV_WC_COMP_SWAP => CompletionKind::CompareSwap,
        ibv_wc_opcode::IBV_WC_FETCH_ADD => CompletionKind::FetchAdd,
        other => {
            return Err(RdsmError::device(format!(
                "unsupported completion opcode {other} (wr_id={:#x})",
                wc.wr_id
            )));
        }
    };
    Ok(WorkCompletion {
        wr_id: wc.wr_id,
        status: CompletionStatus::Success,
        kind,
        byte_len: wc.byte_len,
    })
}

impl CompletionDevice for VerbsDevice {
    fn wait_completions(&self, timeout: Duration, out: &mut Vec<WorkCompletion>) -> Result<()> {
        let fd = unsafe { (*self.0.channel).fd };
        if wait_readable(fd, timeout)? {
            let mut cq: *mut ibv_cq = ptr::null_mut();
            let mut ctx: *mut libc::c_void = ptr::null_mut();
            if unsafe { ibv_get_cq_event(self.0.channel, &mut cq, &mut ctx) } == 0 {
                unsafe { ibv_ack_cq_events(cq, 1) };
                if unsafe { ibv_req_notify_cq(cq, 0) } != 0 {
                    return Err(RdsmError::last_os_device("ibv_req_notify_cq"));
                }
            }
        }
        // Drain even without an event: entries queued before re-arming
        // raise no further notification.
        self.drain(out)
    }
}

pub(super) struct QpInner {
    // Destroyed before the identifier it was created on.
    raw: *mut ibv_qp,
    id: VerbsId,
    _device: Arc<DeviceInner>,
}

unsafe impl Send for QpInner {}
unsafe impl Sync for QpInner {}

impl Drop for QpInner {
    fn drop(&mut self) {
        unsafe { rdma_destroy_qp(self.id.raw()) };
    }
}

/// Reliable-connected queue pair created through the connection manager.
pub struct VerbsQp(QpInner);

impl VerbsQp {
    pub(super) fn create(id: &VerbsId, device: &VerbsDevice, caps: QpCaps) -> Result<Self> {
        let mut attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        attr.send_cq = device.0.cq;
        attr.recv_cq = device.0.cq;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = 0;
        attr.cap.max_send_wr = caps.max_send_wr;
        attr.cap.max_recv_wr = caps.max_recv_wr;
        attr.cap.max_send_sge = caps.max_send_sge;
        attr.cap.max_recv_sge = caps.max_recv_sge;
        if unsafe { rdma_create_qp(id.raw(), device.0.pd, &mut attr) } != 0 {
            return Err(RdsmError::last_os_device("rdma_create_qp"));
        }
        let raw = unsafe { (*id.raw()).qp };
        Ok(Self(QpInner {
            raw,
            id: id.clone(),
            _device: Arc::clone(&device.0),
        }))
    }
}

fn raw_sge(sge: &Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.len,
        lkey: sge.lkey,
    }
}

impl QueuePair for VerbsQp {
    fn qp_num(&self) -> u32 {
        unsafe { (*self.0.raw).qp_num }
    }

    fn post_send(&self, wr: &WorkRequest) -> Result<()> {
        let mut sge = raw_sge(&wr.local);
        let mut raw: ibv_send_wr = unsafe { std::mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;
        raw.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let remote = wr.remote;
        let need_remote = || {
            remote.ok_or_else(|| RdsmError::device(format!("{:?} without remote target", wr.op)))
        };
        raw.opcode = match wr.op {
            WorkOp::Send => ibv_wr_opcode::IBV_WR_SEND,
            WorkOp::Write | WorkOp::Read => {
                let target = need_remote()?;
                unsafe {
                    raw.wr.rdma.remote_addr = target.addr;
                    raw.wr.rdma.rkey = target.rkey;
                }
                if wr.op == WorkOp::Write {
                    ibv_wr_opcode::IBV_WR_RDMA_WRITE
                } else {
                    ibv_wr_opcode::IBV_WR_RDMA_READ
                }
            }
            WorkOp::CompareSwap { compare, swap } => {
                let target = need_remote()?;
                unsafe {
                    raw.wr.atomic.remote_addr = target.addr;
                    raw.wr.atomic.rkey = target.rkey;
                    raw.wr.atomic.compare_add = compare;
                    raw.wr.atomic.swap = swap;
                }
                ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP
            }
            WorkOp::FetchAdd { add } => {
                let target = need_remote()?;
                unsafe {
                    raw.wr.atomic.remote_addr = target.addr;
                    raw.wr.atomic.rkey = target.rkey;
                    raw.wr.atomic.compare_add = add;
                }
                ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD
            }
        };
        let mut bad: *mut ibv_send_wr = ptr::null_mut();
        let rc = unsafe { ibv_post_send(self.0.raw, &mut raw, &mut bad) };
        if rc != 0 {
            return Err(RdsmError::device_with_source(
                "ibv_post_send failed",
                std::io::Error::from_raw_os_error(rc),
            ));
        }
        Ok(())
    }

    fn post_recv(&self, wr: &RecvRequest) -> Result<()> {
        let mut sge = raw_sge(&wr.local);
        let mut raw: ibv_recv_wr = unsafe { std::mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;
        let mut bad: *mut ibv_recv_wr = ptr::null_mut();
        let rc = unsafe { ibv_post_recv(self.0.raw, &mut raw, &mut bad) };
        if rc != 0 {
            return Err(RdsmError::device_with_source(
                "ibv_post_recv failed",
                std::io::Error::from_raw_os_error(rc),
            ));
        }
        Ok(())
    }
}

/// An `ibv_mr`; deregistered on drop, before its protection domain.
pub struct VerbsMr {
    raw: *mut ibv_mr,
    _device: Arc<DeviceInner>,
}

unsafe impl Send for VerbsMr {}
unsafe impl Sync for VerbsMr {}

fn access_bits(access: Access) -> libc::c_int {
    let mut bits = 0;
    if access.contains(Access::LOCAL_WRITE) {
        bits |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0;
    }
    if access.contains(Access::REMOTE_WRITE) {
        bits |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
    }
    if access.contains(Access::REMOTE_READ) {
        bits |= ibv_access_flags::IBV_ACCESS_REMOTE_READ.0;
    }
    if access.contains(Access::REMOTE_ATOMIC) {
        bits |= ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0;
    }
    bits as libc::c_int
}

impl VerbsMr {
    pub(super) fn register(
        device: &VerbsDevice,
        addr: *mut u8,
        len: usize,
        access: Access,
    ) -> Result<Self> {
        let raw = unsafe { ibv_reg_mr(device.0.pd, addr.cast(), len, access_bits(access)) };
        if raw.is_null() {
            return Err(RdsmError::last_os_device("ibv_reg_mr"));
        }
        tracing::debug!(addr = format_args!("{:#x}", addr as usize), len, access = access.bits(), "registered memory");
        Ok(Self {
            raw,
            _device: Arc::clone(&device.0),
        })
    }
}

impl MemoryRegistration for VerbsMr {
    fn addr(&self) -> usize {
        unsafe { (*self.raw).addr as usize }
    }

    fn len(&self) -> usize {
        unsafe { (*self.raw).length }
    }

    fn lkey(&self) -> u32 {
        unsafe { (*self.raw).lkey }
    }

    fn rkey(&self) -> u32 {
        unsafe { (*self.raw).rkey }
    }
}

impl Drop for VerbsMr {
    fn drop(&mut self) {
        if unsafe { ibv_dereg_mr(self.raw) } != 0 {
            tracing::debug!(error = %std::io::Error::last_os_error(), "ibv_dereg_mr failed");
        }
    }
}
