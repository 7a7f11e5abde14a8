//! One peer link: queue pair, control buffers, region registration and the
//! handshake that makes the link usable.

use super::context::HardwareContext;
use crate::config::ClusterConfig;
use crate::error::{RdsmError, Result};
use crate::memory::MappedRegion;
use crate::protocol::{Handshake, HandshakeAction, HandshakeMessage, MESSAGE_SIZE, RegionDescriptor};
use crate::transport::fabric::{
    Access, CmId, CompletionKind, Fabric, MemoryRegistration, QpCaps, QueuePair, RecvRequest,
    RemoteTarget, Sge, WorkCompletion, WorkOp, WorkRequest, WrKind, WrTag,
};
use crate::types::{FlagId, PeerIndex, Role, Slot};
use crate::wait::{StopSignal, wait_until};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Fixed-size heap buffer for one handshake message.
struct ControlBuffer {
    ptr: *mut u8,
}

unsafe impl Send for ControlBuffer {}
unsafe impl Sync for ControlBuffer {}

impl ControlBuffer {
    fn new() -> Self {
        let buf: Box<[u8; MESSAGE_SIZE]> = Box::new([0u8; MESSAGE_SIZE]);
        Self {
            ptr: Box::into_raw(buf) as *mut u8,
        }
    }

    fn sge(&self, lkey: u32) -> Sge {
        Sge {
            addr: self.ptr as u64,
            len: MESSAGE_SIZE as u32,
            lkey,
        }
    }

    fn read(&self, len: usize) -> Vec<u8> {
        let len = len.min(MESSAGE_SIZE);
        let mut out = vec![0u8; len];
        unsafe { ptr::copy_nonoverlapping(self.ptr, out.as_mut_ptr(), len) };
        out
    }

    fn write(&self, bytes: &[u8; MESSAGE_SIZE]) {
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, MESSAGE_SIZE) };
    }
}

impl Drop for ControlBuffer {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.ptr as *mut [u8; MESSAGE_SIZE])) };
    }
}

/// A link to one peer.
///
/// Created on the first connection-manager event for its identifier and
/// usable for data operations only once [`is_synchronized`](Self::is_synchronized).
pub struct Connection<F: Fabric> {
    // Field order is teardown order: queue pair, registrations, buffers,
    // then our reference to the shared mapping.
    qp: F::Qp,
    region_mr: F::Mr,
    send_mr: F::Mr,
    recv_mr: F::Mr,
    send_buf: ControlBuffer,
    recv_buf: ControlBuffer,
    /// Keeps the registered mapping alive.
    _region: Arc<MappedRegion>,
    id: F::Id,

    conn_id: u32,
    context_slot: Slot,
    peer: PeerIndex,
    role: Role,
    peer_desc: OnceLock<RegionDescriptor>,
    connected: AtomicBool,
    synchronized: AtomicBool,
    handshake: Mutex<Handshake>,
    /// Serializes data posts so tickets follow submission order.
    post_lock: Mutex<()>,
    data_posted: AtomicU64,
    data_completed: AtomicU64,
    handshake_timeout: Duration,
    stop: Arc<StopSignal>,
}

/// Everything [`Connection::build`] needs besides the fabric.
pub(crate) struct LinkSpec {
    pub conn_id: u32,
    pub peer: PeerIndex,
    pub role: Role,
}

impl<F: Fabric> Connection<F> {
    /// Create the queue pair, register control buffers and the shared region,
    /// attach to the context's poller and post the first receive.
    pub(crate) fn build(
        fabric: &F,
        ctx: &HardwareContext<F>,
        id: F::Id,
        spec: LinkSpec,
        region: Arc<MappedRegion>,
        config: &ClusterConfig,
        stop: Arc<StopSignal>,
    ) -> Result<Arc<Self>> {
        let qp = fabric.create_qp(&id, ctx.device(), QpCaps::with_depth(config.qp_depth))?;
        let send_buf = ControlBuffer::new();
        let recv_buf = ControlBuffer::new();
        let send_mr = fabric.register(ctx.device(), send_buf.ptr, MESSAGE_SIZE, Access::NONE)?;
        let recv_mr =
            fabric.register(ctx.device(), recv_buf.ptr, MESSAGE_SIZE, Access::LOCAL_WRITE)?;
        let region_mr = fabric.register(
            ctx.device(),
            region.region_start() as *mut u8,
            region.region_len(),
            Access::REGION,
        )?;
        region.arm_remote_sentinel();
        tracing::debug!(
            peer = spec.peer,
            qp_num = qp.qp_num(),
            rkey = region_mr.rkey(),
            region_len = region_mr.len(),
            "registered heap region"
        );

        let conn = Arc::new(Self {
            qp,
            region_mr,
            send_mr,
            recv_mr,
            send_buf,
            recv_buf,
            _region: region,
            id,
            conn_id: spec.conn_id,
            context_slot: ctx.slot(),
            peer: spec.peer,
            role: spec.role,
            peer_desc: OnceLock::new(),
            connected: AtomicBool::new(false),
            synchronized: AtomicBool::new(false),
            handshake: Mutex::new(Handshake::new()),
            post_lock: Mutex::new(()),
            data_posted: AtomicU64::new(0),
            data_completed: AtomicU64::new(0),
            handshake_timeout: config.handshake_timeout,
            stop,
        });
        ctx.attach(Arc::clone(&conn))?;
        if let Err(e) = conn.post_receive() {
            ctx.detach(conn.conn_id);
            return Err(e);
        }
        Ok(conn)
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn context_slot(&self) -> Slot {
        self.context_slot
    }

    pub fn peer(&self) -> PeerIndex {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> &F::Id {
        &self.id
    }

    pub fn qp_num(&self) -> u32 {
        self.qp.qp_num()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Both descriptors and both DONE messages have crossed.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    pub fn local_descriptor(&self) -> RegionDescriptor {
        RegionDescriptor {
            addr: self.region_mr.addr() as u64,
            length: self.region_mr.len() as u64,
            rkey: self.region_mr.rkey(),
            qp_num: self.qp.qp_num(),
        }
    }

    pub fn peer_descriptor(&self) -> Result<RegionDescriptor> {
        self.peer_desc.get().copied().ok_or(RdsmError::NotReady)
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub(crate) fn disconnect(&self) -> Result<()> {
        self.id.disconnect()
    }

    /// Dialing side: open the descriptor exchange on ESTABLISHED.
    pub(crate) fn start_handshake(&self) -> Result<()> {
        let mut hs = self
            .handshake
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("handshake"))?;
        let actions = hs.on_established_active();
        self.apply(&hs, actions)
    }

    /// Poller entry point for a successful completion owned by this link.
    pub(crate) fn on_completion(&self, kind: WrKind, wc: &WorkCompletion) -> Result<()> {
        if kind == WrKind::Data {
            self.data_completed.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        let mut hs = self
            .handshake
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("handshake"))?;
        let actions = match wc.kind {
            CompletionKind::Recv => {
                let msg = HandshakeMessage::decode(&self.recv_buf.read(wc.byte_len as usize))?;
                tracing::debug!(peer = self.peer, kind = ?msg.kind(), "received control message");
                hs.on_receive(msg)?
            }
            CompletionKind::Send => hs.on_send_complete()?,
            other => {
                return Err(RdsmError::device(format!(
                    "unexpected {other:?} completion on control channel"
                )));
            }
        };
        self.apply(&hs, actions)
    }

    fn apply(&self, hs: &Handshake, actions: Vec<HandshakeAction>) -> Result<()> {
        for action in actions {
            match action {
                HandshakeAction::StorePeer(desc) => {
                    self.peer_desc.set(desc).map_err(|_| RdsmError::InvalidTransition {
                        machine: "receive",
                        state: hs.recv_state().name(),
                        input: "second peer descriptor",
                    })?;
                }
                HandshakeAction::RepostReceive => self.post_receive()?,
                HandshakeAction::SendDescriptor => {
                    self.post_control(HandshakeMessage::Descriptor(self.local_descriptor()))?
                }
                HandshakeAction::SendDone => self.post_control(HandshakeMessage::Done)?,
            }
        }
        if hs.is_synchronized() && !self.synchronized.swap(true, Ordering::AcqRel) {
            tracing::debug!(peer = self.peer, role = %self.role, "link synchronized");
        }
        Ok(())
    }

    fn post_receive(&self) -> Result<()> {
        self.qp.post_recv(&RecvRequest {
            wr_id: WrTag::new(self.conn_id, WrKind::Control).pack(),
            local: self.recv_buf.sge(self.recv_mr.lkey()),
        })
    }

    /// Send a handshake message once the link is established.
    fn post_control(&self, msg: HandshakeMessage) -> Result<()> {
        let peer = self.peer;
        wait_until(
            self.handshake_timeout,
            &self.stop,
            || Ok(self.is_connected().then_some(())),
            || RdsmError::HandshakeTimeout {
                peer,
                timeout_ms: self.handshake_timeout.as_millis() as u64,
            },
        )?;
        self.send_buf.write(&msg.encode());
        self.qp.post_send(&WorkRequest {
            wr_id: WrTag::new(self.conn_id, WrKind::Control).pack(),
            op: WorkOp::Send,
            local: self.send_buf.sge(self.send_mr.lkey()),
            remote: None,
        })
    }

    /// Post a one-sided operation whose local operand is `len` bytes at
    /// `local_addr` inside the registered region.
    ///
    /// Returns a ticket that [`wait_data`](Self::wait_data) can wait on.
    pub(crate) fn post_data(
        &self,
        op: WorkOp,
        local_addr: usize,
        len: usize,
        remote: RemoteTarget,
    ) -> Result<u64> {
        let len32 = u32::try_from(len).map_err(|_| RdsmError::OutOfBounds {
            what: "work request",
            offset: 0,
            len,
            limit: u32::MAX as usize,
        })?;
        let wr = WorkRequest {
            wr_id: WrTag::new(self.conn_id, WrKind::Data).pack(),
            op,
            local: Sge {
                addr: local_addr as u64,
                len: len32,
                lkey: self.region_mr.lkey(),
            },
            remote: Some(remote),
        };
        let _guard = self
            .post_lock
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("post"))?;
        self.qp.post_send(&wr)?;
        Ok(self.data_posted.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Wait until the data operation with `ticket` has completed locally.
    pub(crate) fn wait_data(&self, ticket: u64, timeout: Duration, flag: FlagId) -> Result<()> {
        wait_until(
            timeout,
            &self.stop,
            || Ok((self.data_completed.load(Ordering::Acquire) >= ticket).then_some(())),
            || RdsmError::SyncTimeout {
                flag,
                timeout_ms: timeout.as_millis() as u64,
            },
        )
    }

    /// Target `region_offset` bytes into the peer's registered region.
    pub(crate) fn peer_target(&self, region_offset: usize, len: usize) -> Result<RemoteTarget> {
        let desc = self.peer_descriptor()?;
        let end = region_offset as u64 + len as u64;
        if end > desc.length {
            return Err(RdsmError::OutOfBounds {
                what: "peer region",
                offset: region_offset,
                len,
                limit: desc.length as usize,
            });
        }
        Ok(RemoteTarget {
            addr: desc.addr + region_offset as u64,
            rkey: desc.rkey,
        })
    }

    /// Target `region_offset` bytes into our own region, with our own key.
    pub(crate) fn own_target(&self, region_offset: usize) -> RemoteTarget {
        RemoteTarget {
            addr: (self.region_mr.addr() + region_offset) as u64,
            rkey: self.region_mr.rkey(),
        }
    }
}

impl<F: Fabric> std::fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("qp_num", &self.qp.qp_num())
            .field("connected", &self.is_connected())
            .field("synchronized", &self.is_synchronized())
            .finish()
    }
}
