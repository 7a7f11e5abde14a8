//! The verbs/connection-manager substrate, as consumed by the cluster.
//!
//! A [`Fabric`] hands out connection-manager channels and identifiers,
//! completion devices, queue pairs and memory registrations. The cluster is
//! generic over it so the same bootstrap and data path run on hardware
//! (`verbs` feature) and on the in-process simulation.

use crate::error::Result;
use std::net::SocketAddr;
use std::time::Duration;

/// Memory registration access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access(u32);

impl Access {
    pub const NONE: Access = Access(0);
    pub const LOCAL_WRITE: Access = Access(1);
    pub const REMOTE_WRITE: Access = Access(1 << 1);
    pub const REMOTE_READ: Access = Access(1 << 2);
    pub const REMOTE_ATOMIC: Access = Access(1 << 3);

    /// Everything the shared heap region is registered with.
    pub const REGION: Access = Access(
        Self::LOCAL_WRITE.0 | Self::REMOTE_WRITE.0 | Self::REMOTE_READ.0 | Self::REMOTE_ATOMIC.0,
    );

    pub const fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

/// Queue pair sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl QpCaps {
    pub fn with_depth(depth: u32) -> Self {
        Self {
            max_send_wr: depth,
            max_recv_wr: depth,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// Parameters for both connect and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    /// 7 retries forever.
    pub rnr_retry_count: u8,
}

impl ConnParams {
    pub fn new(rnr_retry_count: u8) -> Self {
        Self {
            initiator_depth: 1,
            responder_resources: 1,
            rnr_retry_count,
        }
    }
}

/// Connection-manager event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    Other(u32),
}

impl CmEventKind {
    /// Failures that mean the dialed listener is not (yet) there.
    pub fn is_dial_failure(self) -> bool {
        matches!(
            self,
            CmEventKind::AddrError
                | CmEventKind::RouteError
                | CmEventKind::ConnectError
                | CmEventKind::Unreachable
                | CmEventKind::Rejected
        )
    }
}

/// An event together with the identifier it concerns.
///
/// For `ConnectRequest` the identifier is the new, not yet accepted, child.
#[derive(Debug, Clone)]
pub struct CmEvent<I> {
    pub id: I,
    pub kind: CmEventKind,
}

/// A connection-manager identifier (one end of one link).
pub trait CmId: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Identity of the device context this identifier is bound to.
    fn device_key(&self) -> usize;
    fn resolve_route(&self, timeout: Duration) -> Result<()>;
    fn connect(&self, params: &ConnParams) -> Result<()>;
    fn accept(&self, params: &ConnParams) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
}

/// Event channel of a listening or dialing identifier.
pub trait CmChannel: Send + 'static {
    type Id: CmId;

    /// Next event, or `None` if nothing arrived within `timeout`.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<CmEvent<Self::Id>>>;
}

/// Per-context completion queue plus its notification channel.
pub trait CompletionDevice: Send + Sync + 'static {
    /// Block up to `timeout` for a completion event, acknowledge it, re-arm
    /// notification and append every ready completion to `out`.
    fn wait_completions(&self, timeout: Duration, out: &mut Vec<WorkCompletion>) -> Result<()>;
}

pub trait QueuePair: Send + Sync + 'static {
    fn qp_num(&self) -> u32;
    fn post_send(&self, wr: &WorkRequest) -> Result<()>;
    fn post_recv(&self, wr: &RecvRequest) -> Result<()>;
}

/// A registered memory range. Dropping it deregisters.
pub trait MemoryRegistration: Send + Sync + 'static {
    fn addr(&self) -> usize;
    fn len(&self) -> usize;
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait Fabric: Send + Sync + 'static {
    type Id: CmId;
    type Channel: CmChannel<Id = Self::Id>;
    type Device: CompletionDevice;
    type Qp: QueuePair;
    type Mr: MemoryRegistration;

    /// Bind a listener; connect requests arrive on the returned channel.
    fn listen(&self, addr: SocketAddr) -> Result<Self::Channel>;

    /// Start resolving `addr`; `AddrResolved` (or an error event) follows
    /// on the returned channel, carrying the dialing identifier.
    fn dial(&self, addr: SocketAddr, timeout: Duration) -> Result<Self::Channel>;

    fn open_device(&self, id: &Self::Id, cq_depth: u32) -> Result<Self::Device>;

    fn create_qp(&self, id: &Self::Id, device: &Self::Device, caps: QpCaps) -> Result<Self::Qp>;

    /// Register `len` bytes at `addr` with the device's protection domain.
    ///
    /// # Safety contract
    /// The range must stay mapped for the lifetime of the registration.
    fn register(
        &self,
        device: &Self::Device,
        addr: *mut u8,
        len: usize,
        access: Access,
    ) -> Result<Self::Mr>;
}

/// One scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// Remote end of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOp {
    Send,
    Write,
    Read,
    CompareSwap { compare: u64, swap: u64 },
    FetchAdd { add: u64 },
}

impl WorkOp {
    pub fn completion_kind(self) -> CompletionKind {
        match self {
            WorkOp::Send => CompletionKind::Send,
            WorkOp::Write => CompletionKind::Write,
            WorkOp::Read => CompletionKind::Read,
            WorkOp::CompareSwap { .. } => CompletionKind::CompareSwap,
            WorkOp::FetchAdd { .. } => CompletionKind::FetchAdd,
        }
    }
}

/// A signaled send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    pub wr_id: u64,
    pub op: WorkOp,
    pub local: Sge,
    /// Required for everything except `Send`.
    pub remote: Option<RemoteTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub wr_id: u64,
    pub local: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Send,
    Recv,
    Write,
    Read,
    CompareSwap,
    FetchAdd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub kind: CompletionKind,
    pub byte_len: u32,
}

/// What a work request was posted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrKind {
    /// Handshake send or receive.
    Control = 1,
    /// One-sided data operation or flag read.
    Data = 2,
}

/// Connection id and [`WrKind`] packed into a `wr_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrTag {
    pub conn_id: u32,
    pub kind: WrKind,
}

impl WrTag {
    pub fn new(conn_id: u32, kind: WrKind) -> Self {
        Self { conn_id, kind }
    }

    pub fn pack(self) -> u64 {
        (u64::from(self.conn_id) << 32) | self.kind as u64
    }

    pub fn unpack(wr_id: u64) -> Option<Self> {
        let kind = match wr_id & 0xffff_ffff {
            1 => WrKind::Control,
            2 => WrKind::Data,
            _ => return None,
        };
        Some(Self {
            conn_id: (wr_id >> 32) as u32,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr_tag_packing() {
        let tag = WrTag::new(0xabcd, WrKind::Data);
        let wr_id = tag.pack();
        assert_eq!(wr_id, 0xabcd_0000_0002);
        assert_eq!(WrTag::unpack(wr_id), Some(tag));
        assert_eq!(
            WrTag::unpack(WrTag::new(u32::MAX, WrKind::Control).pack()),
            Some(WrTag::new(u32::MAX, WrKind::Control))
        );
        assert_eq!(WrTag::unpack(0x5_0000_0009), None);
    }

    #[test]
    fn test_region_access() {
        assert!(Access::REGION.contains(Access::REMOTE_ATOMIC));
        assert!(Access::REGION.contains(Access::LOCAL_WRITE | Access::REMOTE_READ));
        assert!(!Access::LOCAL_WRITE.contains(Access::REMOTE_WRITE));
        assert!(Access::NONE.contains(Access::NONE));
    }

    #[test]
    fn test_dial_failures() {
        assert!(CmEventKind::Rejected.is_dial_failure());
        assert!(CmEventKind::Unreachable.is_dial_failure());
        assert!(!CmEventKind::Established.is_dial_failure());
        assert!(!CmEventKind::Disconnected.is_dial_failure());
    }

    #[test]
    fn test_conn_params_fixed_depths() {
        let p = ConnParams::new(7);
        assert_eq!((p.initiator_depth, p.responder_resources), (1, 1));
        assert_eq!(p.rnr_retry_count, 7);
    }
}
