//! In-process fabric with the observable semantics of RDMA CM + verbs.
//!
//! Every `SimFabric` is an isolated network: listeners, identifiers and
//! registrations of one fabric never see another's. Several clusters can
//! therefore run side by side in one test process.

mod cm;
mod verbs;

pub use cm::{SimChannel, SimId};
pub use verbs::{SimDevice, SimMr, SimQp};

use crate::error::{RdsmError, Result};
use crate::transport::fabric::{Access, CmId, Fabric, QpCaps};
use cm::ChannelQueue;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use verbs::{QpState, RegionEntry};

pub(crate) struct Shared {
    listeners: Mutex<HashMap<SocketAddr, Arc<ChannelQueue>>>,
    regions: RwLock<HashMap<u32, RegionEntry>>,
    next_key: AtomicU32,
    next_qp: AtomicU32,
    next_id: AtomicU64,
}

impl Shared {
    /// All identifiers of one fabric sit on the same simulated device.
    fn device_key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

#[derive(Clone)]
pub struct SimFabric {
    shared: Arc<Shared>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: Mutex::new(HashMap::new()),
                regions: RwLock::new(HashMap::new()),
                next_key: AtomicU32::new(0x100),
                next_qp: AtomicU32::new(0x40),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of live memory registrations.
    pub fn registration_count(&self) -> usize {
        self.shared.regions.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether something listens on `addr`.
    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.shared
            .listeners
            .lock()
            .map(|l| l.contains_key(&addr))
            .unwrap_or(false)
    }
}

impl Fabric for SimFabric {
    type Id = SimId;
    type Channel = SimChannel;
    type Device = SimDevice;
    type Qp = SimQp;
    type Mr = SimMr;

    fn listen(&self, addr: SocketAddr) -> Result<SimChannel> {
        SimChannel::listener(&self.shared, addr)
    }

    fn dial(&self, addr: SocketAddr, _timeout: Duration) -> Result<SimChannel> {
        Ok(SimChannel::dialer(&self.shared, addr))
    }

    fn open_device(&self, id: &SimId, cq_depth: u32) -> Result<SimDevice> {
        if id.device_key() != self.shared.device_key() {
            return Err(RdsmError::device("identifier belongs to another fabric"));
        }
        SimDevice::new(cq_depth)
    }

    fn create_qp(&self, id: &SimId, device: &SimDevice, caps: QpCaps) -> Result<SimQp> {
        let qp_num = self
            .shared
            .next_qp
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let qp = QpState::new(qp_num, caps, device, &self.shared);
        id.bind_qp(Arc::clone(&qp))?;
        Ok(SimQp(qp))
    }

    fn register(
        &self,
        _device: &SimDevice,
        addr: *mut u8,
        len: usize,
        access: Access,
    ) -> Result<SimMr> {
        if addr.is_null() {
            return Err(RdsmError::device("ibv_reg_mr: null address"));
        }
        SimMr::new(&self.shared, addr as usize, len, access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fabric::{
        CmChannel, CmEventKind, CompletionDevice, CompletionKind, CompletionStatus, ConnParams,
        MemoryRegistration, QueuePair, RecvRequest, RemoteTarget, Sge, WorkCompletion, WorkOp,
        WorkRequest,
    };

    const TICK: Duration = Duration::from_millis(500);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn expect(ch: &mut SimChannel, kind: CmEventKind) -> SimId {
        let ev = ch.next_event(TICK).unwrap().expect("event");
        assert_eq!(ev.kind, kind);
        ev.id
    }

    struct End {
        id: SimId,
        device: SimDevice,
        qp: SimQp,
    }

    fn completions(dev: &SimDevice) -> Vec<WorkCompletion> {
        let mut out = Vec::new();
        dev.wait_completions(TICK, &mut out).unwrap();
        out
    }

    /// Listener and dialer with connected queue pairs.
    fn connected_pair(fabric: &SimFabric) -> (End, End, SimChannel, SimChannel) {
        let params = ConnParams::new(7);
        let mut listener = fabric.listen(addr(7000)).unwrap();
        let mut dialer = fabric.dial(addr(7000), TICK).unwrap();

        let active = expect(&mut dialer, CmEventKind::AddrResolved);
        let a_dev = fabric.open_device(&active, 64).unwrap();
        let a_qp = fabric.create_qp(&active, &a_dev, QpCaps::with_depth(16)).unwrap();
        active.resolve_route(TICK).unwrap();
        expect(&mut dialer, CmEventKind::RouteResolved);
        active.connect(&params).unwrap();

        let passive = expect(&mut listener, CmEventKind::ConnectRequest);
        let p_dev = fabric.open_device(&passive, 64).unwrap();
        let p_qp = fabric.create_qp(&passive, &p_dev, QpCaps::with_depth(16)).unwrap();
        passive.accept(&params).unwrap();
        expect(&mut listener, CmEventKind::Established);
        expect(&mut dialer, CmEventKind::Established);

        (
            End {
                id: active,
                device: a_dev,
                qp: a_qp,
            },
            End {
                id: passive,
                device: p_dev,
                qp: p_qp,
            },
            dialer,
            listener,
        )
    }

    fn sge(buf: &mut [u8], mr: &SimMr) -> Sge {
        Sge {
            addr: buf.as_mut_ptr() as u64,
            len: buf.len() as u32,
            lkey: mr.lkey(),
        }
    }

    #[test]
    fn test_connect_without_listener_is_rejected() {
        let fabric = SimFabric::new();
        let mut dialer = fabric.dial(addr(7001), TICK).unwrap();
        let id = expect(&mut dialer, CmEventKind::AddrResolved);
        id.resolve_route(TICK).unwrap();
        expect(&mut dialer, CmEventKind::RouteResolved);
        id.connect(&ConnParams::new(7)).unwrap();
        expect(&mut dialer, CmEventKind::Rejected);
    }

    #[test]
    fn test_listener_unbinds_on_drop() {
        let fabric = SimFabric::new();
        let ch = fabric.listen(addr(7002)).unwrap();
        assert!(fabric.is_listening(addr(7002)));
        assert!(fabric.listen(addr(7002)).is_err());
        drop(ch);
        assert!(!fabric.is_listening(addr(7002)));
        fabric.listen(addr(7002)).unwrap();
    }

    #[test]
    fn test_fabrics_are_isolated() {
        let a = SimFabric::new();
        let b = SimFabric::new();
        let _l = a.listen(addr(7003)).unwrap();
        assert!(!b.is_listening(addr(7003)));
    }

    #[test]
    fn test_send_waits_for_posted_receive() {
        let fabric = SimFabric::new();
        let (a, p, _d, _l) = connected_pair(&fabric);

        let mut out = [7u8; 32];
        let out_mr = fabric
            .register(&a.device, out.as_mut_ptr(), 32, Access::NONE)
            .unwrap();
        a.qp
            .post_send(&WorkRequest {
                wr_id: 1,
                op: WorkOp::Send,
                local: sge(&mut out, &out_mr),
                remote: None,
            })
            .unwrap();
        let wcs = completions(&a.device);
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].kind, CompletionKind::Send);

        // Receiver not ready: the message waits for the receive.
        let mut inbox = [0u8; 32];
        let in_mr = fabric
            .register(&p.device, inbox.as_mut_ptr(), 32, Access::LOCAL_WRITE)
            .unwrap();
        p.qp
            .post_recv(&RecvRequest {
                wr_id: 2,
                local: sge(&mut inbox, &in_mr),
            })
            .unwrap();
        let wcs = completions(&p.device);
        assert_eq!(wcs[0].kind, CompletionKind::Recv);
        assert_eq!(wcs[0].byte_len, 32);
        assert_eq!(inbox, [7u8; 32]);
    }

    #[test]
    fn test_one_sided_ops_and_atomics() {
        let fabric = SimFabric::new();
        let (a, p, _d, _l) = connected_pair(&fabric);

        let mut target = vec![0u64; 8];
        let target_mr = fabric
            .register(
                &p.device,
                target.as_mut_ptr() as *mut u8,
                64,
                Access::REGION,
            )
            .unwrap();
        let mut local = vec![0u64; 8];
        local[0] = 0x1122;
        let local_mr = fabric
            .register(&a.device, local.as_mut_ptr() as *mut u8, 64, Access::LOCAL_WRITE)
            .unwrap();
        let remote = |slot: usize| RemoteTarget {
            addr: target_mr.addr() as u64 + 8 * slot as u64,
            rkey: target_mr.rkey(),
        };
        let local_base = local_mr.addr() as u64;
        let local_sge = |slot: usize| Sge {
            addr: local_base + 8 * slot as u64,
            len: 8,
            lkey: local_mr.lkey(),
        };
        let ops = [
            (WorkOp::Write, 0, 0),
            (WorkOp::FetchAdd { add: 5 }, 1, 1),
            (WorkOp::FetchAdd { add: 5 }, 2, 1),
            (
                WorkOp::CompareSwap {
                    compare: 10,
                    swap: 99,
                },
                3,
                1,
            ),
            (WorkOp::CompareSwap { compare: 10, swap: 1 }, 4, 1),
            (WorkOp::Read, 5, 0),
        ];
        for (i, (op, l, r)) in ops.into_iter().enumerate() {
            a.qp
                .post_send(&WorkRequest {
                    wr_id: i as u64,
                    op,
                    local: local_sge(l),
                    remote: Some(remote(r)),
                })
                .unwrap();
        }
        let wcs = completions(&a.device);
        assert_eq!(wcs.len(), ops.len());
        assert!(wcs.iter().all(|wc| wc.status == CompletionStatus::Success));
        assert_eq!(target[0], 0x1122);
        assert_eq!(target[1], 99);
        assert_eq!(local[1], 0);
        assert_eq!(local[2], 5);
        assert_eq!(local[3], 10);
        assert_eq!(local[4], 99);
        assert_eq!(local[5], 0x1122);
    }

    #[test]
    fn test_bad_rkey_fails_completion() {
        let fabric = SimFabric::new();
        let (a, _p, _d, _l) = connected_pair(&fabric);
        let mut local = [0u8; 8];
        let mr = fabric
            .register(&a.device, local.as_mut_ptr(), 8, Access::LOCAL_WRITE)
            .unwrap();
        a.qp
            .post_send(&WorkRequest {
                wr_id: 9,
                op: WorkOp::Read,
                local: sge(&mut local, &mr),
                remote: Some(RemoteTarget {
                    addr: 0x1000,
                    rkey: 0xffff,
                }),
            })
            .unwrap();
        let wcs = completions(&a.device);
        assert_eq!(
            wcs[0].status,
            CompletionStatus::Failed("remote access error".into())
        );
    }

    #[test]
    fn test_registration_dropped_on_drop() {
        let fabric = SimFabric::new();
        let (a, _p, _d, _l) = connected_pair(&fabric);
        let mut buf = [0u8; 8];
        let before = fabric.registration_count();
        let mr = fabric
            .register(&a.device, buf.as_mut_ptr(), 8, Access::NONE)
            .unwrap();
        assert_eq!(fabric.registration_count(), before + 1);
        drop(mr);
        assert_eq!(fabric.registration_count(), before);
    }

    #[test]
    fn test_completion_queue_overrun() {
        let fabric = SimFabric::new();
        let mut listener = fabric.listen(addr(7010)).unwrap();
        let mut dialer = fabric.dial(addr(7010), TICK).unwrap();
        let active = expect(&mut dialer, CmEventKind::AddrResolved);
        let dev = fabric.open_device(&active, 2).unwrap();
        let qp = fabric.create_qp(&active, &dev, QpCaps::with_depth(16)).unwrap();
        active.connect(&ConnParams::new(7)).unwrap();
        let passive = expect(&mut listener, CmEventKind::ConnectRequest);
        let p_dev = fabric.open_device(&passive, 64).unwrap();
        let _p_qp = fabric.create_qp(&passive, &p_dev, QpCaps::with_depth(16)).unwrap();
        passive.accept(&ConnParams::new(7)).unwrap();

        let mut buf = [0u8; 8];
        let mr = fabric
            .register(&dev, buf.as_mut_ptr(), 8, Access::REGION)
            .unwrap();
        for i in 0..3 {
            qp.post_send(&WorkRequest {
                wr_id: i,
                op: WorkOp::Write,
                local: sge(&mut buf, &mr),
                remote: Some(RemoteTarget {
                    addr: mr.addr() as u64,
                    rkey: mr.rkey(),
                }),
            })
            .unwrap();
        }
        let mut out = Vec::new();
        assert!(dev.wait_completions(TICK, &mut out).is_err());
    }

    #[test]
    fn test_disconnect_reaches_both_ends() {
        let fabric = SimFabric::new();
        let (a, _p, mut dialer, mut listener) = connected_pair(&fabric);
        a.id.disconnect().unwrap();
        a.id.disconnect().unwrap();
        expect(&mut dialer, CmEventKind::Disconnected);
        expect(&mut listener, CmEventKind::Disconnected);
        assert!(dialer.next_event(Duration::from_millis(10)).unwrap().is_none());

        let mut buf = [0u8; 8];
        let mr = fabric
            .register(&a.device, buf.as_mut_ptr(), 8, Access::NONE)
            .unwrap();
        let err = a.qp.post_send(&WorkRequest {
            wr_id: 1,
            op: WorkOp::Send,
            local: sge(&mut buf, &mr),
            remote: None,
        });
        assert!(err.is_err());
    }
}
