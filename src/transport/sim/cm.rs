//! Simulated connection manager: listeners, identifiers and event channels.

use super::Shared;
use super::verbs::QpState;
use crate::error::{RdsmError, Result};
use crate::transport::fabric::{CmChannel, CmEvent, CmEventKind, CmId, ConnParams};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

/// Event queue behind one channel.
#[derive(Default)]
pub(super) struct ChannelQueue {
    events: Mutex<VecDeque<CmEvent<SimId>>>,
    ready: Condvar,
}

impl ChannelQueue {
    fn push(&self, id: SimId, kind: CmEventKind) {
        tracing::trace!(id = id.0.serial, ?kind, "sim cm event queued");
        if let Ok(mut q) = self.events.lock() {
            q.push_back(CmEvent { id, kind });
            self.ready.notify_all();
        }
    }

    fn pop(&self, timeout: Duration) -> Result<Option<CmEvent<SimId>>> {
        let guard = self
            .events
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("sim cm channel"))?;
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |q| q.is_empty())
            .map_err(|_| RdsmError::LockPoisoned("sim cm channel"))?;
        Ok(guard.pop_front())
    }
}

/// Channel of a listener or of one dialing identifier.
pub struct SimChannel {
    queue: Arc<ChannelQueue>,
    listening: Option<(Weak<Shared>, SocketAddr)>,
}

impl SimChannel {
    pub(super) fn listener(shared: &Arc<Shared>, addr: SocketAddr) -> Result<Self> {
        let mut listeners = shared
            .listeners
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("sim listeners"))?;
        if listeners.contains_key(&addr) {
            return Err(RdsmError::device_with_source(
                format!("rdma_bind_addr {addr} failed"),
                std::io::Error::from(std::io::ErrorKind::AddrInUse),
            ));
        }
        let queue = Arc::new(ChannelQueue::default());
        listeners.insert(addr, Arc::clone(&queue));
        Ok(Self {
            queue,
            listening: Some((Arc::downgrade(shared), addr)),
        })
    }

    pub(super) fn dialer(shared: &Arc<Shared>, target: SocketAddr) -> Self {
        let queue = Arc::new(ChannelQueue::default());
        let id = SimId::new(shared, Arc::clone(&queue), Some(target));
        // Address resolution always succeeds; reachability is decided at connect.
        queue.push(id, CmEventKind::AddrResolved);
        Self {
            queue,
            listening: None,
        }
    }
}

impl CmChannel for SimChannel {
    type Id = SimId;

    fn next_event(&mut self, timeout: Duration) -> Result<Option<CmEvent<SimId>>> {
        self.queue.pop(timeout)
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        let Some((shared, addr)) = self.listening.take() else {
            return;
        };
        if let Some(shared) = shared.upgrade()
            && let Ok(mut listeners) = shared.listeners.lock()
            && listeners
                .get(&addr)
                .is_some_and(|q| Arc::ptr_eq(q, &self.queue))
        {
            listeners.remove(&addr);
        }
    }
}

#[derive(Default)]
struct IdLink {
    peer: Option<Weak<IdState>>,
    qp: Option<Arc<QpState>>,
    connected: bool,
}

pub(super) struct IdState {
    serial: u64,
    shared: Weak<Shared>,
    device_key: usize,
    events: Arc<ChannelQueue>,
    target: Option<SocketAddr>,
    link: Mutex<IdLink>,
}

/// Simulated `rdma_cm_id`.
#[derive(Clone)]
pub struct SimId(pub(super) Arc<IdState>);

impl std::fmt::Debug for SimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimId")
            .field("serial", &self.0.serial)
            .field("target", &self.0.target)
            .finish()
    }
}

impl SimId {
    fn new(shared: &Arc<Shared>, events: Arc<ChannelQueue>, target: Option<SocketAddr>) -> Self {
        Self(Arc::new(IdState {
            serial: shared.next_id.fetch_add(1, Ordering::Relaxed),
            shared: Arc::downgrade(shared),
            device_key: shared.device_key(),
            events,
            target,
            link: Mutex::new(IdLink::default()),
        }))
    }

    fn link(&self) -> Result<std::sync::MutexGuard<'_, IdLink>> {
        self.0
            .link
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("sim cm id"))
    }

    pub(super) fn bind_qp(&self, qp: Arc<QpState>) -> Result<()> {
        let mut link = self.link()?;
        if link.qp.is_some() {
            return Err(RdsmError::device("rdma_create_qp: identifier already has a queue pair"));
        }
        link.qp = Some(qp);
        Ok(())
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.0
            .shared
            .upgrade()
            .ok_or_else(|| RdsmError::device("simulated fabric was dropped"))
    }
}

impl CmId for SimId {
    fn device_key(&self) -> usize {
        self.0.device_key
    }

    fn resolve_route(&self, _timeout: Duration) -> Result<()> {
        if self.0.target.is_none() {
            return Err(RdsmError::device("rdma_resolve_route on a passive identifier"));
        }
        self.0.events.push(self.clone(), CmEventKind::RouteResolved);
        Ok(())
    }

    fn connect(&self, _params: &ConnParams) -> Result<()> {
        let target = self
            .0
            .target
            .ok_or_else(|| RdsmError::device("rdma_connect on a passive identifier"))?;
        let shared = self.shared()?;
        let listener = shared
            .listeners
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("sim listeners"))?
            .get(&target)
            .cloned();
        let Some(listener) = listener else {
            self.0.events.push(self.clone(), CmEventKind::Rejected);
            return Ok(());
        };
        let child = SimId::new(&shared, listener, None);
        child.link()?.peer = Some(Arc::downgrade(&self.0));
        self.link()?.peer = Some(Arc::downgrade(&child.0));
        child.0.events.push(child.clone(), CmEventKind::ConnectRequest);
        Ok(())
    }

    fn accept(&self, _params: &ConnParams) -> Result<()> {
        let (peer, own_qp) = {
            let link = self.link()?;
            (link.peer.as_ref().and_then(Weak::upgrade), link.qp.clone())
        };
        let peer = peer.ok_or_else(|| RdsmError::device("rdma_accept: dialer went away"))?;
        let own_qp = own_qp.ok_or_else(|| RdsmError::device("rdma_accept before rdma_create_qp"))?;
        let peer = SimId(peer);
        let peer_qp = peer
            .link()?
            .qp
            .clone()
            .ok_or_else(|| RdsmError::device("rdma_accept: dialer has no queue pair"))?;

        QpState::wire(&own_qp, &peer_qp)?;
        self.link()?.connected = true;
        peer.link()?.connected = true;
        self.0.events.push(self.clone(), CmEventKind::Established);
        peer.0.events.push(peer.clone(), CmEventKind::Established);
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let (peer, qp) = {
            let mut link = self.link()?;
            if !link.connected {
                return Ok(());
            }
            link.connected = false;
            (link.peer.as_ref().and_then(Weak::upgrade), link.qp.clone())
        };
        if let Some(qp) = qp {
            qp.unwire();
        }
        self.0.events.push(self.clone(), CmEventKind::Disconnected);

        if let Some(peer) = peer.map(SimId) {
            let peer_qp = {
                let mut link = peer.link()?;
                if !link.connected {
                    return Ok(());
                }
                link.connected = false;
                link.qp.clone()
            };
            if let Some(qp) = peer_qp {
                qp.unwire();
            }
            peer.0.events.push(peer.clone(), CmEventKind::Disconnected);
        }
        Ok(())
    }
}
