//! Connection-manager event channels and identifiers.

use super::{set_nonblocking, timeout_ms, wait_readable};
use crate::error::{RdsmError, Result};
use crate::transport::fabric::{CmChannel, CmEvent, CmEventKind, CmId, ConnParams};
use rdma_sys::{
    rdma_accept, rdma_ack_cm_event, rdma_bind_addr, rdma_cm_event, rdma_cm_event_type,
    rdma_cm_id, rdma_conn_param, rdma_connect, rdma_create_event_channel, rdma_create_id,
    rdma_destroy_event_channel, rdma_destroy_id, rdma_disconnect, rdma_event_channel,
    rdma_get_cm_event, rdma_listen, rdma_port_space, rdma_resolve_addr, rdma_resolve_route,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ptr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const LISTEN_BACKLOG: libc::c_int = 16;

/// Transport retries on the wire; 7 is the verbs maximum.
const RETRY_COUNT: u8 = 7;

/// An `rdma_event_channel` and the identifiers created on it.
pub(super) struct EventChannel {
    raw: *mut rdma_event_channel,
    ids: Mutex<HashMap<usize, Weak<IdInner>>>,
}

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

impl EventChannel {
    fn new() -> Result<Arc<Self>> {
        let raw = unsafe { rdma_create_event_channel() };
        if raw.is_null() {
            return Err(RdsmError::last_os_device("rdma_create_event_channel"));
        }
        let channel = Arc::new(Self {
            raw,
            ids: Mutex::new(HashMap::new()),
        });
        set_nonblocking(channel.fd(), "cm event channel")?;
        Ok(channel)
    }

    fn fd(&self) -> libc::c_int {
        unsafe { (*self.raw).fd }
    }

    fn create_id(self: &Arc<Self>) -> Result<VerbsId> {
        let mut raw: *mut rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            rdma_create_id(
                self.raw,
                &mut raw,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if rc != 0 || raw.is_null() {
            return Err(RdsmError::last_os_device("rdma_create_id"));
        }
        Ok(self.adopt(raw))
    }

    /// Take ownership of `raw`; it is destroyed with the last `VerbsId` clone.
    fn adopt(self: &Arc<Self>, raw: *mut rdma_cm_id) -> VerbsId {
        let inner = Arc::new(IdInner {
            raw,
            channel: Arc::clone(self),
        });
        if let Ok(mut ids) = self.ids.lock() {
            ids.insert(raw as usize, Arc::downgrade(&inner));
        }
        VerbsId(inner)
    }

    fn lookup(&self, raw: *mut rdma_cm_id) -> Option<VerbsId> {
        let ids = self.ids.lock().ok()?;
        ids.get(&(raw as usize))?.upgrade().map(VerbsId)
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe { rdma_destroy_event_channel(self.raw) };
    }
}

pub(super) struct IdInner {
    raw: *mut rdma_cm_id,
    channel: Arc<EventChannel>,
}

unsafe impl Send for IdInner {}
unsafe impl Sync for IdInner {}

impl Drop for IdInner {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.channel.ids.lock() {
            ids.remove(&(self.raw as usize));
        }
        if unsafe { rdma_destroy_id(self.raw) } != 0 {
            tracing::debug!(error = %std::io::Error::last_os_error(), "rdma_destroy_id failed");
        }
    }
}

/// Shared handle to one `rdma_cm_id`.
#[derive(Clone)]
pub struct VerbsId(Arc<IdInner>);

impl VerbsId {
    pub(super) fn raw(&self) -> *mut rdma_cm_id {
        self.0.raw
    }

    fn check(rc: libc::c_int, call: &str) -> Result<()> {
        if rc != 0 {
            return Err(RdsmError::last_os_device(call));
        }
        Ok(())
    }
}

impl std::fmt::Debug for VerbsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VerbsId").field(&self.0.raw).finish()
    }
}

fn conn_param(params: &ConnParams) -> rdma_conn_param {
    let mut p: rdma_conn_param = unsafe { std::mem::zeroed() };
    p.initiator_depth = params.initiator_depth;
    p.responder_resources = params.responder_resources;
    p.retry_count = RETRY_COUNT;
    p.rnr_retry_count = params.rnr_retry_count;
    p
}

impl CmId for VerbsId {
    fn device_key(&self) -> usize {
        unsafe { (*self.raw()).verbs as usize }
    }

    fn resolve_route(&self, timeout: Duration) -> Result<()> {
        Self::check(
            unsafe { rdma_resolve_route(self.raw(), timeout_ms(timeout)) },
            "rdma_resolve_route",
        )
    }

    fn connect(&self, params: &ConnParams) -> Result<()> {
        let mut p = conn_param(params);
        Self::check(unsafe { rdma_connect(self.raw(), &mut p) }, "rdma_connect")
    }

    fn accept(&self, params: &ConnParams) -> Result<()> {
        let mut p = conn_param(params);
        Self::check(unsafe { rdma_accept(self.raw(), &mut p) }, "rdma_accept")
    }

    fn disconnect(&self) -> Result<()> {
        Self::check(unsafe { rdma_disconnect(self.raw()) }, "rdma_disconnect")
    }
}

/// Socket address in the layout librdmacm expects.
enum SockAddr {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl SockAddr {
    fn new(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => {
                let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = a.port().to_be();
                sa.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
                SockAddr::V4(sa)
            }
            SocketAddr::V6(a) => {
                let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_port = a.port().to_be();
                sa.sin6_addr.s6_addr = a.ip().octets();
                sa.sin6_flowinfo = a.flowinfo();
                sa.sin6_scope_id = a.scope_id();
                SockAddr::V6(sa)
            }
        }
    }

    fn as_mut_ptr(&mut self) -> *mut rdma_sys::sockaddr {
        match self {
            SockAddr::V4(sa) => sa as *mut libc::sockaddr_in as *mut rdma_sys::sockaddr,
            SockAddr::V6(sa) => sa as *mut libc::sockaddr_in6 as *mut rdma_sys::sockaddr,
        }
    }
}

fn event_kind(event: rdma_cm_event_type::Type) -> CmEventKind {
    match event {
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventKind::ConnectResponse,
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        other => CmEventKind::Other(other as u32),
    }
}

/// Event channel of one listening or dialing identifier.
pub struct VerbsChannel {
    // Dropped before `events`, which every identifier keeps alive anyway.
    own: VerbsId,
    events: Arc<EventChannel>,
}

impl VerbsChannel {
    pub(super) fn listener(addr: SocketAddr) -> Result<Self> {
        let events = EventChannel::new()?;
        let own = events.create_id()?;
        let mut sa = SockAddr::new(addr);
        VerbsId::check(
            unsafe { rdma_bind_addr(own.raw(), sa.as_mut_ptr()) },
            &format!("rdma_bind_addr({addr})"),
        )?;
        VerbsId::check(unsafe { rdma_listen(own.raw(), LISTEN_BACKLOG) }, "rdma_listen")?;
        Ok(Self { own, events })
    }

    pub(super) fn dialer(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let events = EventChannel::new()?;
        let own = events.create_id()?;
        let mut sa = SockAddr::new(addr);
        VerbsId::check(
            unsafe {
                rdma_resolve_addr(own.raw(), ptr::null_mut(), sa.as_mut_ptr(), timeout_ms(timeout))
            },
            &format!("rdma_resolve_addr({addr})"),
        )?;
        Ok(Self { own, events })
    }

    /// The listening or dialing identifier itself.
    pub fn id(&self) -> &VerbsId {
        &self.own
    }
}

impl CmChannel for VerbsChannel {
    type Id = VerbsId;

    fn next_event(&mut self, timeout: Duration) -> Result<Option<CmEvent<VerbsId>>> {
        if !wait_readable(self.events.fd(), timeout)? {
            return Ok(None);
        }
        let mut raw: *mut rdma_cm_event = ptr::null_mut();
        if unsafe { rdma_get_cm_event(self.events.raw, &mut raw) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(RdsmError::device_with_source("rdma_get_cm_event failed", err));
        }
        let (event, raw_id, status) = unsafe { ((*raw).event, (*raw).id, (*raw).status) };
        let kind = event_kind(event);
        let id = if kind == CmEventKind::ConnectRequest {
            Some(self.events.adopt(raw_id))
        } else {
            self.events.lookup(raw_id)
        };
        unsafe { rdma_ack_cm_event(raw) };
        match id {
            Some(id) => Ok(Some(CmEvent { id, kind })),
            None => {
                tracing::debug!(event = ?kind, status, "event for released identifier");
                Ok(None)
            }
        }
    }
}
