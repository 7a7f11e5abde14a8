use super::addressing::AddressMap;
use super::connection::Connection;
use super::context::ContextRegistry;
use crate::config::ClusterConfig;
use crate::error::{RdsmError, Result};
use crate::memory::{MappedRegion, RegionLayout, RegionManager};
use crate::transport::fabric::{CmChannel, CmEventKind, Fabric};
use crate::types::{PeerIndex, Role, Slot};
use crate::wait::{Fault, StopSignal, wait_until};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// The connection table frozen by [`Cluster::server_ready`].
pub(super) struct Ready<F: Fabric> {
    /// Indexed by slot. A slot is emptied when its peer disconnects.
    pub(super) table: RwLock<Vec<Option<Arc<Connection<F>>>>>,
    pub(super) region: Arc<MappedRegion>,
}

/// An established link and the event channel its disconnect arrives on.
pub(super) struct Link<F: Fabric> {
    pub(super) channel: F::Channel,
    pub(super) conn: Arc<Connection<F>>,
}

/// Observable facts about one link, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub peer: PeerIndex,
    pub slot: Slot,
    pub role: Role,
    pub local_qp_num: u32,
    pub peer_qp_num: u32,
}

/// One server of a fixed-membership shared-memory cluster.
///
/// Owns the heap mapping, the hardware contexts with their pollers and the
/// connection table. Several clusters may live in one process as long as
/// each uses its own fabric (or distinct addresses).
///
/// # Example
///
/// ```no_run
/// use rdsm::{Cluster, ClusterConfig, SimFabric};
/// use std::sync::Arc;
///
/// # fn example() -> rdsm::Result<()> {
/// let fabric = SimFabric::new();
/// let config = ClusterConfig::local(2, 1 << 20);
/// let servers: Vec<Arc<Cluster<SimFabric>>> = (0..2)
///     .map(|i| Cluster::new(fabric.clone(), config.clone(), i).map(Arc::new))
///     .collect::<rdsm::Result<_>>()?;
/// for server in &servers {
///     server.spawn_server()?;
/// }
/// for server in &servers {
///     server.server_ready()?;
/// }
/// servers[0].write_local(0, b"hello")?;
/// servers[0].write_sync(0, 1 << 20, 5, 0)?;
/// # Ok(())
/// # }
/// ```
pub struct Cluster<F: Fabric> {
    pub(super) config: ClusterConfig,
    pub(super) fabric: F,
    pub(super) addresses: AddressMap,
    pub(super) regions: RegionManager,
    pub(super) contexts: ContextRegistry<F>,
    /// Bootstrap-order table: slot `s + k` holds the `k`-th dialed peer.
    pub(super) staged: Mutex<Vec<Option<Arc<Connection<F>>>>>,
    pub(super) ready: OnceLock<Ready<F>>,
    pub(super) links: Mutex<Vec<Link<F>>>,
    pub(super) stop: Arc<StopSignal>,
    pub(super) next_conn_id: AtomicU32,
    pub(super) started: AtomicBool,
    shut_down: AtomicBool,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl<F: Fabric> Cluster<F> {
    /// Validate `config` for server `index` and set up the owned registry.
    ///
    /// Nothing is mapped or connected until [`start_server`](Self::start_server).
    pub fn new(fabric: F, config: ClusterConfig, index: PeerIndex) -> Result<Self> {
        config.validate(index)?;
        let addresses = AddressMap::new(index, config.cluster_size, config.heap_size)?;
        let layout = RegionLayout::new(config.heap_size, config.max_flags, config.remote_flag_bytes)?;
        let regions = RegionManager::new(layout, config.placement, config.heap_start(index));
        let stop = Arc::new(StopSignal::new());
        let slots = addresses.peer_count();
        let contexts =
            ContextRegistry::new(slots, config.cq_depth, config.poll_tick, Arc::clone(&stop));
        Ok(Self {
            fabric,
            addresses,
            regions,
            contexts,
            staged: Mutex::new((0..slots).map(|_| None).collect()),
            ready: OnceLock::new(),
            links: Mutex::new(Vec::new()),
            stop,
            next_conn_id: AtomicU32::new(1),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            server: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.addresses
    }

    pub fn cluster_size(&self) -> usize {
        self.addresses.cluster_size()
    }

    /// Shared stop/fault signal of this cluster.
    pub fn stop_signal(&self) -> &Arc<StopSignal> {
        &self.stop
    }

    /// First fault recorded by a background thread, if any.
    pub fn fault(&self) -> Option<Fault> {
        self.stop.fault().cloned()
    }

    /// Number of hardware contexts created so far.
    pub fn context_count(&self) -> usize {
        self.contexts.live()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get().is_some()
    }

    /// Block until every peer link exists and has completed its handshake,
    /// then freeze the connection table in slot order.
    ///
    /// Returns at once on later calls.
    pub fn server_ready(&self) -> Result<()> {
        if self.ready.get().is_some() {
            return Ok(());
        }
        let peers = self.addresses.peer_count();
        let timeout = self.config.dial_retry_window * (peers.max(1) as u32)
            + self.config.handshake_timeout;
        let staged = wait_until(
            timeout,
            &self.stop,
            || {
                let staged = self
                    .staged
                    .lock()
                    .map_err(|_| RdsmError::LockPoisoned("connection table"))?;
                let done = staged
                    .iter()
                    .all(|c| c.as_ref().is_some_and(|c| c.is_synchronized()));
                Ok(done.then(|| staged.iter().flatten().cloned().collect::<Vec<_>>()))
            },
            || RdsmError::HandshakeTimeout {
                peer: self.addresses.self_index(),
                timeout_ms: timeout.as_millis() as u64,
            },
        )?;
        let region = self.regions.region()?;
        let table = self.normalize(staged)?.into_iter().map(Some).collect();
        let ready = Ready {
            table: RwLock::new(table),
            region,
        };
        if self.ready.set(ready).is_ok() {
            tracing::info!(
                server = self.addresses.self_index(),
                peers,
                "all servers are ready"
            );
        }
        Ok(())
    }

    /// Put bootstrap order into slot order: the dialed half was filled from
    /// the highest peer down, so it is reversed in place.
    fn normalize(&self, mut table: Vec<Arc<Connection<F>>>) -> Result<Vec<Arc<Connection<F>>>> {
        let s = self.addresses.self_index();
        if s < table.len() {
            table[s..].reverse();
        }
        for (slot, conn) in table.iter().enumerate() {
            let expected = self.addresses.peer_for_slot(slot)?;
            if conn.peer() != expected {
                return Err(RdsmError::device(format!(
                    "slot {slot} holds peer {} after reordering, expected {expected}",
                    conn.peer()
                )));
            }
        }
        Ok(table)
    }

    /// [`server_ready`](Self::server_ready) without blocking an async runtime.
    pub async fn ready_async(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.server_ready())
            .await
            .map_err(|e| RdsmError::device_with_source("server_ready task failed", e))?
    }

    /// Run [`run_server`](Self::run_server) on a dedicated thread.
    ///
    /// A bootstrap failure is recorded as the cluster fault, so
    /// [`server_ready`](Self::server_ready) reports it. The thread keeps the
    /// cluster alive until [`shutdown`](Self::shutdown).
    pub fn spawn_server(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("rdsm-server-{}", self.addresses.self_index()))
            .spawn(move || match this.run_server() {
                Ok(()) | Err(RdsmError::Cancelled) => {}
                Err(e) => {
                    tracing::error!(server = this.addresses.self_index(), error = %e, "server failed");
                    this.stop.fail(Fault::from_error(&e));
                }
            })?;
        *self
            .server
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("server thread"))? = Some(handle);
        Ok(())
    }

    /// Bootstrap, then service connection-manager events until stopped.
    pub fn run_server(&self) -> Result<()> {
        self.start_server()?;
        while !self.stop.is_stopped() {
            self.service_links()?;
            std::thread::sleep(self.config.poll_tick);
        }
        Ok(())
    }

    /// Handle events that arrive on established links.
    fn service_links(&self) -> Result<()> {
        let mut links = self
            .links
            .lock()
            .map_err(|_| RdsmError::LockPoisoned("links"))?;
        let mut i = 0;
        while i < links.len() {
            let Some(event) = links[i].channel.next_event(Duration::ZERO)? else {
                i += 1;
                continue;
            };
            if event.kind != CmEventKind::Disconnected {
                return Err(RdsmError::UnexpectedEvent {
                    event: format!("{:?}", event.kind),
                    role: links[i].conn.role().name(),
                });
            }
            let link = links.swap_remove(i);
            tracing::info!(peer = link.conn.peer(), "peer disconnected");
            self.close_link(link);
        }
        Ok(())
    }

    /// Destroy a disconnected link: drop every table entry for it so the
    /// queue pair, registrations, control buffers and identifier are released
    /// with the last in-flight operation.
    fn close_link(&self, link: Link<F>) {
        let Link { channel, conn } = link;
        conn.mark_disconnected();
        if let Some(ctx) = self.contexts.get(conn.context_slot()) {
            ctx.detach(conn.conn_id());
        }
        if let Ok(mut staged) = self.staged.lock() {
            for entry in staged.iter_mut() {
                if entry.as_ref().is_some_and(|c| c.conn_id() == conn.conn_id()) {
                    *entry = None;
                }
            }
        }
        if let Some(ready) = self.ready.get()
            && let Ok(slot) = self.addresses.slot_for_peer(conn.peer())
            && let Ok(mut table) = ready.table.write()
            && let Some(entry) = table.get_mut(slot)
        {
            *entry = None;
        }
        tracing::debug!(peer = conn.peer(), conn_id = conn.conn_id(), "link torn down");
        drop(conn);
        drop(channel);
    }

    /// Whether the link to `peer` is still in the connection table.
    pub fn is_linked(&self, peer: PeerIndex) -> Result<bool> {
        let slot = self.addresses.slot_for_peer(peer)?;
        match self.link(slot) {
            Ok(_) => Ok(true),
            Err(RdsmError::PeerDisconnected { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Disconnect every link, stop the pollers and the server thread.
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let server = self.addresses.self_index();
        if let Ok(links) = self.links.lock() {
            for link in links.iter() {
                if let Err(e) = link.conn.disconnect() {
                    tracing::debug!(server, peer = link.conn.peer(), error = %e, "disconnect failed");
                }
            }
        }
        self.stop.stop();

        let handle = self.server.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            tracing::warn!(server, "server thread panicked");
        }

        if let Ok(mut links) = self.links.lock() {
            for mut link in links.drain(..) {
                // Our own disconnect is reported back on the link's channel.
                let drained = wait_until(
                    self.config.poll_tick * 4,
                    &StopSignal::new(),
                    || {
                        Ok(link
                            .channel
                            .next_event(Duration::ZERO)?
                            .filter(|e| e.kind == CmEventKind::Disconnected)
                            .map(|_| ()))
                    },
                    || RdsmError::Cancelled,
                );
                if drained.is_err() {
                    tracing::debug!(server, peer = link.conn.peer(), "no disconnect event");
                }
                self.close_link(link);
            }
        }
        self.contexts.shutdown();
        tracing::info!(server, "shutdown complete");
    }

    /// Link facts for `peer` once the table is ready.
    pub fn link_info(&self, peer: PeerIndex) -> Result<LinkInfo> {
        let slot = self.addresses.slot_for_peer(peer)?;
        let conn = self.link(slot)?;
        Ok(LinkInfo {
            peer,
            slot,
            role: conn.role(),
            local_qp_num: conn.qp_num(),
            peer_qp_num: conn.peer_descriptor()?.qp_num,
        })
    }

    /// Connection at `slot` of the frozen table.
    pub(super) fn link(&self, slot: Slot) -> Result<Arc<Connection<F>>> {
        let ready = self.ready.get().ok_or(RdsmError::NotReady)?;
        let table = ready
            .table
            .read()
            .map_err(|_| RdsmError::LockPoisoned("connection table"))?;
        match table.get(slot) {
            Some(Some(conn)) => Ok(Arc::clone(conn)),
            Some(None) => Err(RdsmError::PeerDisconnected {
                peer: self.addresses.peer_for_slot(slot)?,
            }),
            None => Err(RdsmError::InvalidPeer {
                peer: slot,
                cluster_size: self.addresses.cluster_size(),
            }),
        }
    }

    pub(super) fn ready_region(&self) -> Result<&Arc<MappedRegion>> {
        self.ready
            .get()
            .map(|r| &r.region)
            .ok_or(RdsmError::NotReady)
    }

    pub(super) fn next_conn_id(&self) -> u32 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<F: Fabric> Drop for Cluster<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<F: Fabric> std::fmt::Debug for Cluster<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("server", &self.addresses.self_index())
            .field("cluster_size", &self.addresses.cluster_size())
            .field("ready", &self.is_ready())
            .field("stopped", &self.stop.is_stopped())
            .finish()
    }
}
