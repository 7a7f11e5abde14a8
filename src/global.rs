//! Process-wide facade over one hardware [`Cluster`].
//!
//! Mirrors the classic C boundary: a dedicated thread calls
//! [`start_server`], the application calls [`server_ready`] once and then the
//! data operations. Every failure terminates the process through
//! [`fatal::exit_on_error`](crate::fatal::exit_on_error).

use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::error::{RdsmError, Result};
use crate::fatal::exit_on_error;
use crate::transport::VerbsFabric;
use crate::types::{FlagId, PeerIndex};
use std::sync::OnceLock;

static CLUSTER: OnceLock<Cluster<VerbsFabric>> = OnceLock::new();

fn cluster() -> &'static Cluster<VerbsFabric> {
    exit_on_error(CLUSTER.get().ok_or(RdsmError::NotReady))
}

fn init(heap_start: usize, heap_size: usize, index: PeerIndex) -> Result<&'static Cluster<VerbsFabric>> {
    let mut config = ClusterConfig::from_env();
    config.heap_size = heap_size;
    config.heap_base = index
        .checked_mul(heap_size)
        .and_then(|offset| heap_start.checked_sub(offset))
        .ok_or_else(|| {
            RdsmError::Config(format!(
                "heap start {heap_start:#x} is not server {index}'s slot for {heap_size:#x}-byte heaps"
            ))
        })?;
    let cluster = Cluster::new(VerbsFabric::new(), config, index)?;
    CLUSTER
        .set(cluster)
        .map_err(|_| RdsmError::Config("server already started in this process".into()))?;
    CLUSTER.get().ok_or(RdsmError::NotReady)
}

/// Map the heap at `heap_start`, connect to every peer and then serve
/// connection-manager events forever. Run it on a dedicated thread.
pub fn start_server(heap_start: usize, heap_size: usize, index: PeerIndex) -> ! {
    let cluster = exit_on_error(init(heap_start, heap_size, index));
    exit_on_error(cluster.run_server());
    // Only a stop request ends run_server.
    crate::fatal::exit_with(&RdsmError::Cancelled)
}

/// Block until every link has finished its handshake.
pub fn server_ready() {
    let cluster = loop {
        if let Some(c) = CLUSTER.get() {
            break c;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    };
    exit_on_error(cluster.server_ready());
}

pub fn write(local_off: usize, dst: usize, len: usize) -> usize {
    exit_on_error(cluster().write(local_off, dst, len))
}

pub fn write_sync(local_off: usize, dst: usize, len: usize, flag: FlagId) -> usize {
    exit_on_error(cluster().write_sync(local_off, dst, len, flag))
}

pub fn read(local_off: usize, src: usize, len: usize) -> usize {
    exit_on_error(cluster().read(local_off, src, len))
}

pub fn read_sync(local_off: usize, src: usize, len: usize, flag: FlagId) -> usize {
    exit_on_error(cluster().read_sync(local_off, src, len, flag))
}

pub fn atomic_compare_exchange(local_off: usize, dst: usize, expected: u64, new_value: u64) -> usize {
    exit_on_error(cluster().atomic_compare_exchange(local_off, dst, expected, new_value))
}

pub fn atomic_compare_exchange_sync(
    local_off: usize,
    dst: usize,
    expected: u64,
    new_value: u64,
    flag: FlagId,
) -> usize {
    exit_on_error(cluster().atomic_compare_exchange_sync(local_off, dst, expected, new_value, flag))
}

pub fn local_atomic_compare_exchange_sync(
    local_off: usize,
    dst: usize,
    expected: u64,
    new_value: u64,
    flag: FlagId,
) -> usize {
    exit_on_error(
        cluster().local_atomic_compare_exchange_sync(local_off, dst, expected, new_value, flag),
    )
}

pub fn atomic_fetch_add(local_off: usize, dst: usize, add: u64) -> usize {
    exit_on_error(cluster().atomic_fetch_add(local_off, dst, add))
}

pub fn atomic_fetch_add_sync(local_off: usize, dst: usize, add: u64, flag: FlagId) -> usize {
    exit_on_error(cluster().atomic_fetch_add_sync(local_off, dst, add, flag))
}

pub fn read_large_sync(local_off: usize, src: usize, len: usize, flag: FlagId) -> usize {
    exit_on_error(cluster().read_large_sync(local_off, src, len, flag))
}

pub fn write_large_sync(local_off: usize, dst: usize, len: usize, flag: FlagId) -> usize {
    exit_on_error(cluster().write_large_sync(local_off, dst, len, flag))
}

pub fn copy_local(src_off: usize, dst_off: usize, len: usize) -> usize {
    exit_on_error(cluster().copy_local(src_off, dst_off, len))
}
