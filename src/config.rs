//! Cluster configuration.
//!
//! Every value is fixed once a [`Cluster`](crate::Cluster) is built; nothing
//! here is renegotiated at runtime. Defaults reproduce the reference
//! deployment (8 servers, 8 GiB heaps at `0x4000_0000_0000`). Override via
//! environment variables (prefixed `RDSM_`), a JSON file, or by constructing
//! a custom `ClusterConfig`.

use crate::error::{RdsmError, Result};
use crate::types::PeerIndex;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Size of the remote flag section that follows each heap (one page).
pub const REMOTE_FLAG_BYTES: usize = 4096;

/// Default number of synchronization flag slots (one byte each).
pub const DEFAULT_MAX_FLAGS: usize = 1024 * 1024;

/// Where the heap region is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// At `heap_base + index * heap_size`; the global offset scheme relies on it.
    Fixed,
    /// Wherever the kernel chooses. Lets several servers share one process.
    Anywhere,
}

/// Static description of the cluster and the tuning of its transport.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of servers, including this one.
    pub cluster_size: usize,
    /// Bytes of heap each server exposes.
    pub heap_size: usize,
    /// Heap start of server 0; server `i` starts at `heap_base + i * heap_size`.
    pub heap_base: usize,
    /// Number of synchronization flag slots (bytes of local flag section).
    pub max_flags: usize,
    /// Bytes of the remote flag section after the heap.
    pub remote_flag_bytes: usize,
    /// Rendezvous address of every server, indexed by server.
    pub addresses: Vec<IpAddr>,
    /// A link dialed by server `d` uses port `base_port + d` on the listener.
    pub base_port: u16,
    pub placement: Placement,
    /// Completion queue depth of each context slot.
    pub cq_depth: u32,
    /// Send and receive work-request depth of each queue pair.
    pub qp_depth: u32,
    /// Timeout handed to address and route resolution.
    pub resolve_timeout: Duration,
    /// Receiver-not-ready retries; 7 means retry forever.
    pub rnr_retry_count: u8,
    /// How long one bootstrap round waits for its peer: a dial keeps
    /// retrying while the listener is not yet bound, a listener keeps
    /// waiting for the connect request.
    pub dial_retry_window: Duration,
    /// Bound on waiting for one link's bilateral handshake.
    pub handshake_timeout: Duration,
    /// Bound on one flag wait of a `_sync` operation.
    pub sync_timeout: Duration,
    /// Granularity at which blocking loops re-check the stop signal.
    pub poll_tick: Duration,
    /// Largest chunk issued by the `_large_sync` transfers.
    pub max_transfer_bytes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_size: 8,
            heap_size: 8 * 1024 * 1024 * 1024, // 8 GiB
            heap_base: 0x4000_0000_0000,
            max_flags: DEFAULT_MAX_FLAGS,
            remote_flag_bytes: REMOTE_FLAG_BYTES,
            addresses: [1u8, 2, 3, 4, 5, 6, 10, 11]
                .iter()
                .map(|&last| IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
                .collect(),
            base_port: 9400,
            placement: Placement::Fixed,
            cq_depth: 8192,
            qp_depth: 8192,
            resolve_timeout: Duration::from_millis(500),
            rnr_retry_count: 7,
            dial_retry_window: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(10),
            poll_tick: Duration::from_millis(20),
            max_transfer_bytes: 1 << 30, // 1 GiB
        }
    }
}

/// On-disk form: every field optional, overlaid on the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    cluster_size: Option<usize>,
    heap_size: Option<usize>,
    heap_base: Option<usize>,
    max_flags: Option<usize>,
    base_port: Option<u16>,
    placement: Option<Placement>,
    cq_depth: Option<u32>,
    qp_depth: Option<u32>,
    resolve_timeout_ms: Option<u64>,
    dial_retry_window_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    sync_timeout_ms: Option<u64>,
    max_transfer_bytes: Option<usize>,
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    ip: IpAddr,
}

impl ClusterConfig {
    /// Configuration for `cluster_size` servers sharing one process.
    ///
    /// Loopback addresses `127.0.0.(i + 1)`, kernel-chosen placement, a small
    /// flag section and short timeouts.
    pub fn local(cluster_size: usize, heap_size: usize) -> Self {
        Self {
            cluster_size,
            heap_size,
            heap_base: 1 << 20,
            max_flags: 64,
            addresses: (0..cluster_size)
                .map(|i| IpAddr::V4(Ipv4Addr::new(127, 0, 0, (i + 1) as u8)))
                .collect(),
            placement: Placement::Anywhere,
            cq_depth: 1024,
            qp_depth: 256,
            dial_retry_window: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(5),
            poll_tick: Duration::from_millis(5),
            ..Self::default()
        }
    }

    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RDSM_CLUSTER_SIZE`
    /// - `RDSM_HEAP_SIZE`
    /// - `RDSM_HEAP_BASE` (decimal or `0x` hex)
    /// - `RDSM_MAX_FLAGS`
    /// - `RDSM_BASE_PORT`
    /// - `RDSM_ADDRESSES` (comma-separated IPs, indexed by server)
    /// - `RDSM_HANDSHAKE_TIMEOUT_SECS`
    /// - `RDSM_SYNC_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = get("RDSM_CLUSTER_SIZE").and_then(|v| v.parse().ok()) {
            self.cluster_size = n;
        }
        if let Some(n) = get("RDSM_HEAP_SIZE").and_then(|v| v.parse().ok()) {
            self.heap_size = n;
        }
        if let Some(n) = get("RDSM_HEAP_BASE").and_then(|v| parse_usize(&v)) {
            self.heap_base = n;
        }
        if let Some(n) = get("RDSM_MAX_FLAGS").and_then(|v| v.parse().ok()) {
            self.max_flags = n;
        }
        if let Some(n) = get("RDSM_BASE_PORT").and_then(|v| v.parse().ok()) {
            self.base_port = n;
        }
        if let Some(v) = get("RDSM_ADDRESSES") {
            let parsed: std::result::Result<Vec<IpAddr>, _> =
                v.split(',').map(|s| s.trim().parse()).collect();
            match parsed {
                Ok(addrs) => self.addresses = addrs,
                Err(e) => tracing::warn!("ignoring RDSM_ADDRESSES: {e}"),
            }
        }
        if let Some(s) = get("RDSM_HANDSHAKE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.handshake_timeout = Duration::from_secs(s);
        }
        if let Some(ms) = get("RDSM_SYNC_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.sync_timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Load config from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(text)?;
        let mut cfg = Self::default();
        if let Some(v) = file.cluster_size {
            cfg.cluster_size = v;
        }
        if let Some(v) = file.heap_size {
            cfg.heap_size = v;
        }
        if let Some(v) = file.heap_base {
            cfg.heap_base = v;
        }
        if let Some(v) = file.max_flags {
            cfg.max_flags = v;
        }
        if let Some(v) = file.base_port {
            cfg.base_port = v;
        }
        if let Some(v) = file.placement {
            cfg.placement = v;
        }
        if let Some(v) = file.cq_depth {
            cfg.cq_depth = v;
        }
        if let Some(v) = file.qp_depth {
            cfg.qp_depth = v;
        }
        if let Some(ms) = file.resolve_timeout_ms {
            cfg.resolve_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.dial_retry_window_ms {
            cfg.dial_retry_window = Duration::from_millis(ms);
        }
        if let Some(ms) = file.handshake_timeout_ms {
            cfg.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.sync_timeout_ms {
            cfg.sync_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = file.max_transfer_bytes {
            cfg.max_transfer_bytes = v;
        }
        if !file.servers.is_empty() {
            cfg.addresses = file.servers.into_iter().map(|s| s.ip).collect();
        }
        Ok(cfg)
    }

    /// Check the configuration for a server with the given index.
    pub fn validate(&self, server_index: PeerIndex) -> Result<()> {
        if self.cluster_size == 0 {
            return Err(RdsmError::Config("cluster size must be at least 1".into()));
        }
        if server_index >= self.cluster_size {
            return Err(RdsmError::InvalidServerIndex {
                index: server_index,
                cluster_size: self.cluster_size,
            });
        }
        if self.addresses.len() < self.cluster_size {
            return Err(RdsmError::Config(format!(
                "{} addresses configured for {} servers",
                self.addresses.len(),
                self.cluster_size
            )));
        }
        if self.heap_size == 0 {
            return Err(RdsmError::Config("heap size must be non-zero".into()));
        }
        if self.max_flags == 0 {
            return Err(RdsmError::Config("at least one flag slot is required".into()));
        }
        if self.remote_flag_bytes == 0 {
            return Err(RdsmError::Config("remote flag section must be non-empty".into()));
        }
        if self.max_transfer_bytes == 0 {
            return Err(RdsmError::Config("max transfer size must be non-zero".into()));
        }
        if self.placement == Placement::Fixed && self.heap_base < self.max_flags {
            return Err(RdsmError::Config(format!(
                "heap base {:#x} leaves no room for {} flag bytes",
                self.heap_base, self.max_flags
            )));
        }
        let last_port = usize::from(self.base_port) + self.cluster_size - 1;
        if last_port > usize::from(u16::MAX) {
            return Err(RdsmError::Config(format!(
                "base port {} overflows for {} servers",
                self.base_port, self.cluster_size
            )));
        }
        let span = self
            .heap_size
            .checked_mul(self.cluster_size)
            .and_then(|s| s.checked_add(self.heap_base))
            .and_then(|s| s.checked_add(self.remote_flag_bytes));
        if span.is_none() {
            return Err(RdsmError::Config(
                "cluster heaps overflow the address space".into(),
            ));
        }
        Ok(())
    }

    /// Heap start address of server `index` under fixed placement.
    pub fn heap_start(&self, index: PeerIndex) -> usize {
        self.heap_base + index * self.heap_size
    }

    /// Address a server listens on for the link dialed by `dialer`.
    pub fn listen_addr(&self, listener: PeerIndex, dialer: PeerIndex) -> SocketAddr {
        SocketAddr::new(self.addresses[listener], self.base_port + dialer as u16)
    }
}

fn parse_usize(v: &str) -> Option<usize> {
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.cluster_size, 8);
        assert_eq!(cfg.addresses.len(), 8);
        assert_eq!(cfg.addresses[6], "10.0.0.10".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.max_flags, 1 << 20);
        assert_eq!(cfg.remote_flag_bytes, 4096);
        assert_eq!(cfg.listen_addr(3, 1).port(), 9401);
        cfg.validate(7).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_index() {
        let cfg = ClusterConfig::local(3, 4096);
        assert!(matches!(
            cfg.validate(3),
            Err(RdsmError::InvalidServerIndex { index: 3, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_addresses() {
        let mut cfg = ClusterConfig::local(3, 4096);
        cfg.addresses.pop();
        assert!(matches!(cfg.validate(0), Err(RdsmError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_no_room_for_flags() {
        let mut cfg = ClusterConfig::default();
        cfg.heap_base = 16;
        assert!(matches!(cfg.validate(0), Err(RdsmError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_overflow() {
        let mut cfg = ClusterConfig::default();
        cfg.heap_size = usize::MAX / 2;
        assert!(cfg.validate(0).is_err());
    }

    #[test]
    fn test_heap_start_per_server() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.heap_start(0), 0x4000_0000_0000);
        assert_eq!(cfg.heap_start(2), 0x4000_0000_0000 + 2 * cfg.heap_size);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RDSM_CLUSTER_SIZE", "3"),
            ("RDSM_HEAP_BASE", "0x10000000"),
            ("RDSM_ADDRESSES", "192.168.1.1, 192.168.1.2,192.168.1.3"),
            ("RDSM_SYNC_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        let cfg = ClusterConfig::default()
            .with_env_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.cluster_size, 3);
        assert_eq!(cfg.heap_base, 0x1000_0000);
        assert_eq!(cfg.addresses.len(), 3);
        assert_eq!(cfg.sync_timeout, Duration::from_millis(250));
        // Untouched values keep their defaults.
        assert_eq!(cfg.base_port, 9400);
    }

    #[test]
    fn test_env_bad_values_ignored() {
        let cfg = ClusterConfig::default().with_env_overrides(|k| match k {
            "RDSM_CLUSTER_SIZE" => Some("many".into()),
            "RDSM_ADDRESSES" => Some("not-an-ip".into()),
            _ => None,
        });
        assert_eq!(cfg.cluster_size, 8);
        assert_eq!(cfg.addresses.len(), 8);
    }

    #[test]
    fn test_json_overlay() {
        let cfg = ClusterConfig::from_json_str(
            r#"{
                "cluster_size": 2,
                "heap_size": 1048576,
                "placement": "anywhere",
                "sync_timeout_ms": 100,
                "servers": [{ "ip": "10.1.0.1" }, { "ip": "10.1.0.2" }]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.cluster_size, 2);
        assert_eq!(cfg.heap_size, 1 << 20);
        assert_eq!(cfg.placement, Placement::Anywhere);
        assert_eq!(cfg.sync_timeout, Duration::from_millis(100));
        assert_eq!(cfg.listen_addr(1, 0).to_string(), "10.1.0.2:9400");
        cfg.validate(1).unwrap();
    }

    #[test]
    fn test_json_unknown_field_rejected() {
        let err = ClusterConfig::from_json_str(r#"{ "clustersize": 2 }"#).unwrap_err();
        assert!(matches!(err, RdsmError::Json(_)));
    }

    #[test]
    fn test_json_file() {
        let path = std::env::temp_dir().join(format!("rdsm-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "base_port": 9500 }"#).unwrap();
        let cfg = ClusterConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.base_port, 9500);
    }

    #[test]
    fn test_local_addresses_distinct() {
        let cfg = ClusterConfig::local(8, 4096);
        let a = cfg.listen_addr(1, 0);
        let b = cfg.listen_addr(2, 0);
        assert_ne!(a, b);
        cfg.validate(7).unwrap();
    }
}
