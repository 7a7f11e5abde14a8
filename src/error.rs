use crate::types::{FlagId, PeerIndex, Slot};

pub type Result<T> = std::result::Result<T, RdsmError>;

#[derive(Debug, thiserror::Error)]
pub enum RdsmError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server index {index} out of range: cluster size is {cluster_size}")]
    InvalidServerIndex { index: usize, cluster_size: usize },

    #[error("peer {peer} out of range: cluster size is {cluster_size}")]
    InvalidPeer { peer: PeerIndex, cluster_size: usize },

    #[error("illegal destination {peer}: same as local ID")]
    SelfDestination { peer: PeerIndex },

    #[error("flag id {flag} out of range: maximum is {max_flags}")]
    FlagOutOfRange { flag: FlagId, max_flags: usize },

    #[error("{what} access [{offset:#x}, +{len:#x}) exceeds {limit:#x} bytes")]
    OutOfBounds {
        what: &'static str,
        offset: usize,
        len: usize,
        limit: usize,
    },

    #[error("RDMA device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("cannot map {len:#x} bytes at {addr:#x}: {source}")]
    Mapping {
        addr: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} offset {offset:#x} is not 8-byte aligned")]
    Misaligned { what: &'static str, offset: usize },

    #[error("cluster is not ready: server_ready has not completed")]
    NotReady,

    #[error("context slot {slot} is already bound to a different device")]
    ContextMismatch { slot: Slot },

    #[error("unexpected connection-manager event {event} on {role} side")]
    UnexpectedEvent { event: String, role: &'static str },

    #[error("peer {peer} disconnected")]
    PeerDisconnected { peer: PeerIndex },

    #[error("connection to {addr} rejected until the dial window expired")]
    Rejected { addr: std::net::SocketAddr },

    #[error("work completion failed (wr_id={wr_id:#x}, status={status})")]
    Completion { wr_id: u64, status: String },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("{machine} state machine: no transition from {state} on {input}")]
    InvalidTransition {
        machine: &'static str,
        state: &'static str,
        input: &'static str,
    },

    #[error("handshake with peer {peer} timed out after {timeout_ms}ms")]
    HandshakeTimeout { peer: PeerIndex, timeout_ms: u64 },

    #[error("synchronization on flag {flag} timed out after {timeout_ms}ms")]
    SyncTimeout { flag: FlagId, timeout_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl RdsmError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Device error carrying `errno` from the last failed libc/verbs call.
    pub fn last_os_device(call: &str) -> Self {
        Self::device_with_source(format!("{call} failed"), std::io::Error::last_os_error())
    }

    /// True for caller mistakes detected before any hardware call.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidServerIndex { .. }
                | Self::InvalidPeer { .. }
                | Self::SelfDestination { .. }
                | Self::FlagOutOfRange { .. }
                | Self::OutOfBounds { .. }
                | Self::Misaligned { .. }
                | Self::NotReady
        )
    }
}
