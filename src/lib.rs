//! Distributed shared memory over RDMA for a fixed cluster of servers.
//!
//! Every server maps one heap and links to every peer with a reliable
//! connected queue pair. Callers address the cluster-wide heap with global
//! offsets (`peer * heap_size + offset`) and move data with one-sided reads,
//! writes and 8-byte atomics. The `_sync` variants wait on a per-caller flag
//! until the operation is observable.
//!
//! # Features
//!
//! - **default**: in-process [`SimFabric`] only; builds without RDMA libraries
//! - **verbs**: hardware `VerbsFabric` over librdmacm + libibverbs, and the
//!   process-wide `global` facade
//!
//! # Usage
//!
//! ```ignore
//! let cluster = Arc::new(Cluster::new(VerbsFabric::new(), ClusterConfig::from_env(), index)?);
//! cluster.spawn_server()?;
//! cluster.server_ready()?;
//! cluster.write_sync(local_off, peer * heap_size + offset, len, flag)?;
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod fatal;
#[cfg(feature = "verbs")]
pub mod global;
pub mod memory;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod wait;

pub use cluster::{AddressMap, Cluster, LinkInfo, Translated};
pub use config::{ClusterConfig, Placement};
pub use error::{RdsmError, Result};
pub use fatal::exit_on_error;
pub use memory::{MappedRegion, RegionLayout, RegionManager};
pub use protocol::{HandshakeMessage, RegionDescriptor};
pub use transport::{Fabric, SimFabric};
#[cfg(feature = "verbs")]
pub use transport::VerbsFabric;
pub use types::{FlagId, PeerIndex, Role, Slot};
pub use wait::{Fault, StopSignal};
