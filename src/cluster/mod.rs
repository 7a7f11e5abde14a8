mod addressing;
mod bootstrap;
mod connection;
mod context;
mod establish;
mod node;
mod ops;

pub use addressing::{AddressMap, Translated};
pub use bootstrap::{Round, bootstrap_plan};
pub use connection::Connection;
pub use context::HardwareContext;
pub use node::{Cluster, LinkInfo};
