//! Heap region layout and mapping.

pub mod layout;
pub mod region;

pub use layout::RegionLayout;
pub use region::{MappedRegion, RegionManager};
