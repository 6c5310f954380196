//! Mesh topology of one writer: cell kinds and the partition each rank owns.
//!
//! - [`cell_type::CellTopology`]: the closed set of supported cell kinds.
//! - [`partition::PartitionDescriptor`]: one rank's validated vertices and cells.
//! - [`partition::GlobalLayout`]: per-rank counts gathered from the whole group.

pub mod cell_type;
pub mod partition;

pub use cell_type::CellTopology;
pub use partition::{GlobalLayout, PartitionDescriptor};
