//! The cellular automaton itself: grids, row partitions and the ring layout
//! the cohort uses to split them. Nothing in here touches the network.

pub mod grid;
pub mod partition;
pub mod topology;

pub use grid::Grid;
pub use partition::Partition;
pub use topology::{partition_rows, RowRange, Topology, MANAGER_RANK};
