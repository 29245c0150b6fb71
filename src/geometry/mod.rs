pub mod cluster;
pub mod frame;

pub use cluster::ClusterShape;
pub use frame::{mean_markers, AxisName, CoordinateSystem, DegenerateFrame};
