pub mod names;
pub mod trajectory;

pub use names::{MarkerId, MarkerNames};
pub use trajectory::{find_unique_suffix, LengthUnit, MarkerTrajectory, StaticPositions};
