//! 運動学モデル
//!
//! [`KinematicModel`]（記号的な定義）を静的試行で [`FrozenModel`] に解決する二段構成。

pub mod builder;
pub mod frozen;
pub mod lower_body;
pub mod segment;
pub mod spec;

pub use builder::KinematicModel;
pub use frozen::{FrozenMarker, FrozenModel, FrozenSegment};
pub use lower_body::{generate_lower_body_model, CalibrationTrials, FunctionalJoint};
pub use segment::{AxisSequence, MarkerSpec, SegmentSpec};
pub use spec::{AxisSpec, CoordinateSystemSpec, PointSpec};

/// 根セグメントの親として使う名前
pub const GROUND: &str = "Ground";
