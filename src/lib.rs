pub mod calibration;
pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod kinematics;
pub mod markers;
pub mod model;
