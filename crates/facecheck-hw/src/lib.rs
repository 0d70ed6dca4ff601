//! facecheck-hw — Camera access for still-image capture.
//!
//! Provides V4L2 snapshots with a device-ready check and frame
//! conversion to encoded image bytes.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, Readiness, Snapshot, Warmup};
pub use frame::FrameError;
