// Closed-loop motion for the mecanum base
//
// Provides:
// - Pose estimation from wheel angles and IMU yaw
// - Proportional heading hold
// - Segmented executor with heading hold and rotation convergence

pub mod executor;
pub mod heading;
pub mod odometry;

pub use executor::{Axis, MotionError, MotionExecutor, MotionReport, SegmentRecord};
pub use heading::{HeadingController, heading_error};
pub use odometry::{Pose, PoseEstimator};
