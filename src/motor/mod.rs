// Motor control module for the mecanum base
//
// Provides:
// - Mecanum kinematics (body motion <-> wheel travel)
// - ZDT X42 V2 stepper protocol implementation
// - High-level drive API for the four wheels

pub mod driver;
pub mod kinematics;
pub mod transport;
pub mod units;
pub mod zdt;

pub use driver::{DriveBase, SpeedProfile};
pub use kinematics::{DriveAddress, MotionKind, WheelCommand, WheelSpeeds};
pub use transport::{Clock, SerialPortTransport, SerialTransport, SystemClock};
pub use units::Calibration;
pub use zdt::{ZdtBus, ZdtError};
