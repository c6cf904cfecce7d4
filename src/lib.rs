pub mod config;
pub mod imu;
pub mod messages;
pub mod motion;
pub mod motor;
pub mod runtime;
pub mod sim;
