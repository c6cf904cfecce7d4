// Timeouts, topics, hardware and tuning configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::motor::units::Calibration;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Zenoh topics
pub const TOPIC_CMD_MOTION: &str = "base/cmd/motion"; // motion requests
pub const TOPIC_STATE_MOTION: &str = "base/state/motion"; // motion reports
pub const TOPIC_HEALTH: &str = "base/state/health"; // health status

// Serial port for the X42 stepper bus
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

// Serial port for the WIT inertial unit
pub const IMU_PORT: &str = "/dev/ttyUSB1";
pub const IMU_BAUDRATE: u32 = 115_200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub motor_port: String,
    pub motor_baudrate: u32,
    pub reply_timeout_ms: u64,
    pub imu_port: String,
    pub imu_baudrate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            motor_port: MOTOR_PORT.to_string(),
            motor_baudrate: crate::motor::zdt::DEFAULT_BAUDRATE,
            reply_timeout_ms: crate::motor::zdt::DEFAULT_TIMEOUT_MS,
            imu_port: IMU_PORT.to_string(),
            imu_baudrate: IMU_BAUDRATE,
        }
    }
}

impl SerialConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Trajectory ramps and completion polling for wheel moves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriveConfig {
    pub accel_rpm_per_s: u16,
    pub decel_rpm_per_s: u16,
    /// Extra time granted past the computed move duration before giving up
    pub settle_timeout_ms: u64,
    pub settle_poll_ms: u64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            accel_rpm_per_s: 200,
            decel_rpm_per_s: 200,
            settle_timeout_ms: 1500,
            settle_poll_ms: 20,
        }
    }
}

/// Proportional heading-hold tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeadingConfig {
    /// RPM of differential per degree of heading error
    pub gain: f32,
    pub max_correction_rpm: f32,
}

impl Default for HeadingConfig {
    fn default() -> Self {
        Self {
            gain: 2.0,
            max_correction_rpm: 15.0,
        }
    }
}

/// Segmented executor limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub segment_count: u32,
    pub default_tolerance_deg: f32,
    pub max_rotation_iterations: u32,
    /// Extra yaw samples allowed per rotation iteration after a read failure
    pub sensor_retries: u32,
    pub sensor_retry_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            segment_count: 5,
            default_tolerance_deg: 1.0,
            max_rotation_iterations: 6,
            sensor_retries: 2,
            sensor_retry_delay_ms: 10,
        }
    }
}

/// Complete runtime configuration; every field falls back to its default
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BaseConfig {
    /// Drive real hardware; false runs the built-in simulator
    pub motor_enabled: bool,
    pub serial: SerialConfig,
    pub calibration: Calibration,
    pub drive: DriveConfig,
    pub heading: HeadingConfig,
    pub executor: ExecutorConfig,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            motor_enabled: true,
            serial: SerialConfig::default(),
            calibration: Calibration::default(),
            drive: DriveConfig::default(),
            heading: HeadingConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl BaseConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: BaseConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.segment_count == 0 {
            return Err(ConfigError::Invalid {
                field: "executor.segment_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.executor.max_rotation_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "executor.max_rotation_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.calibration.wheel_diameter_mm <= 0.0 || self.calibration.rotation_arm_mm() <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "calibration",
                reason: "wheel diameter and chassis dimensions must be positive".to_string(),
            });
        }
        if self.heading.gain < 0.0 || self.heading.max_correction_rpm < 0.0 {
            return Err(ConfigError::Invalid {
                field: "heading",
                reason: "gain and correction limit must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = BaseConfig::from_json("{}").unwrap();
        assert_eq!(config, BaseConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = BaseConfig::from_json(
            r#"{"motor_enabled": false, "executor": {"segment_count": 3}, "calibration": {"wheel_diameter_mm": 75.0}}"#,
        )
        .unwrap();
        assert!(!config.motor_enabled);
        assert_eq!(config.executor.segment_count, 3);
        assert_eq!(config.executor.max_rotation_iterations, 6);
        assert_eq!(config.calibration.wheel_diameter_mm, 75.0);
        assert_eq!(config.calibration.half_track_mm, 105.0);
    }

    #[test]
    fn test_rejects_zero_segments() {
        let err = BaseConfig::from_json(r#"{"executor": {"segment_count": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            BaseConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
