// Conversions between physical quantities and X42 device fields
//
// Device position fields count tenths of a shaft degree ("pulses" below),
// velocity fields count tenths of an RPM. Every rounding is half away from
// zero so equal and opposite moves produce equal and opposite pulse counts.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Position field resolution: 0.1° per pulse
pub const PULSES_PER_REV: f32 = 3600.0;

/// Velocity field resolution: 0.1 RPM
const SPEED_UNITS_PER_RPM: f32 = 10.0;

/// Upper bound of the 16-bit velocity field in RPM
pub const MAX_DEVICE_RPM: f32 = 3000.0;

/// WIT-protocol IMU angle scale: full i16 range is ±180°
const IMU_RAW_FULL_SCALE: f32 = 32768.0;

/// Wheel and chassis geometry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Mecanum roller-contact diameter
    pub wheel_diameter_mm: f32,
    /// Half the distance between left and right wheel centres
    pub half_track_mm: f32,
    /// Half the distance between front and rear axles
    pub half_wheelbase_mm: f32,
}

impl Calibration {
    pub const DEFAULT: Calibration = Calibration {
        wheel_diameter_mm: 80.0,
        half_track_mm: 105.0,
        half_wheelbase_mm: 95.0,
    };

    pub fn pulses_per_mm(&self) -> f32 {
        PULSES_PER_REV / (PI * self.wheel_diameter_mm)
    }

    /// Linear wheel travel per degree of shaft rotation
    pub fn mm_per_shaft_deg(&self) -> f32 {
        PI * self.wheel_diameter_mm / 360.0
    }

    /// Lever arm used by mecanum rotation: |lx| + |ly|
    pub fn rotation_arm_mm(&self) -> f32 {
        self.half_track_mm + self.half_wheelbase_mm
    }

    pub fn mm_to_pulses(&self, mm: f32) -> i32 {
        (mm * self.pulses_per_mm()).round() as i32
    }

    /// Exact inverse of `mm_to_pulses` (no rounding)
    pub fn pulses_to_mm(&self, pulses: i32) -> f32 {
        pulses as f32 / self.pulses_per_mm()
    }

    /// Inverse of `mm_to_pulses`, rounded to the nearest whole millimetre
    pub fn pulses_to_mm_rounded(&self, pulses: i32) -> i32 {
        self.pulses_to_mm(pulses).round() as i32
    }

    /// Wheel travel that turns the base in place by `deg`
    pub fn rotation_to_wheel_mm(&self, deg: f32) -> f32 {
        deg.to_radians() * self.rotation_arm_mm()
    }

    pub fn shaft_deg_to_mm(&self, deg: f32) -> f32 {
        deg * self.mm_per_shaft_deg()
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Millimetres to pulses using the default calibration
pub fn mm_to_pulses(mm: f32) -> i32 {
    Calibration::DEFAULT.mm_to_pulses(mm)
}

/// Pulses to millimetres using the default calibration
pub fn pulses_to_mm(pulses: i32) -> f32 {
    Calibration::DEFAULT.pulses_to_mm(pulses)
}

/// Speed magnitude in RPM to the 0.1 RPM velocity field, saturating at the field limit
pub fn rpm_to_device_speed(rpm: f32) -> u16 {
    let raw = (rpm.abs().min(MAX_DEVICE_RPM) * SPEED_UNITS_PER_RPM).round();
    raw as u16
}

pub fn device_speed_to_rpm(raw: u16) -> f32 {
    raw as f32 / SPEED_UNITS_PER_RPM
}

/// Shaft angle magnitude in degrees to the 0.1° position field
pub fn deg_to_device_units(deg: f32) -> u32 {
    (deg.abs() * 10.0).round() as u32
}

pub fn device_units_to_deg(raw: u32) -> f32 {
    raw as f32 / 10.0
}

/// Raw IMU yaw word to degrees in [0, 360)
pub fn imu_raw_to_deg(raw: i16) -> f32 {
    normalize_deg(raw as f32 / IMU_RAW_FULL_SCALE * 180.0)
}

/// Wrap any angle into [0, 360)
pub fn normalize_deg(deg: f32) -> f32 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can return exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulses_round_trip_within_one_pulse() {
        let cal = Calibration::DEFAULT;
        for p in [-100_000, -14_324, -7, -1, 0, 1, 3, 15, 1_432, 99_999] {
            let back = cal.mm_to_pulses(cal.pulses_to_mm(p));
            assert!((back - p).abs() <= 1, "{} -> {}", p, back);
        }
    }

    #[test]
    fn test_opposite_moves_are_symmetric() {
        let cal = Calibration::DEFAULT;
        for mm in [0.5f32, 1.0, 12.34, 100.0, 333.3, 1250.0] {
            assert_eq!(cal.mm_to_pulses(-mm), -cal.mm_to_pulses(mm));
        }
    }

    #[test]
    fn test_one_revolution_is_one_circumference() {
        let cal = Calibration::DEFAULT;
        let circumference = PI * cal.wheel_diameter_mm;
        assert_eq!(cal.mm_to_pulses(circumference), 3600);
        assert_eq!(cal.pulses_to_mm_rounded(3600), circumference.round() as i32);
    }

    #[test]
    fn test_speed_field() {
        assert_eq!(rpm_to_device_speed(50.0), 500);
        assert_eq!(rpm_to_device_speed(-50.0), 500);
        assert_eq!(rpm_to_device_speed(12.34), 123);
        assert_eq!(rpm_to_device_speed(12.36), 124);
        assert_eq!(rpm_to_device_speed(100_000.0), 30_000);
        assert_eq!(device_speed_to_rpm(305), 30.5);
    }

    #[test]
    fn test_position_field() {
        assert_eq!(deg_to_device_units(90.0), 900);
        assert_eq!(deg_to_device_units(-0.05), 1);
        assert_eq!(device_units_to_deg(3600), 360.0);
    }

    #[test]
    fn test_imu_raw_and_normalize() {
        assert_eq!(imu_raw_to_deg(0), 0.0);
        assert_eq!(imu_raw_to_deg(16384), 90.0);
        assert_eq!(imu_raw_to_deg(-16384), 270.0);
        assert_eq!(normalize_deg(-90.0), 270.0);
        assert_eq!(normalize_deg(720.0), 0.0);
        assert!(normalize_deg(-1e-9) < 360.0);
    }
}
