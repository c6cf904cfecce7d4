// Proportional heading hold
//
// Turns the difference between a target yaw and the measured yaw into a
// bounded counter-clockwise speed correction for the wheels.

use serde::{Deserialize, Serialize};

use crate::config::HeadingConfig;
use crate::motor::units::normalize_deg;

/// Signed shortest-path error from `current_deg` to `target_deg`, in (-180, 180]
///
/// Positive means the base must turn counter-clockwise. Swapping the arguments
/// negates the result everywhere except at exactly 180°, which stays 180.
pub fn heading_error(target_deg: f32, current_deg: f32) -> f32 {
    let error = (target_deg - current_deg).rem_euclid(360.0);
    if error > 180.0 { error - 360.0 } else { error }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadingController {
    pub target_yaw_deg: f32,
    pub current_yaw_deg: f32,
    pub yaw_error_deg: f32,
    pub gain: f32,
    pub max_correction_rpm: f32,
    pub enabled: bool,
}

impl HeadingController {
    pub fn new(gain: f32, max_correction_rpm: f32) -> Self {
        Self {
            target_yaw_deg: 0.0,
            current_yaw_deg: 0.0,
            yaw_error_deg: 0.0,
            gain,
            max_correction_rpm: max_correction_rpm.abs(),
            enabled: true,
        }
    }

    pub fn from_config(config: &HeadingConfig) -> Self {
        Self::new(config.gain, config.max_correction_rpm)
    }

    pub fn set_target(&mut self, target_deg: f32) {
        self.target_yaw_deg = normalize_deg(target_deg);
    }

    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Record a yaw measurement and return the resulting error
    pub fn observe(&mut self, yaw_deg: f32) -> f32 {
        self.current_yaw_deg = yaw_deg;
        self.yaw_error_deg = heading_error(self.target_yaw_deg, yaw_deg);
        self.yaw_error_deg
    }

    /// Correction in RPM for the latest yaw; 0 and no state change while disabled
    pub fn tick(&mut self, yaw_deg: f32) -> f32 {
        if !self.enabled {
            return 0.0;
        }
        let error = self.observe(yaw_deg);
        (self.gain * error).clamp(-self.max_correction_rpm, self.max_correction_rpm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_range() {
        let mut target = -720.0f32;
        while target <= 720.0 {
            let mut current = -360.0f32;
            while current <= 720.0 {
                let e = heading_error(target, current);
                assert!(e > -180.0 && e <= 180.0, "{} {} -> {}", target, current, e);
                current += 7.5;
            }
            target += 11.25;
        }
    }

    #[test]
    fn test_error_wraps_shortest_way() {
        assert_eq!(heading_error(10.0, 350.0), 20.0);
        assert_eq!(heading_error(350.0, 10.0), -20.0);
        assert_eq!(heading_error(280.0, 10.0), -90.0);
        assert_eq!(heading_error(0.0, 180.0), 180.0);
        assert_eq!(heading_error(180.0, 0.0), 180.0);
    }

    #[test]
    fn test_error_antisymmetric_off_the_seam() {
        for (a, b) in [(0.0f32, 45.0f32), (10.0, 300.0), (359.0, 1.0), (90.0, 200.0)] {
            assert_eq!(heading_error(a, b), -heading_error(b, a));
        }
    }

    #[test]
    fn test_tick_is_clamped() {
        let mut ctrl = HeadingController::new(2.0, 15.0);
        ctrl.set_target(0.0);
        assert_eq!(ctrl.tick(5.0), -10.0);
        assert_eq!(ctrl.tick(30.0), -15.0);
        assert_eq!(ctrl.tick(330.0), 15.0);
        assert_eq!(ctrl.yaw_error_deg, 30.0);
    }

    #[test]
    fn test_disabled_tick_keeps_state() {
        let mut ctrl = HeadingController::new(2.0, 15.0);
        ctrl.set_target(90.0);
        ctrl.tick(80.0);
        let before = ctrl;
        ctrl.enable(false);
        assert_eq!(ctrl.tick(0.0), 0.0);
        assert_eq!(ctrl.current_yaw_deg, before.current_yaw_deg);
        assert_eq!(ctrl.yaw_error_deg, before.yaw_error_deg);
    }

    #[test]
    fn test_target_is_normalized() {
        let mut ctrl = HeadingController::from_config(&HeadingConfig::default());
        ctrl.set_target(-90.0);
        assert_eq!(ctrl.target_yaw_deg, 270.0);
    }
}
