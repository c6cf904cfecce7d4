// Pose estimation from wheel angles and inertial heading
//
// Translation comes from the change in each wheel's shaft angle pushed
// through the mecanum forward kinematics. Heading is never integrated: every
// update overwrites it with the IMU's absolute reading, and the body-frame
// displacement is rotated into the world frame with that fresh yaw.
//
// World frame: +x is the base's forward direction at yaw 0, +y is to its
// left, yaw is counter-clockwise positive.

use serde::{Deserialize, Serialize};

use crate::imu::{SensorError, YawSensor};
use crate::motor::driver::DriveBase;
use crate::motor::kinematics::{DriveAddress, body_delta, shaft_delta_to_travel};
use crate::motor::transport::{Clock, SerialTransport};
use crate::motor::units::Calibration;

/// Estimated position and heading of the base
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x_mm: f32,
    pub y_mm: f32,
    pub yaw_deg: f32,
    /// Shaft angles at the last successful update, address order
    pub last_wheel_angles: [f32; 4],
    /// False until the first successful update sets the baseline
    pub initialized: bool,
}

/// Owns the pose; only `update`/`apply` mutate it
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    pose: Pose,
    calibration: Calibration,
}

impl PoseEstimator {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            pose: Pose::default(),
            calibration,
        }
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    /// Forget the baseline; the next update starts again from (0, 0)
    pub fn reset(&mut self) {
        self.pose = Pose::default();
    }

    /// Read all four wheel angles and the IMU yaw, then fold them into the pose
    ///
    /// On any read failure the pose is left exactly as it was and the error is
    /// returned; the caller decides whether to retry or abort
    pub fn update<T, C, I>(
        &mut self,
        drive: &mut DriveBase<T, C>,
        imu: &mut I,
    ) -> Result<(), SensorError>
    where
        T: SerialTransport,
        C: Clock,
        I: YawSensor,
    {
        let mut angles = [0.0f32; 4];
        for address in DriveAddress::ALL {
            angles[address.index()] = drive
                .read_wheel_angle(address)
                .map_err(|source| SensorError::WheelAngle {
                    address: address.id(),
                    source,
                })?;
        }
        let yaw = imu.read_yaw_deg()?;
        self.apply(angles, yaw);
        Ok(())
    }

    /// Fold one set of readings into the pose
    pub fn apply(&mut self, wheel_angles: [f32; 4], yaw_deg: f32) {
        if !self.pose.initialized {
            self.pose = Pose {
                x_mm: 0.0,
                y_mm: 0.0,
                yaw_deg,
                last_wheel_angles: wheel_angles,
                initialized: true,
            };
            return;
        }

        let mut travel = [0.0f32; 4];
        for address in DriveAddress::ALL {
            let i = address.index();
            let delta = wheel_angles[i] - self.pose.last_wheel_angles[i];
            travel[i] = shaft_delta_to_travel(address, delta, &self.calibration);
        }
        let delta = body_delta(travel, &self.calibration);

        let (sin, cos) = yaw_deg.to_radians().sin_cos();
        self.pose.x_mm += delta.forward_mm * cos + delta.right_mm * sin;
        self.pose.y_mm += delta.forward_mm * sin - delta.right_mm * cos;
        self.pose.yaw_deg = yaw_deg;
        self.pose.last_wheel_angles = wheel_angles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use crate::motor::kinematics::{MotionKind, plan};
    use crate::motor::zdt::ZdtBus;
    use crate::sim::{SimClock, SimWorld};

    const EPS: f32 = 0.05;

    /// Shaft angle changes that produce `magnitude` of `kind` motion
    fn shaft_deltas(kind: MotionKind, magnitude: f32) -> [f32; 4] {
        let cal = Calibration::DEFAULT;
        plan(kind, magnitude, 50.0).map(|c| c.travel_mm * c.address.mount_sign() / cal.mm_per_shaft_deg())
    }

    fn advanced(start: [f32; 4], deltas: [f32; 4]) -> [f32; 4] {
        let mut out = start;
        for i in 0..4 {
            out[i] += deltas[i];
        }
        out
    }

    #[test]
    fn test_first_update_sets_baseline() {
        let mut odom = PoseEstimator::new(Calibration::DEFAULT);
        assert!(!odom.pose().initialized);
        odom.apply([10.0, 20.0, 30.0, 40.0], 45.0);
        let pose = odom.pose();
        assert!(pose.initialized);
        assert_eq!((pose.x_mm, pose.y_mm), (0.0, 0.0));
        assert_eq!(pose.yaw_deg, 45.0);
        assert_eq!(pose.last_wheel_angles, [10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_forward_at_constant_yaw() {
        for (yaw, x, y) in [(0.0f32, 200.0f32, 0.0f32), (90.0, 0.0, 200.0), (180.0, -200.0, 0.0)] {
            let mut odom = PoseEstimator::new(Calibration::DEFAULT);
            let start = [0.0; 4];
            odom.apply(start, yaw);
            odom.apply(advanced(start, shaft_deltas(MotionKind::Forward, 200.0)), yaw);
            let pose = odom.pose();
            assert!((pose.x_mm - x).abs() < EPS, "yaw {}: x {}", yaw, pose.x_mm);
            assert!((pose.y_mm - y).abs() < EPS, "yaw {}: y {}", yaw, pose.y_mm);
        }
    }

    #[test]
    fn test_lateral_right_moves_to_negative_y() {
        let mut odom = PoseEstimator::new(Calibration::DEFAULT);
        odom.apply([0.0; 4], 0.0);
        odom.apply(shaft_deltas(MotionKind::Lateral, 150.0), 0.0);
        assert!(odom.pose().x_mm.abs() < EPS);
        assert!((odom.pose().y_mm + 150.0).abs() < EPS);
    }

    #[test]
    fn test_equal_shaft_deltas_give_no_translation() {
        // Equal shaft turns on mirrored mounts are a pure rotation
        let mut odom = PoseEstimator::new(Calibration::DEFAULT);
        odom.apply([0.0; 4], 0.0);
        odom.apply([90.0; 4], 30.0);
        assert!(odom.pose().x_mm.abs() < EPS);
        assert!(odom.pose().y_mm.abs() < EPS);
        assert_eq!(odom.pose().yaw_deg, 30.0);
    }

    #[test]
    fn test_yaw_is_overwritten_not_integrated() {
        let mut odom = PoseEstimator::new(Calibration::DEFAULT);
        odom.apply([0.0; 4], 10.0);
        odom.apply([0.0; 4], 20.0);
        odom.apply([0.0; 4], 5.0);
        assert_eq!(odom.pose().yaw_deg, 5.0);
    }

    #[test]
    fn test_update_through_sim() {
        let world = SimWorld::new(Calibration::DEFAULT);
        let bus = ZdtBus::new(world.transport(), SimClock::new());
        let mut drive = DriveBase::new(bus, Calibration::DEFAULT, DriveConfig::default());
        let mut imu = world.imu();
        let mut odom = PoseEstimator::new(Calibration::DEFAULT);

        odom.update(&mut drive, &mut imu).unwrap();
        drive.move_forward(300.0, None).unwrap();
        odom.update(&mut drive, &mut imu).unwrap();
        assert!((odom.pose().x_mm - 300.0).abs() < 0.5, "{:?}", odom.pose());
        assert!(odom.pose().y_mm.abs() < 0.5);
    }

    #[test]
    fn test_failed_update_leaves_pose_stale() {
        let world = SimWorld::new(Calibration::DEFAULT);
        let bus = ZdtBus::new(world.transport(), SimClock::new());
        let mut drive = DriveBase::new(bus, Calibration::DEFAULT, DriveConfig::default());
        let mut imu = world.imu();
        let mut odom = PoseEstimator::new(Calibration::DEFAULT);

        odom.update(&mut drive, &mut imu).unwrap();
        drive.move_forward(100.0, None).unwrap();
        let before = *odom.pose();

        world.fail_imu_always(true);
        assert!(matches!(
            odom.update(&mut drive, &mut imu),
            Err(SensorError::Imu(_))
        ));
        assert_eq!(*odom.pose(), before);

        world.fail_imu_always(false);
        world.corrupt_replies(true);
        assert!(matches!(
            odom.update(&mut drive, &mut imu),
            Err(SensorError::WheelAngle { address: 1, .. })
        ));
        assert_eq!(*odom.pose(), before);
    }
}
