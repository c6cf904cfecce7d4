// Closed-loop motion on top of the open-loop drive primitives
//
// Translations are cut into equal segments. Between segments the executor
// refreshes the pose, and the heading controller turns the yaw error into a
// left/right speed differential for the next segment. Rotations repeat
// in-place turns by the measured residual until the heading is in tolerance.
//
// With heading hold on, any drive or sensor failure between segments stops
// every wheel before the error is returned. Yaw-blind moves keep going on a
// stale pose when only the sensors fail.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::heading::{HeadingController, heading_error};
use super::odometry::{Pose, PoseEstimator};
use crate::config::{ExecutorConfig, HeadingConfig};
use crate::imu::{SensorError, YawSensor};
use crate::motor::driver::{DriveBase, SpeedProfile};
use crate::motor::kinematics::{MotionKind, WheelSpeeds, plan_segment};
use crate::motor::transport::{Clock, SerialTransport};
use crate::motor::units::normalize_deg;
use crate::motor::zdt::ZdtError;

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("Drive error: {0}")]
    Drive(#[from] ZdtError),

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Heading off by {error_deg:.2} deg after {iterations} correction turns")]
    NotConverged { error_deg: f32, iterations: u32 },

    #[error("Invalid motion request: {0}")]
    InvalidRequest(String),
}

/// Translation axis for a segmented move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Positive forward
    Forward,
    /// Positive to the right
    Lateral,
}

impl Axis {
    pub fn kind(self) -> MotionKind {
        match self {
            Axis::Forward => MotionKind::Forward,
            Axis::Lateral => MotionKind::Lateral,
        }
    }
}

/// What happened during one segment of a translation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub index: u32,
    pub distance_mm: f32,
    pub yaw_error_before_deg: f32,
    pub correction_rpm: f32,
    pub wheel_speeds: [f32; 4],
    pub yaw_after_deg: f32,
}

/// Outcome of a completed motion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionReport {
    pub target_yaw_deg: f32,
    pub final_yaw_deg: f32,
    pub final_error_deg: f32,
    pub segments: Vec<SegmentRecord>,
    /// In-place correction turns issued
    pub rotation_iterations: u32,
    pub pose: Pose,
}

pub struct MotionExecutor<T: SerialTransport, C: Clock, I: YawSensor> {
    drive: DriveBase<T, C>,
    imu: I,
    odometry: PoseEstimator,
    heading: HeadingController,
    heading_config: HeadingConfig,
    config: ExecutorConfig,
}

impl<T: SerialTransport, C: Clock, I: YawSensor> MotionExecutor<T, C, I> {
    pub fn new(
        drive: DriveBase<T, C>,
        imu: I,
        heading_config: HeadingConfig,
        config: ExecutorConfig,
    ) -> Self {
        let odometry = PoseEstimator::new(*drive.calibration());
        Self {
            drive,
            imu,
            odometry,
            heading: HeadingController::from_config(&heading_config),
            heading_config,
            config,
        }
    }

    /// Bring up the drives and take the pose baseline
    pub fn initialize(&mut self) -> Result<(), MotionError> {
        self.drive.initialize()?;
        self.reset();
        self.odometry.update(&mut self.drive, &mut self.imu)?;
        info!("Pose baseline set at yaw {:.2}", self.odometry.pose().yaw_deg);
        Ok(())
    }

    /// Drop the pose baseline and heading state
    pub fn reset(&mut self) {
        self.odometry.reset();
        self.heading = HeadingController::from_config(&self.heading_config);
    }

    pub fn pose(&self) -> &Pose {
        self.odometry.pose()
    }

    pub fn heading(&self) -> &HeadingController {
        &self.heading
    }

    pub fn drive_mut(&mut self) -> &mut DriveBase<T, C> {
        &mut self.drive
    }

    pub fn set_speed_profile(&mut self, profile: SpeedProfile) {
        self.drive.set_speed_profile(profile);
    }

    pub fn stop_all(&mut self) {
        self.drive.stop_all();
    }

    pub fn emergency_stop(&mut self) {
        self.drive.emergency_stop();
    }

    /// Translate `distance_mm` along `axis` while holding `target_yaw_deg`
    ///
    /// A residual heading error above `tolerance_deg` after the last segment
    /// is closed with in-place correction turns.
    pub fn move_with_heading_hold(
        &mut self,
        axis: Axis,
        distance_mm: f32,
        target_yaw_deg: f32,
        tolerance_deg: f32,
        speed_rpm: Option<f32>,
    ) -> Result<MotionReport, MotionError> {
        self.run_segments(axis, distance_mm, target_yaw_deg, tolerance_deg, speed_rpm, true)
    }

    /// Turn 90° and keep correcting until the IMU agrees
    pub fn rotate_90_with_feedback(
        &mut self,
        clockwise: bool,
        speed_rpm: Option<f32>,
    ) -> Result<MotionReport, MotionError> {
        let speed = self.drive.resolve_speed(speed_rpm)?;
        let yaw = self.sample_yaw()?;
        let turn = if clockwise { -90.0 } else { 90.0 };
        let target = normalize_deg(yaw + turn);
        info!(
            "Rotate 90 {} from {:.2} to {:.2}",
            if clockwise { "CW" } else { "CCW" },
            yaw,
            target
        );
        self.converge(target, self.config.default_tolerance_deg, speed)
    }

    /// Turn in place until the measured yaw is within `tolerance_deg` of the target
    pub fn rotate_to_heading(
        &mut self,
        target_yaw_deg: f32,
        tolerance_deg: f32,
        speed_rpm: Option<f32>,
    ) -> Result<MotionReport, MotionError> {
        check_tolerance(tolerance_deg)?;
        if !target_yaw_deg.is_finite() {
            return Err(MotionError::InvalidRequest(format!(
                "target yaw {} is not finite",
                target_yaw_deg
            )));
        }
        let speed = self.drive.resolve_speed(speed_rpm)?;
        info!("Rotate to heading {:.2}", normalize_deg(target_yaw_deg));
        self.converge(normalize_deg(target_yaw_deg), tolerance_deg, speed)
    }

    /// Open-loop forward move kept for older callers; failures are logged only
    pub fn move_forward_distance_stable(&mut self, distance_mm: f32, target_yaw_deg: f32) -> bool {
        self.legacy_translate(Axis::Forward, distance_mm, target_yaw_deg);
        true
    }

    /// Open-loop lateral move kept for older callers; failures are logged only
    pub fn move_lateral_distance_stable(&mut self, distance_mm: f32, target_yaw_deg: f32) -> bool {
        self.legacy_translate(Axis::Lateral, distance_mm, target_yaw_deg);
        true
    }

    /// Open-loop quarter turn kept for older callers
    pub fn move_rotate_90_degrees(&mut self, clockwise: bool) -> bool {
        let angle = if clockwise { -90.0 } else { 90.0 };
        if let Err(e) = self.drive.move_rotate(angle, None) {
            warn!("Quarter turn failed: {}", e);
            self.drive.stop_all();
        }
        true
    }

    fn legacy_translate(&mut self, axis: Axis, distance_mm: f32, target_yaw_deg: f32) {
        let tolerance = self.config.default_tolerance_deg;
        if let Err(e) = self.run_segments(axis, distance_mm, target_yaw_deg, tolerance, None, false) {
            warn!("{:?} move of {:.1} mm failed: {}", axis, distance_mm, e);
        }
    }

    fn run_segments(
        &mut self,
        axis: Axis,
        distance_mm: f32,
        target_yaw_deg: f32,
        tolerance_deg: f32,
        speed_rpm: Option<f32>,
        hold: bool,
    ) -> Result<MotionReport, MotionError> {
        if !distance_mm.is_finite() || !target_yaw_deg.is_finite() {
            return Err(MotionError::InvalidRequest(format!(
                "distance {} / target yaw {} must be finite",
                distance_mm, target_yaw_deg
            )));
        }
        check_tolerance(tolerance_deg)?;

        let target = normalize_deg(target_yaw_deg);
        if distance_mm == 0.0 {
            debug!("Zero-length {:?} move, nothing to do", axis);
            return Ok(self.report(target, Vec::new(), 0));
        }

        let kind = axis.kind();
        let base_rpm = self.drive.resolve_speed(speed_rpm)?;
        let segment_count = self.config.segment_count.max(1);
        let segment_mm = distance_mm / segment_count as f32;
        let signed_base = base_rpm.copysign(distance_mm);

        info!(
            "{:?} {:.1} mm in {} segments at {:.1} RPM, holding {:.2} deg (hold {})",
            axis, distance_mm, segment_count, base_rpm, target, hold
        );

        self.heading.set_target(target);
        self.heading.enable(hold);
        self.refresh_pose(hold)?;
        let mut yaw = self.odometry.pose().yaw_deg;
        let mut correction = self.heading.tick(yaw);

        let mut segments = Vec::with_capacity(segment_count as usize);
        for index in 0..segment_count {
            let error_before = heading_error(target, yaw);
            let speeds = WheelSpeeds::compose(kind, signed_base, correction);
            let commands = plan_segment(segment_mm, &speeds, base_rpm, self.drive.calibration());
            debug!(
                "Segment {}/{}: error {:.2} deg, correction {:.2} RPM, speeds {:?}",
                index + 1,
                segment_count,
                error_before,
                correction,
                speeds.0
            );

            if let Err(e) = self.drive.execute_and_wait(&commands) {
                warn!("Segment {} failed: {}", index + 1, e);
                self.drive.stop_all();
                return Err(e.into());
            }
            self.refresh_pose(hold)?;
            yaw = self.odometry.pose().yaw_deg;

            segments.push(SegmentRecord {
                index,
                distance_mm: segment_mm,
                yaw_error_before_deg: error_before,
                correction_rpm: correction,
                wheel_speeds: speeds.0,
                yaw_after_deg: yaw,
            });
            correction = self.heading.tick(yaw);
        }

        let mut iterations = 0;
        if hold && heading_error(target, yaw).abs() > tolerance_deg {
            debug!("Residual heading error after segments, correcting in place");
            iterations = self.converge(target, tolerance_deg, base_rpm)?.rotation_iterations;
        }

        let report = self.report(target, segments, iterations);
        info!(
            "{:?} move done: yaw {:.2}, error {:.2}, pose ({:.1}, {:.1})",
            axis, report.final_yaw_deg, report.final_error_deg, report.pose.x_mm, report.pose.y_mm
        );
        Ok(report)
    }

    /// Repeat in-place turns by the measured residual until within tolerance
    fn converge(
        &mut self,
        target_deg: f32,
        tolerance_deg: f32,
        speed_rpm: f32,
    ) -> Result<MotionReport, MotionError> {
        self.heading.set_target(target_deg);
        let mut iterations = 0;
        loop {
            let yaw = match self.sample_yaw() {
                Ok(yaw) => yaw,
                Err(e) => {
                    if iterations > 0 {
                        self.drive.stop_all();
                    }
                    return Err(e);
                }
            };
            let error = self.heading.observe(yaw);
            if error.abs() <= tolerance_deg {
                debug!("Heading {:.2} within {:.2} of target", yaw, tolerance_deg);
                return Ok(self.report(target_deg, Vec::new(), iterations));
            }
            if iterations >= self.config.max_rotation_iterations {
                warn!(
                    "Heading still {:.2} deg off after {} turns",
                    error, iterations
                );
                self.drive.stop_all();
                return Err(MotionError::NotConverged {
                    error_deg: error,
                    iterations,
                });
            }

            iterations += 1;
            debug!("Correction turn {}: {:.2} deg", iterations, error);
            let commands = self.drive.plan(MotionKind::Rotate, error, Some(speed_rpm))?;
            if let Err(e) = self.drive.execute_and_wait(&commands) {
                warn!("Correction turn {} failed: {}", iterations, e);
                self.drive.stop_all();
                return Err(e.into());
            }
        }
    }

    /// Refresh the pose and return the yaw, re-sampling a bounded number of times
    fn sample_yaw(&mut self) -> Result<f32, MotionError> {
        let delay = Duration::from_millis(self.config.sensor_retry_delay_ms);
        let mut attempt = 0;
        loop {
            match self.odometry.update(&mut self.drive, &mut self.imu) {
                Ok(()) => return Ok(self.odometry.pose().yaw_deg),
                Err(e) if attempt < self.config.sensor_retries => {
                    attempt += 1;
                    warn!("Pose update failed (attempt {}): {}", attempt, e);
                    self.drive.sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Segment-boundary pose update
    ///
    /// With heading hold on a failure stops the wheels and aborts the move.
    /// Without it the move does not depend on the sensors, so the pose is
    /// left stale and the segments carry on.
    fn refresh_pose(&mut self, hold: bool) -> Result<(), MotionError> {
        match self.odometry.update(&mut self.drive, &mut self.imu) {
            Ok(()) => Ok(()),
            Err(e) if !hold => {
                warn!("Pose update failed, continuing open loop: {}", e);
                Ok(())
            }
            Err(e) => {
                warn!("Pose update failed, stopping: {}", e);
                self.drive.stop_all();
                Err(e.into())
            }
        }
    }

    fn report(&self, target_deg: f32, segments: Vec<SegmentRecord>, rotation_iterations: u32) -> MotionReport {
        let pose = *self.odometry.pose();
        MotionReport {
            target_yaw_deg: target_deg,
            final_yaw_deg: pose.yaw_deg,
            final_error_deg: heading_error(target_deg, pose.yaw_deg),
            segments,
            rotation_iterations,
            pose,
        }
    }
}

fn check_tolerance(tolerance_deg: f32) -> Result<(), MotionError> {
    if !(tolerance_deg >= 0.0 && tolerance_deg.is_finite()) {
        return Err(MotionError::InvalidRequest(format!(
            "tolerance {} must be a non-negative number of degrees",
            tolerance_deg
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveConfig;
    use crate::motor::units::Calibration;
    use crate::motor::zdt::ZdtBus;
    use crate::sim::{SimClock, SimImu, SimTransport, SimWorld};

    type SimExecutor = MotionExecutor<SimTransport, SimClock, SimImu>;

    fn sim_executor(segment_count: u32) -> (SimWorld, SimExecutor) {
        let world = SimWorld::new(Calibration::DEFAULT);
        let bus = ZdtBus::new(world.transport(), SimClock::new());
        let drive = DriveBase::new(bus, Calibration::DEFAULT, DriveConfig::default());
        let config = ExecutorConfig {
            segment_count,
            ..ExecutorConfig::default()
        };
        let executor = MotionExecutor::new(drive, world.imu(), HeadingConfig::default(), config);
        (world, executor)
    }

    fn stop_addresses(world: &SimWorld) -> Vec<u8> {
        world.frames_with_function(0xFE).iter().map(|f| f[0]).collect()
    }

    #[test]
    fn test_zero_distance_touches_nothing() {
        let (world, mut exec) = sim_executor(5);
        let report = exec
            .move_with_heading_hold(Axis::Forward, 0.0, 0.0, 1.0, None)
            .unwrap();
        assert!(report.segments.is_empty());
        assert!(world.frames().is_empty());
    }

    #[test]
    fn test_straight_move_without_disturbance() {
        let (world, mut exec) = sim_executor(5);
        let report = exec
            .move_with_heading_hold(Axis::Forward, 500.0, 0.0, 1.0, None)
            .unwrap();
        assert_eq!(report.segments.len(), 5);
        assert!(report.segments.iter().all(|s| s.correction_rpm == 0.0));
        assert_eq!(world.moves_executed(), 5);
        assert!((report.pose.x_mm - 500.0).abs() < 1.0, "{:?}", report.pose);
        assert!(report.pose.y_mm.abs() < 1.0);
    }

    #[test]
    fn test_drift_is_corrected_in_later_segments() {
        let (world, mut exec) = sim_executor(5);
        world.inject_drift_after_moves(2, 5.0);

        let report = exec
            .move_with_heading_hold(Axis::Forward, 500.0, 0.0, 2.0, None)
            .unwrap();

        assert_eq!(report.segments.len(), 5);
        for seg in &report.segments[..2] {
            assert_eq!(seg.correction_rpm, 0.0);
        }
        for seg in &report.segments[2..] {
            assert_ne!(seg.correction_rpm, 0.0, "segment {}", seg.index);
            // a positive error needs a CCW correction and vice versa
            assert!(seg.correction_rpm * seg.yaw_error_before_deg > 0.0, "{:?}", seg);
        }
        assert!(report.final_error_deg.abs() <= 2.0, "{:?}", report);
        assert_eq!(report.rotation_iterations, 0);
    }

    #[test]
    fn test_backward_lateral_move_with_hold() {
        let (world, mut exec) = sim_executor(4);
        world.inject_drift_after_moves(1, -4.0);
        let report = exec
            .move_with_heading_hold(Axis::Lateral, -200.0, 0.0, 1.0, None)
            .unwrap();
        assert!(report.final_error_deg.abs() <= 1.0, "{:?}", report);
        assert!(report.pose.y_mm > 150.0, "{:?}", report.pose);
    }

    #[test]
    fn test_rotate_clockwise_converges_despite_slip() {
        let (world, mut exec) = sim_executor(5);
        world.set_yaw(10.0);
        world.set_rotation_scale(0.97);

        let report = exec.rotate_90_with_feedback(true, None).unwrap();

        assert_eq!(report.target_yaw_deg, 280.0);
        assert!(heading_error(280.0, world.yaw()).abs() <= 1.0, "yaw {}", world.yaw());
        assert!(report.rotation_iterations >= 2);
        assert!(report.rotation_iterations <= ExecutorConfig::default().max_rotation_iterations);
    }

    #[test]
    fn test_rotate_to_heading_takes_short_way() {
        let (world, mut exec) = sim_executor(5);
        world.set_yaw(350.0);
        let report = exec.rotate_to_heading(20.0, 0.5, None).unwrap();
        assert!(report.final_error_deg.abs() <= 0.5);
        assert_eq!(report.rotation_iterations, 1);
    }

    #[test]
    fn test_rotation_fails_without_imu() {
        let (world, mut exec) = sim_executor(5);
        world.fail_imu_always(true);
        let err = exec.rotate_90_with_feedback(false, None).unwrap_err();
        assert!(matches!(err, MotionError::Sensor(SensorError::Imu(_))));
        assert_eq!(world.moves_executed(), 0);
    }

    #[test]
    fn test_rotation_gives_up_after_iteration_limit() {
        let (world, mut exec) = sim_executor(5);
        // the base barely turns, so every correction falls short
        world.set_rotation_scale(0.1);
        let err = exec.rotate_to_heading(90.0, 1.0, None).unwrap_err();
        assert!(matches!(
            err,
            MotionError::NotConverged { iterations: 6, .. }
        ));
        assert_eq!(world.moves_executed(), 6);
    }

    #[test]
    fn test_sensor_loss_on_last_boundary_stops_wheels() {
        let (world, mut exec) = sim_executor(3);
        world.fail_imu_after_moves(3);

        let err = exec
            .move_with_heading_hold(Axis::Forward, 300.0, 0.0, 1.0, None)
            .unwrap_err();
        assert!(matches!(err, MotionError::Sensor(_)));
        assert_eq!(world.frames_with_function(0xFF).len(), 3);
        assert_eq!(stop_addresses(&world), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sensor_loss_midway_aborts_remaining_segments() {
        let (world, mut exec) = sim_executor(5);
        world.fail_imu_after_moves(2);

        assert!(exec
            .move_with_heading_hold(Axis::Forward, 500.0, 0.0, 1.0, None)
            .is_err());
        assert_eq!(world.frames_with_function(0xFF).len(), 2);
        assert_eq!(stop_addresses(&world), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_invalid_request_sends_nothing() {
        let (world, mut exec) = sim_executor(5);
        assert!(matches!(
            exec.move_with_heading_hold(Axis::Forward, f32::NAN, 0.0, 1.0, None),
            Err(MotionError::InvalidRequest(_))
        ));
        assert!(matches!(
            exec.rotate_to_heading(90.0, -1.0, None),
            Err(MotionError::InvalidRequest(_))
        ));
        assert!(world.frames().is_empty());
    }

    #[test]
    fn test_legacy_wrappers_move_without_imu() {
        let (world, mut exec) = sim_executor(5);
        world.fail_imu_always(true);

        assert!(exec.move_forward_distance_stable(100.0, 0.0));
        assert_eq!(world.moves_executed(), 5);
        for travel in world.wheel_travel_mm() {
            assert!((travel - 100.0).abs() < 0.5, "travel {}", travel);
        }

        assert!(exec.move_lateral_distance_stable(100.0, 0.0));
        assert_eq!(world.moves_executed(), 10);
        let travel = world.wheel_travel_mm();
        // strafing right adds to the FL/RR diagonal and cancels FR/RL
        assert!((travel[0] - 200.0).abs() < 1.0, "{:?}", travel);
        assert!(travel[1].abs() < 1.0, "{:?}", travel);
        assert!(stop_addresses(&world).is_empty());

        world.fail_imu_always(false);
        assert!(exec.move_rotate_90_degrees(true));
        assert!((world.yaw() - 270.0).abs() < 0.1, "yaw {}", world.yaw());
    }

    #[test]
    fn test_initialize_sets_baseline() {
        let (world, mut exec) = sim_executor(5);
        world.set_yaw(42.0);
        exec.initialize().unwrap();
        assert!(exec.pose().initialized);
        assert_eq!(exec.pose().yaw_deg, 42.0);
        assert_eq!((exec.pose().x_mm, exec.pose().y_mm), (0.0, 0.0));
    }

    #[test]
    fn test_unusable_speed_rejected_before_bus_traffic() {
        let (world, mut exec) = sim_executor(5);
        for speed in [1e-20, 0.01, -1.0, f32::NAN, 5000.0] {
            assert!(matches!(
                exec.move_with_heading_hold(Axis::Forward, 100.0, 0.0, 1.0, Some(speed)),
                Err(MotionError::Drive(ZdtError::InvalidParameter { .. }))
            ));
            assert!(matches!(
                exec.rotate_to_heading(90.0, 1.0, Some(speed)),
                Err(MotionError::Drive(ZdtError::InvalidParameter { .. }))
            ));
            assert!(matches!(
                exec.rotate_90_with_feedback(true, Some(speed)),
                Err(MotionError::Drive(ZdtError::InvalidParameter { .. }))
            ));
        }
        assert!(world.frames().is_empty());
        assert_eq!(world.moves_executed(), 0);
    }
}
