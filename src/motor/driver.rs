// Drive abstraction for the four-wheel mecanum base
//
// Combines kinematics and the X42 protocol: plans a primitive onto the four
// drives, starts them together with the sync trigger and waits for arrival.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::kinematics::{DriveAddress, MotionKind, WheelCommand, plan_with_params};
use super::transport::{Clock, SerialPortTransport, SerialTransport, SystemClock};
use super::units::{
    Calibration, MAX_DEVICE_RPM, PULSES_PER_REV, device_speed_to_rpm, rpm_to_device_speed,
};
use super::zdt::{Command, PositionMode, Reply, ZdtBus, ZdtError};
use crate::config::{DriveConfig, SerialConfig};

/// Speed tiers used whenever a caller asks for the default speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedProfile {
    Precise,
    #[default]
    Normal,
    Fast,
}

impl SpeedProfile {
    pub fn rpm(self) -> f32 {
        match self {
            SpeedProfile::Precise => 30.0,
            SpeedProfile::Normal => 50.0,
            SpeedProfile::Fast => 80.0,
        }
    }

    /// Legacy numeric tier: 0 precise, 1 normal, 2 fast
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(SpeedProfile::Precise),
            1 => Some(SpeedProfile::Normal),
            2 => Some(SpeedProfile::Fast),
            _ => None,
        }
    }
}

/// High-level driver for the four wheel drives
pub struct DriveBase<T: SerialTransport, C: Clock> {
    bus: ZdtBus<T, C>,
    calibration: Calibration,
    settings: DriveConfig,
    profile: SpeedProfile,
}

impl DriveBase<SerialPortTransport, SystemClock> {
    /// Open the stepper bus on a real serial port
    pub fn open(
        serial: &SerialConfig,
        calibration: Calibration,
        settings: DriveConfig,
    ) -> Result<Self, ZdtError> {
        info!(
            "Opening stepper bus on {} at {} baud",
            serial.motor_port, serial.motor_baudrate
        );
        let transport = SerialPortTransport::open(&serial.motor_port, serial.motor_baudrate)?;
        let bus = ZdtBus::with_timeout(transport, SystemClock::new(), serial.reply_timeout());
        Ok(Self::new(bus, calibration, settings))
    }
}

impl<T: SerialTransport, C: Clock> DriveBase<T, C> {
    pub fn new(bus: ZdtBus<T, C>, calibration: Calibration, settings: DriveConfig) -> Self {
        Self {
            bus,
            calibration,
            settings,
            profile: SpeedProfile::default(),
        }
    }

    /// Check every drive answers, enable it and zero its position counter
    pub fn initialize(&mut self) -> Result<(), ZdtError> {
        info!("Initializing drives {:?}", DriveAddress::ALL.map(|a| a.id()));

        for address in DriveAddress::ALL {
            if self.bus.ping(address.id())? {
                debug!("Drive {} ({}) responding", address.id(), address.name());
            } else {
                warn!("Drive {} ({}) not responding", address.id(), address.name());
                return Err(ZdtError::Timeout {
                    address: address.id(),
                });
            }
        }

        for address in DriveAddress::ALL {
            self.bus.enable(address.id(), true)?;
            self.bus.reset_position(address.id())?;
        }

        info!("Drives initialized");
        Ok(())
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn set_speed_profile(&mut self, profile: SpeedProfile) {
        info!("Speed profile {:?} ({} RPM)", profile, profile.rpm());
        self.profile = profile;
    }

    pub fn speed_profile(&self) -> SpeedProfile {
        self.profile
    }

    /// Caller speed, or the profile speed when the caller passes 0 / nothing
    ///
    /// Anything the velocity field cannot carry is rejected: non-finite or
    /// negative values, speeds that round to a zero field, and speeds above
    /// `MAX_DEVICE_RPM`.
    pub fn resolve_speed(&self, speed_rpm: Option<f32>) -> Result<f32, ZdtError> {
        let rpm = match speed_rpm {
            None => return Ok(self.profile.rpm()),
            Some(rpm) if rpm == 0.0 => return Ok(self.profile.rpm()),
            Some(rpm) => rpm,
        };
        let reason = if !rpm.is_finite() {
            Some(format!("{} is not a finite speed", rpm))
        } else if rpm < 0.0 {
            Some(format!("{} RPM is negative", rpm))
        } else if rpm > MAX_DEVICE_RPM {
            Some(format!("{} RPM exceeds {} RPM", rpm, MAX_DEVICE_RPM))
        } else if rpm_to_device_speed(rpm) == 0 {
            Some(format!("{} RPM is below the 0.1 RPM resolution", rpm))
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ZdtError::InvalidParameter {
                name: "speed_rpm",
                reason,
            }),
            None => Ok(rpm),
        }
    }

    pub fn plan(
        &self,
        kind: MotionKind,
        magnitude: f32,
        speed_rpm: Option<f32>,
    ) -> Result<[WheelCommand; 4], ZdtError> {
        let speed = self.resolve_speed(speed_rpm)?;
        Ok(plan_with_params(kind, magnitude, speed, &self.calibration))
    }

    /// Estimated time for the slowest wheel to finish, including both ramps
    ///
    /// Uses the speed the drive actually receives, so saturated and
    /// minimum-resolution wheel speeds are timed as they will run.
    pub fn expected_duration(&self, commands: &[WheelCommand]) -> Result<Duration, ZdtError> {
        let accel = self.settings.accel_rpm_per_s.max(1) as f32;
        let decel = self.settings.decel_rpm_per_s.max(1) as f32;
        let secs = commands
            .iter()
            .filter(|c| c.pulses > 0)
            .map(|c| {
                let rpm = device_speed_to_rpm(device_speed(c.speed_rpm));
                let revs = c.pulses as f32 / PULSES_PER_REV;
                let cruise = revs / (rpm / 60.0);
                let ramps = rpm / accel / 2.0 + rpm / decel / 2.0;
                cruise + ramps
            })
            .fold(0.0f32, f32::max);
        Duration::try_from_secs_f32(secs).map_err(|e| ZdtError::InvalidParameter {
            name: "duration",
            reason: format!("{} s: {}", secs, e),
        })
    }

    /// Queue a relative move on every drive, then start them together
    ///
    /// Returns the expected duration of the slowest wheel. Wheels with nothing
    /// to do are skipped.
    pub fn execute(&mut self, commands: &[WheelCommand; 4]) -> Result<Duration, ZdtError> {
        let expected = self.expected_duration(commands)?;
        let mut queued = 0;
        for cmd in commands.iter().filter(|c| c.pulses > 0) {
            debug!(
                "{} -> {:?} {} pulses at {:.1} RPM",
                cmd.address.name(),
                cmd.direction,
                cmd.pulses,
                cmd.speed_rpm
            );
            self.bus.execute(
                cmd.address.id(),
                Command::TrajectoryPosition {
                    direction: cmd.direction,
                    accel_rpm_per_s: self.settings.accel_rpm_per_s,
                    decel_rpm_per_s: self.settings.decel_rpm_per_s,
                    speed: device_speed(cmd.speed_rpm),
                    pulses: cmd.pulses,
                    mode: PositionMode::Relative,
                    sync: true,
                },
                Reply::Ignore,
            )?;
            queued += 1;
        }

        if queued == 0 {
            return Ok(Duration::ZERO);
        }
        self.bus.trigger_sync()?;
        Ok(expected)
    }

    /// Wait out the expected move time, then poll until every drive reports arrival
    pub fn wait_until_settled(&mut self, expected: Duration) -> Result<(), ZdtError> {
        self.bus.clock().sleep(expected);

        let deadline = self.bus.clock().now() + Duration::from_millis(self.settings.settle_timeout_ms);
        let poll = Duration::from_millis(self.settings.settle_poll_ms);
        loop {
            let mut unsettled = None;
            for address in DriveAddress::ALL {
                if !self.bus.read_status(address.id())?.in_position {
                    unsettled = Some(address);
                    break;
                }
            }
            let Some(address) = unsettled else {
                return Ok(());
            };
            if self.bus.clock().now() >= deadline {
                warn!("Drive {} ({}) never reached its target", address.id(), address.name());
                return Err(ZdtError::Timeout {
                    address: address.id(),
                });
            }
            self.bus.clock().sleep(poll);
        }
    }

    pub fn execute_and_wait(&mut self, commands: &[WheelCommand; 4]) -> Result<(), ZdtError> {
        let expected = self.execute(commands)?;
        if expected.is_zero() {
            return Ok(());
        }
        self.wait_until_settled(expected)
    }

    /// Drive straight; positive forward, negative backward
    pub fn move_forward(&mut self, distance_mm: f32, speed_rpm: Option<f32>) -> Result<(), ZdtError> {
        info!("Move forward {:.1} mm", distance_mm);
        let commands = self.plan(MotionKind::Forward, distance_mm, speed_rpm)?;
        self.execute_and_wait(&commands)
    }

    /// Strafe; positive right, negative left
    pub fn move_lateral(&mut self, distance_mm: f32, speed_rpm: Option<f32>) -> Result<(), ZdtError> {
        info!("Move lateral {:.1} mm", distance_mm);
        let commands = self.plan(MotionKind::Lateral, distance_mm, speed_rpm)?;
        self.execute_and_wait(&commands)
    }

    /// Turn in place; positive counter-clockwise
    pub fn move_rotate(&mut self, angle_deg: f32, speed_rpm: Option<f32>) -> Result<(), ZdtError> {
        info!("Rotate {:.1} deg", angle_deg);
        let commands = self.plan(MotionKind::Rotate, angle_deg, speed_rpm)?;
        self.execute_and_wait(&commands)
    }

    /// Issue a stop to every drive; failures are logged, never returned
    pub fn stop_all(&mut self) {
        info!("Stopping all drives");
        for address in DriveAddress::ALL {
            if let Err(e) = self.bus.stop(address.id(), Reply::Ignore) {
                warn!("Failed to stop drive {}: {}", address.id(), e);
            }
        }
    }

    /// Broadcast stop, stop each drive, then release torque
    pub fn emergency_stop(&mut self) {
        warn!("Emergency stop");
        if let Err(e) = self.bus.broadcast_stop() {
            warn!("Broadcast stop failed during emergency stop: {}", e);
        }
        self.stop_all();
        for address in DriveAddress::ALL {
            let disable = Command::Enable {
                enabled: false,
                sync: false,
            };
            if let Err(e) = self.bus.execute(address.id(), disable, Reply::Ignore) {
                warn!("Failed to disable drive {}: {}", address.id(), e);
            }
        }
    }

    /// Shaft angle of one drive in degrees, positive CW
    pub fn read_wheel_angle(&mut self, address: DriveAddress) -> Result<f32, ZdtError> {
        self.bus.read_position_deg(address.id())
    }

    /// Shaft angle of every drive in degrees, address order
    pub fn read_wheel_angles(&mut self) -> Result<[f32; 4], ZdtError> {
        let mut angles = [0.0f32; 4];
        for address in DriveAddress::ALL {
            angles[address.index()] = self.read_wheel_angle(address)?;
        }
        Ok(angles)
    }

    pub fn sleep(&self, duration: Duration) {
        self.bus.clock().sleep(duration);
    }
}

/// Velocity field for a wheel speed; at least 0.1 RPM so a wheel with travel moves
fn device_speed(rpm: f32) -> u16 {
    rpm_to_device_speed(rpm).max(1)
}

impl<T: SerialTransport, C: Clock> Drop for DriveBase<T, C> {
    fn drop(&mut self) {
        // Leave the base stopped when the driver goes away
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::zdt::DRIVER_COUNT;
    use crate::sim::{SimClock, SimWorld};

    fn sim_drive() -> (SimWorld, DriveBase<crate::sim::SimTransport, SimClock>) {
        let world = SimWorld::new(Calibration::DEFAULT);
        let bus = ZdtBus::new(world.transport(), SimClock::new());
        let drive = DriveBase::new(bus, Calibration::DEFAULT, DriveConfig::default());
        (world, drive)
    }

    #[test]
    fn test_speed_profiles() {
        let (_world, mut drive) = sim_drive();
        assert_eq!(drive.resolve_speed(None).unwrap(), 50.0);
        assert_eq!(drive.resolve_speed(Some(0.0)).unwrap(), 50.0);
        drive.set_speed_profile(SpeedProfile::Precise);
        assert_eq!(drive.resolve_speed(None).unwrap(), 30.0);
        assert_eq!(drive.resolve_speed(Some(42.0)).unwrap(), 42.0);
        assert_eq!(drive.resolve_speed(Some(MAX_DEVICE_RPM)).unwrap(), MAX_DEVICE_RPM);
        assert_eq!(SpeedProfile::from_index(2), Some(SpeedProfile::Fast));
        assert_eq!(SpeedProfile::from_index(3), None);
    }

    #[test]
    fn test_initialize_enables_every_drive() {
        let (world, mut drive) = sim_drive();
        drive.initialize().unwrap();
        let enabled = world.frames_with_function(0xF3);
        assert_eq!(enabled.len(), DRIVER_COUNT as usize);
    }

    #[test]
    fn test_forward_move_is_synchronized() {
        let (world, mut drive) = sim_drive();
        drive.move_forward(100.0, None).unwrap();

        let moves = world.frames_with_function(0xFD);
        assert_eq!(moves.len(), 4);
        // every move is queued with the sync flag and started by one broadcast
        assert!(moves.iter().all(|f| f[f.len() - 2] == 1));
        assert_eq!(world.frames_with_function(0xFF), vec![vec![0x00, 0xFF, 0x66, 0x6B]]);
        assert_eq!(world.moves_executed(), 1);

        let travel = world.wheel_travel_mm();
        for t in travel {
            assert!((t - 100.0).abs() < 0.1, "travel {}", t);
        }
    }

    #[test]
    fn test_zero_move_sends_nothing() {
        let (world, mut drive) = sim_drive();
        drive.move_rotate(0.0, None).unwrap();
        assert!(world.frames().is_empty());
    }

    #[test]
    fn test_stop_all_reaches_every_address() {
        let (world, mut drive) = sim_drive();
        drive.stop_all();
        let stops: Vec<u8> = world.frames_with_function(0xFE).iter().map(|f| f[0]).collect();
        assert_eq!(stops, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_emergency_stop_disables_drives() {
        let (world, mut drive) = sim_drive();
        drive.emergency_stop();
        let stops: Vec<u8> = world.frames_with_function(0xFE).iter().map(|f| f[0]).collect();
        assert_eq!(stops, vec![0, 1, 2, 3, 4]);
        let disables = world.frames_with_function(0xF3);
        assert_eq!(disables.len(), 4);
        assert!(disables.iter().all(|f| f[3] == 0));
    }

    #[test]
    fn test_settle_timeout() {
        let (world, mut drive) = sim_drive();
        world.set_in_position(false);
        let err = drive.move_forward(50.0, None).unwrap_err();
        assert!(matches!(err, ZdtError::Timeout { .. }));
    }

    #[test]
    fn test_expected_duration() {
        let (_world, drive) = sim_drive();
        // one revolution at 60 RPM takes a second, plus half of each 60/200 s ramp
        let cmds = [WheelCommand {
            address: DriveAddress::FrontLeft,
            direction: crate::motor::zdt::Direction::Cw,
            speed_rpm: 60.0,
            pulses: 3600,
            travel_mm: 0.0,
        }];
        let secs = drive.expected_duration(&cmds).unwrap().as_secs_f32();
        assert!((secs - 1.3).abs() < 1e-3, "{}", secs);
    }

    #[test]
    fn test_unusable_speeds_are_rejected_before_bus_traffic() {
        let (world, mut drive) = sim_drive();
        for speed in [f32::NAN, f32::INFINITY, -5.0, 1e-20, 0.01, MAX_DEVICE_RPM + 1.0] {
            assert!(
                matches!(
                    drive.resolve_speed(Some(speed)),
                    Err(ZdtError::InvalidParameter { name: "speed_rpm", .. })
                ),
                "speed {}",
                speed
            );
            assert!(drive.move_forward(100.0, Some(speed)).is_err(), "speed {}", speed);
            assert!(drive.move_rotate(90.0, Some(speed)).is_err(), "speed {}", speed);
        }
        assert!(world.frames().is_empty());
    }

    #[test]
    fn test_slow_wheel_keeps_nonzero_speed_field() {
        let (world, mut drive) = sim_drive();
        let mut cmds = drive.plan(MotionKind::Forward, 10.0, Some(0.1)).unwrap();
        cmds[0].speed_rpm = 0.001;
        let expected = drive.execute(&cmds).unwrap();
        assert!(expected > Duration::ZERO);
        for frame in world.frames_with_function(0xFD) {
            assert_ne!(u16::from_be_bytes([frame[7], frame[8]]), 0, "{:02X?}", frame);
        }
    }
}
