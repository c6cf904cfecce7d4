// Mecanum kinematics for the four-wheel base
// Maps forward / lateral / rotate intents to per-wheel travel and back.
//
// Body frame: forward is +x, right is +lateral, counter-clockwise is +rotation.
// Wheel travel is positive when the wheel rolls the base forward.

use super::units::Calibration;
use super::zdt::{Direction, ZdtError};

/// One stepper drive per wheel corner; the address is the drive's bus id
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveAddress {
    FrontLeft = 1,
    FrontRight = 2,
    RearLeft = 3,
    RearRight = 4,
}

impl DriveAddress {
    /// All drives in bus-address order; every per-wheel array uses this order
    pub const ALL: [DriveAddress; 4] = [
        DriveAddress::FrontLeft,
        DriveAddress::FrontRight,
        DriveAddress::RearLeft,
        DriveAddress::RearRight,
    ];

    pub fn from_u8(address: u8) -> Result<Self, ZdtError> {
        match address {
            1 => Ok(DriveAddress::FrontLeft),
            2 => Ok(DriveAddress::FrontRight),
            3 => Ok(DriveAddress::RearLeft),
            4 => Ok(DriveAddress::RearRight),
            other => Err(ZdtError::InvalidAddress(other)),
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn name(self) -> &'static str {
        match self {
            DriveAddress::FrontLeft => "front-left",
            DriveAddress::FrontRight => "front-right",
            DriveAddress::RearLeft => "rear-left",
            DriveAddress::RearRight => "rear-right",
        }
    }

    /// Left-side motors are mounted mirrored: forward travel is a CCW shaft turn
    pub fn mount_sign(self) -> f32 {
        match self {
            DriveAddress::FrontLeft | DriveAddress::RearLeft => -1.0,
            DriveAddress::FrontRight | DriveAddress::RearRight => 1.0,
        }
    }
}

/// Motion primitives the base can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionKind {
    /// Magnitude in mm, positive forward
    Forward,
    /// Magnitude in mm, positive to the right
    Lateral,
    /// Magnitude in degrees, positive counter-clockwise
    Rotate,
}

impl MotionKind {
    /// Contribution sign of each wheel (address order) to this motion
    pub fn wheel_signs(self) -> [f32; 4] {
        match self {
            MotionKind::Forward => [1.0, 1.0, 1.0, 1.0],
            // Diagonal pairs roll against each other
            MotionKind::Lateral => [1.0, -1.0, -1.0, 1.0],
            // Left side backwards, right side forwards
            MotionKind::Rotate => [-1.0, 1.0, -1.0, 1.0],
        }
    }
}

/// Signed RPM-equivalent speed per wheel, in address order
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelSpeeds(pub [f32; 4]);

impl WheelSpeeds {
    /// Nominal speed along `kind` plus a counter-clockwise correction
    ///
    /// A positive correction speeds up the right side and slows the left,
    /// turning the base counter-clockwise while it keeps translating.
    pub fn compose(kind: MotionKind, base_rpm: f32, correction_rpm: f32) -> Self {
        let motion = kind.wheel_signs();
        let turn = MotionKind::Rotate.wheel_signs();
        let mut speeds = [0.0f32; 4];
        for i in 0..4 {
            speeds[i] = base_rpm * motion[i] + correction_rpm * turn[i];
        }
        WheelSpeeds(speeds)
    }

    pub fn get(&self, address: DriveAddress) -> f32 {
        self.0[address.index()]
    }

    pub fn max_abs(&self) -> f32 {
        self.0.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }
}

/// Everything one drive needs for a relative position move
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelCommand {
    pub address: DriveAddress,
    pub direction: Direction,
    /// Speed magnitude in RPM
    pub speed_rpm: f32,
    /// Move length in device pulses (0.1° of shaft)
    pub pulses: u32,
    /// Signed wheel travel in mm, positive rolls the base forward
    pub travel_mm: f32,
}

impl WheelCommand {
    fn new(address: DriveAddress, travel_mm: f32, speed_rpm: f32, cal: &Calibration) -> Self {
        let shaft_mm = travel_mm * address.mount_sign();
        Self {
            address,
            direction: Direction::from_sign(shaft_mm),
            speed_rpm: speed_rpm.abs(),
            pulses: cal.mm_to_pulses(shaft_mm).unsigned_abs(),
            travel_mm,
        }
    }
}

/// Plan one primitive with the default calibration
pub fn plan(kind: MotionKind, magnitude: f32, speed_rpm: f32) -> [WheelCommand; 4] {
    plan_with_params(kind, magnitude, speed_rpm, &Calibration::DEFAULT)
}

/// Plan one primitive: every wheel at the same speed, travel signed per the table
pub fn plan_with_params(
    kind: MotionKind,
    magnitude: f32,
    speed_rpm: f32,
    cal: &Calibration,
) -> [WheelCommand; 4] {
    let travel = match kind {
        MotionKind::Forward | MotionKind::Lateral => magnitude,
        MotionKind::Rotate => cal.rotation_to_wheel_mm(magnitude),
    };
    let signs = kind.wheel_signs();
    DriveAddress::ALL.map(|address| {
        WheelCommand::new(address, travel * signs[address.index()], speed_rpm, cal)
    })
}

/// Plan one heading-hold segment
///
/// Each wheel's travel is scaled by its speed relative to `base_rpm`, so all
/// four finish together and the speed differential becomes a heading change.
pub fn plan_segment(
    segment_mm: f32,
    speeds: &WheelSpeeds,
    base_rpm: f32,
    cal: &Calibration,
) -> [WheelCommand; 4] {
    let base = base_rpm.abs().max(f32::EPSILON);
    DriveAddress::ALL.map(|address| {
        let speed = speeds.get(address);
        let travel = segment_mm.abs() * speed / base;
        WheelCommand::new(address, travel, speed, cal)
    })
}

/// Body-frame displacement produced by a set of wheel travels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BodyDelta {
    pub forward_mm: f32,
    pub right_mm: f32,
    pub rotation_deg: f32,
}

/// Forward kinematics: wheel travel (mm, address order) to body displacement
pub fn body_delta(travel_mm: [f32; 4], cal: &Calibration) -> BodyDelta {
    let project = |kind: MotionKind| -> f32 {
        kind.wheel_signs()
            .iter()
            .zip(travel_mm.iter())
            .map(|(s, t)| s * t)
            .sum::<f32>()
            / 4.0
    };
    let rotation_mm = project(MotionKind::Rotate);
    BodyDelta {
        forward_mm: project(MotionKind::Forward),
        right_mm: project(MotionKind::Lateral),
        rotation_deg: (rotation_mm / cal.rotation_arm_mm()).to_degrees(),
    }
}

/// Wheel travel from a change in shaft angle (degrees, positive CW)
pub fn shaft_delta_to_travel(address: DriveAddress, delta_deg: f32, cal: &Calibration) -> f32 {
    cal.shaft_deg_to_mm(delta_deg) * address.mount_sign()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-3;

    #[test]
    fn test_address_mapping() {
        for address in DriveAddress::ALL {
            assert_eq!(DriveAddress::from_u8(address.id()).unwrap(), address);
        }
        assert!(DriveAddress::from_u8(0).is_err());
        assert!(DriveAddress::from_u8(5).is_err());
    }

    #[test]
    fn test_forward_plan() {
        let cmds = plan(MotionKind::Forward, 100.0, 50.0);
        let pulses = Calibration::DEFAULT.mm_to_pulses(100.0) as u32;
        for cmd in &cmds {
            assert_eq!(cmd.pulses, pulses);
            assert_eq!(cmd.speed_rpm, 50.0);
            assert!((cmd.travel_mm - 100.0).abs() < EPS);
        }
        // Mirrored mounts: left shafts turn opposite to right shafts
        assert_eq!(cmds[0].direction, Direction::Ccw);
        assert_eq!(cmds[1].direction, Direction::Cw);
        assert_eq!(cmds[2].direction, Direction::Ccw);
        assert_eq!(cmds[3].direction, Direction::Cw);
    }

    #[test]
    fn test_backward_is_mirror_of_forward() {
        let fwd = plan(MotionKind::Forward, 250.0, 50.0);
        let back = plan(MotionKind::Forward, -250.0, 50.0);
        for (f, b) in fwd.iter().zip(back.iter()) {
            assert_eq!(f.pulses, b.pulses);
            assert_ne!(f.direction, b.direction);
        }
    }

    #[test]
    fn test_lateral_plan_inverts_diagonals() {
        let cmds = plan(MotionKind::Lateral, 80.0, 30.0);
        assert!(cmds[0].travel_mm > 0.0 && cmds[3].travel_mm > 0.0);
        assert!(cmds[1].travel_mm < 0.0 && cmds[2].travel_mm < 0.0);
    }

    #[test]
    fn test_rotation_plan_uses_track_geometry() {
        let cal = Calibration::DEFAULT;
        let cmds = plan(MotionKind::Rotate, 90.0, 30.0);
        let expected = std::f32::consts::FRAC_PI_2 * cal.rotation_arm_mm();
        assert!((cmds[1].travel_mm - expected).abs() < EPS);
        assert!((cmds[0].travel_mm + expected).abs() < EPS);
        // Every shaft turns the same way for an in-place turn
        assert!(cmds.iter().all(|c| c.direction == Direction::Cw));
    }

    #[test]
    fn test_compose_correction_is_a_left_right_differential() {
        let speeds = WheelSpeeds::compose(MotionKind::Forward, 50.0, 10.0);
        assert_eq!(speeds.0, [40.0, 60.0, 40.0, 60.0]);
        let speeds = WheelSpeeds::compose(MotionKind::Forward, 50.0, 0.0);
        assert_eq!(speeds.0, [50.0; 4]);
        assert_eq!(speeds.max_abs(), 50.0);
    }

    #[test]
    fn test_segment_plan_turns_by_correction() {
        let cal = Calibration::DEFAULT;
        let speeds = WheelSpeeds::compose(MotionKind::Forward, 50.0, -10.0);
        let cmds = plan_segment(100.0, &speeds, 50.0, &cal);
        let delta = body_delta(cmds.map(|c| c.travel_mm), &cal);
        assert!((delta.forward_mm - 100.0).abs() < EPS);
        assert!(delta.right_mm.abs() < EPS);
        let expected = (-20.0 / cal.rotation_arm_mm()).to_degrees();
        assert!((delta.rotation_deg - expected).abs() < EPS);
    }

    #[test]
    fn test_forward_kinematics_per_motion() {
        let cal = Calibration::DEFAULT;
        for kind in [MotionKind::Forward, MotionKind::Lateral] {
            let travel = plan(kind, 120.0, 50.0).map(|c| c.travel_mm);
            let delta = body_delta(travel, &cal);
            let (fwd, right) = match kind {
                MotionKind::Forward => (120.0, 0.0),
                _ => (0.0, 120.0),
            };
            assert!((delta.forward_mm - fwd).abs() < EPS);
            assert!((delta.right_mm - right).abs() < EPS);
            assert!(delta.rotation_deg.abs() < EPS);
        }
        let travel = plan(MotionKind::Rotate, -45.0, 50.0).map(|c| c.travel_mm);
        let delta = body_delta(travel, &cal);
        assert!((delta.rotation_deg + 45.0).abs() < EPS);
    }

    #[test]
    fn test_shaft_delta_follows_mount() {
        let cal = Calibration::DEFAULT;
        let per_deg = cal.mm_per_shaft_deg();
        assert!((shaft_delta_to_travel(DriveAddress::FrontRight, 10.0, &cal) - 10.0 * per_deg).abs() < EPS);
        assert!((shaft_delta_to_travel(DriveAddress::RearLeft, 10.0, &cal) + 10.0 * per_deg).abs() < EPS);
    }
}
