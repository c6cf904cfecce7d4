// ZDT X42 V2 closed-loop stepper serial protocol
//
// Frame format: [Address, Function, Params..., 0x6B]
// Multi-byte fields are big-endian. The trailer is a fixed validation byte,
// not a computed checksum. Position fields are 0.1° of shaft angle,
// velocity fields 0.1 RPM.

use std::time::Duration;
use tracing::{debug, warn};

use super::transport::{Clock, SerialTransport};
use super::units::device_units_to_deg;

/// Default serial configuration for the drives
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Fixed trailing validation byte
pub const CHECKSUM: u8 = 0x6B;

/// Address every drive listens on; broadcast frames are never answered
pub const BROADCAST_ADDRESS: u8 = 0;

/// Number of drives on the base bus (addresses 1..=DRIVER_COUNT)
pub const DRIVER_COUNT: u8 = 4;

/// Largest value of the 0.1 RPM velocity field accepted by the firmware
pub const MAX_SPEED_FIELD: u16 = 30_000;

/// Largest torque-mode current in mA
pub const MAX_TORQUE_MA: u16 = 6_000;

/// Length of a control acknowledgement: [addr, func, status, 0x6B]
const ACK_LEN: usize = 4;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Acknowledgement status bytes
const STATUS_OK: u8 = 0x02;
const STATUS_CONDITION_NOT_MET: u8 = 0xE2;
const STATUS_BAD_COMMAND: u8 = 0xEE;

/// Error types for X42 communication
#[derive(Debug, thiserror::Error)]
pub enum ZdtError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid drive address {0}")]
    InvalidAddress(u8),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Bad trailer 0x{found:02X} in reply from drive {address}")]
    Checksum { address: u8, found: u8 },

    #[error("Reply from drive {address} is {actual} bytes, expected {expected}")]
    Length {
        address: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Unexpected reply from drive {address}: {reason}")]
    UnexpectedReply { address: u8, reason: String },

    #[error("Drive {address} rejected function 0x{function:02X} with status 0x{status:02X}")]
    Rejected { address: u8, function: u8, status: u8 },

    #[error("Timeout waiting for response from drive {address}")]
    Timeout { address: u8 },
}

impl ZdtError {
    /// Frame-level failures: the reply arrived but could not be trusted
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ZdtError::Checksum { .. } | ZdtError::Length { .. } | ZdtError::UnexpectedReply { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ZdtError>;

/// Shaft rotation direction as seen from the motor's front face
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Cw = 0,
    Ccw = 1,
}

impl Direction {
    /// CW for non-negative values
    pub fn from_sign(value: f32) -> Self {
        if value >= 0.0 { Direction::Cw } else { Direction::Ccw }
    }

    pub fn sign(self) -> f32 {
        match self {
            Direction::Cw => 1.0,
            Direction::Ccw => -1.0,
        }
    }

    fn from_byte(value: u8) -> Self {
        if value == 0 { Direction::Cw } else { Direction::Ccw }
    }
}

/// Relative moves add to the last target, absolute moves go to a shaft angle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    Relative = 0,
    Absolute = 1,
}

/// Whether an exchange waits for the drive's reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Fire-and-forget: any acknowledgement is discarded before the next exchange
    Ignore,
    /// Block until the drive acknowledges or the timeout elapses
    Wait,
}

/// Homing configuration, shared by the modify command and the parameter read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomingParams {
    /// 0 single-turn nearest, 1 single-turn directional, 2 stall, 3 limit switch
    pub mode: u8,
    pub direction: Direction,
    pub speed_rpm: u16,
    pub timeout_ms: u32,
    pub stall_speed_rpm: u16,
    pub stall_current_ma: u16,
    pub stall_time_ms: u16,
    pub home_on_power_up: bool,
}

/// Drive operations. Numeric fields are device-native units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Make the current shaft angle the zero position
    ResetPosition,
    /// Release the stall-protection latch
    ResetStallProtection,
    Read(SysParam),
    /// 1 = open loop, 2 = FOC closed loop
    SetControlMode { store: bool, mode: u8 },
    Enable { enabled: bool, sync: bool },
    Torque {
        direction: Direction,
        ramp_ma_per_s: u16,
        torque_ma: u16,
        sync: bool,
    },
    Velocity {
        direction: Direction,
        ramp_rpm_per_s: u16,
        /// 0.1 RPM
        speed: u16,
        sync: bool,
    },
    /// Position move without the trapezoidal profile
    BypassPosition {
        direction: Direction,
        speed: u16,
        pulses: u32,
        mode: PositionMode,
        sync: bool,
    },
    /// Position move along a trapezoidal speed profile
    TrajectoryPosition {
        direction: Direction,
        accel_rpm_per_s: u16,
        decel_rpm_per_s: u16,
        speed: u16,
        pulses: u32,
        mode: PositionMode,
        sync: bool,
    },
    Stop { sync: bool },
    /// Start every move queued with `sync: true`
    SyncMotion,
    HomingSetZero { store: bool },
    HomingSetParams { store: bool, params: HomingParams },
    HomingTrigger { mode: u8, sync: bool },
    HomingInterrupt,
}

impl Command {
    pub fn function_code(&self) -> u8 {
        match self {
            Command::ResetPosition => 0x0A,
            Command::ResetStallProtection => 0x0E,
            Command::Read(param) => param.code(),
            Command::SetControlMode { .. } => 0x46,
            Command::Enable { .. } => 0xF3,
            Command::Torque { .. } => 0xF5,
            Command::Velocity { .. } => 0xF6,
            Command::BypassPosition { .. } => 0xFB,
            Command::TrajectoryPosition { .. } => 0xFD,
            Command::Stop { .. } => 0xFE,
            Command::SyncMotion => 0xFF,
            Command::HomingSetZero { .. } => 0x93,
            Command::HomingSetParams { .. } => 0x4C,
            Command::HomingTrigger { .. } => 0x9A,
            Command::HomingInterrupt => 0x9C,
        }
    }

    /// Length of the drive's reply to this command
    pub fn reply_len(&self) -> usize {
        match self {
            Command::Read(param) => param.reply_len(),
            _ => ACK_LEN,
        }
    }

    /// Commands that set a wheel in motion or stop it
    pub fn moves_motor(&self) -> bool {
        matches!(
            self,
            Command::Torque { .. }
                | Command::Velocity { .. }
                | Command::BypassPosition { .. }
                | Command::TrajectoryPosition { .. }
                | Command::Stop { .. }
                | Command::SyncMotion
                | Command::HomingTrigger { .. }
        )
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Command::SetControlMode { mode, .. } if !(1..=2).contains(&mode) => {
                Err(invalid("mode", format!("control mode {} not in 1..=2", mode)))
            }
            Command::Torque { torque_ma, .. } if torque_ma > MAX_TORQUE_MA => Err(invalid(
                "torque_ma",
                format!("{} mA exceeds {} mA", torque_ma, MAX_TORQUE_MA),
            )),
            Command::Velocity { speed, .. }
            | Command::BypassPosition { speed, .. }
            | Command::TrajectoryPosition { speed, .. }
                if speed > MAX_SPEED_FIELD =>
            {
                Err(invalid(
                    "speed",
                    format!("{} exceeds {}", speed, MAX_SPEED_FIELD),
                ))
            }
            Command::HomingSetParams { params, .. } if params.mode > 3 => Err(invalid(
                "mode",
                format!("homing mode {} not in 0..=3", params.mode),
            )),
            Command::HomingTrigger { mode, .. } if mode > 3 => {
                Err(invalid("mode", format!("homing mode {} not in 0..=3", mode)))
            }
            _ => Ok(()),
        }
    }

    fn write_params(&self, out: &mut Vec<u8>) {
        match *self {
            Command::ResetPosition => out.push(0x6D),
            Command::ResetStallProtection => out.push(0x52),
            Command::Read(param) => {
                if let Some(aux) = param.aux_byte() {
                    out.push(aux);
                }
            }
            Command::SetControlMode { store, mode } => {
                out.extend_from_slice(&[0x69, store as u8, mode]);
            }
            Command::Enable { enabled, sync } => {
                out.extend_from_slice(&[0xAB, enabled as u8, sync as u8]);
            }
            Command::Torque {
                direction,
                ramp_ma_per_s,
                torque_ma,
                sync,
            } => {
                out.push(direction as u8);
                out.extend_from_slice(&ramp_ma_per_s.to_be_bytes());
                out.extend_from_slice(&torque_ma.to_be_bytes());
                out.push(sync as u8);
            }
            Command::Velocity {
                direction,
                ramp_rpm_per_s,
                speed,
                sync,
            } => {
                out.push(direction as u8);
                out.extend_from_slice(&ramp_rpm_per_s.to_be_bytes());
                out.extend_from_slice(&speed.to_be_bytes());
                out.push(sync as u8);
            }
            Command::BypassPosition {
                direction,
                speed,
                pulses,
                mode,
                sync,
            } => {
                out.push(direction as u8);
                out.extend_from_slice(&speed.to_be_bytes());
                out.extend_from_slice(&pulses.to_be_bytes());
                out.push(mode as u8);
                out.push(sync as u8);
            }
            Command::TrajectoryPosition {
                direction,
                accel_rpm_per_s,
                decel_rpm_per_s,
                speed,
                pulses,
                mode,
                sync,
            } => {
                out.push(direction as u8);
                out.extend_from_slice(&accel_rpm_per_s.to_be_bytes());
                out.extend_from_slice(&decel_rpm_per_s.to_be_bytes());
                out.extend_from_slice(&speed.to_be_bytes());
                out.extend_from_slice(&pulses.to_be_bytes());
                out.push(mode as u8);
                out.push(sync as u8);
            }
            Command::Stop { sync } => out.extend_from_slice(&[0x98, sync as u8]),
            Command::SyncMotion => out.push(0x66),
            Command::HomingSetZero { store } => out.extend_from_slice(&[0x88, store as u8]),
            Command::HomingSetParams { store, params } => {
                out.extend_from_slice(&[0xAE, store as u8]);
                write_homing_params(&params, out);
            }
            Command::HomingTrigger { mode, sync } => out.extend_from_slice(&[mode, sync as u8]),
            Command::HomingInterrupt => out.push(0x48),
        }
    }
}

fn invalid(name: &'static str, reason: String) -> ZdtError {
    ZdtError::InvalidParameter { name, reason }
}

fn write_homing_params(params: &HomingParams, out: &mut Vec<u8>) {
    out.push(params.mode);
    out.push(params.direction as u8);
    out.extend_from_slice(&params.speed_rpm.to_be_bytes());
    out.extend_from_slice(&params.timeout_ms.to_be_bytes());
    out.extend_from_slice(&params.stall_speed_rpm.to_be_bytes());
    out.extend_from_slice(&params.stall_current_ma.to_be_bytes());
    out.extend_from_slice(&params.stall_time_ms.to_be_bytes());
    out.push(params.home_on_power_up as u8);
}

/// An encoded request, built fresh for every command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionFrame {
    address: u8,
    function: u8,
    bytes: Vec<u8>,
    reply_len: Option<usize>,
}

impl MotionFrame {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Expected reply length, `None` for broadcast frames
    pub fn reply_len(&self) -> Option<usize> {
        self.reply_len
    }
}

/// Encode a command for one drive
pub fn encode(address: u8, command: &Command) -> Result<MotionFrame> {
    if address == BROADCAST_ADDRESS || address > DRIVER_COUNT {
        return Err(ZdtError::InvalidAddress(address));
    }
    build_frame(address, command, Some(command.reply_len()))
}

/// Encode a command for every drive at once; only sync trigger, stop and enable qualify
pub fn encode_broadcast(command: &Command) -> Result<MotionFrame> {
    match command {
        Command::SyncMotion | Command::Stop { .. } | Command::Enable { .. } => {
            build_frame(BROADCAST_ADDRESS, command, None)
        }
        other => Err(invalid(
            "command",
            format!("function 0x{:02X} cannot be broadcast", other.function_code()),
        )),
    }
}

fn build_frame(address: u8, command: &Command, reply_len: Option<usize>) -> Result<MotionFrame> {
    command.validate()?;

    let mut bytes = Vec::with_capacity(20);
    bytes.push(address);
    bytes.push(command.function_code());
    command.write_params(&mut bytes);
    bytes.push(CHECKSUM);

    Ok(MotionFrame {
        address,
        function: command.function_code(),
        bytes,
        reply_len,
    })
}

/// System parameter read selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysParam {
    Version,
    PhaseResistance,
    PidGains,
    HomingParams,
    BusVoltage,
    BusCurrent,
    PhaseCurrent,
    EncoderRaw,
    PulseCount,
    EncoderLinearized,
    InputPulses,
    TargetPosition,
    SetpointPosition,
    Velocity,
    CurrentPosition,
    PositionError,
    Temperature,
    StatusFlags,
    HomingFlags,
    DriverConfig,
    SystemState,
}

impl SysParam {
    pub const ALL: [SysParam; 21] = [
        SysParam::Version,
        SysParam::PhaseResistance,
        SysParam::PidGains,
        SysParam::HomingParams,
        SysParam::BusVoltage,
        SysParam::BusCurrent,
        SysParam::PhaseCurrent,
        SysParam::EncoderRaw,
        SysParam::PulseCount,
        SysParam::EncoderLinearized,
        SysParam::InputPulses,
        SysParam::TargetPosition,
        SysParam::SetpointPosition,
        SysParam::Velocity,
        SysParam::CurrentPosition,
        SysParam::PositionError,
        SysParam::Temperature,
        SysParam::StatusFlags,
        SysParam::HomingFlags,
        SysParam::DriverConfig,
        SysParam::SystemState,
    ];

    pub fn code(self) -> u8 {
        match self {
            SysParam::Version => 0x1F,
            SysParam::PhaseResistance => 0x20,
            SysParam::PidGains => 0x21,
            SysParam::HomingParams => 0x22,
            SysParam::BusVoltage => 0x24,
            SysParam::BusCurrent => 0x26,
            SysParam::PhaseCurrent => 0x27,
            SysParam::EncoderRaw => 0x29,
            SysParam::PulseCount => 0x30,
            SysParam::EncoderLinearized => 0x31,
            SysParam::InputPulses => 0x32,
            SysParam::TargetPosition => 0x33,
            SysParam::SetpointPosition => 0x34,
            SysParam::Velocity => 0x35,
            SysParam::CurrentPosition => 0x36,
            SysParam::PositionError => 0x37,
            SysParam::Temperature => 0x39,
            SysParam::StatusFlags => 0x3A,
            SysParam::HomingFlags => 0x3B,
            SysParam::DriverConfig => 0x42,
            SysParam::SystemState => 0x43,
        }
    }

    fn aux_byte(self) -> Option<u8> {
        match self {
            SysParam::DriverConfig => Some(0x6C),
            SysParam::SystemState => Some(0x7A),
            _ => None,
        }
    }

    /// Full reply length including address, function and trailer
    pub fn reply_len(self) -> usize {
        3 + match self {
            SysParam::Version => 2,
            SysParam::PhaseResistance => 4,
            SysParam::PidGains => 16,
            SysParam::HomingParams => 15,
            SysParam::BusVoltage
            | SysParam::BusCurrent
            | SysParam::PhaseCurrent
            | SysParam::EncoderRaw
            | SysParam::EncoderLinearized
            | SysParam::Temperature => 2,
            SysParam::PulseCount
            | SysParam::InputPulses
            | SysParam::TargetPosition
            | SysParam::SetpointPosition
            | SysParam::CurrentPosition
            | SysParam::PositionError => 5,
            SysParam::Velocity => 3,
            SysParam::StatusFlags | SysParam::HomingFlags => 1,
            // byte count + parameter count + fields
            SysParam::DriverConfig => 2 + 29,
            SysParam::SystemState => 2 + 26,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    pub enabled: bool,
    pub in_position: bool,
    pub stalled: bool,
    pub stall_protection: bool,
}

impl StatusFlags {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            enabled: byte & 0x01 != 0,
            in_position: byte & 0x02 != 0,
            stalled: byte & 0x04 != 0,
            stall_protection: byte & 0x08 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        self.enabled as u8
            | (self.in_position as u8) << 1
            | (self.stalled as u8) << 2
            | (self.stall_protection as u8) << 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HomingFlags {
    pub encoder_ready: bool,
    pub calibration_ready: bool,
    pub homing: bool,
    pub homing_failed: bool,
}

impl HomingFlags {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            encoder_ready: byte & 0x01 != 0,
            calibration_ready: byte & 0x02 != 0,
            homing: byte & 0x04 != 0,
            homing_failed: byte & 0x08 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidGains {
    pub trajectory_kp: u32,
    pub direct_kp: u32,
    pub speed_kp: u32,
    pub speed_ki: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    pub motor_type: u8,
    pub pulse_port_mode: u8,
    pub comm_port_mode: u8,
    pub enable_pin_level: u8,
    pub direction_pin_level: u8,
    pub microsteps: u8,
    pub microstep_interpolation: bool,
    pub auto_screen_off: bool,
    pub open_loop_current_ma: u16,
    pub closed_loop_max_current_ma: u16,
    pub max_speed_rpm: u16,
    pub current_loop_bandwidth: u16,
    pub uart_baud_code: u8,
    pub can_baud_code: u8,
    pub checksum_mode: u8,
    pub response_mode: u8,
    pub stall_protection: bool,
    pub stall_speed_rpm: u16,
    pub stall_current_ma: u16,
    pub stall_time_ms: u16,
    /// 0.1°
    pub arrival_window: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemState {
    pub bus_voltage_mv: u16,
    pub phase_current_ma: u16,
    pub encoder_linearized: u16,
    pub target_position_deg: f32,
    pub velocity_rpm: f32,
    pub current_position_deg: f32,
    pub position_error_deg: f32,
    pub homing_flags: HomingFlags,
    pub status_flags: StatusFlags,
}

/// Decoded parameter read, one variant per selector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SysParamValue {
    Version { firmware: u8, hardware: u8 },
    PhaseResistance { resistance_mohm: u16, inductance_uh: u16 },
    PidGains(PidGains),
    HomingParams(HomingParams),
    BusVoltage { millivolts: u16 },
    BusCurrent { milliamps: u16 },
    PhaseCurrent { milliamps: u16 },
    EncoderRaw(u16),
    PulseCount(i64),
    EncoderLinearized(u16),
    InputPulses(i64),
    TargetPosition { degrees: f32 },
    SetpointPosition { degrees: f32 },
    Velocity { rpm: f32 },
    CurrentPosition { degrees: f32 },
    PositionError { degrees: f32 },
    Temperature { celsius: i16 },
    StatusFlags(StatusFlags),
    HomingFlags(HomingFlags),
    DriverConfig(DriverConfig),
    SystemState(SystemState),
}

/// Sequential big-endian field reader over a reply payload
struct Fields<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let value = self.bytes[self.pos];
        self.pos += 1;
        value
    }

    fn flag(&mut self) -> bool {
        self.u8() != 0
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes([self.u8(), self.u8()])
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes([self.u8(), self.u8(), self.u8(), self.u8()])
    }

    /// Sign byte (1 = negative) followed by a u32 magnitude
    fn signed_u32(&mut self) -> i64 {
        let negative = self.flag();
        let magnitude = self.u32() as i64;
        if negative { -magnitude } else { magnitude }
    }

    fn signed_u16(&mut self) -> i32 {
        let negative = self.flag();
        let magnitude = self.u16() as i32;
        if negative { -magnitude } else { magnitude }
    }

    /// Signed 0.1° position field in degrees
    fn position_deg(&mut self) -> f32 {
        let raw = self.signed_u32();
        let degrees = device_units_to_deg(raw.unsigned_abs() as u32);
        if raw < 0 { -degrees } else { degrees }
    }

    /// Signed 0.1 RPM velocity field in RPM
    fn velocity_rpm(&mut self) -> f32 {
        self.signed_u16() as f32 / 10.0
    }
}

/// Validate and parse a parameter reply
pub fn decode(param: SysParam, raw: &[u8]) -> Result<SysParamValue> {
    let address = raw.first().copied().unwrap_or(0);
    let expected = param.reply_len();
    if raw.len() != expected {
        return Err(ZdtError::Length {
            address,
            expected,
            actual: raw.len(),
        });
    }
    let trailer = raw[raw.len() - 1];
    if trailer != CHECKSUM {
        return Err(ZdtError::Checksum {
            address,
            found: trailer,
        });
    }
    if raw[1] != param.code() {
        return Err(ZdtError::UnexpectedReply {
            address,
            reason: format!(
                "function 0x{:02X} in reply to read 0x{:02X}",
                raw[1],
                param.code()
            ),
        });
    }

    let mut f = Fields::new(&raw[2..raw.len() - 1]);
    let value = match param {
        SysParam::Version => SysParamValue::Version {
            firmware: f.u8(),
            hardware: f.u8(),
        },
        SysParam::PhaseResistance => SysParamValue::PhaseResistance {
            resistance_mohm: f.u16(),
            inductance_uh: f.u16(),
        },
        SysParam::PidGains => SysParamValue::PidGains(PidGains {
            trajectory_kp: f.u32(),
            direct_kp: f.u32(),
            speed_kp: f.u32(),
            speed_ki: f.u32(),
        }),
        SysParam::HomingParams => SysParamValue::HomingParams(HomingParams {
            mode: f.u8(),
            direction: Direction::from_byte(f.u8()),
            speed_rpm: f.u16(),
            timeout_ms: f.u32(),
            stall_speed_rpm: f.u16(),
            stall_current_ma: f.u16(),
            stall_time_ms: f.u16(),
            home_on_power_up: f.flag(),
        }),
        SysParam::BusVoltage => SysParamValue::BusVoltage {
            millivolts: f.u16(),
        },
        SysParam::BusCurrent => SysParamValue::BusCurrent { milliamps: f.u16() },
        SysParam::PhaseCurrent => SysParamValue::PhaseCurrent { milliamps: f.u16() },
        SysParam::EncoderRaw => SysParamValue::EncoderRaw(f.u16()),
        SysParam::PulseCount => SysParamValue::PulseCount(f.signed_u32()),
        SysParam::EncoderLinearized => SysParamValue::EncoderLinearized(f.u16()),
        SysParam::InputPulses => SysParamValue::InputPulses(f.signed_u32()),
        SysParam::TargetPosition => SysParamValue::TargetPosition {
            degrees: f.position_deg(),
        },
        SysParam::SetpointPosition => SysParamValue::SetpointPosition {
            degrees: f.position_deg(),
        },
        SysParam::Velocity => SysParamValue::Velocity {
            rpm: f.velocity_rpm(),
        },
        SysParam::CurrentPosition => SysParamValue::CurrentPosition {
            degrees: f.position_deg(),
        },
        SysParam::PositionError => SysParamValue::PositionError {
            degrees: f.position_deg(),
        },
        SysParam::Temperature => {
            let negative = f.flag();
            let celsius = f.u8() as i16;
            SysParamValue::Temperature {
                celsius: if negative { -celsius } else { celsius },
            }
        }
        SysParam::StatusFlags => SysParamValue::StatusFlags(StatusFlags::from_byte(f.u8())),
        SysParam::HomingFlags => SysParamValue::HomingFlags(HomingFlags::from_byte(f.u8())),
        SysParam::DriverConfig => {
            let _byte_count = f.u8();
            let _param_count = f.u8();
            SysParamValue::DriverConfig(DriverConfig {
                motor_type: f.u8(),
                pulse_port_mode: f.u8(),
                comm_port_mode: f.u8(),
                enable_pin_level: f.u8(),
                direction_pin_level: f.u8(),
                microsteps: f.u8(),
                microstep_interpolation: f.flag(),
                auto_screen_off: f.flag(),
                open_loop_current_ma: f.u16(),
                closed_loop_max_current_ma: f.u16(),
                max_speed_rpm: f.u16(),
                current_loop_bandwidth: f.u16(),
                uart_baud_code: f.u8(),
                can_baud_code: f.u8(),
                checksum_mode: f.u8(),
                response_mode: f.u8(),
                stall_protection: f.flag(),
                stall_speed_rpm: f.u16(),
                stall_current_ma: f.u16(),
                stall_time_ms: f.u16(),
                arrival_window: f.u16(),
            })
        }
        SysParam::SystemState => {
            let _byte_count = f.u8();
            let _param_count = f.u8();
            SysParamValue::SystemState(SystemState {
                bus_voltage_mv: f.u16(),
                phase_current_ma: f.u16(),
                encoder_linearized: f.u16(),
                target_position_deg: f.position_deg(),
                velocity_rpm: f.velocity_rpm(),
                current_position_deg: f.position_deg(),
                position_error_deg: f.position_deg(),
                homing_flags: HomingFlags::from_byte(f.u8()),
                status_flags: StatusFlags::from_byte(f.u8()),
            })
        }
    };
    Ok(value)
}

/// `[addr, 0x00, 0xEE, 0x6B]` is sent for any frame the firmware cannot parse
fn is_unknown_command_reply(reply: &[u8], address: u8) -> bool {
    reply.len() == ACK_LEN && reply == [address, 0x00, STATUS_BAD_COMMAND, CHECKSUM]
}

fn is_rejection(reply: &[u8], frame: &MotionFrame) -> Option<u8> {
    if reply.len() == ACK_LEN
        && reply[0] == frame.address
        && reply[1] == frame.function
        && matches!(reply[2], STATUS_CONDITION_NOT_MET | STATUS_BAD_COMMAND)
        && reply[3] == CHECKSUM
    {
        Some(reply[2])
    } else {
        None
    }
}

/// X42 drive bus - serializes every exchange with the drives
pub struct ZdtBus<T, C> {
    transport: T,
    clock: C,
    reply_timeout: Duration,
}

impl<T: SerialTransport, C: Clock> ZdtBus<T, C> {
    pub fn new(transport: T, clock: C) -> Self {
        Self::with_timeout(transport, clock, Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }

    pub fn with_timeout(transport: T, clock: C, reply_timeout: Duration) -> Self {
        Self {
            transport,
            clock,
            reply_timeout,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Write a frame and, if asked, wait for a complete reply
    ///
    /// Bytes left over from earlier fire-and-forget commands are discarded
    /// before writing, so a reply is never assembled from two exchanges.
    pub fn send_and_optionally_wait(
        &mut self,
        frame: &MotionFrame,
        expects_reply: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.transport.discard_input()?;
        self.transport.write_all(frame.as_bytes())?;

        match (expects_reply, frame.reply_len()) {
            (true, Some(expected)) => self.collect_reply(frame, expected, timeout).map(Some),
            _ => Ok(None),
        }
    }

    fn collect_reply(
        &mut self,
        frame: &MotionFrame,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let address = frame.address();
        let deadline = self.clock.now() + timeout;
        let mut reply = Vec::with_capacity(expected);
        let mut chunk = [0u8; 64];

        loop {
            let n = self.transport.read_available(&mut chunk)?;
            reply.extend_from_slice(&chunk[..n]);

            if is_unknown_command_reply(&reply, address) {
                return Err(ZdtError::Rejected {
                    address,
                    function: frame.function(),
                    status: STATUS_BAD_COMMAND,
                });
            }
            if reply.len() >= expected {
                break;
            }
            if self.clock.now() >= deadline {
                // A short status frame is a refusal, anything else is a lost reply
                if let Some(status) = is_rejection(&reply, frame) {
                    return Err(ZdtError::Rejected {
                        address,
                        function: frame.function(),
                        status,
                    });
                }
                if !reply.is_empty() {
                    debug!(
                        "Discarding partial reply from drive {}: {:02X?}",
                        address, reply
                    );
                }
                return Err(ZdtError::Timeout { address });
            }
            self.clock.sleep(POLL_INTERVAL);
        }

        if reply.len() != expected {
            return Err(ZdtError::Length {
                address,
                expected,
                actual: reply.len(),
            });
        }
        let trailer = reply[expected - 1];
        if trailer != CHECKSUM {
            return Err(ZdtError::Checksum {
                address,
                found: trailer,
            });
        }
        if reply[0] != address {
            return Err(ZdtError::UnexpectedReply {
                address,
                reason: format!("reply addressed from drive {}", reply[0]),
            });
        }
        Ok(reply)
    }

    /// Send a control command to one drive
    pub fn execute(&mut self, address: u8, command: Command, reply: Reply) -> Result<()> {
        let frame = encode(address, &command)?;
        debug!(
            "Drive {} <- 0x{:02X} {:02X?}",
            address,
            frame.function(),
            frame.as_bytes()
        );

        let timeout = self.reply_timeout;
        let wait = reply == Reply::Wait;
        let Some(ack) = self.send_and_optionally_wait(&frame, wait, timeout)? else {
            return Ok(());
        };

        match ack[2] {
            STATUS_OK if ack[1] == frame.function() => Ok(()),
            STATUS_CONDITION_NOT_MET | STATUS_BAD_COMMAND => Err(ZdtError::Rejected {
                address,
                function: frame.function(),
                status: ack[2],
            }),
            other => Err(ZdtError::UnexpectedReply {
                address,
                reason: format!(
                    "status 0x{:02X} for function 0x{:02X}",
                    other,
                    ack[1]
                ),
            }),
        }
    }

    /// Send a command every drive obeys at once; never answered
    pub fn broadcast(&mut self, command: Command) -> Result<()> {
        let frame = encode_broadcast(&command)?;
        debug!("Broadcast <- {:02X?}", frame.as_bytes());
        self.send_and_optionally_wait(&frame, false, Duration::ZERO)?;
        Ok(())
    }

    /// Read and decode one system parameter
    pub fn read(&mut self, address: u8, param: SysParam) -> Result<SysParamValue> {
        let frame = encode(address, &Command::Read(param))?;
        let timeout = self.reply_timeout;
        let raw = self
            .send_and_optionally_wait(&frame, true, timeout)?
            .ok_or(ZdtError::Timeout { address })?;
        decode(param, &raw)
    }

    /// Check that a drive answers a version read
    pub fn ping(&mut self, address: u8) -> Result<bool> {
        match self.read(address, SysParam::Version) {
            Ok(SysParamValue::Version { firmware, hardware }) => {
                debug!(
                    "Drive {} firmware {} hardware {}",
                    address, firmware, hardware
                );
                Ok(true)
            }
            Ok(_) => Ok(true),
            Err(ZdtError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current shaft angle in degrees
    pub fn read_position_deg(&mut self, address: u8) -> Result<f32> {
        match self.read(address, SysParam::CurrentPosition)? {
            SysParamValue::CurrentPosition { degrees } => Ok(degrees),
            other => Err(mismatched(address, other)),
        }
    }

    pub fn read_status(&mut self, address: u8) -> Result<StatusFlags> {
        match self.read(address, SysParam::StatusFlags)? {
            SysParamValue::StatusFlags(flags) => Ok(flags),
            other => Err(mismatched(address, other)),
        }
    }

    pub fn enable(&mut self, address: u8, enabled: bool) -> Result<()> {
        self.execute(
            address,
            Command::Enable {
                enabled,
                sync: false,
            },
            Reply::Wait,
        )
    }

    pub fn reset_position(&mut self, address: u8) -> Result<()> {
        self.execute(address, Command::ResetPosition, Reply::Wait)
    }

    pub fn stop(&mut self, address: u8, reply: Reply) -> Result<()> {
        self.execute(address, Command::Stop { sync: false }, reply)
    }

    /// Start every move queued with the sync flag
    pub fn trigger_sync(&mut self) -> Result<()> {
        self.broadcast(Command::SyncMotion)
    }

    /// Stop every drive with a single broadcast frame
    pub fn broadcast_stop(&mut self) -> Result<()> {
        if let Err(e) = self.broadcast(Command::Stop { sync: false }) {
            warn!("Broadcast stop failed: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

fn mismatched(address: u8, value: SysParamValue) -> ZdtError {
    ZdtError::UnexpectedReply {
        address,
        reason: format!("decoded {:?}", value),
    }
}
