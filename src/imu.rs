// Inertial heading input
//
// The motion core only needs "read current yaw". The WIT-protocol reader
// below serves the real base; the simulator provides its own implementation.
//
// WIT angle packet: [0x55, 0x53, RollL, RollH, PitchL, PitchH, YawL, YawH, VL, VH, Sum]

use serialport::SerialPort;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::motor::units::imu_raw_to_deg;
use crate::motor::zdt::ZdtError;

const PACKET_LEN: usize = 11;
const HEADER: u8 = 0x55;
const ANGLE_PACKET: u8 = 0x53;

/// How long a yaw read may take before it counts as failed
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("IMU read failed: {0}")]
    Imu(String),

    #[error("No angle packet from IMU within {0:?}")]
    ImuTimeout(Duration),

    #[error("Wheel angle read failed on drive {address}: {source}")]
    WheelAngle {
        address: u8,
        #[source]
        source: ZdtError,
    },
}

/// Blocking absolute-heading source
pub trait YawSensor {
    /// Current yaw in degrees, [0, 360), counter-clockwise positive
    fn read_yaw_deg(&mut self) -> Result<f32, SensorError>;
}

/// Validate a WIT angle packet and extract its yaw
pub fn parse_angle_packet(packet: &[u8]) -> Option<f32> {
    if packet.len() != PACKET_LEN || packet[0] != HEADER || packet[1] != ANGLE_PACKET {
        return None;
    }
    let sum = packet[..PACKET_LEN - 1]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != packet[PACKET_LEN - 1] {
        return None;
    }
    let raw = i16::from_le_bytes([packet[6], packet[7]]);
    Some(imu_raw_to_deg(raw))
}

/// WIT-protocol IMU (HWT101 / JY901 family) on its own serial port
pub struct WitImu {
    port: Box<dyn SerialPort>,
    read_timeout: Duration,
    buffer: Vec<u8>,
}

impl WitImu {
    pub fn open(port_name: &str, baudrate: u32) -> Result<Self, SensorError> {
        info!("Opening IMU on {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(5))
            .open()
            .map_err(|e| SensorError::Imu(e.to_string()))?;
        Ok(Self {
            port,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            buffer: Vec::with_capacity(64),
        })
    }

    /// Pull the newest complete angle packet out of the buffer, dropping older bytes
    fn take_latest_yaw(&mut self) -> Option<f32> {
        let mut latest = None;
        let mut consumed = 0;
        let mut i = 0;
        while i + PACKET_LEN <= self.buffer.len() {
            if let Some(yaw) = parse_angle_packet(&self.buffer[i..i + PACKET_LEN]) {
                latest = Some(yaw);
                i += PACKET_LEN;
                consumed = i;
            } else {
                i += 1;
            }
        }
        if latest.is_some() {
            self.buffer.drain(..consumed);
        } else if self.buffer.len() > 4 * PACKET_LEN {
            // no sync in a long run of bytes: keep only a possible partial packet
            let keep_from = self.buffer.len() - PACKET_LEN;
            self.buffer.drain(..keep_from);
        }
        latest
    }
}

impl YawSensor for WitImu {
    fn read_yaw_deg(&mut self) -> Result<f32, SensorError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| SensorError::Imu(e.to_string()))?;
        self.buffer.clear();

        let start = Instant::now();
        let mut chunk = [0u8; 64];
        loop {
            match self.port.read(&mut chunk) {
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(SensorError::Imu(e.to_string())),
            }
            if let Some(yaw) = self.take_latest_yaw() {
                debug!("IMU yaw {:.2}", yaw);
                return Ok(yaw);
            }
            if start.elapsed() >= self.read_timeout {
                return Err(SensorError::ImuTimeout(self.read_timeout));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(yaw_raw: i16) -> Vec<u8> {
        let mut p = vec![HEADER, ANGLE_PACKET, 0, 0, 0, 0];
        p.extend_from_slice(&yaw_raw.to_le_bytes());
        p.extend_from_slice(&[0x00, 0x00]);
        let sum = p.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        p.push(sum);
        p
    }

    #[test]
    fn test_parse_angle_packet() {
        assert_eq!(parse_angle_packet(&packet(16384)), Some(90.0));
        assert_eq!(parse_angle_packet(&packet(-16384)), Some(270.0));
    }

    #[test]
    fn test_rejects_bad_sum_and_type() {
        let mut bad = packet(100);
        bad[10] = bad[10].wrapping_add(1);
        assert_eq!(parse_angle_packet(&bad), None);

        let mut accel = packet(100);
        accel[1] = 0x51;
        assert_eq!(parse_angle_packet(&accel), None);
        assert_eq!(parse_angle_packet(&packet(100)[..10]), None);
    }
}
