// Host-side simulation of the stepper bus, the IMU and the clock
//
// Used when `motor_enabled` is false and by the tests. The simulated drives
// understand the same frames as the real ones: queued sync moves start on the
// broadcast trigger, position reads report accumulated shaft angle, and the
// base yaw follows the wheels through the mecanum kinematics.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

use crate::imu::{SensorError, YawSensor};
use crate::motor::kinematics::{DriveAddress, MotionKind, shaft_delta_to_travel};
use crate::motor::transport::{Clock, SerialTransport};
use crate::motor::units::{Calibration, normalize_deg};
use crate::motor::zdt::{CHECKSUM, DRIVER_COUNT, StatusFlags, SysParam};

/// Frames kept for inspection; older ones are dropped
const FRAME_LOG_CAPACITY: usize = 1024;

/// Clock that only advances when something sleeps on it
#[derive(Debug, Default)]
pub struct SimClock {
    now: Cell<Duration>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

struct SimState {
    calibration: Calibration,
    shaft_deg: [f64; 4],
    pending_deg: [f64; 4],
    travel_mm: [f64; 4],
    yaw_deg: f64,
    /// Fraction of the kinematic rotation that actually happens (slip model)
    rotation_scale: f64,
    in_position: bool,
    moves_executed: u32,
    drift: Option<(u32, f64)>,
    imu_fail_after: Option<u32>,
    imu_fail_always: bool,
    corrupt_replies: bool,
    frames: VecDeque<Vec<u8>>,
}

impl SimState {
    fn apply(&mut self, index: usize, shaft_delta: f64) {
        let address = DriveAddress::ALL[index];
        let travel =
            shaft_delta_to_travel(address, shaft_delta as f32, &self.calibration) as f64;
        self.shaft_deg[index] += shaft_delta;
        self.travel_mm[index] += travel;

        let turn_sign = MotionKind::Rotate.wheel_signs()[index] as f64;
        let arm = self.calibration.rotation_arm_mm() as f64;
        let rotation = (turn_sign * travel / (4.0 * arm)).to_degrees();
        self.yaw_deg += rotation * self.rotation_scale;
    }

    fn start_pending(&mut self) {
        for i in 0..4 {
            let delta = std::mem::take(&mut self.pending_deg[i]);
            if delta != 0.0 {
                self.apply(i, delta);
            }
        }
        self.moves_executed += 1;
        if let Some((after, deg)) = self.drift {
            if self.moves_executed >= after {
                debug!("Sim: injecting {:.1} deg of drift", deg);
                self.yaw_deg += deg;
                self.drift = None;
            }
        }
    }

    fn position_move(&mut self, address: u8, direction: u8, pulses: u32, sync: bool) {
        let index = address as usize - 1;
        let sign = if direction == 0 { 1.0 } else { -1.0 };
        let delta = sign * pulses as f64 / 10.0;
        if sync {
            self.pending_deg[index] += delta;
        } else {
            self.apply(index, delta);
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.frames.len() == FRAME_LOG_CAPACITY {
            self.frames.pop_front();
        }
        self.frames.push_back(frame.to_vec());
        if frame.len() < 3 || frame[frame.len() - 1] != CHECKSUM {
            return None;
        }
        let (address, function) = (frame[0], frame[1]);
        if address > DRIVER_COUNT {
            return None;
        }
        if address == 0 && !matches!(function, 0xFF | 0xFE | 0xF3) {
            return None;
        }
        let ack = vec![address, function, 0x02, CHECKSUM];

        let reply = match function {
            0xFD if frame.len() == 16 => {
                let pulses = u32::from_be_bytes([frame[9], frame[10], frame[11], frame[12]]);
                self.position_move(address, frame[2], pulses, frame[14] != 0);
                ack
            }
            0xFB if frame.len() == 12 => {
                let pulses = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]);
                self.position_move(address, frame[2], pulses, frame[10] != 0);
                ack
            }
            0xFF => {
                self.start_pending();
                ack
            }
            0xFE => {
                if address == 0 {
                    self.pending_deg = [0.0; 4];
                } else {
                    self.pending_deg[address as usize - 1] = 0.0;
                }
                ack
            }
            0x0A => {
                self.shaft_deg[address as usize - 1] = 0.0;
                ack
            }
            0x36 => {
                let deg = self.shaft_deg[address as usize - 1];
                let raw = (deg.abs() * 10.0).round() as u32;
                let mut reply = vec![address, function, (deg < 0.0) as u8];
                reply.extend_from_slice(&raw.to_be_bytes());
                reply.push(CHECKSUM);
                reply
            }
            0x3A => {
                let flags = StatusFlags {
                    enabled: true,
                    in_position: self.in_position,
                    stalled: false,
                    stall_protection: false,
                };
                vec![address, function, flags.to_byte(), CHECKSUM]
            }
            0x1F => vec![address, function, 0x01, 0x02, CHECKSUM],
            code => match SysParam::ALL.iter().find(|p| p.code() == code) {
                Some(param) => {
                    let mut reply = vec![0u8; param.reply_len()];
                    reply[0] = address;
                    reply[1] = function;
                    let last = reply.len() - 1;
                    reply[last] = CHECKSUM;
                    reply
                }
                None => ack,
            },
        };

        if address == 0 {
            return None;
        }
        let mut reply = reply;
        if self.corrupt_replies {
            let last = reply.len() - 1;
            reply[last] ^= 0xFF;
        }
        Some(reply)
    }
}

/// Shared handle to one simulated base
#[derive(Clone)]
pub struct SimWorld {
    state: Rc<RefCell<SimState>>,
}

impl SimWorld {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                calibration,
                shaft_deg: [0.0; 4],
                pending_deg: [0.0; 4],
                travel_mm: [0.0; 4],
                yaw_deg: 0.0,
                rotation_scale: 1.0,
                in_position: true,
                moves_executed: 0,
                drift: None,
                imu_fail_after: None,
                imu_fail_always: false,
                corrupt_replies: false,
                frames: VecDeque::with_capacity(FRAME_LOG_CAPACITY),
            })),
        }
    }

    /// Serial endpoint wired to the simulated drives
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            world: self.clone(),
            rx: VecDeque::new(),
        }
    }

    pub fn imu(&self) -> SimImu {
        SimImu {
            world: self.clone(),
        }
    }

    pub fn set_yaw(&self, deg: f32) {
        self.state.borrow_mut().yaw_deg = deg as f64;
    }

    pub fn yaw(&self) -> f32 {
        normalize_deg(self.state.borrow().yaw_deg as f32)
    }

    /// Scale every kinematic rotation, e.g. 0.97 lands a 90° turn at 87.3°
    pub fn set_rotation_scale(&self, scale: f32) {
        self.state.borrow_mut().rotation_scale = scale as f64;
    }

    pub fn set_in_position(&self, in_position: bool) {
        self.state.borrow_mut().in_position = in_position;
    }

    /// Add `deg` of yaw once `moves` synchronized moves have run
    pub fn inject_drift_after_moves(&self, moves: u32, deg: f32) {
        self.state.borrow_mut().drift = Some((moves, deg as f64));
    }

    /// Every IMU read fails once `moves` synchronized moves have run
    pub fn fail_imu_after_moves(&self, moves: u32) {
        self.state.borrow_mut().imu_fail_after = Some(moves);
    }

    pub fn fail_imu_always(&self, fail: bool) {
        self.state.borrow_mut().imu_fail_always = fail;
    }

    /// Flip the trailer of every reply
    pub fn corrupt_replies(&self, corrupt: bool) {
        self.state.borrow_mut().corrupt_replies = corrupt;
    }

    pub fn moves_executed(&self) -> u32 {
        self.state.borrow().moves_executed
    }

    /// Accumulated wheel travel per address, positive forward
    pub fn wheel_travel_mm(&self) -> [f32; 4] {
        self.state.borrow().travel_mm.map(|t| t as f32)
    }

    /// The most recent frames written to the bus, oldest first
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.borrow().frames.iter().cloned().collect()
    }

    pub fn frames_with_function(&self, function: u8) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .frames
            .iter()
            .filter(|f| f.len() > 1 && f[1] == function)
            .cloned()
            .collect()
    }

}

/// Bus endpoint of the simulator
pub struct SimTransport {
    world: SimWorld,
    rx: VecDeque<u8>,
}

impl SerialTransport for SimTransport {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(reply) = self.world.state.borrow_mut().handle_frame(bytes) {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> std::io::Result<usize> {
        Ok(self.rx.len())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// IMU endpoint of the simulator
pub struct SimImu {
    world: SimWorld,
}

impl YawSensor for SimImu {
    fn read_yaw_deg(&mut self) -> Result<f32, SensorError> {
        let state = self.world.state.borrow();
        let failing = state.imu_fail_always
            || state
                .imu_fail_after
                .is_some_and(|after| state.moves_executed >= after);
        if failing {
            return Err(SensorError::Imu("simulated read failure".to_string()));
        }
        Ok(normalize_deg(state.yaw_deg as f32))
    }
}
