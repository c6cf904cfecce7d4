// 50 Hz loop bridging zenoh and the motion worker
//
// Motions block for seconds, so they run on one dedicated worker thread that
// owns the executor and with it the serial bus. The async loop only routes
// requests in and statuses out. One motion at a time: a request that arrives
// while the base is busy is rejected, except stops, which are queued.

use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::mpsc::error::{SendError, TryRecvError};
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{BaseConfig, LOOP_HZ, TOPIC_CMD_MOTION, TOPIC_HEALTH, TOPIC_STATE_MOTION};
use crate::imu::{WitImu, YawSensor};
use crate::messages::{MotionRequest, MotionStatus, RuntimeHealth};
use crate::motion::{MotionError, MotionExecutor};
use crate::motor::transport::{Clock, SerialTransport, SystemClock};
use crate::motor::zdt::ZdtBus;
use crate::motor::DriveBase;
use crate::sim::SimWorld;

/// Messages from the worker thread to the loop
#[derive(Debug)]
pub enum WorkerEvent {
    /// Drives initialized, pose baseline taken
    Ready,
    Finished(MotionStatus),
    /// The worker cannot drive the base any more
    Fault(String),
}

/// What the loop should do with an incoming request
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Forward(MotionRequest),
    Reject(MotionStatus),
}

pub struct Runtime {
    health: RuntimeHealth,
    ready: bool,
    motion_in_flight: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            health: RuntimeHealth::Busy, // Busy until the worker reports ready
            ready: false,
            motion_in_flight: false,
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Decide whether a request goes to the worker
    pub fn on_request(&mut self, request: MotionRequest) -> Dispatch {
        info!("Received request: {:?}", &request);
        let reason = if self.health == RuntimeHealth::Fault {
            Some("drive fault")
        } else if request.is_stop() {
            None
        } else if !self.ready {
            Some("initializing")
        } else if self.motion_in_flight {
            Some("busy")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                warn!("Rejecting {:?}: {}", request, reason);
                Dispatch::Reject(MotionStatus::Rejected {
                    request,
                    reason: reason.to_string(),
                })
            }
            None => {
                if !request.is_stop() {
                    self.motion_in_flight = true;
                    self.health = RuntimeHealth::Busy;
                }
                Dispatch::Forward(request)
            }
        }
    }

    /// Fold a worker event into the state; returns a status to publish
    pub fn on_event(&mut self, event: WorkerEvent) -> Option<MotionStatus> {
        match event {
            WorkerEvent::Ready => {
                info!("Motion worker ready");
                self.ready = true;
                self.health = RuntimeHealth::Idle;
                None
            }
            WorkerEvent::Finished(status) => {
                if !status.request().is_stop() {
                    self.motion_in_flight = false;
                }
                if self.health != RuntimeHealth::Fault && !self.motion_in_flight {
                    self.health = RuntimeHealth::Idle;
                }
                Some(status)
            }
            WorkerEvent::Fault(reason) => {
                error!("Motion worker fault: {}", reason);
                self.on_fault();
                None
            }
        }
    }

    pub fn on_fault(&mut self) {
        self.health = RuntimeHealth::Fault;
        self.motion_in_flight = false;
    }
}

/// Run one request to completion on the executor
pub fn handle_request<T, C, I>(
    executor: &mut MotionExecutor<T, C, I>,
    request: MotionRequest,
    default_tolerance_deg: f32,
) -> MotionStatus
where
    T: SerialTransport,
    C: Clock,
    I: YawSensor,
{
    let result: Result<_, MotionError> = match &request {
        MotionRequest::Move {
            axis,
            distance_mm,
            target_yaw_deg,
            tolerance_deg,
            speed_rpm,
        } => {
            let target = target_yaw_deg.unwrap_or(executor.pose().yaw_deg);
            executor
                .move_with_heading_hold(
                    *axis,
                    *distance_mm,
                    target,
                    tolerance_deg.unwrap_or(default_tolerance_deg),
                    *speed_rpm,
                )
                .map(Some)
        }
        MotionRequest::Rotate90 {
            clockwise,
            speed_rpm,
        } => executor.rotate_90_with_feedback(*clockwise, *speed_rpm).map(Some),
        MotionRequest::RotateTo {
            target_yaw_deg,
            tolerance_deg,
            speed_rpm,
        } => executor
            .rotate_to_heading(
                *target_yaw_deg,
                tolerance_deg.unwrap_or(default_tolerance_deg),
                *speed_rpm,
            )
            .map(Some),
        MotionRequest::SetSpeedProfile { profile } => {
            executor.set_speed_profile(*profile);
            Ok(None)
        }
        MotionRequest::Stop => {
            executor.stop_all();
            Ok(None)
        }
        MotionRequest::EmergencyStop => {
            executor.emergency_stop();
            Ok(None)
        }
    };

    match result {
        Ok(report) => MotionStatus::Completed { request, report },
        Err(e) => {
            warn!("{:?} failed: {}", request, e);
            MotionStatus::Failed {
                request,
                error: e.to_string(),
            }
        }
    }
}

/// Initialize the executor, then serve requests until the loop goes away
fn serve<T, C, I>(
    mut executor: MotionExecutor<T, C, I>,
    default_tolerance_deg: f32,
    mut requests: UnboundedReceiver<MotionRequest>,
    events: UnboundedSender<WorkerEvent>,
) where
    T: SerialTransport,
    C: Clock,
    I: YawSensor,
{
    if let Err(e) = executor.initialize() {
        let _ = events.send(WorkerEvent::Fault(format!("initialization failed: {}", e)));
        return;
    }
    if events.send(WorkerEvent::Ready).is_err() {
        return;
    }
    // blocking_recv: the worker is a plain thread, outside the tokio runtime
    while let Some(request) = requests.blocking_recv() {
        let status = handle_request(&mut executor, request, default_tolerance_deg);
        if events.send(WorkerEvent::Finished(status)).is_err() {
            break;
        }
    }
    info!("Motion worker exiting");
}

/// Build the executor for the configured backend on the worker thread
fn worker_main(
    config: BaseConfig,
    requests: UnboundedReceiver<MotionRequest>,
    events: UnboundedSender<WorkerEvent>,
) {
    let tolerance = config.executor.default_tolerance_deg;

    if !config.motor_enabled {
        info!("Motors disabled, driving the simulated base");
        let world = SimWorld::new(config.calibration);
        let bus = ZdtBus::with_timeout(
            world.transport(),
            SystemClock::new(),
            config.serial.reply_timeout(),
        );
        let drive = DriveBase::new(bus, config.calibration, config.drive.clone());
        let executor =
            MotionExecutor::new(drive, world.imu(), config.heading.clone(), config.executor.clone());
        serve(executor, tolerance, requests, events);
        return;
    }

    let drive = match DriveBase::open(&config.serial, config.calibration, config.drive.clone()) {
        Ok(drive) => drive,
        Err(e) => {
            let _ = events.send(WorkerEvent::Fault(format!("stepper bus: {}", e)));
            return;
        }
    };
    let imu = match WitImu::open(&config.serial.imu_port, config.serial.imu_baudrate) {
        Ok(imu) => imu,
        Err(e) => {
            let _ = events.send(WorkerEvent::Fault(format!("IMU: {}", e)));
            return;
        }
    };
    let executor = MotionExecutor::new(drive, imu, config.heading.clone(), config.executor.clone());
    serve(executor, tolerance, requests, events);
}

pub async fn run(config: BaseConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (request_tx, request_rx) = mpsc::unbounded_channel::<MotionRequest>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let worker_config = config.clone();
    let worker = std::thread::Builder::new()
        .name("motion-worker".to_string())
        .spawn(move || worker_main(worker_config, request_rx, event_tx))?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_MOTION).await?;
    let pub_status = session.declare_publisher(TOPIC_STATE_MOTION).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut runtime = Runtime::new();
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));

    info!(
        "Runtime started: {}Hz loop, {} backend",
        LOOP_HZ,
        if config.motor_enabled { "hardware" } else { "simulated" }
    );
    info!("Subscribed to: {}", TOPIC_CMD_MOTION);
    info!("Publishing to: {}, {}", TOPIC_STATE_MOTION, TOPIC_HEALTH);

    loop {
        tick.tick().await;

        // 1. Drain pending requests (non-blocking)
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            let request = match serde_json::from_slice::<MotionRequest>(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Failed to parse request: {}", e);
                    continue;
                }
            };
            match runtime.on_request(request) {
                Dispatch::Forward(request) => {
                    if let Err(SendError(request)) = request_tx.send(request) {
                        runtime.on_fault();
                        let status = MotionStatus::Failed {
                            request,
                            error: "motion worker stopped".to_string(),
                        };
                        pub_status.put(serde_json::to_string(&status)?).await?;
                    }
                }
                Dispatch::Reject(status) => {
                    pub_status.put(serde_json::to_string(&status)?).await?;
                }
            }
        }

        // 2. Drain worker events
        loop {
            match event_rx.try_recv() {
                Ok(event) => {
                    if let Some(status) = runtime.on_event(event) {
                        pub_status.put(serde_json::to_string(&status)?).await?;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if runtime.health() != RuntimeHealth::Fault {
                        error!("Motion worker exited");
                        runtime.on_fault();
                    }
                    break;
                }
            }
        }

        // 3. Publish health
        let health_json = serde_json::to_string(&runtime.health())?;
        pub_health.put(health_json).await?;

        if worker.is_finished() && runtime.health() != RuntimeHealth::Fault {
            runtime.on_fault();
        }
    }
}
