// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::motion::{Axis, MotionReport};
use crate::motor::SpeedProfile;

// Request from planners/scripts -> runtime
// Optional fields fall back to the current heading, the configured tolerance
// and the active speed profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionRequest {
    /// Segmented translation with heading hold
    Move {
        axis: Axis,
        distance_mm: f32,
        target_yaw_deg: Option<f32>,
        tolerance_deg: Option<f32>,
        speed_rpm: Option<f32>,
    },
    Rotate90 {
        clockwise: bool,
        speed_rpm: Option<f32>,
    },
    RotateTo {
        target_yaw_deg: f32,
        tolerance_deg: Option<f32>,
        speed_rpm: Option<f32>,
    },
    SetSpeedProfile {
        profile: SpeedProfile,
    },
    Stop,
    EmergencyStop,
}

impl MotionRequest {
    /// Stops are accepted even while a motion is running
    pub fn is_stop(&self) -> bool {
        matches!(self, MotionRequest::Stop | MotionRequest::EmergencyStop)
    }
}

// Outcome published by runtime -> planners/scripts, one per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MotionStatus {
    Completed {
        request: MotionRequest,
        report: Option<MotionReport>,
    },
    Failed {
        request: MotionRequest,
        error: String,
    },
    Rejected {
        request: MotionRequest,
        reason: String,
    },
}

impl MotionStatus {
    pub fn request(&self) -> &MotionRequest {
        match self {
            MotionStatus::Completed { request, .. }
            | MotionStatus::Failed { request, .. }
            | MotionStatus::Rejected { request, .. } => request,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Idle,
    Busy,
    Fault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req: MotionRequest = serde_json::from_str(
            r#"{"type": "move", "axis": "forward", "distance_mm": 250.0}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            MotionRequest::Move {
                axis: Axis::Forward,
                distance_mm: 250.0,
                target_yaw_deg: None,
                tolerance_deg: None,
                speed_rpm: None,
            }
        );

        let req: MotionRequest =
            serde_json::from_str(r#"{"type": "set_speed_profile", "profile": "precise"}"#).unwrap();
        assert_eq!(
            req,
            MotionRequest::SetSpeedProfile {
                profile: SpeedProfile::Precise
            }
        );
        assert!(serde_json::from_str::<MotionRequest>(r#"{"type": "stop"}"#).unwrap().is_stop());
    }

    #[test]
    fn test_status_is_tagged() {
        let status = MotionStatus::Rejected {
            request: MotionRequest::Stop,
            reason: "busy".to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["request"]["type"], "stop");
        assert_eq!(serde_json::to_string(&RuntimeHealth::Busy).unwrap(), "\"busy\"");
    }
}
