//! Agent session wire frames.
//!
//! The message set is a closed sum: the validator dispatches on the `type`
//! tag and the session gateway matches exhaustively. The actual transport
//! (WebSocket or otherwise) lives outside the core; these types define what
//! travels over it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::models::CapabilitySpec;

/// Frames an agent sends to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Identify {
        agent_id: String,
        token: String,
        name: String,
        #[serde(default)]
        capabilities: Vec<CapabilitySpec>,
    },
    TaskAccepted {
        task_id: String,
        generation: u64,
    },
    TaskComplete {
        task_id: String,
        generation: u64,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verification_report: Option<String>,
    },
    TaskFailed {
        task_id: String,
        generation: u64,
        reason: String,
    },
    StateReport {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_task_id: Option<String>,
        status: String,
        #[serde(default)]
        generation: u64,
    },
    Heartbeat,
    WakeResult {
        task_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl InboundFrame {
    /// Wire tag, used by the validator and for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Identify { .. } => "identify",
            InboundFrame::TaskAccepted { .. } => "task_accepted",
            InboundFrame::TaskComplete { .. } => "task_complete",
            InboundFrame::TaskFailed { .. } => "task_failed",
            InboundFrame::StateReport { .. } => "state_report",
            InboundFrame::Heartbeat => "heartbeat",
            InboundFrame::WakeResult { .. } => "wake_result",
        }
    }
}

/// Hub decision on a reconnect state report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportDecision {
    Continue,
    Abort,
}

/// Frames the hub sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Identified {
        agent_id: String,
    },
    PushTask {
        task_id: String,
        description: String,
        generation: u64,
        metadata: HashMap<String, String>,
        needed_capabilities: HashSet<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        verification_steps: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wake_command: Option<String>,
    },
    TaskReassign {
        task_id: String,
    },
    TaskContinue {
        task_id: String,
    },
    StateReportAck {
        decision: ReportDecision,
    },
    Message {
        from: String,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
    Error {
        code: String,
        details: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_round_trip_by_tag() {
        let json = r#"{"type":"task_accepted","task_id":"t1","generation":3}"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.kind(), "task_accepted");
        match frame {
            InboundFrame::TaskAccepted { task_id, generation } => {
                assert_eq!(task_id, "t1");
                assert_eq!(generation, 3);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn identify_accepts_string_and_structured_capabilities() {
        let json = r#"{
            "type": "identify",
            "agent_id": "a1",
            "token": "tok",
            "name": "worker",
            "capabilities": ["code", {"name": "git"}]
        }"#;
        let frame: InboundFrame = serde_json::from_str(json).unwrap();
        match frame {
            InboundFrame::Identify { capabilities, .. } => {
                assert_eq!(capabilities.len(), 2);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ack_decision_serializes_snake_case() {
        let json = serde_json::to_string(&OutboundFrame::StateReportAck {
            decision: ReportDecision::Continue,
        })
        .unwrap();
        assert!(json.contains(r#""decision":"continue""#));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let json = r#"{"type":"not_a_frame"}"#;
        assert!(serde_json::from_str::<InboundFrame>(json).is_err());
    }
}
