//! Inbound frame validation.
//!
//! Every structured message from an agent is checked against a typed schema
//! before it is parsed: required fields, permitted values, and length
//! bounds. Invalid frames are rejected with a structured error and counted;
//! nothing downstream ever sees them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::constants::{
    MAX_AGENT_NAME_LENGTH, MAX_CAPABILITIES, MAX_CAPABILITY_LENGTH, MAX_DESCRIPTION_LENGTH,
    MAX_RESULT_LENGTH,
};
use crate::protocol::InboundFrame;
use crate::{HubError, Result};

const MAX_ID_LENGTH: usize = 100;
const MAX_TOKEN_LENGTH: usize = 256;
const MAX_REASON_LENGTH: usize = 4_000;

/// Declarative schema for one frame kind, also served to agents for
/// introspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FrameSchema {
    pub kind: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

pub const FRAME_SCHEMAS: &[FrameSchema] = &[
    FrameSchema {
        kind: "identify",
        required: &["agent_id", "token", "name"],
        optional: &["capabilities"],
    },
    FrameSchema {
        kind: "task_accepted",
        required: &["task_id", "generation"],
        optional: &[],
    },
    FrameSchema {
        kind: "task_complete",
        required: &["task_id", "generation", "result"],
        optional: &["verification_report"],
    },
    FrameSchema {
        kind: "task_failed",
        required: &["task_id", "generation", "reason"],
        optional: &[],
    },
    FrameSchema {
        kind: "state_report",
        required: &["status"],
        optional: &["active_task_id", "generation"],
    },
    FrameSchema {
        kind: "heartbeat",
        required: &[],
        optional: &[],
    },
    FrameSchema {
        kind: "wake_result",
        required: &["task_id", "success"],
        optional: &["error"],
    },
];

/// Statuses an agent may claim in a `state_report`.
const REPORTABLE_STATUSES: &[&str] = &["idle", "assigned", "working", "blocked"];

#[derive(Default)]
pub struct FrameValidator {
    rejected: AtomicU64,
}

impl FrameValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Schema descriptions served at `GET /schemas`.
    pub fn schemas(&self) -> Vec<FrameSchema> {
        FRAME_SCHEMAS.to_vec()
    }

    /// Validates a raw JSON value and parses it into a typed frame.
    pub fn validate(&self, value: &Value) -> Result<InboundFrame> {
        match self.validate_inner(value) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn validate_inner(&self, value: &Value) -> Result<InboundFrame> {
        let object = value
            .as_object()
            .ok_or_else(|| HubError::Validation("frame must be a JSON object".to_string()))?;
        let kind = object
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("frame is missing a type tag".to_string()))?;

        let schema = FRAME_SCHEMAS
            .iter()
            .find(|s| s.kind == kind)
            .ok_or_else(|| HubError::Validation(format!("unknown frame type: {kind}")))?;

        for field in schema.required {
            if !object.contains_key(*field) {
                return Err(HubError::Validation(format!(
                    "{kind} frame is missing required field {field}"
                )));
            }
        }

        self.check_bounds(kind, object)?;

        let frame: InboundFrame = serde_json::from_value(value.clone())
            .map_err(|e| HubError::Validation(format!("malformed {kind} frame: {e}")))?;
        Ok(frame)
    }

    fn check_bounds(&self, kind: &str, object: &serde_json::Map<String, Value>) -> Result<()> {
        check_str_len(object, "agent_id", MAX_ID_LENGTH)?;
        check_str_len(object, "task_id", MAX_ID_LENGTH)?;
        check_str_len(object, "active_task_id", MAX_ID_LENGTH)?;
        check_str_len(object, "token", MAX_TOKEN_LENGTH)?;
        check_str_len(object, "name", MAX_AGENT_NAME_LENGTH)?;
        check_str_len(object, "reason", MAX_REASON_LENGTH)?;
        check_str_len(object, "error", MAX_REASON_LENGTH)?;
        check_str_len(object, "verification_report", MAX_DESCRIPTION_LENGTH)?;

        if let Some(generation) = object.get("generation") {
            if !generation.is_u64() {
                return Err(HubError::Validation(
                    "generation must be a non-negative integer".to_string(),
                ));
            }
        }

        if let Some(result) = object.get("result") {
            let serialized = serde_json::to_string(result)?;
            if serialized.len() > MAX_RESULT_LENGTH {
                return Err(HubError::Validation(format!(
                    "result exceeds {MAX_RESULT_LENGTH} bytes"
                )));
            }
        }

        if kind == "identify" {
            if let Some(capabilities) = object.get("capabilities") {
                let list = capabilities.as_array().ok_or_else(|| {
                    HubError::Validation("capabilities must be a list".to_string())
                })?;
                if list.len() > MAX_CAPABILITIES {
                    return Err(HubError::Validation(format!(
                        "at most {MAX_CAPABILITIES} capabilities are accepted"
                    )));
                }
                for cap in list {
                    let name = match cap {
                        Value::String(s) => s.as_str(),
                        Value::Object(map) => map
                            .get("name")
                            .and_then(|n| n.as_str())
                            .ok_or_else(|| {
                                HubError::Validation(
                                    "structured capability needs a name".to_string(),
                                )
                            })?,
                        _ => {
                            return Err(HubError::Validation(
                                "capability must be a string or an object".to_string(),
                            ))
                        }
                    };
                    if name.is_empty() || name.len() > MAX_CAPABILITY_LENGTH {
                        return Err(HubError::Validation(format!(
                            "capability names must be 1..={MAX_CAPABILITY_LENGTH} characters"
                        )));
                    }
                }
            }
        }

        if kind == "state_report" {
            let status = object
                .get("status")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HubError::Validation("status must be a string".to_string()))?;
            if !REPORTABLE_STATUSES.contains(&status) {
                return Err(HubError::Validation(format!(
                    "status must be one of {REPORTABLE_STATUSES:?}"
                )));
            }
        }

        Ok(())
    }
}

fn check_str_len(
    object: &serde_json::Map<String, Value>,
    field: &str,
    max: usize,
) -> Result<()> {
    if let Some(value) = object.get(field) {
        if let Some(s) = value.as_str() {
            if s.is_empty() || s.len() > max {
                return Err(HubError::Validation(format!(
                    "{field} must be 1..={max} characters"
                )));
            }
        }
    }
    Ok(())
}

/// Validates task-submission metadata from the HTTP surface.
pub fn validate_metadata(metadata: &HashMap<String, String>) -> Result<()> {
    for (key, value) in metadata {
        if key.is_empty() || key.len() > MAX_ID_LENGTH {
            return Err(HubError::Validation(format!(
                "metadata key must be 1..={MAX_ID_LENGTH} characters"
            )));
        }
        if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(HubError::Validation(
                "metadata keys may contain only alphanumerics and underscores".to_string(),
            ));
        }
        if value.len() > crate::constants::MAX_METADATA_VALUE_LENGTH {
            return Err(HubError::Validation(format!(
                "metadata value for {key} is too long"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_frames_parse() {
        let validator = FrameValidator::new();

        let frame = validator
            .validate(&json!({
                "type": "identify",
                "agent_id": "a1",
                "token": "tok",
                "name": "worker",
                "capabilities": ["code", {"name": "git"}]
            }))
            .unwrap();
        assert_eq!(frame.kind(), "identify");

        let frame = validator
            .validate(&json!({"type": "heartbeat"}))
            .unwrap();
        assert_eq!(frame.kind(), "heartbeat");
    }

    #[test]
    fn missing_required_field_is_rejected_and_counted() {
        let validator = FrameValidator::new();
        let result = validator.validate(&json!({
            "type": "task_accepted",
            "task_id": "t1"
        }));
        assert!(matches!(result, Err(HubError::Validation(_))));
        assert_eq!(validator.rejected_count(), 1);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let validator = FrameValidator::new();
        assert!(validator.validate(&json!({"type": "exfiltrate"})).is_err());
    }

    #[test]
    fn length_bounds_are_enforced() {
        let validator = FrameValidator::new();
        let long_id = "x".repeat(MAX_ID_LENGTH + 1);
        let result = validator.validate(&json!({
            "type": "task_accepted",
            "task_id": long_id,
            "generation": 1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn state_report_status_must_be_permitted() {
        let validator = FrameValidator::new();
        assert!(validator
            .validate(&json!({"type": "state_report", "status": "working"}))
            .is_ok());
        assert!(validator
            .validate(&json!({"type": "state_report", "status": "on-fire"}))
            .is_err());
    }

    #[test]
    fn negative_generation_is_rejected() {
        let validator = FrameValidator::new();
        let result = validator.validate(&json!({
            "type": "task_accepted",
            "task_id": "t1",
            "generation": -1
        }));
        assert!(result.is_err());
    }

    #[test]
    fn metadata_key_charset_is_restricted() {
        let mut metadata = HashMap::new();
        metadata.insert("ok_key".to_string(), "v".to_string());
        assert!(validate_metadata(&metadata).is_ok());

        metadata.insert("bad key".to_string(), "v".to_string());
        assert!(validate_metadata(&metadata).is_err());
    }
}
