use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Topic a review request is broadcast on.
pub const HITL_REQUEST_TOPIC: &str = "hitl_request";
/// Topic a reviewer answers on.
pub const HITL_RESPONSE_TOPIC: &str = "hitl_response";
/// Topic used to tell a reviewer that its answer could not be processed.
pub const HITL_ERROR_TOPIC: &str = "hitl_error";
/// Node id used when the caller did not name the node behind a checkpoint.
pub const UNSPECIFIED_NODE: &str = "N/A";

/// Outbound review request, pushed to every connected reviewer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HitlRequest {
    pub checkpoint_name: String,
    pub context_message: String,
    pub data_for_review: Option<Value>,
    pub node_id: String,
    pub current_attempt: u32,
    pub request_id: String, // sole correlation key
    pub timestamp: DateTime<Utc>, // observability only
}

/// Inbound decision. Every field is optional on the wire; a decision without
/// a `request_id` cannot be correlated and is dropped by the broker.
///
/// Fields are read leniently: a non-string `request_id`, `action` or
/// `modification_instructions` is kept as its JSON text, and a non-string
/// `checkpoint_name` echo is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(default)]
pub struct HitlResponse {
    #[serde(deserialize_with = "lenient_text")]
    #[schemars(with = "Option<String>")]
    pub request_id: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    #[schemars(with = "Option<String>")]
    pub action: Option<String>,
    #[serde(deserialize_with = "lenient_text")]
    #[schemars(with = "Option<String>")]
    pub modification_instructions: Option<String>,
    #[serde(deserialize_with = "string_only")]
    #[schemars(with = "Option<String>")]
    pub checkpoint_name: Option<String>, // echo of the request
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

fn string_only<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        _ => None,
    })
}

impl HitlResponse {
    pub fn new(request_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            action: Some(action.into()),
            ..Default::default()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.modification_instructions = Some(instructions.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_name: impl Into<String>) -> Self {
        self.checkpoint_name = Some(checkpoint_name.into());
        self
    }
}

/// The actions a reviewer UI can send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReviewAction {
    Approve,
    Modify,
    Abort,
}

/// Terminal result of a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, AsRefStr)]
#[serde(tag = "user_choice", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewOutcome {
    Approved {
        message: String,
    },
    RequestModification {
        message: String,
        modification_instructions: Option<String>,
    },
    Aborted {
        message: String,
    },
    /// No decision before the deadline. Never an approval.
    Timeout {
        message: String,
    },
    /// No transport was registered, so there was nobody to ask.
    TransportUnavailable {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ReviewOutcome {
    /// Translate a reviewer's action into an outcome. Unknown or missing
    /// actions fall back to approval.
    pub fn from_decision(
        action: Option<&str>,
        modification_instructions: Option<String>,
        checkpoint_name: &str,
    ) -> Self {
        match action.map(str::parse::<ReviewAction>) {
            Some(Ok(ReviewAction::Approve)) => ReviewOutcome::Approved {
                message: format!("User approved checkpoint '{}'", checkpoint_name),
            },
            Some(Ok(ReviewAction::Modify)) => ReviewOutcome::RequestModification {
                message: format!("User requested modification for '{}'", checkpoint_name),
                modification_instructions,
            },
            Some(Ok(ReviewAction::Abort)) => ReviewOutcome::Aborted {
                message: format!("User aborted checkpoint '{}'", checkpoint_name),
            },
            _ => ReviewOutcome::Approved {
                message: format!(
                    "Unknown action '{}', defaulting to approved",
                    action.unwrap_or("<missing>")
                ),
            },
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ReviewOutcome::Approved { message }
            | ReviewOutcome::RequestModification { message, .. }
            | ReviewOutcome::Aborted { message }
            | ReviewOutcome::Timeout { message }
            | ReviewOutcome::TransportUnavailable { message }
            | ReviewOutcome::Error { message } => message,
        }
    }

    /// `true` when the pipeline may proceed unchanged.
    pub fn is_approval(&self) -> bool {
        matches!(
            self,
            ReviewOutcome::Approved { .. } | ReviewOutcome::TransportUnavailable { .. }
        )
    }

    pub fn modification_instructions(&self) -> Option<&str> {
        match self {
            ReviewOutcome::RequestModification {
                modification_instructions,
                ..
            } => modification_instructions.as_deref(),
            _ => None,
        }
    }
}

/// Frame exchanged over the WebSocket: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WsEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WsEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_translation_table() {
        let approved = ReviewOutcome::from_decision(Some("approve"), None, "budget_check");
        assert_eq!(
            approved,
            ReviewOutcome::Approved {
                message: "User approved checkpoint 'budget_check'".into()
            }
        );

        let modify = ReviewOutcome::from_decision(
            Some("modify"),
            Some("cap it at $300".into()),
            "budget_check",
        );
        assert_eq!(
            modify.message(),
            "User requested modification for 'budget_check'"
        );
        assert_eq!(modify.modification_instructions(), Some("cap it at $300"));

        let abort = ReviewOutcome::from_decision(Some("abort"), None, "budget_check");
        assert_eq!(abort.message(), "User aborted checkpoint 'budget_check'");
        assert!(!abort.is_approval());
    }

    #[test]
    fn test_unknown_or_missing_action_defaults_to_approved() {
        let unknown = ReviewOutcome::from_decision(Some("shrug"), None, "x");
        assert_eq!(
            unknown,
            ReviewOutcome::Approved {
                message: "Unknown action 'shrug', defaulting to approved".into()
            }
        );

        let missing = ReviewOutcome::from_decision(None, None, "x");
        assert_eq!(
            missing.message(),
            "Unknown action '<missing>', defaulting to approved"
        );
        assert!(missing.is_approval());
    }

    #[test]
    fn test_action_parse_is_case_sensitive() {
        // the UI sends lowercase verbs; anything else is unknown
        let outcome = ReviewOutcome::from_decision(Some("APPROVE"), None, "x");
        assert_eq!(
            outcome.message(),
            "Unknown action 'APPROVE', defaulting to approved"
        );
    }

    #[test]
    fn test_timeout_is_not_an_approval() {
        let timeout = ReviewOutcome::Timeout {
            message: "HITL request timed out after 1 seconds".into(),
        };
        assert!(!timeout.is_approval());
        assert!(
            ReviewOutcome::TransportUnavailable {
                message: "auto".into()
            }
            .is_approval()
        );
    }

    #[test]
    fn test_outcome_wire_shape() {
        let outcome = ReviewOutcome::RequestModification {
            message: "m".into(),
            modification_instructions: Some("fix".into()),
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            v,
            json!({
                "user_choice": "request_modification",
                "message": "m",
                "modification_instructions": "fix"
            })
        );
        assert_eq!(outcome.as_ref(), "request_modification");
        assert_eq!(
            ReviewOutcome::TransportUnavailable { message: "".into() }.as_ref(),
            "transport_unavailable"
        );
    }

    #[test]
    fn test_request_wire_field_names() {
        let req = HitlRequest {
            checkpoint_name: "budget_check".into(),
            context_message: "approve $500 spend".into(),
            data_for_review: None,
            node_id: UNSPECIFIED_NODE.into(),
            current_attempt: 1,
            request_id: "abc".into(),
            timestamp: Utc::now(),
        };
        let v = serde_json::to_value(&req).unwrap();
        for key in [
            "checkpoint_name",
            "context_message",
            "data_for_review",
            "node_id",
            "current_attempt",
            "request_id",
            "timestamp",
        ] {
            assert!(v.get(key).is_some(), "missing wire field {key}");
        }
        assert_eq!(v["data_for_review"], Value::Null);
    }

    #[test]
    fn test_response_tolerates_missing_fields() {
        let rsp: HitlResponse = serde_json::from_value(json!({ "action": "approve" })).unwrap();
        assert_eq!(rsp.request_id, None);
        assert_eq!(rsp.action.as_deref(), Some("approve"));

        let rsp: HitlResponse = serde_json::from_value(json!({
            "request_id": "r1",
            "action": "modify",
            "modification_instructions": "shorter",
            "checkpoint_name": "PlanReview",
            "extra": true
        }))
        .unwrap();
        assert_eq!(
            rsp,
            HitlResponse::new("r1", "modify")
                .with_instructions("shorter")
                .with_checkpoint("PlanReview")
        );
    }

    #[test]
    fn test_response_reads_mistyped_fields_leniently() {
        let rsp: HitlResponse = serde_json::from_value(json!({
            "request_id": "r1",
            "action": 1,
            "modification_instructions": { "cap": 300 },
            "checkpoint_name": 7
        }))
        .unwrap();
        assert_eq!(rsp.request_id.as_deref(), Some("r1"));
        assert_eq!(rsp.action.as_deref(), Some("1"));
        assert_eq!(rsp.modification_instructions.as_deref(), Some(r#"{"cap":300}"#));
        assert_eq!(rsp.checkpoint_name, None);

        let rsp: HitlResponse =
            serde_json::from_value(json!({ "request_id": null, "action": null })).unwrap();
        assert_eq!(rsp, HitlResponse::default());
    }

    #[test]
    fn test_ws_event_data_defaults_to_null() {
        let ev: WsEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(ev, WsEvent::new("ping", Value::Null));
    }
}
