//! Message types exchanged with the automation worker.
//!
//! Outbound: `automation_request` (dispatch) and `bridge_pong` (heartbeat reply).
//! Inbound: terminal responses, progress updates, completion events and
//! connection-level chatter. Framing is the transport's business; these are
//! the JSON bodies only.

use serde::{Deserialize, Serialize};

/// Request body as sent to the worker. Always a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Messages from bridge to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    AutomationRequest {
        request_id: String,
        action: String,
        payload: Payload,
    },

    BridgePong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

/// Terminal response for one request.
///
/// `success == Some(false)` is still a *response*: the worker answered, and the
/// caller decides how to surface the failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl AutomationResponse {
    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(self.error.is_none())
    }
}

/// Heartbeat for a long-running request; extends its soft deadline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub still_working: Option<bool>,
}

impl ProgressUpdate {
    /// Percent if it is a finite value within 0..=100.
    pub fn valid_percent(&self) -> Option<f64> {
        self.percent
            .filter(|p| p.is_finite() && (0.0..=100.0).contains(p))
    }
}

/// Deferred completion notice; resolves a still-pending request when it
/// carries a matching `requestId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AutomationEvent {
    /// Build the response a pending request is resolved with.
    pub fn into_response(self, request_id: String) -> AutomationResponse {
        let result_field = |name: &str| self.result.as_ref().and_then(|r| r.get(name));

        let success = result_field("success").and_then(serde_json::Value::as_bool);
        let message = result_field("message")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .or_else(|| self.message.clone())
            .or_else(|| self.event.clone());
        let error = result_field("error")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        AutomationResponse {
            request_id,
            success,
            message,
            error,
            result: self.result.or(self.payload),
            action: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
}

/// Messages from worker to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    AutomationResponse(AutomationResponse),

    ProgressUpdate(ProgressUpdate),

    AutomationEvent(AutomationEvent),

    BridgeAck(BridgeAck),

    BridgeError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    BridgePing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    BridgePong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    BridgeGoodbye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn automation_request_serializes() {
        let mut payload = Payload::new();
        payload.insert("dir".to_string(), json!("/Game"));
        let req = OutboundMessage::AutomationRequest {
            request_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            action: "list_assets".to_string(),
            payload,
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "type": "automation_request",
          "requestId": "550e8400-e29b-41d4-a716-446655440000",
          "action": "list_assets",
          "payload": {
            "dir": "/Game"
          }
        }
        "#);
    }

    #[test]
    fn bridge_pong_serializes() {
        let pong = OutboundMessage::BridgePong {
            timestamp: Some("2026-01-01T00:00:00Z".to_string()),
        };
        insta::assert_json_snapshot!(pong, @r#"
        {
          "type": "bridge_pong",
          "timestamp": "2026-01-01T00:00:00Z"
        }
        "#);
    }

    #[test]
    fn automation_response_deserializes() {
        let msg = InboundMessage::parse(
            r#"{"type":"automation_response","requestId":"abc","success":true,"result":{"count":2},"extra":1}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::AutomationResponse(resp) => {
                assert_eq!(resp.request_id, "abc");
                assert_eq!(resp.success, Some(true));
                assert_eq!(resp.result, Some(json!({"count": 2})));
                assert!(resp.is_success());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn progress_update_deserializes() {
        let msg = InboundMessage::parse(
            r#"{"type":"progress_update","requestId":"abc","percent":42.5,"message":"compiling","stillWorking":true}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::ProgressUpdate(update) => {
                assert_eq!(update.request_id, "abc");
                assert_eq!(update.valid_percent(), Some(42.5));
                assert_eq!(update.message.as_deref(), Some("compiling"));
                assert_eq!(update.still_working, Some(true));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn out_of_range_percent_is_ignored() {
        let update = ProgressUpdate {
            request_id: "abc".to_string(),
            percent: Some(140.0),
            ..Default::default()
        };
        assert_eq!(update.valid_percent(), None);

        let update = ProgressUpdate {
            percent: Some(f64::NAN),
            ..update
        };
        assert_eq!(update.valid_percent(), None);
    }

    #[test]
    fn goodbye_deserializes() {
        let msg = InboundMessage::parse(r#"{"type":"bridge_goodbye","reason":"editor closing"}"#)
            .unwrap();
        assert_eq!(
            msg,
            InboundMessage::BridgeGoodbye {
                reason: Some("editor closing".to_string()),
                timestamp: None,
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(InboundMessage::parse(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn response_without_success_flag_uses_error_field() {
        let resp = AutomationResponse {
            request_id: "abc".to_string(),
            error: Some("ASSET_NOT_FOUND".to_string()),
            ..Default::default()
        };
        assert!(!resp.is_success());
    }

    #[test]
    fn event_into_response_prefers_result_fields() {
        let event = AutomationEvent {
            request_id: Some("abc".to_string()),
            event: Some("modify_scs_applied".to_string()),
            result: Some(json!({"success": true, "message": "applied"})),
            message: Some("ignored".to_string()),
            ..Default::default()
        };
        let resp = event.into_response("abc".to_string());
        assert_eq!(resp.success, Some(true));
        assert_eq!(resp.message.as_deref(), Some("applied"));
        assert_eq!(resp.result, Some(json!({"success": true, "message": "applied"})));
    }

    #[test]
    fn event_into_response_falls_back_to_payload_and_event_name() {
        let event = AutomationEvent {
            request_id: Some("abc".to_string()),
            event: Some("import_done".to_string()),
            payload: Some(json!({"path": "/Game/Mesh"})),
            ..Default::default()
        };
        let resp = event.into_response("abc".to_string());
        assert_eq!(resp.success, None);
        assert_eq!(resp.message.as_deref(), Some("import_done"));
        assert_eq!(resp.result, Some(json!({"path": "/Game/Mesh"})));
    }
}
