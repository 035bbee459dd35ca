//! Request/response envelope used on the bus.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of a bus response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqStatus {
    /// The request succeeded.
    Ok,
    /// The request payload was invalid.
    BadRequest,
    /// The handler failed.
    InternalError,
}

/// A bus response envelope; extra fields ride alongside the status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqResponse {
    /// Response status.
    pub status: MqStatus,
    /// Failure description for non-ok statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Handler-specific response fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MqResponse {
    /// A successful response.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: MqStatus::Ok,
            error_message: None,
            extra: Map::new(),
        }
    }

    /// A bad-request response.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: MqStatus::BadRequest,
            error_message: Some(message.into()),
            extra: Map::new(),
        }
    }

    /// An internal-error response.
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: MqStatus::InternalError,
            error_message: Some(message.into()),
            extra: Map::new(),
        }
    }

    /// Attach a handler-specific field.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// True for non-ok statuses.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status != MqStatus::Ok
    }

    /// The error message, or a placeholder when absent.
    #[must_use]
    pub fn error(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_response_wire_shape() {
        let json = serde_json::to_value(MqResponse::ok()).unwrap();
        assert_eq!(json, json!({"status": "ok"}));
    }

    #[test]
    fn extra_fields_flatten() {
        let response = MqResponse::ok().with_field("config", json!({"app": {}}));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["config"], json!({"app": {}}));
    }

    #[test]
    fn error_detection() {
        let response: MqResponse =
            serde_json::from_value(json!({"status": "internal_error", "error_message": "nope"}))
                .unwrap();
        assert!(response.is_error());
        assert_eq!(response.error(), "nope");
        assert!(!MqResponse::ok().is_error());
    }
}
