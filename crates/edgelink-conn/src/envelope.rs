//! The websocket message envelope.
//!
//! One JSON envelope per frame: a method, addressing, a correlation block
//! and a body. Responses reuse the request's method and correlation id with
//! `isResponse` set.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Connection lifecycle, published to subscribers on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Closed,
    /// A dial is in progress.
    Connecting,
    /// The websocket is up.
    Active,
}

/// Correlation block of an envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseParams {
    /// Correlation id tying a response to its request.
    #[serde(default)]
    pub request_id: String,
    /// True on response frames.
    #[serde(default)]
    pub is_response: bool,
}

/// A websocket frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope {
    /// Method name.
    pub method: String,
    /// Sender id.
    #[serde(default)]
    pub sender_id: String,
    /// Recipient id.
    #[serde(default)]
    pub recipient_id: String,
    /// Correlation block.
    #[serde(default)]
    pub response_params: ResponseParams,
    /// HTTP-like status on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Failure description on error responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Method-specific body.
    #[serde(default)]
    pub body: Value,
}

impl WsEnvelope {
    /// Build an outbound request with a fresh correlation id.
    #[must_use]
    pub fn request(method: &str, from: &str, to: &str, body: Value) -> Self {
        Self {
            method: method.to_string(),
            sender_id: from.to_string(),
            recipient_id: to.to_string(),
            response_params: ResponseParams {
                request_id: Uuid::new_v4().to_string(),
                is_response: false,
            },
            status_code: None,
            error_message: None,
            body,
        }
    }

    /// Build the success response to a request.
    #[must_use]
    pub fn response_to(source: &Self, body: Value) -> Self {
        Self {
            method: source.method.clone(),
            sender_id: source.recipient_id.clone(),
            recipient_id: source.sender_id.clone(),
            response_params: ResponseParams {
                request_id: source.response_params.request_id.clone(),
                is_response: true,
            },
            status_code: Some(200),
            error_message: None,
            body,
        }
    }

    /// Build an error response to a request.
    #[must_use]
    pub fn error_response_to(source: &Self, status_code: u16, message: &str) -> Self {
        Self {
            method: source.method.clone(),
            sender_id: source.recipient_id.clone(),
            recipient_id: source.sender_id.clone(),
            response_params: ResponseParams {
                request_id: source.response_params.request_id.clone(),
                is_response: true,
            },
            status_code: Some(status_code),
            error_message: Some(message.to_string()),
            body: Value::Null,
        }
    }

    /// True on response frames.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.response_params.is_response
    }

    /// True when a response carries an error status.
    #[must_use]
    pub fn is_error_response(&self) -> bool {
        self.error_message.is_some() || self.status_code.is_some_and(|code| code >= 400)
    }

    /// The error message, or a placeholder when absent.
    #[must_use]
    pub fn error(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| format!("status {}", self.status_code.unwrap_or_default()))
    }
}
