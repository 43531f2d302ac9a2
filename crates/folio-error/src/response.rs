// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client-visible error payloads.
//!
//! The body shape is fixed:
//!
//! ```json
//! {
//!   "success": false,
//!   "error": { "message": "...", "code": "...", "type": "...",
//!              "retryable": true, "retryAfter": 5, "validation": [...] },
//!   "timestamp": "2026-01-01T00:00:00Z",
//!   "requestId": "..."
//! }
//! ```

use crate::{ErrorCode, ErrorKind, TypedError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of cause-chain lines attached in debug mode.
pub const MAX_DEBUG_TRACE_LINES: usize = 10;

/// Whether internal detail may be exposed to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Canned messages only.
    #[default]
    Production,
    /// Also attach the original message, details and a truncated cause chain.
    Debug,
}

/// One entry of the `validation` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEntry {
    /// Offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
    /// Rejected value; only emitted in debug mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Internal detail attached in [`ResponseMode::Debug`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    /// The error's internal message.
    pub original_message: String,
    /// Cause chain, outermost first, at most [`MAX_DEBUG_TRACE_LINES`] lines.
    pub stack: Vec<String>,
    /// Diagnostic details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// The `error` object of an [`ErrorResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Canned user-facing message for `code`.
    pub message: String,
    /// Stable machine code.
    pub code: ErrorCode,
    /// Failure kind.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Present (and `true`) only for retryable errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Suggested back-off in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u32>,
    /// Per-field problems, in the order they were reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<Vec<ValidationEntry>>,
    /// Internal detail, debug mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

/// Complete error response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    /// Error description.
    pub error: ErrorBody,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
    /// Per-request identifier for correlating with server logs.
    pub request_id: String,
}

impl ErrorResponse {
    /// Format a normalized error for the client.
    pub fn from_error(err: &TypedError, request_id: impl Into<String>, mode: ResponseMode) -> Self {
        let debug = mode == ResponseMode::Debug;

        let validation = if err.context().is_empty() {
            None
        } else {
            Some(
                err.context()
                    .iter()
                    .map(|f| ValidationEntry {
                        field: f.field.clone(),
                        message: f.message.clone(),
                        value: if debug { f.rejected_value.clone() } else { None },
                    })
                    .collect(),
            )
        };

        let debug_info = debug.then(|| {
            let mut stack = err.cause_chain();
            stack.truncate(MAX_DEBUG_TRACE_LINES);
            DebugInfo {
                original_message: err.message().to_string(),
                stack,
                details: err.details().clone(),
            }
        });

        Self {
            success: false,
            error: ErrorBody {
                message: err.user_message().to_string(),
                code: err.code(),
                kind: err.kind(),
                retryable: err.is_retryable().then_some(true),
                retry_after: err.retry_after_secs(),
                validation,
                debug: debug_info,
            },
            timestamp: Utc::now(),
            request_id: request_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Failure, normalize};
    use std::io;

    #[test]
    fn production_uses_canned_message() {
        let err = TypedError::internal("connection string mongodb://admin:hunter2@db leaked");
        let resp = ErrorResponse::from_error(&err, "req-1", ResponseMode::Production);
        assert_eq!(resp.error.message, "Something went wrong. Please try again later.");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(resp.error.debug.is_none());
    }

    #[test]
    fn shape_has_fixed_top_level_keys() {
        let err = TypedError::not_found("service");
        let resp = ErrorResponse::from_error(&err, "req-2", ResponseMode::Production);
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], serde_json::json!(false));
        assert_eq!(v["requestId"], serde_json::json!("req-2"));
        assert!(v["timestamp"].is_string());
        assert_eq!(v["error"]["code"], serde_json::json!("NOT_FOUND"));
        assert_eq!(v["error"]["type"], serde_json::json!("not_found"));
        assert!(v["error"].get("retryable").is_none());
        assert!(v["error"].get("validation").is_none());
    }

    #[test]
    fn retryable_fields_present_only_when_retryable() {
        let err = TypedError::new(ErrorCode::DbConnectionFailed, "down");
        let v = serde_json::to_value(ErrorResponse::from_error(
            &err,
            "r",
            ResponseMode::Production,
        ))
        .unwrap();
        assert_eq!(v["error"]["retryable"], serde_json::json!(true));
        assert_eq!(v["error"]["retryAfter"], serde_json::json!(5));
    }

    #[test]
    fn rejected_values_hidden_in_production() {
        let err = TypedError::new(ErrorCode::ValidationFailed, "bad")
            .with_field_value("password", "too short", "abc");
        let prod = ErrorResponse::from_error(&err, "r", ResponseMode::Production);
        assert!(prod.error.validation.as_ref().unwrap()[0].value.is_none());
        let dbg = ErrorResponse::from_error(&err, "r", ResponseMode::Debug);
        assert_eq!(
            dbg.error.validation.as_ref().unwrap()[0].value,
            Some(serde_json::json!("abc"))
        );
    }

    #[test]
    fn debug_mode_attaches_original_message_and_truncated_chain() {
        let err = normalize(Failure::other(io::Error::other("socket closed")));
        let resp = ErrorResponse::from_error(&err, "r", ResponseMode::Debug);
        let debug = resp.error.debug.unwrap();
        assert_eq!(debug.original_message, "socket closed");
        assert_eq!(debug.stack, vec!["socket closed".to_string()]);
        assert!(debug.stack.len() <= MAX_DEBUG_TRACE_LINES);
        // The client message is still the canned one.
        assert_eq!(resp.error.message, crate::user_message(ErrorCode::InternalError));
    }
}
