// SPDX-License-Identifier: MIT OR Apache-2.0
//! Failure normalization: every raw failure becomes exactly one [`TypedError`].

use crate::{ErrorCode, TypedError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Raw failure shapes
// ---------------------------------------------------------------------------

/// A single field rejected by schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// Field path (e.g. `"email"` or `"address.city"`).
    pub field: String,
    /// Validator message.
    pub message: String,
    /// The offending value, when the validator reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_value: Option<serde_json::Value>,
}

impl FieldViolation {
    /// Create a violation without a recorded value.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            rejected_value: None,
        }
    }
}

/// Bearer-token verification failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenFailure {
    /// Malformed token or bad signature.
    Invalid {
        /// Verifier's reason, kept for logs.
        reason: String,
    },
    /// Token was valid but is past its expiry.
    Expired,
}

/// Multipart upload failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadFailure {
    /// A file exceeded the per-file byte limit.
    FileTooLarge {
        /// Form field carrying the file.
        field: String,
        /// Configured limit in bytes.
        limit_bytes: u64,
    },
    /// More files than allowed.
    TooManyFiles {
        /// Form field carrying the files.
        field: String,
        /// Configured maximum count.
        limit: u32,
    },
    /// A file arrived under a field name the endpoint does not accept.
    UnexpectedField {
        /// The unexpected field name.
        field: String,
    },
}

/// Anything a collaborator may raise while handling a request.
///
/// Inner layers return these (or anything convertible into them) and never
/// format client responses themselves; [`normalize`] runs once at the
/// boundary.
#[derive(Debug)]
pub enum Failure {
    /// Already normalized.
    Typed(TypedError),
    /// Schema validation reported one or more bad fields.
    FieldValidation(Vec<FieldViolation>),
    /// A value could not be cast to the expected type (e.g. a malformed id).
    Cast {
        /// Field or path parameter being cast.
        field: String,
        /// Raw value.
        value: String,
        /// Target type name.
        expected: String,
    },
    /// A unique index rejected a write. `message` is the driver's text.
    DuplicateKey {
        /// Driver message, used to recover the offending field.
        message: String,
    },
    /// A storage operation exceeded its deadline.
    StorageTimeout {
        /// Operation that timed out.
        operation: String,
    },
    /// The storage transport failed (connection refused, reset, no primary).
    StorageTransport {
        /// Driver message.
        message: String,
    },
    /// Bearer token rejected.
    Token(TokenFailure),
    /// Upload limits violated.
    Upload(UploadFailure),
    /// A failure that already carries an HTTP status.
    Status {
        /// HTTP status.
        status: u16,
        /// Accompanying message.
        message: String,
    },
    /// Anything else.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Failure {
    /// Wrap an arbitrary error.
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }

    /// A failure with an explicit status code.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Typed(err) => write!(f, "{err}"),
            Self::FieldValidation(v) => write!(f, "validation failed on {} field(s)", v.len()),
            Self::Cast {
                field,
                value,
                expected,
            } => write!(f, "cannot cast {field}={value:?} to {expected}"),
            Self::DuplicateKey { message } => write!(f, "duplicate key: {message}"),
            Self::StorageTimeout { operation } => write!(f, "storage timeout during {operation}"),
            Self::StorageTransport { message } => write!(f, "storage transport error: {message}"),
            Self::Token(TokenFailure::Invalid { reason }) => write!(f, "invalid token: {reason}"),
            Self::Token(TokenFailure::Expired) => f.write_str("token expired"),
            Self::Upload(u) => write!(f, "upload rejected: {u:?}"),
            Self::Status { status, message } => write!(f, "{status}: {message}"),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}

impl From<TypedError> for Failure {
    fn from(err: TypedError) -> Self {
        Self::Typed(err)
    }
}

impl From<TokenFailure> for Failure {
    fn from(err: TokenFailure) -> Self {
        Self::Token(err)
    }
}

impl From<UploadFailure> for Failure {
    fn from(err: UploadFailure) -> Self {
        Self::Upload(err)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TypedError>() {
            Ok(typed) => Self::Typed(typed),
            Err(other) => Self::Other(other.into()),
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Convert any failure into exactly one [`TypedError`].
///
/// Rules are checked in order and the first match wins:
///
/// 1. already typed: returned unchanged
/// 2. field validation: `Validation`/400 with one context entry per field
/// 3. cast failure: `Validation`/400 with a single field entry
/// 4. duplicate key: `Conflict`/409 `DB_DUPLICATE_KEY`, field recovered from the driver text
/// 5. storage timeout/transport: `Storage`/500, retryable
/// 6. token invalid/expired: `Auth`/401
/// 7. upload limits: `Validation`/400, field scoped
/// 8. explicit 401/403/404 status: `Auth` or `NotFound`
/// 9. anything else: `Internal`/500, original kept only as the cause
pub fn normalize(failure: impl Into<Failure>) -> TypedError {
    match failure.into() {
        Failure::Typed(err) => err,

        Failure::FieldValidation(violations) => {
            let message = format!("validation failed for {} field(s)", violations.len());
            violations.into_iter().fold(
                TypedError::new(ErrorCode::ValidationFailed, message),
                |err, v| match v.rejected_value {
                    Some(value) => err.with_field_value(v.field, v.message, value),
                    None => err.with_field(v.field, v.message),
                },
            )
        }

        Failure::Cast {
            field,
            value,
            expected,
        } => TypedError::new(
            ErrorCode::InvalidId,
            format!("cannot cast {field}={value:?} to {expected}"),
        )
        .with_field_value(field, format!("must be a valid {expected}"), value),

        Failure::DuplicateKey { message } => {
            let err = TypedError::new(ErrorCode::DbDuplicateKey, message.clone());
            match duplicate_key_field(&message) {
                Some((field, Some(value))) => {
                    let msg = format!("{field} already exists");
                    err.with_field_value(field, msg, value)
                }
                Some((field, None)) => {
                    let msg = format!("{field} already exists");
                    err.with_field(field, msg)
                }
                None => err,
            }
        }

        Failure::StorageTimeout { operation } => TypedError::new(
            ErrorCode::DbOperationTimeout,
            format!("storage operation timed out: {operation}"),
        )
        .with_detail("operation", operation),

        Failure::StorageTransport { message } => {
            TypedError::new(ErrorCode::DbConnectionFailed, message)
        }

        Failure::Token(TokenFailure::Invalid { reason }) => {
            TypedError::new(ErrorCode::InvalidToken, format!("invalid token: {reason}"))
        }
        Failure::Token(TokenFailure::Expired) => {
            TypedError::new(ErrorCode::TokenExpired, "token expired")
        }

        Failure::Upload(UploadFailure::FileTooLarge { field, limit_bytes }) => TypedError::new(
            ErrorCode::FileTooLarge,
            format!("file in '{field}' exceeds {limit_bytes} bytes"),
        )
        .with_field(field, format!("file must not exceed {limit_bytes} bytes")),
        Failure::Upload(UploadFailure::TooManyFiles { field, limit }) => TypedError::new(
            ErrorCode::TooManyFiles,
            format!("more than {limit} files in '{field}'"),
        )
        .with_field(field, format!("at most {limit} files are allowed")),
        Failure::Upload(UploadFailure::UnexpectedField { field }) => TypedError::new(
            ErrorCode::UnexpectedFileField,
            format!("unexpected file field '{field}'"),
        )
        .with_field(field, "this field does not accept files"),

        Failure::Status { status: 401, message } => {
            TypedError::new(ErrorCode::AuthenticationFailed, message)
        }
        Failure::Status { status: 403, message } => TypedError::new(ErrorCode::Forbidden, message),
        Failure::Status { status: 404, message } => TypedError::new(ErrorCode::NotFound, message),
        Failure::Status { status, message } => {
            TypedError::new(ErrorCode::InternalError, format!("{status}: {message}"))
                .with_detail("original_status", status)
        }

        Failure::Other(err) => match err.downcast::<TypedError>() {
            Ok(typed) => *typed,
            Err(err) => TypedError::new(ErrorCode::InternalError, err.to_string())
                .with_boxed_source(err),
        },
    }
}

static DUP_KEY_DOC: LazyLock<Regex> = LazyLock::new(|| {
    // The value is either one quoted string or a bare token; compound keys
    // stop at the first top-level comma.
    Regex::new(
        r#"dup key:\s*\{\s*"?([A-Za-z0-9_.$]+)"?\s*:\s*("(?:[^"\\]|\\.)*"|[^,}]*?)\s*[,}]"#,
    )
    .expect("dup key pattern is valid")
});

static DUP_KEY_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"index:\s*([A-Za-z0-9_.$]+?)_-?1\b").expect("index pattern is valid")
});

/// Recover the offending field (and value, when printed) from a driver's
/// duplicate-key message such as
/// `E11000 duplicate key error collection: folio.admins index: username_1 dup key: { username: "alice" }`.
fn duplicate_key_field(message: &str) -> Option<(String, Option<String>)> {
    if let Some(caps) = DUP_KEY_DOC.captures(message) {
        let field = caps[1].to_string();
        let raw = caps[2].trim();
        let value = if raw.is_empty() {
            None
        } else {
            Some(raw.trim_matches('"').to_string())
        };
        return Some((field, value));
    }
    DUP_KEY_INDEX
        .captures(message)
        .map(|caps| (caps[1].to_string(), None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_key_field_from_document() {
        let msg = r#"E11000 duplicate key error collection: folio.admins index: username_1 dup key: { username: "alice" }"#;
        assert_eq!(
            duplicate_key_field(msg),
            Some(("username".into(), Some("alice".into())))
        );
    }

    #[test]
    fn dup_key_compound_index_keeps_first_value() {
        let msg = r#"E11000 duplicate key error collection: folio.contacts index: email_1_site_1 dup key: { email: "a@b.c", site: "x" }"#;
        assert_eq!(
            duplicate_key_field(msg),
            Some(("email".into(), Some("a@b.c".into())))
        );
    }

    #[test]
    fn dup_key_quoted_value_may_contain_commas() {
        let msg = r#"E11000 duplicate key error index: title_1 dup key: { title: "Hello, world" }"#;
        assert_eq!(
            duplicate_key_field(msg),
            Some(("title".into(), Some("Hello, world".into())))
        );
    }

    #[test]
    fn dup_key_field_from_index_only() {
        let msg = "E11000 duplicate key error collection: folio.contacts index: email_1";
        assert_eq!(duplicate_key_field(msg), Some(("email".into(), None)));
    }

    #[test]
    fn dup_key_field_descending_index() {
        let msg = "E11000 duplicate key error index: slug_-1";
        assert_eq!(duplicate_key_field(msg), Some(("slug".into(), None)));
    }

    #[test]
    fn dup_key_field_unrecognised() {
        assert_eq!(duplicate_key_field("something else entirely"), None);
    }

    #[test]
    fn boxed_typed_error_passes_through() {
        let boxed: Box<dyn std::error::Error + Send + Sync> =
            Box::new(TypedError::not_found("project"));
        let err = normalize(Failure::Other(boxed));
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn anyhow_wrapping_typed_error_passes_through() {
        let err = normalize(anyhow::Error::new(TypedError::business_rule("closed")));
        assert_eq!(err.code(), ErrorCode::BusinessRuleViolation);
    }

    #[test]
    fn unmapped_status_is_internal() {
        let err = normalize(Failure::status(418, "teapot"));
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.details()["original_status"], serde_json::json!(418));
    }
}
