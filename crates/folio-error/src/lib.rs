// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closed error taxonomy for the Folio backend.
//!
//! Every failure that reaches a client is a [`TypedError`]: one of eight
//! [`ErrorKind`]s, a stable [`ErrorCode`], an HTTP status, a retryability
//! flag, optional per-field context and an optional wrapped cause that is
//! kept for logging only.
//!
//! Raw failures raised by collaborators are described by [`Failure`] and
//! turned into a [`TypedError`] by [`normalize`]. [`ErrorResponse`] renders
//! the client-visible JSON body.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Conversion of raw failures into [`TypedError`]s.
pub mod normalize;
/// Client-visible error payloads.
pub mod response;

pub use normalize::{Failure, FieldViolation, TokenFailure, UploadFailure, normalize};
pub use response::{ErrorBody, ErrorResponse, ResponseMode, ValidationEntry};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The closed set of failure kinds. Every failure normalizes into exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input failed schema, field, identifier or upload validation.
    Validation,
    /// Missing, invalid or expired credentials, or insufficient permission.
    Auth,
    /// The addressed resource does not exist.
    NotFound,
    /// The write collides with existing state (duplicate key).
    Conflict,
    /// The document store is unreachable, slow, or rejected the operation.
    Storage,
    /// A third-party dependency (mail relay, analytics) failed.
    ExternalService,
    /// The request is well-formed but violates a business rule.
    BusinessRule,
    /// Anything not covered above.
    Internal,
}

impl ErrorKind {
    /// HTTP status implied by the kind when the code does not refine it.
    pub fn default_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Storage => 500,
            Self::ExternalService => 502,
            Self::BusinessRule => 422,
            Self::Internal => 500,
        }
    }

    /// Stable lowercase name, also used as the `type` field in responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Storage => "storage",
            Self::ExternalService => "external_service",
            Self::BusinessRule => "business_rule",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Serialises to `SCREAMING_SNAKE_CASE`; the strings are part of the public
/// API contract with clients and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// One or more fields failed validation.
    ValidationFailed,
    /// An identifier or typed value could not be parsed.
    InvalidId,
    /// An uploaded file exceeds the size limit.
    FileTooLarge,
    /// Too many files in one upload.
    TooManyFiles,
    /// A file arrived under a field name the endpoint does not accept.
    UnexpectedFileField,

    // -- Auth --
    /// Credentials were rejected.
    AuthenticationFailed,
    /// The bearer token is malformed or its signature does not verify.
    InvalidToken,
    /// The bearer token is past its expiry.
    TokenExpired,
    /// Authenticated, but not allowed to do this.
    Forbidden,

    // -- NotFound --
    /// Resource does not exist.
    NotFound,

    // -- Conflict --
    /// A unique index rejected the write.
    DbDuplicateKey,

    // -- Storage --
    /// No usable connection to the document store.
    DbConnectionFailed,
    /// A storage operation exceeded its deadline.
    DbOperationTimeout,
    /// The store rejected an operation for another reason.
    DbOperationFailed,

    // -- ExternalService --
    /// A third-party service failed.
    ExternalServiceError,
    /// The mail relay refused or failed to deliver.
    EmailSendFailed,

    // -- BusinessRule --
    /// A domain rule rejected the request.
    BusinessRuleViolation,
    /// The caller exceeded a request quota.
    RateLimited,

    // -- Internal --
    /// The surrounding request was cancelled before the operation finished.
    OperationCancelled,
    /// Catch-all for unexpected failures.
    InternalError,
}

impl ErrorCode {
    /// The [`ErrorKind`] this code belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed
            | Self::InvalidId
            | Self::FileTooLarge
            | Self::TooManyFiles
            | Self::UnexpectedFileField => ErrorKind::Validation,

            Self::AuthenticationFailed
            | Self::InvalidToken
            | Self::TokenExpired
            | Self::Forbidden => ErrorKind::Auth,

            Self::NotFound => ErrorKind::NotFound,

            Self::DbDuplicateKey => ErrorKind::Conflict,

            Self::DbConnectionFailed | Self::DbOperationTimeout | Self::DbOperationFailed => {
                ErrorKind::Storage
            }

            Self::ExternalServiceError | Self::EmailSendFailed => ErrorKind::ExternalService,

            Self::BusinessRuleViolation | Self::RateLimited => ErrorKind::BusinessRule,

            Self::OperationCancelled | Self::InternalError => ErrorKind::Internal,
        }
    }

    /// HTTP status for this code. Falls back to the kind's status.
    pub fn default_status(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::RateLimited => 429,
            Self::OperationCancelled => 503,
            other => other.kind().default_status(),
        }
    }

    /// Whether a failure with this code is transient by default.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::DbConnectionFailed
                | Self::DbOperationTimeout
                | Self::ExternalServiceError
                | Self::EmailSendFailed
                | Self::RateLimited
        )
    }

    /// Suggested client back-off for retryable codes.
    pub fn default_retry_after(&self) -> Option<u32> {
        match self {
            Self::DbConnectionFailed => Some(5),
            Self::DbOperationTimeout => Some(2),
            Self::ExternalServiceError | Self::EmailSendFailed => Some(30),
            Self::RateLimited => Some(60),
            _ => None,
        }
    }

    /// Stable `&'static str` representation (e.g. `"DB_DUPLICATE_KEY"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidId => "INVALID_ID",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::TooManyFiles => "TOO_MANY_FILES",
            Self::UnexpectedFileField => "UNEXPECTED_FILE_FIELD",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::DbDuplicateKey => "DB_DUPLICATE_KEY",
            Self::DbConnectionFailed => "DB_CONNECTION_FAILED",
            Self::DbOperationTimeout => "DB_OPERATION_TIMEOUT",
            Self::DbOperationFailed => "DB_OPERATION_FAILED",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::EmailSendFailed => "EMAIL_SEND_FAILED",
            Self::BusinessRuleViolation => "BUSINESS_RULE_VIOLATION",
            Self::RateLimited => "RATE_LIMITED",
            Self::OperationCancelled => "OPERATION_CANCELLED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canned user-facing message for a code.
///
/// This is the only text a production client ever sees for a failure. Auth
/// messages deliberately do not reveal whether the account exists.
pub fn user_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::ValidationFailed => "The submitted data is invalid. Please check the listed fields.",
        ErrorCode::InvalidId => "The supplied identifier is not valid.",
        ErrorCode::FileTooLarge => "The uploaded file is too large.",
        ErrorCode::TooManyFiles => "Too many files were uploaded at once.",
        ErrorCode::UnexpectedFileField => "A file was submitted in an unexpected field.",
        ErrorCode::AuthenticationFailed => "Invalid credentials.",
        ErrorCode::InvalidToken => "Your session is invalid. Please sign in again.",
        ErrorCode::TokenExpired => "Your session has expired. Please sign in again.",
        ErrorCode::Forbidden => "You do not have permission to perform this action.",
        ErrorCode::NotFound => "The requested resource was not found.",
        ErrorCode::DbDuplicateKey => "A record with this value already exists.",
        ErrorCode::DbConnectionFailed => {
            "The service is temporarily unavailable. Please try again shortly."
        }
        ErrorCode::DbOperationTimeout => "The request took too long to complete. Please try again.",
        ErrorCode::DbOperationFailed => "A storage error occurred. Please try again later.",
        ErrorCode::ExternalServiceError => {
            "A dependent service is unavailable. Please try again later."
        }
        ErrorCode::EmailSendFailed => "We could not send the email. Please try again later.",
        ErrorCode::BusinessRuleViolation => "The request could not be completed.",
        ErrorCode::RateLimited => "Too many requests. Please slow down and try again later.",
        ErrorCode::OperationCancelled => "The request was cancelled before it completed.",
        ErrorCode::InternalError => "Something went wrong. Please try again later.",
    }
}

// ---------------------------------------------------------------------------
// FieldDetail
// ---------------------------------------------------------------------------

/// One entry of a [`TypedError`]'s ordered field context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDetail {
    /// Name of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
    /// The value that was rejected, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_value: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// TypedError
// ---------------------------------------------------------------------------

/// A normalized failure.
///
/// Built once with the fluent methods below, then only read. The wrapped
/// cause is kept for server-side logs and is never part of a client payload.
///
/// ```
/// use folio_error::{ErrorCode, ErrorKind, TypedError};
///
/// let err = TypedError::new(ErrorCode::ValidationFailed, "contact form rejected")
///     .with_field("email", "must be a valid address");
/// assert_eq!(err.kind(), ErrorKind::Validation);
/// assert_eq!(err.status_code(), 400);
/// ```
pub struct TypedError {
    kind: ErrorKind,
    status_code: u16,
    code: ErrorCode,
    message: String,
    retryable: bool,
    retry_after_secs: Option<u32>,
    context: Vec<FieldDetail>,
    details: BTreeMap<String, serde_json::Value>,
    caused_by: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TypedError {
    /// Create an error with the code's default kind, status and retry policy.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.default_retryable();
        Self {
            kind: code.kind(),
            status_code: code.default_status(),
            code,
            message: message.into(),
            retryable,
            retry_after_secs: if retryable {
                code.default_retry_after()
            } else {
                None
            },
            context: Vec::new(),
            details: BTreeMap::new(),
            caused_by: None,
        }
    }

    /// Validation failure listing every offending field.
    pub fn validation(fields: impl IntoIterator<Item = FieldDetail>) -> Self {
        let context: Vec<FieldDetail> = fields.into_iter().collect();
        let message = format!("validation failed for {} field(s)", context.len());
        Self {
            context,
            ..Self::new(ErrorCode::ValidationFailed, message)
        }
    }

    /// Resource lookup miss.
    pub fn not_found(resource: impl fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{resource} not found"))
    }

    /// Domain rule rejection.
    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BusinessRuleViolation, message)
    }

    /// Failure of a third-party dependency, retryable by default.
    pub fn external_service(service: &str, message: impl fmt::Display) -> Self {
        Self::new(ErrorCode::ExternalServiceError, format!("{service}: {message}"))
            .with_detail("service", service)
    }

    /// Unexpected failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Override the HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = status;
        self
    }

    /// Override retryability. Clearing it also drops any retry-after hint.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        if !retryable {
            self.retry_after_secs = None;
        } else if self.retry_after_secs.is_none() {
            self.retry_after_secs = self.code.default_retry_after();
        }
        self
    }

    /// Set the retry-after hint. Ignored unless the error is retryable.
    pub fn with_retry_after(mut self, secs: u32) -> Self {
        if self.retryable {
            self.retry_after_secs = Some(secs);
        }
        self
    }

    /// Append a field entry to the ordered context.
    pub fn with_field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.context.push(FieldDetail {
            field: field.into(),
            message: message.into(),
            rejected_value: None,
        });
        self
    }

    /// Append a field entry that records the rejected value.
    pub fn with_field_value(
        mut self,
        field: impl Into<String>,
        message: impl Into<String>,
        value: impl Serialize,
    ) -> Self {
        self.context.push(FieldDetail {
            field: field.into(),
            message: message.into(),
            rejected_value: serde_json::to_value(value).ok(),
        });
        self
    }

    /// Attach a diagnostic key-value pair (logged, shown only in debug mode).
    ///
    /// Values that fail to serialise are skipped.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Wrap the original failure.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.caused_by = Some(Box::new(source));
        self
    }

    /// Wrap an already boxed original failure.
    pub fn with_boxed_source(mut self, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        self.caused_by = Some(source);
        self
    }

    /// Failure kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// HTTP status to respond with.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Stable machine code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Internal message. Never sent to production clients.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Canned client-facing message for this error's code.
    pub fn user_message(&self) -> &'static str {
        user_message(self.code)
    }

    /// Whether the operation that produced this may be retried.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Retry-after hint in seconds, present only when retryable.
    pub fn retry_after_secs(&self) -> Option<u32> {
        self.retry_after_secs
    }

    /// Ordered per-field context.
    pub fn context(&self) -> &[FieldDetail] {
        &self.context
    }

    /// Diagnostic details.
    pub fn details(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.details
    }

    /// The wrapped original failure, if any.
    pub fn caused_by(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.caused_by.as_deref()
    }

    /// Display strings of the cause chain, outermost first.
    pub fn cause_chain(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut next: Option<&(dyn std::error::Error + 'static)> = self
            .caused_by
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(err) = next {
            out.push(err.to_string());
            next = err.source();
        }
        out
    }
}

impl fmt::Debug for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("TypedError");
        d.field("kind", &self.kind);
        d.field("code", &self.code);
        d.field("status_code", &self.status_code);
        d.field("message", &self.message);
        d.field("retryable", &self.retryable);
        if let Some(secs) = self.retry_after_secs {
            d.field("retry_after_secs", &secs);
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        if let Some(ref src) = self.caused_by {
            d.field("caused_by", &src.to_string());
        }
        d.finish()
    }
}

impl fmt::Display for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.details.is_empty()
            && let Ok(ctx) = serde_json::to_string(&self.details)
        {
            write!(f, " {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TypedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.caused_by
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
