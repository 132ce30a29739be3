use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::transport::TransportError;

/// A single field-level failure carried by a 422 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Serializable error shape handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub status_code: u16,
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

/// Every terminal failure a call can end in. `Clone` so one refresh failure
/// can be handed to every queued waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Access denied: {message}")]
    Forbidden { message: String },

    #[error("Resource not found: {message}")]
    NotFound { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationError {
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("Rate limited - retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request setup failed: {0}")]
    RequestSetupError(String),

    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Session is gone and the user has to sign in again.
    pub fn session_expired() -> Self {
        ApiError::Unauthorized {
            message: "Session expired".to_string(),
        }
    }

    /// Classify a non-2xx response.
    pub fn from_response(
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
        default_retry_after: Duration,
    ) -> Self {
        let text = String::from_utf8_lossy(body);
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let message = parsed
            .as_ref()
            .and_then(server_message)
            .unwrap_or_else(|| {
                if text.trim().is_empty() {
                    reqwest::StatusCode::from_u16(status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("Request failed")
                        .to_string()
                } else {
                    Self::truncate_body(&text)
                }
            });

        match status {
            400 => ApiError::BadRequest { message },
            401 => ApiError::Unauthorized { message },
            403 => ApiError::Forbidden { message },
            404 => ApiError::NotFound { message },
            409 => ApiError::Conflict { message },
            422 => ApiError::ValidationError {
                message,
                fields: parsed.as_ref().map(field_errors).unwrap_or_default(),
            },
            429 => ApiError::RateLimited {
                retry_after: parse_retry_after(headers).unwrap_or(default_retry_after),
            },
            500..=599 => ApiError::ServerError { status, message },
            _ => ApiError::UnexpectedStatus { status, message },
        }
    }

    /// HTTP status behind the error, 0 when no response was received.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest { .. } => 400,
            ApiError::Unauthorized { .. } => 401,
            ApiError::Forbidden { .. } => 403,
            ApiError::NotFound { .. } => 404,
            ApiError::Conflict { .. } => 409,
            ApiError::ValidationError { .. } => 422,
            ApiError::RateLimited { .. } => 429,
            ApiError::ServerError { status, .. } | ApiError::UnexpectedStatus { status, .. } => {
                *status
            }
            ApiError::NetworkError(_)
            | ApiError::RequestSetupError(_)
            | ApiError::Timeout(_)
            | ApiError::InvalidResponse(_)
            | ApiError::Cancelled => 0,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest { .. } => "BAD_REQUEST",
            ApiError::Unauthorized { .. } => "UNAUTHORIZED",
            ApiError::Forbidden { .. } => "FORBIDDEN",
            ApiError::NotFound { .. } => "NOT_FOUND",
            ApiError::Conflict { .. } => "CONFLICT",
            ApiError::ValidationError { .. } => "VALIDATION_ERROR",
            ApiError::RateLimited { .. } => "TOO_MANY_REQUESTS",
            ApiError::ServerError { .. } => "INTERNAL_SERVER_ERROR",
            ApiError::UnexpectedStatus { .. } => "API_ERROR",
            ApiError::NetworkError(_) => "NETWORK_ERROR",
            ApiError::RequestSetupError(_) => "REQUEST_ERROR",
            ApiError::Timeout(_) => "TIMEOUT",
            ApiError::InvalidResponse(_) => "INVALID_RESPONSE",
            ApiError::Cancelled => "CANCELLED",
        }
    }

    /// 5xx and transport failures are worth another attempt on idempotent calls.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::ServerError { .. } | ApiError::NetworkError(_))
    }

    /// The raw message, without the variant prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            ApiError::BadRequest { message }
            | ApiError::Unauthorized { message }
            | ApiError::Forbidden { message }
            | ApiError::NotFound { message }
            | ApiError::Conflict { message }
            | ApiError::ValidationError { message, .. }
            | ApiError::ServerError { message, .. }
            | ApiError::UnexpectedStatus { message, .. } => message.clone(),
            ApiError::NetworkError(message)
            | ApiError::RequestSetupError(message)
            | ApiError::InvalidResponse(message) => message.clone(),
            ApiError::RateLimited { .. } | ApiError::Timeout(_) | ApiError::Cancelled => {
                self.to_string()
            }
        }
    }

    /// Text suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::BadRequest { message } if !message.is_empty() => message.clone(),
            ApiError::BadRequest { .. } => "Invalid request. Please check your input.".to_string(),
            ApiError::Unauthorized { .. } => {
                "Your session has expired. Please log in again.".to_string()
            }
            ApiError::Forbidden { .. } => {
                "You do not have permission to perform this action.".to_string()
            }
            ApiError::NotFound { .. } => "The requested resource was not found.".to_string(),
            ApiError::Conflict { .. } => "This resource already exists.".to_string(),
            ApiError::ValidationError { message, .. } => message.clone(),
            ApiError::RateLimited { retry_after } => format!(
                "Too many requests. Please try again in {} seconds.",
                retry_after.as_secs()
            ),
            ApiError::ServerError { .. } => "Server error. Please try again later.".to_string(),
            ApiError::NetworkError(_) => "Network error. Please check your connection.".to_string(),
            ApiError::Timeout(_) => {
                "Request timed out. Please check your connection and try again.".to_string()
            }
            ApiError::Cancelled => "The request was cancelled.".to_string(),
            ApiError::UnexpectedStatus { .. }
            | ApiError::RequestSetupError(_)
            | ApiError::InvalidResponse(_) => {
                "An unexpected error occurred. Please try again later.".to_string()
            }
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let fields = match self {
            ApiError::ValidationError { fields, .. } => fields.clone(),
            _ => Vec::new(),
        };
        ErrorPayload {
            status_code: self.status(),
            message: self.message(),
            code: self.code().to_string(),
            fields,
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(after) => ApiError::Timeout(after),
            TransportError::Connection(msg) => ApiError::NetworkError(msg),
            TransportError::Setup(msg) => ApiError::RequestSetupError(msg),
        }
    }
}

fn server_message(body: &Value) -> Option<String> {
    ["message", "error", "detail"]
        .iter()
        .find_map(|key| body.get(key).and_then(Value::as_str))
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Extract field errors from `errors` (or `details`), accepting both
/// `[{"field": .., "message": ..}]` and `{"field": "msg" | ["msg", ..]}`.
fn field_errors(body: &Value) -> Vec<FieldError> {
    let Some(errors) = body.get("errors").or_else(|| body.get("details")) else {
        return Vec::new();
    };

    match errors {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let field = item.get("field").and_then(Value::as_str)?;
                let message = item
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("is invalid");
                Some(FieldError {
                    field: field.to_string(),
                    message: message.to_string(),
                })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(field, value)| {
                let messages: Vec<String> = match value {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(list) => list
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                };
                messages.into_iter().map(move |message| FieldError {
                    field: field.clone(),
                    message,
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Delay-seconds form of `Retry-After`. HTTP-date values are ignored.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = raw.parse().ok()?;
    // Negative, NaN and values past Duration::MAX fall back to the default
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    const DEFAULT_WAIT: Duration = Duration::from_secs(5);

    fn classify(status: u16, body: &str) -> ApiError {
        ApiError::from_response(status, &HeaderMap::new(), body.as_bytes(), DEFAULT_WAIT)
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify(400, "{}"), ApiError::BadRequest { .. }));
        assert!(matches!(classify(401, ""), ApiError::Unauthorized { .. }));
        assert!(matches!(classify(403, ""), ApiError::Forbidden { .. }));
        assert!(matches!(classify(404, ""), ApiError::NotFound { .. }));
        assert!(matches!(classify(409, ""), ApiError::Conflict { .. }));
        assert!(matches!(classify(422, "{}"), ApiError::ValidationError { .. }));
        assert!(matches!(classify(429, ""), ApiError::RateLimited { .. }));
        assert!(matches!(classify(503, ""), ApiError::ServerError { status: 503, .. }));
        assert!(matches!(classify(418, ""), ApiError::UnexpectedStatus { status: 418, .. }));
    }

    #[test]
    fn test_server_message_is_preferred() {
        let err = classify(400, r#"{"message": "Seat 14C is not available"}"#);
        assert_eq!(err.message(), "Seat 14C is not available");
        assert_eq!(err.user_message(), "Seat 14C is not available");

        // Fixed text for statuses whose server message is not user-facing
        let err = classify(403, r#"{"message": "role EMPLOYEE required"}"#);
        assert_eq!(err.user_message(), "You do not have permission to perform this action.");
    }

    #[test]
    fn test_plain_text_body_is_truncated() {
        let body = "x".repeat(2000);
        let err = classify(502, &body);
        let message = err.message();
        assert!(message.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(message.contains("truncated, 2000 total bytes"));
    }

    #[test]
    fn test_empty_body_uses_reason_phrase() {
        assert_eq!(classify(404, "").message(), "Not Found");
    }

    #[test]
    fn test_validation_fields_from_array() {
        let err = classify(
            422,
            r#"{"message": "Invalid passenger", "errors": [
                {"field": "passportNumber", "message": "is required"},
                {"field": "dateOfBirth", "message": "must be in the past"}
            ]}"#,
        );
        match err {
            ApiError::ValidationError { message, fields } => {
                assert_eq!(message, "Invalid passenger");
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].field, "passportNumber");
                assert_eq!(fields[1].message, "must be in the past");
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_fields_from_map() {
        let err = classify(
            422,
            r#"{"errors": {"email": ["is invalid", "is taken"], "phone": "is too short"}}"#,
        );
        let payload = err.payload();
        assert_eq!(payload.code, "VALIDATION_ERROR");
        assert_eq!(payload.fields.len(), 3);
        assert!(payload.fields.iter().any(|f| f.field == "phone" && f.message == "is too short"));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        let err = ApiError::from_response(429, &headers, b"", DEFAULT_WAIT);
        assert_eq!(err, ApiError::RateLimited { retry_after: Duration::from_secs(12) });

        // HTTP-date form falls back to the default
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        let err = ApiError::from_response(429, &headers, b"", DEFAULT_WAIT);
        assert_eq!(err, ApiError::RateLimited { retry_after: DEFAULT_WAIT });
    }

    #[test]
    fn test_retry_after_out_of_range_uses_default() {
        let mut headers = HeaderMap::new();
        for raw in ["99999999999999999999", "-3", "NaN", "inf"] {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(raw));
            let err = ApiError::from_response(429, &headers, b"", DEFAULT_WAIT);
            assert_eq!(err, ApiError::RateLimited { retry_after: DEFAULT_WAIT }, "{}", raw);
        }

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        let err = ApiError::from_response(429, &headers, b"", DEFAULT_WAIT);
        assert_eq!(err, ApiError::RateLimited { retry_after: Duration::from_millis(1500) });
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(classify(500, "").is_retryable());
        assert!(ApiError::NetworkError("connection reset".into()).is_retryable());
        assert!(!ApiError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!classify(404, "").is_retryable());
        assert!(!classify(429, "").is_retryable());
    }

    #[test]
    fn test_payload_serializes_camel_case() {
        let json = serde_json::to_value(classify(409, r#"{"message": "duplicate booking"}"#).payload())
            .expect("serialize payload");
        assert_eq!(json["statusCode"], 409);
        assert_eq!(json["code"], "CONFLICT");
        assert_eq!(json["message"], "duplicate booking");
        assert!(json.get("fields").is_none());
    }
}
