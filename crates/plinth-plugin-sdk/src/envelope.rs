use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{error_code_for, ApiError, FieldError, ValidationError};

pub const VALIDATION_MESSAGE: &str = "Validation failed";
pub const VALIDATION_SUGGESTION: &str = "Please check the request format and try again";
pub const FALLBACK_MESSAGE: &str = "Something went wrong";

/// Uniform response body for every non-exempt route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope {
    Success {
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(rename = "requestId")]
        request_id: Uuid,
        data: Value,
    },
    Error {
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(rename = "requestId")]
        request_id: Uuid,
        error: ErrorDetails,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldError>>,
}

impl ErrorDetails {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: iso_timestamp(),
            path: None,
            suggestion: None,
            fields: None,
        }
    }
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Self::success_with_status(data, StatusCode::OK)
    }

    pub fn success_with_status(data: Value, status: StatusCode) -> Self {
        Envelope::Success {
            status_code: status.as_u16(),
            request_id: Uuid::new_v4(),
            data,
        }
    }

    pub fn error(status: StatusCode, error: ErrorDetails) -> Self {
        Envelope::Error {
            status_code: status.as_u16(),
            request_id: Uuid::new_v4(),
            error,
        }
    }

    /// The error's own path, when set, wins over the request path.
    pub fn from_api_error(err: ApiError, path: Option<&str>) -> Self {
        let ApiError {
            status,
            code,
            message,
            details,
            suggestion,
            path: explicit_path,
            fields,
        } = err;
        let mut error = ErrorDetails::new(code, message);
        error.details = details;
        error.suggestion = suggestion;
        error.fields = fields;
        error.path = explicit_path.or_else(|| path.map(String::from));
        Self::error(status, error)
    }

    pub fn from_validation(err: &ValidationError, path: Option<&str>) -> Self {
        let status = StatusCode::BAD_REQUEST;
        let mut error = ErrorDetails::new(error_code_for(status), VALIDATION_MESSAGE);
        error.path = path.map(String::from);
        error.suggestion = Some(VALIDATION_SUGGESTION.to_string());
        error.fields = Some(err.field_errors());
        Self::error(status, error)
    }

    pub fn internal(message: Option<String>, path: Option<&str>) -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let message = message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| FALLBACK_MESSAGE.to_string());
        let mut error = ErrorDetails::new(error_code_for(status), message);
        error.path = path.map(String::from);
        Self::error(status, error)
    }

    pub fn status_code(&self) -> StatusCode {
        let code = match self {
            Envelope::Success { status_code, .. } | Envelope::Error { status_code, .. } => {
                *status_code
            }
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            Envelope::Success { request_id, .. } | Envelope::Error { request_id, .. } => {
                *request_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_serializes_in_wire_order() {
        let envelope = Envelope::Success {
            status_code: 200,
            request_id: Uuid::nil(),
            data: json!({"foo": 1}),
        };
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"status":"success","statusCode":200,"requestId":"00000000-0000-0000-0000-000000000000","data":{"foo":1}}"#
        );
    }

    #[test]
    fn error_omits_absent_optionals() {
        let mut details = ErrorDetails::new("RESOURCE_NOT_FOUND", "X not found");
        details.timestamp = "2024-01-01T00:00:00.000Z".into();
        let envelope = Envelope::Error {
            status_code: 404,
            request_id: Uuid::nil(),
            error: details,
        };
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"status":"error","statusCode":404,"requestId":"00000000-0000-0000-0000-000000000000","error":{"code":"RESOURCE_NOT_FOUND","message":"X not found","timestamp":"2024-01-01T00:00:00.000Z"}}"#
        );
    }

    #[test]
    fn api_error_path_overrides_request_path() {
        let err = ApiError::not_found("gone").with_path("/custom");
        let Envelope::Error { error, .. } = Envelope::from_api_error(err, Some("/api/v1/x")) else {
            panic!("expected error envelope");
        };
        assert_eq!(error.path.as_deref(), Some("/custom"));

        let err = ApiError::not_found("gone");
        let Envelope::Error { error, .. } = Envelope::from_api_error(err, Some("/api/v1/x")) else {
            panic!("expected error envelope");
        };
        assert_eq!(error.path.as_deref(), Some("/api/v1/x"));
    }

    #[test]
    fn internal_falls_back_to_generic_message() {
        let Envelope::Error { error, status_code, .. } = Envelope::internal(Some(String::new()), None)
        else {
            panic!("expected error envelope");
        };
        assert_eq!(status_code, 500);
        assert_eq!(error.message, FALLBACK_MESSAGE);
        assert_eq!(error.code, "INTERNAL_SERVER_ERROR");
    }

    #[test]
    fn timestamps_are_millisecond_utc() {
        let ts = iso_timestamp();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
    }

    #[test]
    fn request_ids_are_fresh() {
        let a = Envelope::success(json!(null));
        let b = Envelope::success(json!(null));
        assert_ne!(a.request_id(), b.request_id());
    }
}
