use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maps a status code onto the stable error code clients switch on.
pub fn error_code_for(status: StatusCode) -> &'static str {
    match status.as_u16() {
        200 => "SUCCESS",
        201 => "RESOURCE_CREATED",
        204 => "NO_CONTENT",
        400 => "BAD_REQUEST",
        401 => "UNAUTHORIZED",
        403 => "FORBIDDEN",
        404 => "RESOURCE_NOT_FOUND",
        409 => "RESOURCE_CONFLICT",
        422 => "VALIDATION_ERROR",
        500 => "INTERNAL_SERVER_ERROR",
        _ => "UNKNOWN_ERROR",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A deliberate failure with a chosen status and optional remediation data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub suggestion: Option<String>,
    pub path: Option<String>,
    pub fields: Option<Vec<FieldError>>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: error_code_for(status).to_string(),
            message: message.into(),
            details: None,
            suggestion: None,
            path: None,
            fields: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.fields
            .get_or_insert_with(Vec::new)
            .push(FieldError::new(field, message));
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: Vec<String>,
    pub message: String,
}

impl ValidationIssue {
    /// Dotted field path, `unknown` when the issue is not tied to a field.
    pub fn field(&self) -> String {
        if self.path.is_empty() {
            "unknown".to_string()
        } else {
            self.path.join(".")
        }
    }
}

/// Schema violations collected while checking a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a violation at a dotted path such as `address.city`.
    pub fn field(mut self, path: &str, message: impl Into<String>) -> Self {
        self.push(path, message);
        self
    }

    pub fn push(&mut self, path: &str, message: impl Into<String>) {
        let path = path
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(String::from)
            .collect();
        self.issues.push(ValidationIssue {
            path,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn field_errors(&self) -> Vec<FieldError> {
        self.issues
            .iter()
            .map(|issue| FieldError::new(issue.field(), issue.message.clone()))
            .collect()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed")?;
        for issue in &self.issues {
            write!(f, "; {}: {}", issue.field(), issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::new().field("body", err.to_string())
    }
}

/// Everything a route handler may fail with.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn internal(message: impl fmt::Display) -> Self {
        HandlerError::Internal(anyhow::anyhow!("{message}"))
    }
}

// Serialization failures on the way out are server faults; request bodies go
// through `RequestExt::json`, which reports a `ValidationError` instead.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_covers_known_codes() {
        assert_eq!(error_code_for(StatusCode::NOT_FOUND), "RESOURCE_NOT_FOUND");
        assert_eq!(error_code_for(StatusCode::CONFLICT), "RESOURCE_CONFLICT");
        assert_eq!(
            error_code_for(StatusCode::UNPROCESSABLE_ENTITY),
            "VALIDATION_ERROR"
        );
        assert_eq!(error_code_for(StatusCode::IM_A_TEAPOT), "UNKNOWN_ERROR");
    }

    #[test]
    fn api_error_derives_code_unless_overridden() {
        let err = ApiError::not_found("X not found");
        assert_eq!(err.code, "RESOURCE_NOT_FOUND");

        let err = ApiError::conflict("taken").with_code("SLUG_TAKEN");
        assert_eq!(err.code, "SLUG_TAKEN");
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn validation_paths_are_dotted() {
        let err = ValidationError::new()
            .field("address.city", "required")
            .field("", "body must be an object");
        let fields = err.field_errors();
        assert_eq!(fields[0], FieldError::new("address.city", "required"));
        assert_eq!(fields[1].field, "unknown");
        assert!(err.into_result().is_err());
        assert!(ValidationError::new().into_result().is_ok());
    }

    #[test]
    fn handler_error_converts_from_each_kind() {
        let err: HandlerError = ApiError::forbidden("nope").into();
        assert!(matches!(err, HandlerError::Api(_)));
        let err: HandlerError = ValidationError::new().field("a", "b").into();
        assert!(matches!(err, HandlerError::Validation(_)));
        let err: HandlerError = anyhow::anyhow!("boom").into();
        assert_eq!(err.to_string(), "boom");
    }
}
