use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::access_control::AccessError;
use crate::services::artifacts::ArtifactError;
use crate::services::lifecycle::{FieldErrors, LifecycleError};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<FieldErrors>,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    UnprocessableEntity(FieldErrors),
    /// Retryable; sent with `Retry-After`.
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }

    pub(crate) fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Self::UnprocessableEntity(errors)
    }

    /// Maps a lifecycle failure, logging internal causes with the operation
    /// and entity they concern.
    pub(crate) fn lifecycle(err: LifecycleError, operation: &str, entity_id: Option<i64>) -> Self {
        match err {
            LifecycleError::Validation(errors) => Self::UnprocessableEntity(errors),
            LifecycleError::Access(err) => Self::from(err),
            LifecycleError::NotFound(what) => {
                Self::NotFound(format!("{} not found", capitalize(what)))
            }
            LifecycleError::AllocationConflict { attempts } => {
                tracing::warn!(operation, attempts, "Certificate number allocation exhausted");
                Self::ServiceUnavailable("Certificate number allocation is busy, retry".into())
            }
            LifecycleError::ConcurrentModification => {
                Self::Conflict("The certificate was changed by another request".into())
            }
            LifecycleError::Artifact(ArtifactError::MissingField(field)) => {
                Self::field(field, format!("The {field} field is required to issue a certificate."))
            }
            LifecycleError::Artifact(ArtifactError::TemplateAssetMissing(path)) => {
                tracing::error!(
                    operation,
                    entity_id,
                    path = %path.display(),
                    "Certificate template asset missing"
                );
                Self::Internal("Certificate could not be generated".into())
            }
            LifecycleError::Artifact(ArtifactError::Timeout(after)) => {
                tracing::error!(operation, entity_id, ?after, "Certificate generation timed out");
                Self::ServiceUnavailable("Certificate generation timed out, retry".into())
            }
            LifecycleError::Artifact(err) => {
                tracing::error!(
                    operation,
                    entity_id,
                    error = %err,
                    "Certificate generation failed"
                );
                Self::Internal("Certificate could not be generated".into())
            }
            LifecycleError::Database(err) => {
                tracing::error!(operation, entity_id, error = %err, "Database error");
                Self::Internal("Internal server error".into())
            }
        }
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Denied(_) => Self::Forbidden("This action is unauthorized."),
            AccessError::Database(err) => Self::internal(err, "Failed to check permissions"),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::UnprocessableEntity(crate::api::validation::field_errors(&errors))
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn body(status: StatusCode, detail: String, errors: Option<FieldErrors>) -> Response {
    (status, Json(ErrorResponse { status: status.as_u16(), detail, errors })).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(message) => {
                let mut response = body(StatusCode::UNAUTHORIZED, message.to_string(), None);
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            ApiError::Forbidden(message) => body(StatusCode::FORBIDDEN, message.to_string(), None),
            ApiError::BadRequest(message) => body(StatusCode::BAD_REQUEST, message, None),
            ApiError::NotFound(message) => body(StatusCode::NOT_FOUND, message, None),
            ApiError::Conflict(message) => body(StatusCode::CONFLICT, message, None),
            ApiError::UnprocessableEntity(errors) => body(
                StatusCode::UNPROCESSABLE_ENTITY,
                "The given data was invalid.".to_string(),
                Some(errors),
            ),
            ApiError::ServiceUnavailable(message) => {
                let mut response = body(StatusCode::SERVICE_UNAVAILABLE, message, None);
                response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
                response
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                body(StatusCode::INTERNAL_SERVER_ERROR, message, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::access_control::Permission;

    #[test]
    fn allocation_conflict_is_retryable() {
        let response = ApiError::lifecycle(
            LifecycleError::AllocationConflict { attempts: 5 },
            "student.create",
            None,
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn lifecycle_errors_map_to_statuses() {
        let cases = [
            (LifecycleError::field("name", "required"), StatusCode::UNPROCESSABLE_ENTITY),
            (LifecycleError::NotFound("student"), StatusCode::NOT_FOUND),
            (LifecycleError::ConcurrentModification, StatusCode::CONFLICT),
            (
                LifecycleError::Access(AccessError::Denied(Permission::EditStudents)),
                StatusCode::FORBIDDEN,
            ),
            (
                LifecycleError::Artifact(ArtifactError::TemplateAssetMissing("font.ttf".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                LifecycleError::Artifact(ArtifactError::Timeout(
                    std::time::Duration::from_secs(30),
                )),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError::lifecycle(err, "test", Some(1)).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
