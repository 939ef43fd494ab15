use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::today_utc;
use crate::db::models::StudentRecord;
use crate::db::types::ArtifactState;
use crate::repositories;
use crate::schemas::certificate::{
    CertificateListQuery, CertificateListResponse, CertificateResponse, VerificationResponse,
};
use crate::services::listing::{self, ListQuery};
use crate::services::storage::StorageError;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_certificates))
        .route("/:certificate_id", get(show_certificate))
        .route("/:certificate_id/download", get(download_certificate))
        .route("/verify/:certificate_number", get(verify_by_number))
        .route("/token/:verification_token", get(verify_by_token))
}

fn not_found() -> ApiError {
    ApiError::NotFound("Certificate not found".to_string())
}

fn present(state: &AppState, record: StudentRecord) -> CertificateResponse {
    CertificateResponse::from_db(
        record,
        state.storage().as_ref(),
        &state.settings().api().api_prefix,
        today_utc(),
    )
}

async fn list_certificates(
    State(state): State<AppState>,
    Query(params): Query<CertificateListQuery>,
) -> Result<Json<CertificateListResponse<CertificateResponse>>, ApiError> {
    let page = listing::list_students(
        state.db(),
        ListQuery {
            course_id: params.course_id(),
            search: params.search,
            page: params.page,
            per_page: params.per_page,
            include_unissued: false,
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to list certificates"))?;

    let page = page.map(|record| present(&state, record));
    Ok(Json(CertificateListResponse::from_page(page)))
}

async fn load_issued(state: &AppState, certificate_id: i64) -> Result<StudentRecord, ApiError> {
    repositories::students::find(state.db(), certificate_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load certificate"))?
        .filter(|record| record.student.artifact_state == ArtifactState::Issued)
        .ok_or_else(not_found)
}

async fn show_certificate(
    State(state): State<AppState>,
    Path(certificate_id): Path<i64>,
) -> Result<Json<CertificateResponse>, ApiError> {
    let record = load_issued(&state, certificate_id).await?;
    Ok(Json(present(&state, record)))
}

async fn download_certificate(
    State(state): State<AppState>,
    Path(certificate_id): Path<i64>,
) -> Result<Response, ApiError> {
    let record = load_issued(&state, certificate_id).await?;
    pdf_attachment(&state, &record).await
}

/// Streams the stored certificate document as a download.
pub(crate) async fn pdf_attachment(
    state: &AppState,
    record: &StudentRecord,
) -> Result<Response, ApiError> {
    let student = &record.student;
    let key = student.certificate_path.as_deref().ok_or_else(not_found)?;
    let number = student.certificate_number.as_deref().unwrap_or("certificate");

    let bytes = match state.storage().get(key).await {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(_)) => {
            tracing::error!(
                student_id = student.id,
                key,
                "Certificate document missing from storage"
            );
            return Err(not_found());
        }
        Err(err) => return Err(ApiError::internal(err, "Failed to read certificate document")),
    };

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"certificate-{}.pdf\"",
        sanitize_filename(number)
    ))
    .map_err(|e| ApiError::internal(e, "Invalid download file name"))?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

fn sanitize_filename(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn verification(state: &AppState, record: StudentRecord) -> VerificationResponse {
    let data = present(state, record);
    VerificationResponse { valid: data.status.is_valid(), status: data.status, data }
}

async fn verify_by_number(
    State(state): State<AppState>,
    Path(certificate_number): Path<String>,
) -> Result<Json<VerificationResponse>, ApiError> {
    let record =
        repositories::students::find_issued_by_number(state.db(), certificate_number.trim())
            .await
            .map_err(|e| ApiError::internal(e, "Failed to verify certificate"))?
            .ok_or_else(not_found)?;

    tracing::info!(student_id = record.student.id, "Certificate verified by number");
    Ok(Json(verification(&state, record)))
}

async fn verify_by_token(
    State(state): State<AppState>,
    Path(verification_token): Path<String>,
) -> Result<Json<VerificationResponse>, ApiError> {
    let token = Uuid::parse_str(verification_token.trim()).map_err(|_| not_found())?;
    let record = repositories::students::find_issued_by_token(state.db(), token)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to verify certificate"))?
        .ok_or_else(not_found)?;

    tracing::info!(student_id = record.student.id, "Certificate verified by token");
    Ok(Json(verification(&state, record)))
}

#[cfg(test)]
mod tests;
