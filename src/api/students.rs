use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::{require_permission, CurrentUser};
use crate::api::pagination::PaginatedResponse;
use crate::api::validation::optional_date;
use crate::core::state::AppState;
use crate::db::types::CertificateStatus;
use crate::repositories;
use crate::schemas::student::{StudentCreate, StudentListQuery, StudentResponse, StudentUpdate};
use crate::services::access_control::Permission;
use crate::services::lifecycle::{self, NewStudent, StudentChanges};
use crate::services::listing::{self, ListQuery};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_students).post(create_student))
        .route("/:student_id", get(get_student).put(update_student).delete(delete_student))
        .route("/:student_id/reissue", post(reissue_student))
        .route("/:student_id/revoke", post(revoke_certificate))
        .route("/:student_id/reinstate", post(reinstate_certificate))
}

async fn list_students(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<StudentListQuery>,
) -> Result<Json<PaginatedResponse<StudentResponse>>, ApiError> {
    require_permission(&state, &user, Permission::ViewStudents).await?;

    let page = listing::list_students(
        state.db(),
        ListQuery {
            search: params.search,
            course_id: params.course_id,
            page: params.page,
            per_page: params.per_page,
            include_unissued: true,
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to list students"))?;

    let storage = state.storage().as_ref();
    Ok(Json(page.map(|record| StudentResponse::from_db(record, storage)).into()))
}

async fn create_student(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<StudentCreate>,
) -> Result<(StatusCode, Json<StudentResponse>), ApiError> {
    let grant = require_permission(&state, &user, Permission::CreateStudents).await?;
    payload.validate()?;

    let input = NewStudent {
        certificate_date: optional_date("certificate_date", payload.certificate_date.as_deref())?,
        name: payload.name,
        course_id: payload.course_id,
        certificate_number: payload.certificate_number,
        hour: payload.hour,
        level: payload.level,
        control: payload.control,
        passport: payload.passport,
    };
    let record = lifecycle::create_student(&state, &grant, input)
        .await
        .map_err(|err| ApiError::lifecycle(err, "student.create", None))?;

    Ok((StatusCode::CREATED, Json(StudentResponse::from_db(record, state.storage().as_ref()))))
}

async fn get_student(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(student_id): Path<i64>,
) -> Result<Json<StudentResponse>, ApiError> {
    require_permission(&state, &user, Permission::ViewStudents).await?;

    let record = repositories::students::find(state.db(), student_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load student"))?
        .ok_or_else(|| ApiError::NotFound("Student not found".to_string()))?;
    Ok(Json(StudentResponse::from_db(record, state.storage().as_ref())))
}

async fn update_student(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(student_id): Path<i64>,
    Json(payload): Json<StudentUpdate>,
) -> Result<Json<StudentResponse>, ApiError> {
    let grant = require_permission(&state, &user, Permission::EditStudents).await?;
    payload.validate()?;

    let changes = StudentChanges {
        certificate_date: optional_date("certificate_date", payload.certificate_date.as_deref())?,
        name: payload.name,
        course_id: payload.course_id,
        certificate_number: payload.certificate_number,
        hour: payload.hour,
        level: payload.level,
        control: payload.control,
        passport: payload.passport,
    };
    let record = lifecycle::update_student(&state, &grant, student_id, changes)
        .await
        .map_err(|err| ApiError::lifecycle(err, "student.update", Some(student_id)))?;

    Ok(Json(StudentResponse::from_db(record, state.storage().as_ref())))
}

async fn delete_student(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(student_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let grant = require_permission(&state, &user, Permission::DeleteStudents).await?;
    lifecycle::delete_student(&state, &grant, student_id)
        .await
        .map_err(|err| ApiError::lifecycle(err, "student.delete", Some(student_id)))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reissue_student(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(student_id): Path<i64>,
) -> Result<Json<StudentResponse>, ApiError> {
    let grant = require_permission(&state, &user, Permission::EditStudents).await?;
    let record = lifecycle::reissue_student(&state, &grant, student_id)
        .await
        .map_err(|err| ApiError::lifecycle(err, "student.reissue", Some(student_id)))?;
    Ok(Json(StudentResponse::from_db(record, state.storage().as_ref())))
}

async fn change_status(
    state: &AppState,
    user: &crate::db::models::User,
    student_id: i64,
    status: CertificateStatus,
) -> Result<Json<StudentResponse>, ApiError> {
    let grant = require_permission(state, user, Permission::RevokeCertificates).await?;
    let record = lifecycle::set_status(state, &grant, student_id, status)
        .await
        .map_err(|err| ApiError::lifecycle(err, "certificate.status", Some(student_id)))?;
    Ok(Json(StudentResponse::from_db(record, state.storage().as_ref())))
}

async fn revoke_certificate(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(student_id): Path<i64>,
) -> Result<Json<StudentResponse>, ApiError> {
    change_status(&state, &user, student_id, CertificateStatus::Revoked).await
}

async fn reinstate_certificate(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(student_id): Path<i64>,
) -> Result<Json<StudentResponse>, ApiError> {
    change_status(&state, &user, student_id, CertificateStatus::Active).await
}
