use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::{require_permission, CurrentUser};
use crate::api::pagination::{PageParams, PaginatedResponse};
use crate::api::validation::validate_image_upload;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::repositories::{self, courses::CourseFields};
use crate::schemas::course::{CourseCreate, CourseOption, CourseResponse, CourseUpdate};
use crate::services::access_control::Permission;
use crate::services::lifecycle;
use crate::services::listing::{normalize_page, page_offset, Page};

const MAX_IMAGES_PER_UPLOAD: usize = 10;

/// Public category list used by the certificate search form.
pub(crate) fn public_router() -> Router<AppState> {
    Router::new().route("/", get(list_options))
}

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_courses).post(create_course))
        .route("/:course_id", get(get_course).put(update_course).delete(delete_course))
        .route(
            "/:course_id/images",
            post(upload_images).layer(DefaultBodyLimit::disable()),
        )
}

async fn list_options(State(state): State<AppState>) -> Result<Json<Vec<CourseOption>>, ApiError> {
    let courses = repositories::courses::list_all(state.db())
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list courses"))?;
    Ok(Json(
        courses
            .into_iter()
            .map(|course| CourseOption { id: course.id, name: course.name })
            .collect(),
    ))
}

async fn list_courses(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<PageParams>,
) -> Result<Json<PaginatedResponse<CourseResponse>>, ApiError> {
    require_permission(&state, &user, Permission::ViewCourses).await?;

    let search = params.search.as_deref().map(str::trim).filter(|value| !value.is_empty());
    let (page, per_page) = normalize_page(params.page, params.per_page);
    let total = repositories::courses::count(state.db(), search)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to count courses"))?;
    let offset = page_offset(page, per_page);
    let courses = repositories::courses::list_page(state.db(), search, offset, per_page)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list courses"))?;

    let storage = state.storage().as_ref();
    let items =
        courses.into_iter().map(|course| CourseResponse::from_db(course, storage)).collect();
    Ok(Json(Page { items, total, page, per_page }.into()))
}

async fn create_course(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<CourseCreate>,
) -> Result<(StatusCode, Json<CourseResponse>), ApiError> {
    let grant = require_permission(&state, &user, Permission::CreateCourses).await?;
    payload.validate()?;

    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::field("name", "The name field is required."));
    }
    let fields = CourseFields {
        name,
        description: payload.description.as_deref().map(str::trim).unwrap_or_default(),
        teacher: payload.teacher.as_deref().map(str::trim).unwrap_or_default(),
    };
    let course = repositories::courses::create(state.db(), &fields, primitive_now_utc())
        .await
        .map_err(|e| ApiError::internal(e, "Failed to create course"))?;

    tracing::info!(
        admin_id = grant.user_id(),
        course_id = course.id,
        action = "course.create",
        "Course created"
    );
    Ok((StatusCode::CREATED, Json(CourseResponse::from_db(course, state.storage().as_ref()))))
}

async fn get_course(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<i64>,
) -> Result<Json<CourseResponse>, ApiError> {
    require_permission(&state, &user, Permission::ViewCourses).await?;

    let course = repositories::courses::find(state.db(), course_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load course"))?
        .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;
    Ok(Json(CourseResponse::from_db(course, state.storage().as_ref())))
}

async fn update_course(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<i64>,
    Json(payload): Json<CourseUpdate>,
) -> Result<Json<CourseResponse>, ApiError> {
    let grant = require_permission(&state, &user, Permission::EditCourses).await?;
    payload.validate()?;

    let current = repositories::courses::find(state.db(), course_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load course"))?
        .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;

    let name = payload.name.as_deref().map(str::trim).unwrap_or(current.name.as_str());
    if name.is_empty() {
        return Err(ApiError::field("name", "The name field is required."));
    }
    let fields = CourseFields {
        name,
        description: payload
            .description
            .as_deref()
            .map(str::trim)
            .unwrap_or(current.description.as_str()),
        teacher: payload
            .teacher
            .as_deref()
            .map(str::trim)
            .unwrap_or(current.teacher.as_str()),
    };
    let mut course =
        repositories::courses::update(state.db(), course_id, &fields, primitive_now_utc())
            .await
            .map_err(|e| ApiError::internal(e, "Failed to update course"))?
            .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;

    if let Some(images) = payload.images {
        course = lifecycle::replace_course_images(&state, &grant, course_id, images)
            .await
            .map_err(|err| ApiError::lifecycle(err, "course.images", Some(course_id)))?;
    }

    tracing::info!(
        admin_id = grant.user_id(),
        course_id,
        action = "course.update",
        "Course updated"
    );
    Ok(Json(CourseResponse::from_db(course, state.storage().as_ref())))
}

async fn delete_course(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let grant = require_permission(&state, &user, Permission::DeleteCourses).await?;
    lifecycle::delete_course(&state, &grant, course_id)
        .await
        .map_err(|err| ApiError::lifecycle(err, "course.delete", Some(course_id)))?;
    Ok(StatusCode::NO_CONTENT)
}

struct Upload {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
}

async fn read_uploads(state: &AppState, mut multipart: Multipart) -> Result<Vec<Upload>, ApiError> {
    let max_mb = state.settings().storage().max_upload_size_mb;
    let max_bytes = max_mb * 1024 * 1024;
    let mut uploads = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name != "image" && name != "images" && name != "images[]" {
            continue;
        }
        if uploads.len() == MAX_IMAGES_PER_UPLOAD {
            return Err(ApiError::field(
                "image",
                format!("No more than {MAX_IMAGES_PER_UPLOAD} images per upload."),
            ));
        }

        let filename = field.file_name().unwrap_or("image").to_string();
        let content_type =
            field.content_type().unwrap_or("application/octet-stream").to_string();
        let mut bytes = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|_| ApiError::BadRequest("Failed to read file".to_string()))?
        {
            if bytes.len() as u64 + chunk.len() as u64 > max_bytes {
                return Err(ApiError::field(
                    "image",
                    format!("The image may not be greater than {max_mb}MB."),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        uploads.push(Upload { filename, content_type, bytes });
    }

    if uploads.is_empty() {
        return Err(ApiError::field("image", "The image field is required."));
    }
    Ok(uploads)
}

async fn upload_images(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<i64>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<CourseResponse>), ApiError> {
    let grant = require_permission(&state, &user, Permission::EditCourses).await?;

    repositories::courses::find(state.db(), course_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load course"))?
        .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))?;

    let uploads = read_uploads(&state, multipart).await?;
    let allowed = &state.settings().storage().allowed_image_extensions;
    let mut checked = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let extension = validate_image_upload(&upload.filename, &upload.content_type, allowed)?;
        checked.push((extension, upload));
    }

    let mut keys = Vec::with_capacity(checked.len());
    for (extension, upload) in checked {
        let key = format!("courses/{course_id}/{}.{extension}", Uuid::new_v4());
        if let Err(err) = state.storage().put(&key, &upload.content_type, upload.bytes).await {
            lifecycle::retire_blobs(&state, keys, "course image upload failed").await;
            return Err(ApiError::internal(err, "Failed to store course image"));
        }
        keys.push(key);
    }

    let course = match repositories::courses::append_images(
        state.db(),
        course_id,
        &keys,
        primitive_now_utc(),
    )
    .await
    {
        Ok(Some(course)) => course,
        Ok(None) => {
            lifecycle::retire_blobs(&state, keys, "course removed during upload").await;
            return Err(ApiError::NotFound("Course not found".to_string()));
        }
        Err(err) => {
            lifecycle::retire_blobs(&state, keys, "course image registration failed").await;
            return Err(ApiError::internal(err, "Failed to register course images"));
        }
    };

    tracing::info!(
        admin_id = grant.user_id(),
        course_id,
        images = keys.len(),
        action = "course.images.upload",
        "Course images uploaded"
    );
    Ok((StatusCode::CREATED, Json(CourseResponse::from_db(course, state.storage().as_ref()))))
}
