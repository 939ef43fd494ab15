use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::{require_permission, CurrentUser};
use crate::api::pagination::{PageParams, PaginatedResponse};
use crate::core::security;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db;
use crate::repositories;
use crate::schemas::user::{
    UserCreate, UserResponse, UserRolesUpdate, UserUpdate, UserWithRolesResponse,
};
use crate::services::access_control::{Permission, ADMIN_ROLE};
use crate::services::listing::{normalize_page, page_offset, Page};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_users).post(create_user))
        .route("/:user_id", put(update_user).delete(delete_user))
        .route("/:user_id/roles", put(replace_roles))
}

async fn with_roles(
    state: &AppState,
    user: crate::db::models::User,
) -> Result<UserWithRolesResponse, ApiError> {
    let roles = repositories::access::role_names_for_user(state.db(), &user.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load user roles"))?;
    Ok(UserWithRolesResponse { user: UserResponse::from_db(user), roles })
}

async fn list_users(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<PageParams>,
) -> Result<Json<PaginatedResponse<UserWithRolesResponse>>, ApiError> {
    require_permission(&state, &user, Permission::ViewUsers).await?;

    let (page, per_page) = normalize_page(params.page, params.per_page);
    let total = repositories::users::count(state.db())
        .await
        .map_err(|e| ApiError::internal(e, "Failed to count users"))?;
    let offset = page_offset(page, per_page);
    let users = repositories::users::list(state.db(), offset, per_page)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list users"))?;

    let mut items = Vec::with_capacity(users.len());
    for user in users {
        items.push(with_roles(&state, user).await?);
    }
    Ok(Json(Page { items, total, page, per_page }.into()))
}

/// Resolves role names to ids; unknown names are a validation error.
async fn resolve_roles(
    conn: &mut sqlx::PgConnection,
    names: &[String],
) -> Result<Vec<i64>, ApiError> {
    let mut wanted: Vec<String> = names.iter().map(|name| name.trim().to_string()).collect();
    wanted.sort();
    wanted.dedup();

    let roles = repositories::access::find_roles_by_names(conn, &wanted)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load roles"))?;
    let known = |name: &&String| roles.iter().any(|role| &role.name == *name);
    if let Some(unknown) = wanted.iter().find(|name| !known(name)) {
        return Err(ApiError::field("roles", format!("Unknown role: {unknown}")));
    }
    Ok(roles.into_iter().map(|role| role.id).collect())
}

async fn create_user(
    State(state): State<AppState>,
    CurrentUser(admin): CurrentUser,
    Json(payload): Json<UserCreate>,
) -> Result<(StatusCode, Json<UserWithRolesResponse>), ApiError> {
    let grant = require_permission(&state, &admin, Permission::CreateUsers).await?;
    payload.validate()?;

    let hashed_password = security::hash_password(&payload.password)
        .map_err(|e| ApiError::internal(e, "Failed to hash password"))?;

    let mut tx = state.db().begin().await.map_err(|e| ApiError::internal(e, "Failed to begin"))?;
    let role_ids = resolve_roles(&mut tx, &payload.roles).await?;
    let user = repositories::users::create(
        &mut tx,
        repositories::users::CreateUser {
            id: &Uuid::new_v4().to_string(),
            email: payload.email.trim(),
            hashed_password,
            full_name: payload.full_name.trim(),
            is_active: payload.is_active,
            now: primitive_now_utc(),
        },
    )
    .await
    .map_err(|e| {
        if db::is_unique_violation(&e, repositories::users::EMAIL_CONSTRAINT) {
            ApiError::field("email", "The email has already been taken.")
        } else {
            ApiError::internal(e, "Failed to create user")
        }
    })?;
    repositories::access::replace_user_roles(&mut tx, &user.id, &role_ids)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to assign roles"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit user"))?;

    tracing::info!(
        admin_id = grant.user_id(),
        user_id = %user.id,
        action = "user.create",
        "User created"
    );
    Ok((StatusCode::CREATED, Json(with_roles(&state, user).await?)))
}

async fn replace_roles(
    State(state): State<AppState>,
    CurrentUser(admin): CurrentUser,
    Path(user_id): Path<String>,
    Json(payload): Json<UserRolesUpdate>,
) -> Result<Json<UserWithRolesResponse>, ApiError> {
    let grant = require_permission(&state, &admin, Permission::EditUsers).await?;

    let user = repositories::users::find_by_id(state.db(), &user_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load user"))?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let mut tx = state.db().begin().await.map_err(|e| ApiError::internal(e, "Failed to begin"))?;
    let role_ids = resolve_roles(&mut tx, &payload.roles).await?;
    repositories::access::replace_user_roles(&mut tx, &user.id, &role_ids)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to replace roles"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit roles"))?;

    tracing::info!(
        admin_id = grant.user_id(),
        user_id = %user.id,
        roles = ?payload.roles,
        action = "user.roles",
        "User roles replaced"
    );
    Ok(Json(with_roles(&state, user).await?))
}

async fn update_user(
    State(state): State<AppState>,
    CurrentUser(admin): CurrentUser,
    Path(user_id): Path<String>,
    Json(payload): Json<UserUpdate>,
) -> Result<Json<UserWithRolesResponse>, ApiError> {
    let grant = require_permission(&state, &admin, Permission::EditUsers).await?;
    payload.validate()?;

    let hashed_password = match payload.password.as_deref() {
        Some(password) => Some(
            security::hash_password(password)
                .map_err(|e| ApiError::internal(e, "Failed to hash password"))?,
        ),
        None => None,
    };

    let mut tx = state.db().begin().await.map_err(|e| ApiError::internal(e, "Failed to begin"))?;
    let user = repositories::users::update(
        &mut *tx,
        &user_id,
        repositories::users::UpdateUser {
            email: payload.email.as_deref().map(str::trim).map(str::to_string),
            full_name: payload.full_name.as_deref().map(str::trim).map(str::to_string),
            is_active: payload.is_active,
            hashed_password,
            updated_at: primitive_now_utc(),
        },
    )
    .await
    .map_err(|e| {
        if db::is_unique_violation(&e, repositories::users::EMAIL_CONSTRAINT) {
            ApiError::field("email", "The email has already been taken.")
        } else {
            ApiError::internal(e, "Failed to update user")
        }
    })?
    .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    if let Some(roles) = &payload.roles {
        let role_ids = resolve_roles(&mut tx, roles).await?;
        repositories::access::replace_user_roles(&mut tx, &user.id, &role_ids)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to replace roles"))?;
    }
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit user"))?;

    tracing::info!(
        admin_id = grant.user_id(),
        user_id = %user.id,
        password_changed = payload.password.is_some(),
        action = "user.update",
        "User updated"
    );
    Ok(Json(with_roles(&state, user).await?))
}

async fn delete_user(
    State(state): State<AppState>,
    CurrentUser(admin): CurrentUser,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let grant = require_permission(&state, &admin, Permission::DeleteUsers).await?;
    if user_id == admin.id {
        return Err(ApiError::Forbidden("You cannot delete your own account"));
    }

    let user = repositories::users::find_by_id(state.db(), &user_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load user"))?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    let roles = repositories::access::role_names_for_user(state.db(), &user.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load user roles"))?;
    if roles.iter().any(|role| role == ADMIN_ROLE) {
        return Err(ApiError::Forbidden("Admin users cannot be deleted"));
    }

    if !repositories::users::delete(state.db(), &user.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to delete user"))?
    {
        return Err(ApiError::NotFound("User not found".to_string()));
    }

    tracing::info!(
        admin_id = grant.user_id(),
        user_id = %user.id,
        action = "user.delete",
        "User deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}
