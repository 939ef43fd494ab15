use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::{require_permission, CurrentUser};
use crate::core::state::AppState;
use crate::db::{self, models::Role};
use crate::repositories;
use crate::schemas::role::{PermissionResponse, RoleCreate, RoleResponse, RoleUpdate};
use crate::services::access_control::{Permission, ADMIN_ROLE};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_roles).post(create_role))
        .route("/:role_id", put(update_role).delete(delete_role))
}

pub(crate) fn permissions_router() -> Router<AppState> {
    Router::new().route("/", get(list_permissions))
}

async fn role_response(state: &AppState, role: Role) -> Result<RoleResponse, ApiError> {
    let permissions = repositories::access::permissions_for_role(state.db(), role.id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load role permissions"))?;
    Ok(RoleResponse { id: role.id, name: role.name, permissions })
}

/// Resolves permission names to ids; unknown names are a validation error.
async fn resolve_permissions(
    conn: &mut sqlx::PgConnection,
    names: &[String],
) -> Result<Vec<i64>, ApiError> {
    let mut wanted: Vec<String> = names.iter().map(|name| name.trim().to_string()).collect();
    wanted.sort();
    wanted.dedup();

    let permissions = repositories::access::find_permissions_by_names(conn, &wanted)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load permissions"))?;
    let known = |name: &&String| permissions.iter().any(|permission| &permission.name == *name);
    if let Some(unknown) = wanted.iter().find(|name| !known(name)) {
        return Err(ApiError::field("permissions", format!("Unknown permission: {unknown}")));
    }
    Ok(permissions.into_iter().map(|permission| permission.id).collect())
}

fn role_name_error(err: sqlx::Error, context: &'static str) -> ApiError {
    if db::is_unique_violation(&err, repositories::access::ROLE_NAME_CONSTRAINT) {
        ApiError::field("name", "The name has already been taken.")
    } else {
        ApiError::internal(err, context)
    }
}

async fn list_roles(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<RoleResponse>>, ApiError> {
    require_permission(&state, &user, Permission::ViewUsers).await?;

    let roles = repositories::access::list_roles(state.db())
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list roles"))?;
    let mut out = Vec::with_capacity(roles.len());
    for role in roles {
        out.push(role_response(&state, role).await?);
    }
    Ok(Json(out))
}

async fn create_role(
    State(state): State<AppState>,
    CurrentUser(admin): CurrentUser,
    Json(payload): Json<RoleCreate>,
) -> Result<(StatusCode, Json<RoleResponse>), ApiError> {
    let grant = require_permission(&state, &admin, Permission::ManageRoles).await?;
    payload.validate()?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::field("name", "The name field is required."));
    }

    let mut tx = state.db().begin().await.map_err(|e| ApiError::internal(e, "Failed to begin"))?;
    let permission_ids = resolve_permissions(&mut tx, &payload.permissions).await?;
    let role = repositories::access::create_role(&mut tx, name)
        .await
        .map_err(|e| role_name_error(e, "Failed to create role"))?;
    repositories::access::replace_role_permissions(&mut tx, role.id, &permission_ids)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to assign permissions"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit role"))?;

    tracing::info!(
        admin_id = grant.user_id(),
        role_id = role.id,
        role = %role.name,
        action = "role.create",
        "Role created"
    );
    Ok((StatusCode::CREATED, Json(role_response(&state, role).await?)))
}

async fn update_role(
    State(state): State<AppState>,
    CurrentUser(admin): CurrentUser,
    Path(role_id): Path<i64>,
    Json(payload): Json<RoleUpdate>,
) -> Result<Json<RoleResponse>, ApiError> {
    let grant = require_permission(&state, &admin, Permission::ManageRoles).await?;
    payload.validate()?;

    let mut tx = state.db().begin().await.map_err(|e| ApiError::internal(e, "Failed to begin"))?;
    let current = repositories::access::find_role_for_update(&mut tx, role_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load role"))?
        .ok_or_else(|| ApiError::NotFound("Role not found".to_string()))?;

    // the admin role keeps its name; the guard and bootstrap look it up by name
    let name = if current.name == ADMIN_ROLE { ADMIN_ROLE } else { payload.name.trim() };
    if name.is_empty() {
        return Err(ApiError::field("name", "The name field is required."));
    }
    let role = repositories::access::rename_role(&mut tx, role_id, name)
        .await
        .map_err(|e| role_name_error(e, "Failed to update role"))?
        .ok_or_else(|| ApiError::NotFound("Role not found".to_string()))?;
    if let Some(permissions) = &payload.permissions {
        let permission_ids = resolve_permissions(&mut tx, permissions).await?;
        repositories::access::replace_role_permissions(&mut tx, role_id, &permission_ids)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to replace permissions"))?;
    }
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit role"))?;

    tracing::info!(
        admin_id = grant.user_id(),
        role_id,
        role = %role.name,
        permissions = ?payload.permissions,
        action = "role.update",
        "Role updated"
    );
    Ok(Json(role_response(&state, role).await?))
}

async fn delete_role(
    State(state): State<AppState>,
    CurrentUser(admin): CurrentUser,
    Path(role_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let grant = require_permission(&state, &admin, Permission::ManageRoles).await?;

    let mut tx = state.db().begin().await.map_err(|e| ApiError::internal(e, "Failed to begin"))?;
    let role = repositories::access::find_role_for_update(&mut tx, role_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to load role"))?
        .ok_or_else(|| ApiError::NotFound("Role not found".to_string()))?;
    if role.name == ADMIN_ROLE {
        return Err(ApiError::Forbidden("Cannot delete admin role"));
    }
    let holders = repositories::access::count_role_users(&mut tx, role_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to count role users"))?;
    if holders > 0 {
        return Err(ApiError::Conflict("Cannot delete role that is assigned to users.".into()));
    }
    repositories::access::delete_role(&mut tx, role_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to delete role"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit role"))?;

    tracing::info!(
        admin_id = grant.user_id(),
        role_id,
        role = %role.name,
        action = "role.delete",
        "Role deleted"
    );
    Ok(StatusCode::NO_CONTENT)
}

async fn list_permissions(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<PermissionResponse>>, ApiError> {
    require_permission(&state, &user, Permission::ViewUsers).await?;

    let permissions = repositories::access::list_permissions(state.db())
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list permissions"))?;
    Ok(Json(permissions.into_iter().map(PermissionResponse::from).collect()))
}
