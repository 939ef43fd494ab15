use sqlx::{PgConnection, PgPool};

use crate::db::models::{PermissionRecord, Role};

pub(crate) const ROLE_NAME_CONSTRAINT: &str = "roles_name_key";

pub(crate) async fn user_has_role(
    pool: &PgPool,
    user_id: &str,
    role: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (
            SELECT 1
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            JOIN users u ON u.id = ur.user_id
            WHERE ur.user_id = $1 AND r.name = $2 AND u.is_active
        )",
    )
    .bind(user_id)
    .bind(role)
    .fetch_one(pool)
    .await
}

pub(crate) async fn user_has_permission(
    pool: &PgPool,
    user_id: &str,
    permission: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (
            SELECT 1
            FROM user_roles ur
            JOIN role_permissions rp ON rp.role_id = ur.role_id
            JOIN permissions p ON p.id = rp.permission_id
            JOIN users u ON u.id = ur.user_id
            WHERE ur.user_id = $1 AND p.name = $2 AND u.is_active
        )",
    )
    .bind(user_id)
    .bind(permission)
    .fetch_one(pool)
    .await
}

pub(crate) async fn role_names_for_user(
    pool: &PgPool,
    user_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT r.name
         FROM user_roles ur
         JOIN roles r ON r.id = ur.role_id
         WHERE ur.user_id = $1
         ORDER BY r.name",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn permission_names_for_user(
    pool: &PgPool,
    user_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT p.name
         FROM user_roles ur
         JOIN role_permissions rp ON rp.role_id = ur.role_id
         JOIN permissions p ON p.id = rp.permission_id
         WHERE ur.user_id = $1
         ORDER BY p.name",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_roles(pool: &PgPool) -> Result<Vec<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>("SELECT id, name FROM roles ORDER BY id").fetch_all(pool).await
}

pub(crate) async fn permissions_for_role(
    pool: &PgPool,
    role_id: i64,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT p.name
         FROM role_permissions rp
         JOIN permissions p ON p.id = rp.permission_id
         WHERE rp.role_id = $1
         ORDER BY p.id",
    )
    .bind(role_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn find_roles_by_names(
    conn: &mut PgConnection,
    names: &[String],
) -> Result<Vec<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>("SELECT id, name FROM roles WHERE name = ANY($1) ORDER BY id")
        .bind(names)
        .fetch_all(conn)
        .await
}

/// Replaces the user's role set with `role_ids`.
pub(crate) async fn replace_user_roles(
    conn: &mut PgConnection,
    user_id: &str,
    role_ids: &[i64],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO user_roles (user_id, role_id)
         SELECT $1, role_id FROM unnest($2::BIGINT[]) AS role_id",
    )
    .bind(user_id)
    .bind(role_ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Grants a role by name; a no-op when the user already holds it.
pub(crate) async fn assign_role_by_name(
    pool: &PgPool,
    user_id: &str,
    role: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO user_roles (user_id, role_id)
         SELECT $1, id FROM roles WHERE name = $2
         ON CONFLICT DO NOTHING",
    )
    .bind(user_id)
    .bind(role)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn list_permissions(pool: &PgPool) -> Result<Vec<PermissionRecord>, sqlx::Error> {
    sqlx::query_as::<_, PermissionRecord>("SELECT id, name FROM permissions ORDER BY id")
        .fetch_all(pool)
        .await
}

pub(crate) async fn find_permissions_by_names(
    conn: &mut PgConnection,
    names: &[String],
) -> Result<Vec<PermissionRecord>, sqlx::Error> {
    sqlx::query_as::<_, PermissionRecord>(
        "SELECT id, name FROM permissions WHERE name = ANY($1) ORDER BY id",
    )
    .bind(names)
    .fetch_all(conn)
    .await
}

pub(crate) async fn find_role_for_update(
    conn: &mut PgConnection,
    id: i64,
) -> Result<Option<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>("SELECT id, name FROM roles WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub(crate) async fn create_role(conn: &mut PgConnection, name: &str) -> Result<Role, sqlx::Error> {
    sqlx::query_as::<_, Role>("INSERT INTO roles (name) VALUES ($1) RETURNING id, name")
        .bind(name)
        .fetch_one(conn)
        .await
}

pub(crate) async fn rename_role(
    conn: &mut PgConnection,
    id: i64,
    name: &str,
) -> Result<Option<Role>, sqlx::Error> {
    sqlx::query_as::<_, Role>("UPDATE roles SET name = $1 WHERE id = $2 RETURNING id, name")
        .bind(name)
        .bind(id)
        .fetch_optional(conn)
        .await
}

/// Replaces the role's permission set with `permission_ids`.
pub(crate) async fn replace_role_permissions(
    conn: &mut PgConnection,
    role_id: i64,
    permission_ids: &[i64],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
        .bind(role_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO role_permissions (role_id, permission_id)
         SELECT $1, permission_id FROM unnest($2::BIGINT[]) AS permission_id",
    )
    .bind(role_id)
    .bind(permission_ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn count_role_users(
    conn: &mut PgConnection,
    role_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM user_roles WHERE role_id = $1")
        .bind(role_id)
        .fetch_one(conn)
        .await
}

pub(crate) async fn delete_role(conn: &mut PgConnection, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM roles WHERE id = $1").bind(id).execute(conn).await?;
    Ok(result.rows_affected() == 1)
}
