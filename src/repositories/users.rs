use sqlx::{PgConnection, PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::User;

const COLUMNS: &str = "id, email, hashed_password, full_name, is_active, created_at, updated_at";

pub(crate) const EMAIL_CONSTRAINT: &str = "users_email_key";

pub(crate) async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users WHERE lower(email) = lower($1)"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await
}

pub(crate) struct CreateUser<'a> {
    pub(crate) id: &'a str,
    pub(crate) email: &'a str,
    pub(crate) hashed_password: String,
    pub(crate) full_name: &'a str,
    pub(crate) is_active: bool,
    pub(crate) now: PrimitiveDateTime,
}

pub(crate) async fn create(
    conn: &mut PgConnection,
    params: CreateUser<'_>,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (
            id, email, hashed_password, full_name, is_active, created_at, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $6)
         RETURNING {COLUMNS}"
    ))
    .bind(params.id)
    .bind(params.email)
    .bind(params.hashed_password)
    .bind(params.full_name)
    .bind(params.is_active)
    .bind(params.now)
    .fetch_one(conn)
    .await
}

pub(crate) struct UpdateUser {
    pub(crate) email: Option<String>,
    pub(crate) full_name: Option<String>,
    pub(crate) is_active: Option<bool>,
    pub(crate) hashed_password: Option<String>,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// Changes the given fields; `None` keeps the stored value.
pub(crate) async fn update<'e, E>(
    executor: E,
    id: &str,
    params: UpdateUser,
) -> Result<Option<User>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET
            email = COALESCE($1, email),
            full_name = COALESCE($2, full_name),
            is_active = COALESCE($3, is_active),
            hashed_password = COALESCE($4, hashed_password),
            updated_at = $5
         WHERE id = $6
         RETURNING {COLUMNS}"
    ))
    .bind(params.email)
    .bind(params.full_name)
    .bind(params.is_active)
    .bind(params.hashed_password)
    .bind(params.updated_at)
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn delete(pool: &PgPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM users WHERE id = $1").bind(id).execute(pool).await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn list(pool: &PgPool, offset: i64, limit: i64) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users ORDER BY created_at DESC, id OFFSET $1 LIMIT $2"
    ))
    .bind(offset.max(0))
    .bind(limit.clamp(1, 100))
    .fetch_all(pool)
    .await
}

pub(crate) async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users").fetch_one(pool).await
}
