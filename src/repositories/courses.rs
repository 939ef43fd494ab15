use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use time::PrimitiveDateTime;

use crate::db::models::Course;

const COLUMNS: &str = "id, name, description, teacher, images, created_at, updated_at";

pub(crate) struct CourseFields<'a> {
    pub(crate) name: &'a str,
    pub(crate) description: &'a str,
    pub(crate) teacher: &'a str,
}

pub(crate) async fn create(
    pool: &PgPool,
    fields: &CourseFields<'_>,
    now: PrimitiveDateTime,
) -> Result<Course, sqlx::Error> {
    sqlx::query_as::<_, Course>(&format!(
        "INSERT INTO courses (name, description, teacher, images, created_at, updated_at)
         VALUES ($1, $2, $3, '[]'::jsonb, $4, $4)
         RETURNING {COLUMNS}"
    ))
    .bind(fields.name)
    .bind(fields.description)
    .bind(fields.teacher)
    .bind(now)
    .fetch_one(pool)
    .await
}

pub(crate) async fn find(pool: &PgPool, id: i64) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(&format!("SELECT {COLUMNS} FROM courses WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn find_for_update(
    conn: &mut PgConnection,
    id: i64,
) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(&format!("SELECT {COLUMNS} FROM courses WHERE id = $1 FOR UPDATE"))
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub(crate) async fn list_all(pool: &PgPool) -> Result<Vec<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(&format!("SELECT {COLUMNS} FROM courses ORDER BY id"))
        .fetch_all(pool)
        .await
}

fn push_search(builder: &mut QueryBuilder<'_, Postgres>, search: Option<&str>) {
    if let Some(search) = search {
        builder.push(" WHERE name ILIKE ");
        builder.push_bind(super::like_pattern(search));
        builder.push(" ESCAPE '\\'");
    }
}

pub(crate) async fn count(pool: &PgPool, search: Option<&str>) -> Result<i64, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM courses");
    push_search(&mut builder, search);
    builder.build_query_scalar::<i64>().fetch_one(pool).await
}

pub(crate) async fn list_page(
    pool: &PgPool,
    search: Option<&str>,
    offset: i64,
    limit: i64,
) -> Result<Vec<Course>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM courses"));
    push_search(&mut builder, search);
    builder.push(" ORDER BY created_at DESC, id DESC OFFSET ");
    builder.push_bind(offset.max(0));
    builder.push(" LIMIT ");
    builder.push_bind(limit.clamp(1, 100));
    builder.build_query_as::<Course>().fetch_all(pool).await
}

pub(crate) async fn update(
    pool: &PgPool,
    id: i64,
    fields: &CourseFields<'_>,
    now: PrimitiveDateTime,
) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(&format!(
        "UPDATE courses
         SET name = $1, description = $2, teacher = $3, updated_at = $4
         WHERE id = $5
         RETURNING {COLUMNS}"
    ))
    .bind(fields.name)
    .bind(fields.description)
    .bind(fields.teacher)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn append_images(
    pool: &PgPool,
    id: i64,
    keys: &[String],
    now: PrimitiveDateTime,
) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(&format!(
        "UPDATE courses
         SET images = images || $1, updated_at = $2
         WHERE id = $3
         RETURNING {COLUMNS}"
    ))
    .bind(Json(keys))
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Deletes the course; its students go with it through the foreign key cascade.
pub(crate) async fn delete(conn: &mut PgConnection, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM courses WHERE id = $1").bind(id).execute(conn).await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn set_images(
    conn: &mut PgConnection,
    id: i64,
    keys: &[String],
    now: PrimitiveDateTime,
) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as::<_, Course>(&format!(
        "UPDATE courses SET images = $1, updated_at = $2 WHERE id = $3 RETURNING {COLUMNS}"
    ))
    .bind(Json(keys))
    .bind(now)
    .bind(id)
    .fetch_optional(conn)
    .await
}
