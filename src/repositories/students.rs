use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder};
use time::{Date, PrimitiveDateTime};
use uuid::Uuid;

use crate::db::models::{Student, StudentRecord};
use crate::db::types::{ArtifactState, CertificateStatus};

pub(crate) const NUMBER_CONSTRAINT: &str = "students_certificate_number_key";

const COLUMNS: &str = "\
    s.id, s.name, s.course_id, s.certificate_number, s.certificate_date, s.qr_code, \
    s.certificate_path, s.certificate_url, s.document_sha256, s.hour, s.level, s.control, \
    s.passport, s.verification_token, s.status, s.artifact_state, s.artifact_revision, \
    s.last_revision, s.reissue_count, s.row_version, s.created_at, s.updated_at";

fn record_select() -> String {
    format!(
        "SELECT {COLUMNS}, c.name AS course_name
         FROM students s
         JOIN courses c ON c.id = s.course_id"
    )
}

const RETURNING: &str = "\
    id, name, course_id, certificate_number, certificate_date, qr_code, certificate_path, \
    certificate_url, document_sha256, hour, level, control, passport, verification_token, \
    status, artifact_state, artifact_revision, last_revision, reissue_count, row_version, \
    created_at, updated_at";

pub(crate) struct StudentFields<'a> {
    pub(crate) name: &'a str,
    pub(crate) course_id: i64,
    pub(crate) certificate_number: &'a str,
    pub(crate) certificate_date: Date,
    pub(crate) hour: Option<&'a str>,
    pub(crate) level: Option<&'a str>,
    pub(crate) control: Option<&'a str>,
    pub(crate) passport: Option<&'a str>,
}

pub(crate) struct ArtifactRefs<'a> {
    pub(crate) revision: i32,
    pub(crate) qr_code: &'a str,
    pub(crate) certificate_path: &'a str,
    pub(crate) certificate_url: &'a str,
    pub(crate) document_sha256: &'a str,
}

pub(crate) async fn insert_pending(
    conn: &mut PgConnection,
    fields: &StudentFields<'_>,
    verification_token: Uuid,
    now: PrimitiveDateTime,
) -> Result<Student, sqlx::Error> {
    sqlx::query_as::<_, Student>(&format!(
        "INSERT INTO students (
            name, course_id, certificate_number, certificate_date, hour, level, control,
            passport, verification_token, status, artifact_state, artifact_revision,
            last_revision, reissue_count, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,0,1,0,$12,$12)
        RETURNING {RETURNING}"
    ))
    .bind(fields.name)
    .bind(fields.course_id)
    .bind(fields.certificate_number)
    .bind(fields.certificate_date)
    .bind(fields.hour)
    .bind(fields.level)
    .bind(fields.control)
    .bind(fields.passport)
    .bind(verification_token)
    .bind(CertificateStatus::Active)
    .bind(ArtifactState::Pending)
    .bind(now)
    .fetch_one(conn)
    .await
}

/// Stores fresh artifact references when the live revision is still
/// `expected_revision`. Returns `None` when another writer moved it first.
pub(crate) async fn attach_artifacts<'e, E>(
    executor: E,
    id: i64,
    refs: &ArtifactRefs<'_>,
    expected_revision: i32,
    now: PrimitiveDateTime,
) -> Result<Option<Student>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Student>(&format!(
        "UPDATE students
         SET qr_code = $1,
             certificate_path = $2,
             certificate_url = $3,
             document_sha256 = $4,
             artifact_state = $5,
             artifact_revision = $6,
             row_version = row_version + 1,
             updated_at = $7
         WHERE id = $8 AND artifact_revision = $9
         RETURNING {RETURNING}"
    ))
    .bind(refs.qr_code)
    .bind(refs.certificate_path)
    .bind(refs.certificate_url)
    .bind(refs.document_sha256)
    .bind(ArtifactState::Issued)
    .bind(refs.revision)
    .bind(now)
    .bind(id)
    .bind(expected_revision)
    .fetch_optional(executor)
    .await
}

/// Overwrites every editable field, and the artifact references when `refs` is given.
/// Returns `None` when the row no longer carries `expected_version`.
pub(crate) async fn replace(
    conn: &mut PgConnection,
    id: i64,
    fields: &StudentFields<'_>,
    refs: Option<&ArtifactRefs<'_>>,
    expected_version: i32,
    now: PrimitiveDateTime,
) -> Result<Option<Student>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("UPDATE students SET name = ");
    builder.push_bind(fields.name);
    builder.push(", course_id = ");
    builder.push_bind(fields.course_id);
    builder.push(", certificate_number = ");
    builder.push_bind(fields.certificate_number);
    builder.push(", certificate_date = ");
    builder.push_bind(fields.certificate_date);
    builder.push(", hour = ");
    builder.push_bind(fields.hour);
    builder.push(", level = ");
    builder.push_bind(fields.level);
    builder.push(", control = ");
    builder.push_bind(fields.control);
    builder.push(", passport = ");
    builder.push_bind(fields.passport);

    if let Some(refs) = refs {
        builder.push(", qr_code = ");
        builder.push_bind(refs.qr_code);
        builder.push(", certificate_path = ");
        builder.push_bind(refs.certificate_path);
        builder.push(", certificate_url = ");
        builder.push_bind(refs.certificate_url);
        builder.push(", document_sha256 = ");
        builder.push_bind(refs.document_sha256);
        builder.push(", reissue_count = reissue_count + CASE WHEN artifact_state = ");
        builder.push_bind(ArtifactState::Issued);
        builder.push(" THEN 1 ELSE 0 END, artifact_state = ");
        builder.push_bind(ArtifactState::Issued);
        builder.push(", artifact_revision = ");
        builder.push_bind(refs.revision);
    }

    builder.push(", row_version = row_version + 1, updated_at = ");
    builder.push_bind(now);
    builder.push(" WHERE id = ");
    builder.push_bind(id);
    builder.push(" AND row_version = ");
    builder.push_bind(expected_version);
    builder.push(format!(" RETURNING {RETURNING}"));

    builder.build_query_as::<Student>().fetch_optional(conn).await
}

/// Claims the next artifact revision for a student. Every generation attempt
/// gets its own slot, so concurrent attempts never share storage keys.
pub(crate) async fn reserve_revision(pool: &PgPool, id: i64) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar::<_, i32>(
        "UPDATE students SET last_revision = last_revision + 1
         WHERE id = $1
         RETURNING last_revision",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Whether another student already holds `number`.
pub(crate) async fn number_taken(
    pool: &PgPool,
    number: &str,
    except_id: Option<i64>,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (
            SELECT 1 FROM students
            WHERE certificate_number = $1 AND ($2::BIGINT IS NULL OR id <> $2)
        )",
    )
    .bind(number)
    .bind(except_id)
    .fetch_one(pool)
    .await
}

pub(crate) async fn find(pool: &PgPool, id: i64) -> Result<Option<StudentRecord>, sqlx::Error> {
    sqlx::query_as::<_, StudentRecord>(&format!("{} WHERE s.id = $1", record_select()))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn find_for_update(
    conn: &mut PgConnection,
    id: i64,
) -> Result<Option<Student>, sqlx::Error> {
    sqlx::query_as::<_, Student>(&format!(
        "SELECT {COLUMNS} FROM students s WHERE s.id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub(crate) async fn find_issued_by_number(
    pool: &PgPool,
    number: &str,
) -> Result<Option<StudentRecord>, sqlx::Error> {
    sqlx::query_as::<_, StudentRecord>(&format!(
        "{} WHERE s.certificate_number = $1 AND s.artifact_state = $2",
        record_select()
    ))
    .bind(number)
    .bind(ArtifactState::Issued)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn find_issued_by_token(
    pool: &PgPool,
    token: Uuid,
) -> Result<Option<StudentRecord>, sqlx::Error> {
    sqlx::query_as::<_, StudentRecord>(&format!(
        "{} WHERE s.verification_token = $1 AND s.artifact_state = $2",
        record_select()
    ))
    .bind(token)
    .bind(ArtifactState::Issued)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn set_status(
    pool: &PgPool,
    id: i64,
    status: CertificateStatus,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE students SET status = $1, row_version = row_version + 1, updated_at = $2
         WHERE id = $3",
    )
    .bind(status)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn delete(conn: &mut PgConnection, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM students WHERE id = $1").bind(id).execute(conn).await?;
    Ok(result.rows_affected() == 1)
}

/// Removes a row whose artifacts were never attached.
pub(crate) async fn delete_pending(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM students WHERE id = $1 AND artifact_state = $2")
        .bind(id)
        .bind(ArtifactState::Pending)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) async fn artifact_keys_for_course(
    conn: &mut PgConnection,
    course_id: i64,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT key
         FROM students, unnest(ARRAY[qr_code, certificate_path]) AS key
         WHERE course_id = $1 AND key IS NOT NULL",
    )
    .bind(course_id)
    .fetch_all(conn)
    .await
}

/// Which of the given storage keys are still referenced by some student.
pub(crate) async fn referenced_keys(
    pool: &PgPool,
    keys: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT key
         FROM students, unnest(ARRAY[qr_code, certificate_path]) AS key
         WHERE key = ANY($1)",
    )
    .bind(keys)
    .fetch_all(pool)
    .await
}

pub(crate) async fn list_stale_pending(
    pool: &PgPool,
    updated_before: PrimitiveDateTime,
    limit: i64,
) -> Result<Vec<StudentRecord>, sqlx::Error> {
    sqlx::query_as::<_, StudentRecord>(&format!(
        "{} WHERE s.artifact_state = $1 AND s.updated_at < $2 ORDER BY s.updated_at LIMIT $3",
        record_select()
    ))
    .bind(ArtifactState::Pending)
    .bind(updated_before)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Bumps `updated_at` so a pending row is not picked up again right away.
pub(crate) async fn touch_pending(
    pool: &PgPool,
    id: i64,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE students SET updated_at = $1 WHERE id = $2 AND artifact_state = $3")
            .bind(now)
            .bind(id)
            .bind(ArtifactState::Pending)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) struct ListParams {
    pub(crate) search: Option<String>,
    pub(crate) course_id: Option<i64>,
    pub(crate) issued_only: bool,
    pub(crate) offset: i64,
    pub(crate) limit: i64,
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, params: &ListParams) {
    builder.push(" WHERE TRUE");
    if params.issued_only {
        builder.push(" AND s.artifact_state = ");
        builder.push_bind(ArtifactState::Issued);
    }
    if let Some(course_id) = params.course_id {
        builder.push(" AND s.course_id = ");
        builder.push_bind(course_id);
    }
    if let Some(search) = &params.search {
        let pattern = super::like_pattern(search);
        builder.push(" AND (s.certificate_number ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" ESCAPE '\\' OR s.name ILIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" ESCAPE '\\' OR c.name ILIKE ");
        builder.push_bind(pattern);
        builder.push(" ESCAPE '\\')");
    }
}

pub(crate) async fn count(pool: &PgPool, params: &ListParams) -> Result<i64, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT COUNT(*) FROM students s JOIN courses c ON c.id = s.course_id",
    );
    push_filters(&mut builder, params);
    builder.build_query_scalar::<i64>().fetch_one(pool).await
}

pub(crate) async fn list(
    pool: &PgPool,
    params: &ListParams,
) -> Result<Vec<StudentRecord>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(record_select());
    push_filters(&mut builder, params);
    builder.push(" ORDER BY s.created_at DESC, s.id DESC OFFSET ");
    builder.push_bind(params.offset.max(0));
    builder.push(" LIMIT ");
    builder.push_bind(params.limit.clamp(1, 100));
    builder.build_query_as::<StudentRecord>().fetch_all(pool).await
}
