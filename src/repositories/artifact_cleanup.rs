use sqlx::{PgExecutor, PgPool};
use time::PrimitiveDateTime;

use crate::db::models::CleanupJob;

const COLUMNS: &str = "id, blob_key, reason, attempts, last_error, next_attempt_at, created_at";

/// Records blobs that must be removed from storage. Runs inside the caller's
/// transaction when given one, so the queue entry commits with the row change.
pub(crate) async fn enqueue<'e, E>(
    executor: E,
    keys: &[String],
    reason: &str,
    now: PrimitiveDateTime,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    if keys.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        "INSERT INTO artifact_cleanup_queue (
            blob_key, reason, attempts, next_attempt_at, created_at
         )
         SELECT key, $2, 0, $3, $3 FROM unnest($1::TEXT[]) AS key",
    )
    .bind(keys)
    .bind(reason)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Leases due entries by pushing their next attempt past `lease_until`, so a
/// crashed drainer's entries become visible again later.
pub(crate) async fn claim_due(
    pool: &PgPool,
    now: PrimitiveDateTime,
    lease_until: PrimitiveDateTime,
    max_attempts: i32,
    limit: i64,
) -> Result<Vec<CleanupJob>, sqlx::Error> {
    sqlx::query_as::<_, CleanupJob>(&format!(
        "WITH due AS (
            SELECT id
            FROM artifact_cleanup_queue
            WHERE next_attempt_at <= $1 AND attempts < $2
            ORDER BY next_attempt_at, id
            FOR UPDATE SKIP LOCKED
            LIMIT $3
        )
        UPDATE artifact_cleanup_queue q
        SET next_attempt_at = $4
        FROM due
        WHERE q.id = due.id
        RETURNING q.id, q.blob_key, q.reason, q.attempts, q.last_error,
                  q.next_attempt_at, q.created_at"
    ))
    .bind(now)
    .bind(max_attempts)
    .bind(limit)
    .bind(lease_until)
    .fetch_all(pool)
    .await
}

pub(crate) async fn complete(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM artifact_cleanup_queue WHERE id = $1").bind(id).execute(pool).await?;
    Ok(())
}

/// Drops queue entries for keys that were removed outside the drainer.
pub(crate) async fn complete_keys(pool: &PgPool, keys: &[String]) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM artifact_cleanup_queue WHERE blob_key = ANY($1)")
        .bind(keys)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn reschedule(
    pool: &PgPool,
    id: i64,
    error: &str,
    next_attempt_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE artifact_cleanup_queue
         SET attempts = attempts + 1, last_error = $1, next_attempt_at = $2
         WHERE id = $3",
    )
    .bind(error)
    .bind(next_attempt_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn list_pending(pool: &PgPool) -> Result<Vec<CleanupJob>, sqlx::Error> {
    sqlx::query_as::<_, CleanupJob>(&format!(
        "SELECT {COLUMNS} FROM artifact_cleanup_queue ORDER BY id"
    ))
    .fetch_all(pool)
    .await
}
