use sqlx::{PgConnection, PgExecutor};

/// Takes the next value of a named counter. The row stays locked until the
/// surrounding transaction ends, so concurrent callers queue behind it.
pub(crate) async fn next_value(conn: &mut PgConnection, name: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "UPDATE certificate_sequences
         SET last_value = last_value + 1
         WHERE name = $1
         RETURNING last_value",
    )
    .bind(name)
    .fetch_one(conn)
    .await
}

pub(crate) async fn advance_to(
    conn: &mut PgConnection,
    name: &str,
    value: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE certificate_sequences
         SET last_value = GREATEST(last_value, $2)
         WHERE name = $1",
    )
    .bind(name)
    .bind(value)
    .execute(conn)
    .await?;
    Ok(())
}

/// Moves the counter past every purely numeric certificate number in use.
pub(crate) async fn resync_with_students<'e, E>(executor: E, name: &str) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar::<_, i64>(
        "UPDATE certificate_sequences
         SET last_value = GREATEST(
             last_value,
             (SELECT COALESCE(MAX(certificate_number::BIGINT), 0)
              FROM students
              WHERE certificate_number ~ '^[1-9][0-9]{0,17}$')
         )
         WHERE name = $1
         RETURNING last_value",
    )
    .bind(name)
    .fetch_one(executor)
    .await
}

/// Hands a value back only when nothing was allocated after it.
pub(crate) async fn release<'e, E>(executor: E, name: &str, value: i64) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE certificate_sequences
         SET last_value = last_value - 1
         WHERE name = $1 AND last_value = $2",
    )
    .bind(name)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
pub(crate) async fn current<'e, E>(executor: E, name: &str) -> Result<i64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_scalar::<_, i64>("SELECT last_value FROM certificate_sequences WHERE name = $1")
        .bind(name)
        .fetch_one(executor)
        .await
}
