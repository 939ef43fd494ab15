use std::collections::HashSet;

use anyhow::Context;
use time::Duration;

use crate::core::metrics as names;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::repositories::{artifact_cleanup, students};
use crate::services::artifacts::ARTIFACT_PREFIX;
use crate::services::lifecycle;
use crate::services::storage::StorageError;

const CLEANUP_BATCH: i64 = 100;
const CLEANUP_LEASE_SECONDS: i64 = 300;
const RETRY_BASE_SECONDS: i64 = 30;
const RETRY_CAP_SECONDS: i64 = 3600;
const RECOVERY_BATCH: i64 = 20;
const REFERENCE_CHUNK: usize = 500;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CleanupReport {
    pub(crate) removed: usize,
    pub(crate) skipped_live: usize,
    pub(crate) failed: usize,
}

/// Delay before the next attempt after `attempts` failures: 30s doubling up to an hour.
pub(crate) fn retry_delay(attempts: i32) -> Duration {
    let exponent = attempts.clamp(0, 16) as u32;
    let seconds = RETRY_BASE_SECONDS.saturating_mul(1_i64 << exponent).min(RETRY_CAP_SECONDS);
    Duration::seconds(seconds)
}

/// Works through due entries of the cleanup queue.
pub(crate) async fn drain_cleanup_queue(state: &AppState) -> anyhow::Result<CleanupReport> {
    let housekeeping = state.settings().housekeeping();
    let now = primitive_now_utc();
    let jobs = artifact_cleanup::claim_due(
        state.db(),
        now,
        now + Duration::seconds(CLEANUP_LEASE_SECONDS),
        housekeeping.cleanup_max_attempts,
        CLEANUP_BATCH,
    )
    .await
    .context("failed to claim cleanup jobs")?;

    let mut report = CleanupReport::default();
    if jobs.is_empty() {
        return Ok(report);
    }

    let keys: Vec<String> = jobs.iter().map(|job| job.blob_key.clone()).collect();
    let live: HashSet<String> =
        students::referenced_keys(state.db(), &keys).await?.into_iter().collect();

    for job in jobs {
        if live.contains(&job.blob_key) {
            tracing::warn!(key = %job.blob_key, "Queued blob is referenced again; dropping entry");
            artifact_cleanup::complete(state.db(), job.id).await?;
            report.skipped_live += 1;
            continue;
        }

        match state.storage().delete(&job.blob_key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {
                artifact_cleanup::complete(state.db(), job.id).await?;
                report.removed += 1;
            }
            Err(err) => {
                metrics::counter!(names::CLEANUP_FAILURES).increment(1);
                report.failed += 1;
                let attempts = job.attempts + 1;
                let next_attempt_at = primitive_now_utc() + retry_delay(attempts);
                artifact_cleanup::reschedule(state.db(), job.id, &err.to_string(), next_attempt_at)
                    .await?;
                if attempts >= housekeeping.cleanup_max_attempts {
                    tracing::error!(
                        key = %job.blob_key,
                        attempts,
                        reason = %job.reason,
                        error = %err,
                        "Giving up on blob deletion; entry kept for inspection"
                    );
                } else {
                    tracing::warn!(
                        key = %job.blob_key,
                        attempts,
                        error = %err,
                        "Blob deletion failed"
                    );
                }
            }
        }
    }

    if report.removed > 0 || report.failed > 0 {
        tracing::info!(
            removed = report.removed,
            skipped_live = report.skipped_live,
            failed = report.failed,
            "Cleanup queue drained"
        );
    }
    Ok(report)
}

/// Finishes creations whose artifacts never got attached, e.g. after a
/// crash between insert and issuance.
pub(crate) async fn recover_stale_pending(state: &AppState) -> anyhow::Result<usize> {
    let retry_after = state.settings().housekeeping().pending_retry_after_seconds;
    let now = primitive_now_utc();
    let before = now - Duration::seconds(i64::try_from(retry_after).unwrap_or(i64::MAX));
    let stale = students::list_stale_pending(state.db(), before, RECOVERY_BATCH)
        .await
        .context("failed to list stale pending students")?;

    let mut recovered = 0;
    for record in stale {
        let student_id = record.student.id;
        match lifecycle::complete_pending(state, &record).await {
            Ok(Some(_)) => recovered += 1,
            Ok(None) => {}
            Err(err) => {
                tracing::error!(student_id, error = %err, "Stale issuance recovery failed");
                students::touch_pending(state.db(), student_id, primitive_now_utc()).await?;
            }
        }
    }
    Ok(recovered)
}

/// Deletes certificate blobs that no student references and that are older
/// than the grace period, so in-flight generations are left alone.
pub(crate) async fn reconcile_storage(state: &AppState) -> anyhow::Result<usize> {
    let grace_minutes = state.settings().housekeeping().reconcile_grace_minutes;
    let cutoff = time::OffsetDateTime::now_utc()
        - Duration::minutes(i64::try_from(grace_minutes).unwrap_or(i64::MAX));

    let entries = state
        .storage()
        .list(ARTIFACT_PREFIX)
        .await
        .context("failed to list certificate blobs")?;
    let candidates: Vec<String> = entries
        .into_iter()
        .filter(|entry| entry.last_modified.is_some_and(|modified| modified < cutoff))
        .map(|entry| entry.key)
        .collect();

    let mut orphans = Vec::new();
    for chunk in candidates.chunks(REFERENCE_CHUNK) {
        let live: HashSet<String> =
            students::referenced_keys(state.db(), chunk).await?.into_iter().collect();
        orphans.extend(chunk.iter().filter(|key| !live.contains(*key)).cloned());
    }

    if orphans.is_empty() {
        return Ok(0);
    }
    let failed = state.artifacts().discard(&orphans).await;
    let removed = orphans.len() - failed.len();
    tracing::info!(removed, failed = failed.len(), "Reconciliation sweep removed orphaned blobs");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::ArtifactState;
    use crate::repositories;
    use crate::services::storage::BlobStore;
    use crate::test_support;
    use uuid::Uuid;

    #[test]
    fn retry_delay_doubles_until_capped() {
        assert_eq!(retry_delay(0), Duration::seconds(30));
        assert_eq!(retry_delay(1), Duration::seconds(60));
        assert_eq!(retry_delay(3), Duration::seconds(240));
        assert_eq!(retry_delay(7), Duration::seconds(3600));
        assert_eq!(retry_delay(40), Duration::seconds(3600));
    }

    #[tokio::test]
    async fn drain_removes_queued_blobs_and_keeps_failures_for_retry() {
        let ctx = test_support::setup_test_context().await;
        ctx.storage
            .put("certificates/9/r1/qr.svg", "image/svg+xml", b"<svg/>".to_vec())
            .await
            .expect("put");
        ctx.storage
            .put("certificates/9/r2/qr.svg", "image/svg+xml", b"<svg/>".to_vec())
            .await
            .expect("put");

        let keys = vec!["certificates/9/r1/qr.svg".to_string()];
        artifact_cleanup::enqueue(ctx.state.db(), &keys, "test", primitive_now_utc())
            .await
            .expect("enqueue");
        let report = drain_cleanup_queue(&ctx.state).await.expect("drain");
        assert_eq!(report, CleanupReport { removed: 1, skipped_live: 0, failed: 0 });
        assert!(!ctx.storage.contains("certificates/9/r1/qr.svg"));
        assert!(artifact_cleanup::list_pending(ctx.state.db()).await.expect("pending").is_empty());

        ctx.storage.fail_deletes(true);
        let keys = vec!["certificates/9/r2/qr.svg".to_string()];
        artifact_cleanup::enqueue(ctx.state.db(), &keys, "test", primitive_now_utc())
            .await
            .expect("enqueue");
        let report = drain_cleanup_queue(&ctx.state).await.expect("drain");
        assert_eq!(report.failed, 1);

        let pending = artifact_cleanup::list_pending(ctx.state.db()).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());
        assert!(pending[0].next_attempt_at > primitive_now_utc());

        // Not due yet, so a second pass leaves it alone.
        let report = drain_cleanup_queue(&ctx.state).await.expect("drain");
        assert_eq!(report, CleanupReport::default());
    }

    #[tokio::test]
    async fn reconcile_only_removes_old_unreferenced_blobs() {
        let ctx = test_support::setup_test_context().await;
        let old = time::OffsetDateTime::now_utc() - Duration::hours(3);
        ctx.storage.insert_aged("certificates/77/r1/certificate.pdf", b"orphan".to_vec(), old);
        ctx.storage.insert_aged("courses/1/photo.png", b"image".to_vec(), old);
        ctx.storage
            .put("certificates/78/r1/certificate.pdf", "application/pdf", b"fresh".to_vec())
            .await
            .expect("put");

        let removed = reconcile_storage(&ctx.state).await.expect("reconcile");
        assert_eq!(removed, 1);
        assert!(!ctx.storage.contains("certificates/77/r1/certificate.pdf"));
        assert!(ctx.storage.contains("certificates/78/r1/certificate.pdf"));
        assert!(ctx.storage.contains("courses/1/photo.png"));
    }

    #[tokio::test]
    async fn stale_pending_students_are_issued() {
        let ctx = test_support::setup_test_context().await;
        let course = test_support::insert_course(ctx.state.db(), "Safety").await;
        let student_id: i64 = sqlx::query_scalar(
            "INSERT INTO students (name, course_id, certificate_number, certificate_date,
                                   verification_token, status, artifact_state,
                                   created_at, updated_at)
             VALUES ('Interrupted', $1, '5', '2024-01-15', $2, 'active', 'pending', $3, $3)
             RETURNING id",
        )
        .bind(course.id)
        .bind(Uuid::new_v4())
        .bind(primitive_now_utc() - Duration::hours(1))
        .fetch_one(ctx.state.db())
        .await
        .expect("pending row");

        let recovered = recover_stale_pending(&ctx.state).await.expect("recover");
        assert_eq!(recovered, 1);

        let record = repositories::students::find(ctx.state.db(), student_id)
            .await
            .expect("find")
            .expect("student");
        assert_eq!(record.student.artifact_state, ArtifactState::Issued);
        assert_eq!(ctx.renderer.last().0.certificate_number, "5");
        assert_eq!(recover_stale_pending(&ctx.state).await.expect("recover"), 0);
    }
}
