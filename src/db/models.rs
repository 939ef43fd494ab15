use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::{Date, PrimitiveDateTime};
use uuid::Uuid;

use crate::db::types::{ArtifactState, CertificateStatus, LifecycleState, Standing};
use crate::services::artifacts::expiry_date;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct User {
    pub(crate) id: String,
    pub(crate) email: String,
    pub(crate) hashed_password: String,
    pub(crate) full_name: String,
    pub(crate) is_active: bool,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Role {
    pub(crate) id: i64,
    pub(crate) name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct PermissionRecord {
    pub(crate) id: i64,
    pub(crate) name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Course {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) teacher: String,
    pub(crate) images: Json<Vec<String>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// A course participant together with the certificate issued to them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Student {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) course_id: i64,
    pub(crate) certificate_number: Option<String>,
    pub(crate) certificate_date: Option<Date>,
    pub(crate) qr_code: Option<String>,
    pub(crate) certificate_path: Option<String>,
    pub(crate) certificate_url: Option<String>,
    pub(crate) document_sha256: Option<String>,
    pub(crate) hour: Option<String>,
    pub(crate) level: Option<String>,
    pub(crate) control: Option<String>,
    pub(crate) passport: Option<String>,
    pub(crate) verification_token: Uuid,
    pub(crate) status: CertificateStatus,
    pub(crate) artifact_state: ArtifactState,
    pub(crate) artifact_revision: i32,
    pub(crate) last_revision: i32,
    pub(crate) reissue_count: i32,
    /// Bumped by every write to the row; guards read-modify-write updates.
    pub(crate) row_version: i32,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

impl Student {
    pub(crate) fn lifecycle_state(&self) -> LifecycleState {
        LifecycleState::derive(self.artifact_state, self.reissue_count)
    }

    pub(crate) fn expiry_date(&self) -> Option<Date> {
        self.certificate_date.map(expiry_date)
    }

    pub(crate) fn standing(&self, today: Date) -> Standing {
        Standing::resolve(self.status, self.expiry_date(), today)
    }

    pub(crate) fn is_issued(&self) -> bool {
        self.artifact_state == ArtifactState::Issued
    }

    /// Storage keys of the QR image and document currently referenced by the row.
    pub(crate) fn artifact_keys(&self) -> Vec<String> {
        [&self.qr_code, &self.certificate_path].into_iter().flatten().cloned().collect()
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct StudentRecord {
    #[sqlx(flatten)]
    pub(crate) student: Student,
    pub(crate) course_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct CleanupJob {
    pub(crate) id: i64,
    pub(crate) blob_key: String,
    pub(crate) reason: String,
    pub(crate) attempts: i32,
    pub(crate) last_error: Option<String>,
    pub(crate) next_attempt_at: PrimitiveDateTime,
    pub(crate) created_at: PrimitiveDateTime,
}
