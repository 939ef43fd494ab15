use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::core::time::{format_iso_date, format_primitive};
use crate::db::models::StudentRecord;
use crate::db::types::{CertificateStatus, LifecycleState};
use crate::services::storage::BlobStore;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct StudentCreate {
    #[validate(length(min = 1, max = 255, message = "The name field is required."))]
    pub(crate) name: String,
    pub(crate) course_id: i64,
    #[serde(default)]
    pub(crate) certificate_number: Option<String>,
    /// `YYYY-MM-DD`; today when omitted.
    #[serde(default)]
    pub(crate) certificate_date: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) hour: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) level: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) control: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) passport: Option<String>,
}

/// Partial update; absent fields keep their value, empty strings clear
/// optional text.
#[derive(Debug, Default, Deserialize, Validate)]
pub(crate) struct StudentUpdate {
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) course_id: Option<i64>,
    #[serde(default)]
    pub(crate) certificate_number: Option<String>,
    #[serde(default)]
    pub(crate) certificate_date: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) hour: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) level: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) control: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub(crate) passport: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StudentListQuery {
    #[serde(default)]
    pub(crate) search: Option<String>,
    #[serde(default)]
    pub(crate) course_id: Option<i64>,
    #[serde(default)]
    pub(crate) page: Option<i64>,
    #[serde(default)]
    pub(crate) per_page: Option<i64>,
}

/// Admin view of a student with its certificate bookkeeping.
#[derive(Debug, Serialize)]
pub(crate) struct StudentResponse {
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) course_id: i64,
    pub(crate) course_name: String,
    pub(crate) certificate_number: Option<String>,
    pub(crate) certificate_date: Option<String>,
    pub(crate) expiry_date: Option<String>,
    pub(crate) hour: Option<String>,
    pub(crate) level: Option<String>,
    pub(crate) control: Option<String>,
    pub(crate) passport: Option<String>,
    pub(crate) verification_token: Uuid,
    pub(crate) status: CertificateStatus,
    pub(crate) lifecycle_state: LifecycleState,
    pub(crate) artifact_revision: i32,
    pub(crate) certificate_url: Option<String>,
    pub(crate) qr_code_url: Option<String>,
    pub(crate) document_url: Option<String>,
    pub(crate) document_sha256: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl StudentResponse {
    pub(crate) fn from_db(record: StudentRecord, storage: &dyn BlobStore) -> Self {
        let StudentRecord { student, course_name } = record;
        Self {
            id: student.id,
            lifecycle_state: student.lifecycle_state(),
            expiry_date: student.expiry_date().map(format_iso_date),
            qr_code_url: student.qr_code.as_deref().map(|key| storage.public_url(key)),
            document_url: student.certificate_path.as_deref().map(|key| storage.public_url(key)),
            name: student.name,
            course_id: student.course_id,
            course_name,
            certificate_number: student.certificate_number,
            certificate_date: student.certificate_date.map(format_iso_date),
            hour: student.hour,
            level: student.level,
            control: student.control,
            passport: student.passport,
            verification_token: student.verification_token,
            status: student.status,
            artifact_revision: student.artifact_revision,
            certificate_url: student.certificate_url,
            document_sha256: student.document_sha256,
            created_at: format_primitive(student.created_at),
            updated_at: format_primitive(student.updated_at),
        }
    }
}
