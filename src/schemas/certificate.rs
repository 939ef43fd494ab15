use serde::{Deserialize, Serialize};

use crate::core::time::{format_certificate_date, format_iso_date};
use crate::db::models::StudentRecord;
use crate::db::types::Standing;
use crate::services::listing::Page;
use crate::services::storage::BlobStore;

#[derive(Debug, Deserialize)]
pub(crate) struct CertificateListQuery {
    #[serde(default)]
    pub(crate) search: Option<String>,
    /// Course id; `0` or empty means every course.
    #[serde(default)]
    pub(crate) category: Option<String>,
    #[serde(default)]
    pub(crate) page: Option<i64>,
    #[serde(default)]
    pub(crate) per_page: Option<i64>,
}

impl CertificateListQuery {
    pub(crate) fn course_id(&self) -> Option<i64> {
        self.category
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| value.parse().ok())
            .filter(|id| *id != 0)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CertificateStudent {
    pub(crate) id: i64,
    pub(crate) name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct CertificateCourse {
    pub(crate) id: i64,
    pub(crate) name: String,
}

/// Public view of an issued certificate.
#[derive(Debug, Serialize)]
pub(crate) struct CertificateResponse {
    pub(crate) id: i64,
    pub(crate) certificate_number: String,
    pub(crate) issue_date: Option<String>,
    pub(crate) expiry_date: Option<String>,
    pub(crate) issue_date_display: Option<String>,
    pub(crate) expiry_date_display: Option<String>,
    pub(crate) hour: Option<String>,
    pub(crate) level: Option<String>,
    pub(crate) control: Option<String>,
    pub(crate) status: Standing,
    pub(crate) is_expired: bool,
    pub(crate) verification_url: Option<String>,
    pub(crate) qr_code_url: Option<String>,
    pub(crate) download_url: String,
    pub(crate) student: CertificateStudent,
    pub(crate) course: CertificateCourse,
}

impl CertificateResponse {
    pub(crate) fn from_db(
        record: StudentRecord,
        storage: &dyn BlobStore,
        api_prefix: &str,
        today: time::Date,
    ) -> Self {
        let StudentRecord { student, course_name } = record;
        let standing = student.standing(today);
        let expiry = student.expiry_date();
        Self {
            id: student.id,
            download_url: format!("{api_prefix}/certificates/{}/download", student.id),
            certificate_number: student.certificate_number.unwrap_or_default(),
            issue_date: student.certificate_date.map(format_iso_date),
            expiry_date: expiry.map(format_iso_date),
            issue_date_display: student.certificate_date.map(format_certificate_date),
            expiry_date_display: expiry.map(format_certificate_date),
            hour: student.hour,
            level: student.level,
            control: student.control,
            status: standing,
            is_expired: standing == Standing::Expired,
            verification_url: student.certificate_url,
            qr_code_url: student.qr_code.as_deref().map(|key| storage.public_url(key)),
            student: CertificateStudent { id: student.id, name: student.name },
            course: CertificateCourse { id: student.course_id, name: course_name },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PageMeta {
    pub(crate) current_page: i64,
    pub(crate) last_page: i64,
    pub(crate) per_page: i64,
    pub(crate) total: i64,
    pub(crate) from: Option<i64>,
    pub(crate) to: Option<i64>,
}

impl PageMeta {
    pub(crate) fn of<T>(page: &Page<T>) -> Self {
        Self {
            current_page: page.page,
            last_page: page.last_page(),
            per_page: page.per_page,
            total: page.total,
            from: page.from(),
            to: page.to(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CertificateListResponse<T> {
    pub(crate) data: Vec<T>,
    pub(crate) meta: PageMeta,
}

impl<T> CertificateListResponse<T> {
    pub(crate) fn from_page(page: Page<T>) -> Self {
        let meta = PageMeta::of(&page);
        Self { data: page.items, meta }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct VerificationResponse {
    pub(crate) valid: bool,
    pub(crate) status: Standing,
    pub(crate) data: CertificateResponse,
}
