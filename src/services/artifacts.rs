use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use time::Date;
use tokio::sync::Semaphore;

use crate::core::config::Settings;
use crate::core::metrics as names;
use crate::core::time::{add_years, format_certificate_date};
use crate::db::models::StudentRecord;
use crate::repositories::students::ArtifactRefs;
use crate::services::documents::{
    CertificateTemplate, DocumentFields, DocumentRenderer, RenderError,
};
use crate::services::qr::{ErrorCorrection, QrEncoder, QrError};
use crate::services::storage::{BlobStore, StorageError};

/// Certificates stay valid for this many calendar years after issue.
pub(crate) const VALIDITY_YEARS: i32 = 3;
pub(crate) const ARTIFACT_PREFIX: &str = "certificates/";

const QR_FILE_NAME: &str = "qr.svg";
const QR_CONTENT_TYPE: &str = "image/svg+xml";

#[derive(Debug, Error)]
pub(crate) enum ArtifactError {
    #[error("required certificate field is missing: {0}")]
    MissingField(&'static str),
    #[error("certificate template asset missing: {0}")]
    TemplateAssetMissing(PathBuf),
    #[error(transparent)]
    Qr(#[from] QrError),
    #[error("document rendering failed: {0}")]
    Render(RenderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("artifact generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("artifact worker failed: {0}")]
    Worker(String),
}

impl From<RenderError> for ArtifactError {
    fn from(value: RenderError) -> Self {
        match value {
            RenderError::TemplateAssetMissing(path) => ArtifactError::TemplateAssetMissing(path),
            other => ArtifactError::Render(other),
        }
    }
}

/// The data a certificate is printed from.
#[derive(Debug, Clone, Default)]
pub(crate) struct CertificateSubject {
    pub(crate) certificate_number: String,
    pub(crate) student_name: String,
    pub(crate) course_name: String,
    pub(crate) issue_date: Option<Date>,
    pub(crate) hour: Option<String>,
    pub(crate) level: Option<String>,
    pub(crate) control: Option<String>,
}

impl CertificateSubject {
    pub(crate) fn from_record(record: &StudentRecord) -> Self {
        let student = &record.student;
        Self {
            certificate_number: student.certificate_number.clone().unwrap_or_default(),
            student_name: student.name.clone(),
            course_name: record.course_name.clone(),
            issue_date: student.certificate_date,
            hour: student.hour.clone(),
            level: student.level.clone(),
            control: student.control.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct IssuedArtifacts {
    pub(crate) revision: i32,
    pub(crate) qr_key: String,
    pub(crate) document_key: String,
    pub(crate) verification_url: String,
    pub(crate) document_sha256: String,
}

impl IssuedArtifacts {
    pub(crate) fn keys(&self) -> Vec<String> {
        vec![self.qr_key.clone(), self.document_key.clone()]
    }

    pub(crate) fn refs(&self) -> ArtifactRefs<'_> {
        ArtifactRefs {
            revision: self.revision,
            qr_code: &self.qr_key,
            certificate_path: &self.document_key,
            certificate_url: &self.verification_url,
            document_sha256: &self.document_sha256,
        }
    }
}

pub(crate) fn expiry_date(issue_date: Date) -> Date {
    add_years(issue_date, VALIDITY_YEARS)
}

pub(crate) fn verification_url(app_url: &str, certificate_number: &str) -> String {
    format!("{}/certificate/{}", app_url.trim_end_matches('/'), certificate_number)
}

/// Storage key of one artifact. Keyed by the student's surrogate id and a
/// revision slot reserved for this generation attempt.
pub(crate) fn artifact_key(student_id: i64, revision: i32, file_name: &str) -> String {
    format!("{ARTIFACT_PREFIX}{student_id}/r{revision}/{file_name}")
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(str::to_string)
}

pub(crate) fn document_fields(
    subject: &CertificateSubject,
) -> Result<DocumentFields, ArtifactError> {
    let certificate_number = non_empty(Some(&subject.certificate_number))
        .ok_or(ArtifactError::MissingField("certificate_number"))?;
    let student_name =
        non_empty(Some(&subject.student_name)).ok_or(ArtifactError::MissingField("name"))?;
    let course_name =
        non_empty(Some(&subject.course_name)).ok_or(ArtifactError::MissingField("course"))?;
    let issue_date = subject.issue_date.ok_or(ArtifactError::MissingField("certificate_date"))?;

    Ok(DocumentFields {
        certificate_number,
        student_name: student_name.to_uppercase(),
        course_name,
        hours: non_empty(subject.hour.as_deref()),
        level: non_empty(subject.level.as_deref()),
        control: non_empty(subject.control.as_deref()),
        issue_date: format_certificate_date(issue_date),
        expiry_date: format_certificate_date(expiry_date(issue_date)),
    })
}

/// Produces the QR image and printable document for a certificate and
/// stores both under revision-scoped keys.
#[derive(Clone)]
pub(crate) struct ArtifactGenerator {
    qr: Arc<dyn QrEncoder>,
    renderer: Arc<dyn DocumentRenderer>,
    storage: Arc<dyn BlobStore>,
    template: Arc<CertificateTemplate>,
    app_url: String,
    qr_size: u32,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ArtifactGenerator {
    pub(crate) fn new(
        settings: &Settings,
        qr: Arc<dyn QrEncoder>,
        renderer: Arc<dyn DocumentRenderer>,
        storage: Arc<dyn BlobStore>,
    ) -> Self {
        let certificate = settings.certificate();
        Self {
            qr,
            renderer,
            storage,
            template: Arc::new(CertificateTemplate::from_settings(certificate)),
            app_url: settings.api().app_url.clone(),
            qr_size: certificate.qr_size,
            permits: Arc::new(Semaphore::new(certificate.artifact_workers.max(1))),
            timeout: certificate.artifact_timeout(),
        }
    }

    pub(crate) fn template(&self) -> &CertificateTemplate {
        &self.template
    }

    pub(crate) fn verification_url(&self, certificate_number: &str) -> String {
        verification_url(&self.app_url, certificate_number)
    }

    pub(crate) async fn generate(
        &self,
        student_id: i64,
        subject: &CertificateSubject,
        revision: i32,
    ) -> Result<IssuedArtifacts, ArtifactError> {
        let started = Instant::now();
        let fields = document_fields(subject)?;
        let url = self.verification_url(&fields.certificate_number);
        let qr_key = artifact_key(student_id, revision, QR_FILE_NAME);
        let document_key = artifact_key(student_id, revision, self.renderer.file_name());

        let (qr_svg, document) = self.render(url.clone(), fields).await?;

        self.storage.put(&qr_key, QR_CONTENT_TYPE, qr_svg).await?;
        let stored = match self
            .storage
            .put(&document_key, self.renderer.content_type(), document)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                if let Err(cleanup_err) = self.storage.delete(&qr_key).await {
                    tracing::warn!(
                        key = %qr_key,
                        error = %cleanup_err,
                        "Orphaned QR image left for the reconciliation sweep"
                    );
                }
                return Err(err.into());
            }
        };

        metrics::histogram!(names::ARTIFACT_GENERATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(
            student_id,
            revision,
            key = %stored.key,
            bytes = stored.size,
            "Certificate artifacts stored"
        );

        Ok(IssuedArtifacts {
            revision,
            qr_key,
            document_key,
            verification_url: url,
            document_sha256: stored.sha256,
        })
    }

    /// CPU-bound encode and render, bounded by the worker pool and a deadline.
    async fn render(
        &self,
        url: String,
        fields: DocumentFields,
    ) -> Result<(Vec<u8>, Vec<u8>), ArtifactError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| ArtifactError::Worker(err.to_string()))?;

        let qr = self.qr.clone();
        let renderer = self.renderer.clone();
        let template = self.template.clone();
        let qr_size = self.qr_size;

        let job = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let image = qr.encode(&url, qr_size, ErrorCorrection::High)?;
            let document = renderer.render(&template, &fields, &image)?;
            Ok::<_, ArtifactError>((image.svg, document))
        });

        match tokio::time::timeout(self.timeout, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ArtifactError::Worker(join_err.to_string())),
            Err(_) => Err(ArtifactError::Timeout(self.timeout)),
        }
    }

    /// Best-effort removal; returns the keys that could not be deleted.
    pub(crate) async fn discard(&self, keys: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for key in keys {
            if let Err(err) = self.storage.delete(key).await {
                tracing::warn!(key = %key, error = %err, "Failed to delete certificate artifact");
                metrics::counter!(names::CLEANUP_FAILURES).increment(1);
                failed.push(key.clone());
            }
        }
        failed
    }
}
