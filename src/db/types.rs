use serde::{Deserialize, Serialize};
use sqlx::Type;
use time::Date;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "certificate_status", rename_all = "lowercase")]
pub(crate) enum CertificateStatus {
    Active,
    Revoked,
    Expired,
}

/// Whether the student's QR code and document have been produced yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "artifact_state", rename_all = "lowercase")]
pub(crate) enum ArtifactState {
    Pending,
    Issued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LifecycleState {
    Unissued,
    Issued,
    Reissued,
}

impl LifecycleState {
    pub(crate) fn derive(state: ArtifactState, reissue_count: i32) -> Self {
        match state {
            ArtifactState::Pending => LifecycleState::Unissued,
            ArtifactState::Issued if reissue_count > 0 => LifecycleState::Reissued,
            ArtifactState::Issued => LifecycleState::Issued,
        }
    }
}

/// What a public verification reports for a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Standing {
    Valid,
    Expired,
    Revoked,
}

impl Standing {
    pub(crate) fn resolve(status: CertificateStatus, expiry: Option<Date>, today: Date) -> Self {
        match status {
            CertificateStatus::Revoked => Standing::Revoked,
            CertificateStatus::Expired => Standing::Expired,
            CertificateStatus::Active if expiry.is_some_and(|expiry| expiry < today) => {
                Standing::Expired
            }
            CertificateStatus::Active => Standing::Valid,
        }
    }

    pub(crate) fn is_valid(self) -> bool {
        self != Standing::Revoked
    }
}
