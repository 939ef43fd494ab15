use std::sync::Arc;

use sqlx::PgPool;

use crate::core::config::Settings;
use crate::services::access_control::{AccessControl, PgAccessControl};
use crate::services::artifacts::ArtifactGenerator;
use crate::services::documents::DocumentRenderer;
use crate::services::qr::QrEncoder;
use crate::services::storage::BlobStore;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    storage: Arc<dyn BlobStore>,
    access: Arc<dyn AccessControl>,
    artifacts: ArtifactGenerator,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        db: PgPool,
        storage: Arc<dyn BlobStore>,
        qr: Arc<dyn QrEncoder>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        let artifacts = ArtifactGenerator::new(&settings, qr, renderer, storage.clone());
        let access: Arc<dyn AccessControl> = Arc::new(PgAccessControl::new(db.clone()));
        Self { inner: Arc::new(InnerState { settings, db, storage, access, artifacts }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn storage(&self) -> &Arc<dyn BlobStore> {
        &self.inner.storage
    }

    pub(crate) fn access(&self) -> &dyn AccessControl {
        self.inner.access.as_ref()
    }

    pub(crate) fn artifacts(&self) -> &ArtifactGenerator {
        &self.inner.artifacts
    }
}
