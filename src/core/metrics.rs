use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

pub(crate) const CERTIFICATES_ISSUED: &str = "certificates_issued_total";
pub(crate) const CERTIFICATES_REISSUED: &str = "certificates_reissued_total";
pub(crate) const ALLOCATION_RETRIES: &str = "certificate_allocation_retries_total";
pub(crate) const ISSUANCE_FAILURES: &str = "certificate_issuance_failures_total";
pub(crate) const CLEANUP_FAILURES: &str = "artifact_cleanup_failures_total";
pub(crate) const ARTIFACT_GENERATION_SECONDS: &str = "artifact_generation_seconds";

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled || PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}
