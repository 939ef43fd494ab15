pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::services::documents::PdfRenderer;
use crate::services::qr::SvgQrEncoder;

async fn build_state() -> anyhow::Result<AppState> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let storage = services::storage::from_settings(&settings).await?;
    let state = AppState::new(
        settings,
        db_pool,
        storage,
        Arc::new(SvgQrEncoder),
        Arc::new(PdfRenderer),
    );
    core::bootstrap::check_template_assets(&state);
    Ok(state)
}

pub async fn run() -> anyhow::Result<()> {
    let state = build_state().await?;

    if let Err(err) = core::bootstrap::ensure_superuser(&state).await {
        tracing::error!(error = %err, "Failed to ensure default superuser");
    }
    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Certificate registry listening"
    );

    axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await?;
    tracing::info!("Certificate registry stopped");
    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    let state = build_state().await?;
    tasks::scheduler::run(state).await
}
