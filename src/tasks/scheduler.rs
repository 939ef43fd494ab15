use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::shutdown::broadcast_shutdown;
use crate::core::state::AppState;
use crate::tasks::housekeeping;

pub(crate) async fn run(state: AppState) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let housekeeping = state.settings().housekeeping().clone();

    let handles = vec![
        tokio::spawn(cleanup_loop(
            state.clone(),
            Duration::from_secs(housekeeping.cleanup_interval_seconds.max(1)),
            shutdown_rx.clone(),
        )),
        tokio::spawn(recovery_loop(
            state.clone(),
            Duration::from_secs(housekeeping.pending_retry_after_seconds.clamp(1, 300)),
            shutdown_rx.clone(),
        )),
        tokio::spawn(reconcile_loop(
            state.clone(),
            Duration::from_secs(housekeeping.reconcile_interval_seconds.max(60)),
            shutdown_rx,
        )),
    ];

    tracing::info!("Housekeeping worker started");
    broadcast_shutdown(shutdown_tx).await;

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn cleanup_loop(state: AppState, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = housekeeping::drain_cleanup_queue(&state).await {
                    tracing::error!(error = %err, "drain_cleanup_queue failed");
                }
            }
        }
    }
}

async fn recovery_loop(state: AppState, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                match housekeeping::recover_stale_pending(&state).await {
                    Ok(0) => {}
                    Ok(recovered) => tracing::info!(recovered, "Recovered pending certificates"),
                    Err(err) => tracing::error!(error = %err, "recover_stale_pending failed"),
                }
            }
        }
    }
}

async fn reconcile_loop(state: AppState, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = housekeeping::reconcile_storage(&state).await {
                    tracing::error!(error = %err, "reconcile_storage failed");
                }
            }
        }
    }
}
