//! Background work on the tokio runtime. Driver calls block on the serial
//! line, so they always run on the blocking pool.
use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};

use crate::controller::Controller;

/// Run a blocking closure on the blocking pool and wait for it.
pub async fn run_blocking<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(func)
        .await
        .map_err(|err| anyhow!("blocking task failed: {err}"))
}

/// Spawn a blocking task without waiting for it.
pub fn spawn_blocking_task<F, R>(func: F) -> tokio::task::JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(func)
}

/// Resolve a dispatched delivery in the background.
pub fn spawn_delivery_tracker(controller: Arc<Controller>, delivery_id: u64) {
    spawn_blocking_task(move || {
        if let Some(record) = controller.track_delivery(delivery_id) {
            log::debug!("delivery {delivery_id} resolved as {}", record.status);
        }
    });
}

/// Run the health check every `interval` until the task is aborted.
/// The first check runs one interval after start.
pub fn spawn_health_scheduler(
    controller: Arc<Controller>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let controller = controller.clone();
            match run_blocking(move || controller.run_health_check()).await {
                Ok(health) => log::info!(
                    "Scheduled health check: {} ({} error(s), {} warning(s))",
                    health.overall_status,
                    health.errors.len(),
                    health.warnings.len()
                ),
                Err(err) => log::error!("Scheduled health check failed: {err}"),
            }
        }
    })
}
