//! Cron-driven trigger loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::monitor::{CycleOutcome, Monitor};

/// Trigger `monitor` on every fire time of `schedule` until `shutdown`
/// resolves.
///
/// Each trigger runs on its own task, so a slow cycle never delays the
/// clock; overlapping triggers are turned away by the monitor itself. On
/// shutdown the active browser session is closed and running cycles are
/// awaited.
pub async fn run_scheduled<F>(monitor: Arc<Monitor>, schedule: Schedule, run_on_start: bool, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut cycles = JoinSet::new();

    if run_on_start {
        info!("running initial cycle");
        spawn_cycle(&mut cycles, &monitor);
    }

    let mut last_fire: DateTime<Utc> = Utc::now();
    loop {
        while cycles.try_join_next().is_some() {}

        let from = last_fire.max(Utc::now());
        let Some(next) = schedule.after(&from).next() else {
            warn!("schedule has no upcoming fire times, stopping");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(next = %next.to_rfc3339(), wait_ms = wait.as_millis() as u64, "next cycle scheduled");

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = tokio::time::sleep(wait) => {
                last_fire = next;
                spawn_cycle(&mut cycles, &monitor);
            }
        }
    }

    monitor.shutdown().await;
    while cycles.join_next().await.is_some() {}
    info!("scheduler stopped");
}

fn spawn_cycle(cycles: &mut JoinSet<()>, monitor: &Arc<Monitor>) {
    let monitor = monitor.clone();
    cycles.spawn(async move {
        match monitor.run_cycle().await {
            CycleOutcome::Completed(report) => {
                info!(items = report.items, events = report.events, "cycle finished")
            }
            CycleOutcome::Bootstrap { items } => info!(items, "catalog seeded"),
            CycleOutcome::Skipped => {}
            CycleOutcome::Failed { stage, .. } => warn!(%stage, "cycle failed, retrying on next trigger"),
        }
    });
}
