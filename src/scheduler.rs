//! Background jobs: calendar sync, trial expiry and token cleanup.
//!
//! Jobs run in-process on `tokio-cron-scheduler` (six-field cron, seconds
//! first). Failures are logged and the next tick tries again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::auth::tokens;
use crate::billing;
use crate::sync::SyncEngine;
use crate::AppState;

/// Skips a tick while the previous run of the same job is still going
#[derive(Clone, Default)]
pub struct OverlapGuard {
    running: Arc<AtomicBool>,
}

/// Held for the duration of one run
pub struct RunPermit {
    running: Arc<AtomicBool>,
}

impl OverlapGuard {
    pub fn try_start(&self) -> Option<RunPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                running: self.running.clone(),
            })
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn guarded_job<F, Fut>(name: &'static str, cron: &str, run: F) -> anyhow::Result<Job>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let guard = OverlapGuard::default();
    let run = Arc::new(run);

    Job::new_async(cron, move |_id, _lock| {
        let guard = guard.clone();
        let run = run.clone();

        Box::pin(async move {
            let Some(_permit) = guard.try_start() else {
                tracing::warn!("Skipping {} tick: previous run still in progress", name);
                return;
            };
            tracing::debug!("Running {} job", name);
            run().await;
        })
    })
    .map_err(|e| anyhow!("invalid cron expression {:?} for {}: {:?}", cron, name, e))
}

/// Register all jobs and start the scheduler
pub async fn start(state: &AppState) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("failed to create scheduler: {:?}", e))?;

    let engine = SyncEngine::from_state(state);
    let sync_job = guarded_job("calendar sync", &state.config.sync_cron, move || {
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.sync_all().await {
                tracing::error!("Calendar sync pass failed: {}", e);
            }
        }
    })?;

    let pool = state.pool.clone();
    let trial_job = guarded_job("trial expiry", &state.config.trial_expiry_cron, move || {
        let pool = pool.clone();
        async move {
            if let Err(e) = billing::expire_trials(&pool).await {
                tracing::error!("Trial expiry failed: {}", e);
            }
        }
    })?;

    let pool = state.pool.clone();
    let cleanup_job = guarded_job("token cleanup", &state.config.token_cleanup_cron, move || {
        let pool = pool.clone();
        async move {
            match tokens::purge_expired(&pool).await {
                Ok(removed) => tracing::info!("Removed {} expired tokens", removed),
                Err(e) => tracing::error!("Token cleanup failed: {}", e),
            }
        }
    })?;

    for job in [sync_job, trial_job, cleanup_job] {
        scheduler
            .add(job)
            .await
            .map_err(|e| anyhow!("failed to register job: {:?}", e))?;
    }

    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("failed to start scheduler: {:?}", e))?;

    tracing::info!(
        "Background jobs scheduled (sync: {}, trials: {}, tokens: {})",
        state.config.sync_cron,
        state.config.trial_expiry_cron,
        state.config.token_cleanup_cron
    );
    Ok(scheduler)
}
