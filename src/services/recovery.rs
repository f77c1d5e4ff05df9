use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::submission::AiStatus;
use crate::services::queue::DispatchQueue;
use crate::store::StoreSet;

const RECOVER_BATCH: i64 = 100;
const MIN_RECOVER_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: Vec<Uuid>,
}

/// Puts jobs stranded in RUNNING by a crashed worker back on the queue.
///
/// A job is stale once its current attempt started more than `stale_after`
/// ago. Recovery keeps the attempt count, so a job that keeps crashing its
/// worker still runs out of budget.
#[derive(Clone)]
pub struct StaleJobRecovery {
    stores: StoreSet,
    queue: Arc<dyn DispatchQueue>,
    stale_after: Duration,
}

impl StaleJobRecovery {
    pub fn new(stores: StoreSet, queue: Arc<dyn DispatchQueue>, stale_after: Duration) -> Self {
        Self {
            stores,
            queue,
            stale_after,
        }
    }

    pub async fn recover_once(&self) -> Result<RecoveryReport, StoreError> {
        self.recover_older_than(self.stale_after).await
    }

    /// One sweep with an explicit threshold instead of the configured one.
    pub async fn recover_older_than(
        &self,
        stale_after: Duration,
    ) -> Result<RecoveryReport, StoreError> {
        let threshold = stale_after;
        let stale_after =
            chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let stale = self
            .stores
            .jobs
            .find_stale_running(cutoff, RECOVER_BATCH)
            .await?;

        let mut report = RecoveryReport {
            scanned: stale.len(),
            recovered: Vec::new(),
        };
        let note = format!(
            "recovered after {}s without progress",
            threshold.as_secs()
        );

        for job in stale {
            if !self.stores.jobs.recover_stale(job.id, cutoff, &note).await? {
                continue;
            }
            self.stores
                .submissions
                .set_ai_status(job.submission_version_id, AiStatus::Pending)
                .await?;
            if let Err(e) = self.queue.readmit(job.id).await {
                // Still QUEUED in the store; a manual requeue can deliver it.
                tracing::error!(job_id = %job.id, error = %e, "Failed to re-admit recovered job");
                continue;
            }
            metrics::counter!("grading_jobs_recovered_total").increment(1);
            tracing::warn!(
                job_id = %job.id,
                attempts = job.attempts,
                last_started_at = ?job.last_started_at,
                "Recovered stale running job"
            );
            report.recovered.push(job.id);
        }

        Ok(report)
    }

    /// Sweep at startup, then every `interval` (at least five seconds) until
    /// `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let interval = interval.max(MIN_RECOVER_INTERVAL);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Stale job recovery started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match self.recover_once().await {
                Ok(report) if report.recovered.is_empty() => {}
                Ok(report) => tracing::info!(recovered = report.recovered.len(), "Stale jobs recovered"),
                Err(e) => tracing::error!(error = %e, "Stale job recovery failed"),
            }
        }

        tracing::info!("Stale job recovery stopped");
    }
}
