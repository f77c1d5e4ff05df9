use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::services::queue::{DispatchQueue, QueueError};

/// Attempt budget and exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before re-admitting a job whose attempt number `attempt`
    /// (1-indexed) just failed: `min(base * 2^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt may follow the failed attempt `attempt`.
    pub fn has_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Re-admits failed jobs to the dispatch queue after their backoff.
///
/// The ready list only supports immediate delivery, so re-admission goes
/// through the queue's ready-time index; [`RetryScheduler::run_promoter`]
/// moves due entries onto the ready list.
#[derive(Clone)]
pub struct RetryScheduler {
    queue: Arc<dyn DispatchQueue>,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(queue: Arc<dyn DispatchQueue>, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Schedule `job_id` for redelivery after the backoff for `attempt`.
    pub async fn readmit(&self, job_id: Uuid, attempt: u32) -> Result<Duration, QueueError> {
        let delay = self.policy.backoff_delay(attempt);
        self.queue.schedule(job_id, delay).await?;
        tracing::debug!(job_id = %job_id, attempt, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        Ok(delay)
    }

    /// Poll the ready-time index until `shutdown` flips to true.
    pub async fn run_promoter(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = interval.as_millis() as u64, "Retry promoter started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match self.queue.promote_due().await {
                Ok(0) => {}
                Ok(moved) => tracing::debug!(moved, "Promoted delayed jobs"),
                Err(e) => tracing::error!(error = %e, "Failed to promote delayed jobs"),
            }
        }

        tracing::info!("Retry promoter stopped");
    }
}
