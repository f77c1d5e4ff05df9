use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::invoker::InvokerSettings;
use crate::services::retry::RetryPolicy;
use crate::services::worker::WorkerSettings;

/// Settings shared by the API server and the worker, read from the
/// environment (and `.env` when present).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the dispatch queue
    pub redis_url: String,

    #[serde(default = "default_max_attempts")]
    pub grading_max_attempts: u32,

    #[serde(default = "default_retry_base_secs")]
    pub grading_retry_base_secs: u64,

    #[serde(default = "default_retry_max_secs")]
    pub grading_retry_max_secs: u64,

    /// Bound on one grader subprocess run.
    #[serde(default = "default_timeout_secs")]
    pub grading_timeout_secs: u64,

    /// Bound on a whole attempt; defaults to the grader timeout plus 30s.
    #[serde(default)]
    pub grading_job_deadline_secs: Option<u64>,

    #[serde(default = "default_image_max_bytes")]
    pub grading_image_max_bytes: u64,

    #[serde(default = "default_max_images")]
    pub grading_max_images: usize,

    #[serde(default = "default_output_max_bytes")]
    pub grading_output_max_bytes: usize,

    #[serde(default = "default_grader_program")]
    pub grader_program: String,

    /// Comma-separated leading arguments, usually the grader script.
    #[serde(default = "default_grader_args")]
    pub grader_args: Vec<String>,

    #[serde(default)]
    pub grader_default_model: Option<String>,

    /// Parent directory for per-job scratch directories.
    #[serde(default)]
    pub grading_work_dir: Option<PathBuf>,

    /// Expiry of dispatch payloads in Redis.
    #[serde(default = "default_payload_ttl_secs")]
    pub payload_ttl_secs: u64,

    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_recover_interval_secs")]
    pub recover_interval_secs: u64,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_queue_poll_secs")]
    pub queue_poll_secs: u64,

    #[serde(default = "default_promote_interval_ms")]
    pub promote_interval_ms: u64,

    /// Optional Prometheus listener for the worker process (e.g. "0.0.0.0:9100").
    #[serde(default)]
    pub worker_metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_secs() -> u64 {
    5
}

fn default_retry_max_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_image_max_bytes() -> u64 {
    9 * 1024 * 1024
}

fn default_max_images() -> usize {
    4
}

fn default_output_max_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_grader_program() -> String {
    "python3".to_string()
}

fn default_grader_args() -> Vec<String> {
    vec!["ai_worker/grader.py".to_string()]
}

fn default_payload_ttl_secs() -> u64 {
    86_400
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_recover_interval_secs() -> u64 {
    60
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_queue_poll_secs() -> u64 {
    5
}

fn default_promote_interval_ms() -> u64 {
    500
}

/// Minimum gap between the job deadline and the stale threshold.
const STALE_MARGIN_SECS: u64 = 30;

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.grading_max_attempts.max(1),
            base_delay: Duration::from_secs(self.grading_retry_base_secs),
            max_delay: Duration::from_secs(
                self.grading_retry_max_secs.max(self.grading_retry_base_secs),
            ),
        }
    }

    pub fn invoker_settings(&self) -> InvokerSettings {
        InvokerSettings {
            program: self.grader_program.clone(),
            args: self
                .grader_args
                .iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            timeout: Duration::from_secs(self.grading_timeout_secs),
            max_output_bytes: self.grading_output_max_bytes,
            max_images: self.grading_max_images,
            max_image_bytes: self.grading_image_max_bytes,
            work_root: self.grading_work_dir.clone(),
            default_model: self.grader_default_model.clone(),
        }
    }

    fn job_deadline_secs(&self) -> u64 {
        self.grading_job_deadline_secs
            .unwrap_or(self.grading_timeout_secs + 30)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            job_deadline: Duration::from_secs(self.job_deadline_secs()),
            poll_wait: Duration::from_secs(self.queue_poll_secs.max(1)),
        }
    }

    pub fn payload_ttl(&self) -> Duration {
        Duration::from_secs(self.payload_ttl_secs)
    }

    /// Age after which a RUNNING job counts as abandoned. Never at or below
    /// the job deadline, so a live attempt is not recovered under itself.
    pub fn stale_after(&self) -> Duration {
        let floor = self.job_deadline_secs() + STALE_MARGIN_SECS;
        Duration::from_secs(self.stale_after_secs.max(floor))
    }

    pub fn recover_interval(&self) -> Duration {
        Duration::from_secs(self.recover_interval_secs)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> AppConfig {
        envy::from_iter(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/grading"),
            ("REDIS_URL", "redis://localhost"),
        ]);
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.grader_args, vec!["ai_worker/grader.py"]);

        let settings = config.invoker_settings();
        assert_eq!(settings.timeout, Duration::from_secs(180));
        assert_eq!(settings.max_images, 4);
        assert_eq!(settings.max_image_bytes, 9 * 1024 * 1024);
        assert_eq!(config.worker_settings().job_deadline, Duration::from_secs(210));
        assert_eq!(config.payload_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.stale_after(), Duration::from_secs(300));
    }

    #[test]
    fn test_stale_threshold_stays_above_deadline() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/grading"),
            ("REDIS_URL", "redis://localhost"),
            ("GRADING_TIMEOUT_SECS", "600"),
        ]);
        assert_eq!(config.worker_settings().job_deadline, Duration::from_secs(630));
        assert_eq!(config.stale_after(), Duration::from_secs(660));

        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/grading"),
            ("REDIS_URL", "redis://localhost"),
            ("GRADING_JOB_DEADLINE_SECS", "100"),
            ("STALE_AFTER_SECS", "900"),
        ]);
        assert_eq!(config.stale_after(), Duration::from_secs(900));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/grading"),
            ("REDIS_URL", "redis://localhost"),
            ("GRADING_MAX_ATTEMPTS", "5"),
            ("GRADING_TIMEOUT_SECS", "20"),
            ("GRADING_JOB_DEADLINE_SECS", "25"),
            ("GRADER_PROGRAM", "/usr/bin/env"),
            ("GRADER_ARGS", "python3,grader.py"),
            ("GRADING_WORK_DIR", "/var/tmp/grading"),
        ]);
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.worker_settings().job_deadline, Duration::from_secs(25));

        let settings = config.invoker_settings();
        assert_eq!(settings.program, "/usr/bin/env");
        assert_eq!(settings.args, vec!["python3", "grader.py"]);
        assert_eq!(settings.work_root, Some(PathBuf::from("/var/tmp/grading")));
    }

    #[test]
    fn test_missing_required() {
        let result: Result<AppConfig, _> =
            envy::from_iter(vec![("REDIS_URL".to_string(), "redis://x".to_string())]);
        assert!(result.is_err());
    }
}
