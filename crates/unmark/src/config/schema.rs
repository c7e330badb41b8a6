use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub version: String,
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    /// Defaults to `<working_directory>/uploads`.
    #[serde(default)]
    pub upload_directory: Option<PathBuf>,
    /// Without a path, job records live in memory only.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_download_url_prefix")]
    pub download_url_prefix: String,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub finalize_retry: RetryConfig,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
}

pub(crate) const DEFAULT_WORKER_COUNT: usize = 4;

fn default_working_directory() -> PathBuf {
    PathBuf::from("working_dir")
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_download_url_prefix() -> String {
    "/download/".to_string()
}

fn default_stale_after_secs() -> u64 {
    3600
}

impl ServiceConfig {
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_directory
            .clone()
            .unwrap_or_else(|| self.working_directory.join("uploads"))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            working_directory: default_working_directory(),
            upload_directory: None,
            database_path: None,
            worker_count: DEFAULT_WORKER_COUNT,
            download_url_prefix: default_download_url_prefix(),
            stale_after_secs: default_stale_after_secs(),
            batch: BatchConfig::default(),
            finalize_retry: RetryConfig::default(),
            transform: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Wall-clock cap per job. A job past its cap is finalized as `ERROR`.
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
    #[serde(default = "default_temp_directory")]
    pub temp_directory: PathBuf,
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: usize,
}

fn default_concurrency_limit() -> usize {
    20
}

fn default_temp_directory() -> PathBuf {
    PathBuf::from("tmp_batch_processing")
}

fn default_max_bundle_size() -> usize {
    20
}

impl BatchConfig {
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            job_timeout_secs: None,
            temp_directory: default_temp_directory(),
            max_bundle_size: default_max_bundle_size(),
        }
    }
}

/// Bounded exponential backoff for terminal-state writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// External program used as the video transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    200
}
