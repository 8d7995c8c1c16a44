//! Configuration types for reportflow.
//!
//! `ReportflowConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default, so a partial file (or none at all)
//! is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportflowConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Durable backend location. `None` uses the main database.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Connection retries before falling back to the in-process queue.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum jobs in flight per queue.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Active jobs claimed longer ago than this are considered abandoned.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_completed_retention_ms")]
    pub completed_retention_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_connect_retries() -> u32 {
    2
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_worker_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    300_000
}
fn default_stale_after_ms() -> u64 {
    600_000
}
fn default_completed_retention_ms() -> u64 {
    86_400_000
}
fn default_cleanup_interval_ms() -> u64 {
    3_600_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retries: default_connect_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_concurrency: default_worker_concurrency(),
            default_max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            stale_after_ms: default_stale_after_ms(),
            completed_retention_ms: default_completed_retention_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lock expiry: the longest plausible single-step duration.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Queue receiving completion notifications. `None` disables them.
    #[serde(default = "default_notify_queue")]
    pub notify_queue: Option<String>,
    /// Local retries of a transient tool failure within one step.
    #[serde(default = "default_tool_retries")]
    pub tool_retries: u32,
    #[serde(default = "default_tool_backoff_base_ms")]
    pub tool_backoff_base_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    300_000
}
fn default_notify_queue() -> Option<String> {
    Some("notifications".to_string())
}
fn default_tool_retries() -> u32 {
    2
}
fn default_tool_backoff_base_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            notify_queue: default_notify_queue(),
            tool_retries: default_tool_retries(),
            tool_backoff_base_ms: default_tool_backoff_base_ms(),
        }
    }
}

impl EngineConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn tool_backoff_base(&self) -> Duration {
        Duration::from_millis(self.tool_backoff_base_ms)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enqueue one catch-up run on start when fires were missed while down.
    #[serde(default = "default_catch_up_missed")]
    pub catch_up_missed: bool,
    /// Queue that scheduled runs are dispatched to.
    #[serde(default = "default_workflow_queue")]
    pub workflow_queue: String,
    /// How often a long-running process re-syncs its timers with the
    /// stored schedules.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_catch_up_missed() -> bool {
    true
}
fn default_workflow_queue() -> String {
    "workflows".to_string()
}
fn default_reconcile_interval_ms() -> u64 {
    15_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            catch_up_missed: default_catch_up_missed(),
            workflow_queue: default_workflow_queue(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before a half-open trial.
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cool_down_ms() -> u64 {
    300_000
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_ms: default_cool_down_ms(),
        }
    }
}

impl BreakerSettings {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}
