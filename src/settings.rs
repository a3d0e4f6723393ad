use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Settings for one matching host. Every knob has a default tuned for
/// production; tests shrink the timers.
#[derive(Debug, Deserialize, Clone)]
pub struct MatchingSettings {
    /// Task ids granted per range lease.
    #[serde(default = "default_range_size")]
    pub range_size: i64,

    /// Page size for backlog reads.
    #[serde(default = "default_max_tasks_per_page")]
    pub max_tasks_per_page: usize,

    /// Capacity of the reader's in-memory backlog buffer.
    #[serde(default = "default_max_buffered_tasks")]
    pub max_buffered_tasks: usize,

    /// Max appends coalesced into one store write.
    #[serde(default = "default_max_append_batch_size")]
    pub max_append_batch_size: usize,

    /// Default deadline applied to polls that arrive without one.
    #[serde(default = "default_long_poll_expiration_ms")]
    pub long_poll_expiration_ms: u64,

    /// How much earlier than the caller's deadline an empty task is
    /// returned, so the empty response wins the race against the RPC
    /// timeout.
    #[serde(default = "default_return_empty_task_time_budget_ms")]
    pub return_empty_task_time_budget_ms: u64,

    /// Cap on the sync-match attempt inside AddTask.
    #[serde(default = "default_max_sync_match_wait_ms")]
    pub max_sync_match_wait_ms: u64,

    /// Probe interval for the backlog pump when no signals arrive.
    #[serde(default = "default_backlog_idle_poll_interval_ms")]
    pub backlog_idle_poll_interval_ms: u64,

    /// Dispatch rate applied until a poller advertises one.
    #[serde(default = "default_task_dispatch_rps")]
    pub default_task_dispatch_rps: f64,

    /// How many times a task may be re-appended after dispatch failures
    /// before the manager stops rather than churn the store.
    #[serde(default = "default_max_dispatch_rewrites")]
    pub max_dispatch_rewrites: u32,

    /// Minimum ack-level advance before garbage collection runs again.
    #[serde(default = "default_gc_task_threshold")]
    pub gc_task_threshold: i64,

    #[serde(default = "default_gc_min_interval_ms")]
    pub gc_min_interval_ms: u64,

    #[serde(default)]
    pub forwarder: ForwarderSettings,

    #[serde(default)]
    pub user_data: UserDataSettings,

    #[serde(default)]
    pub persistence_retry: RetrySettings,

    #[serde(default)]
    pub poller_history: PollerHistorySettings,

    #[serde(default)]
    pub log_format: LogFormat,
}

/// Output format for the tracing subscriber.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            range_size: default_range_size(),
            max_tasks_per_page: default_max_tasks_per_page(),
            max_buffered_tasks: default_max_buffered_tasks(),
            max_append_batch_size: default_max_append_batch_size(),
            long_poll_expiration_ms: default_long_poll_expiration_ms(),
            return_empty_task_time_budget_ms: default_return_empty_task_time_budget_ms(),
            max_sync_match_wait_ms: default_max_sync_match_wait_ms(),
            backlog_idle_poll_interval_ms: default_backlog_idle_poll_interval_ms(),
            default_task_dispatch_rps: default_task_dispatch_rps(),
            max_dispatch_rewrites: default_max_dispatch_rewrites(),
            gc_task_threshold: default_gc_task_threshold(),
            gc_min_interval_ms: default_gc_min_interval_ms(),
            forwarder: ForwarderSettings::default(),
            user_data: UserDataSettings::default(),
            persistence_retry: RetrySettings::default(),
            poller_history: PollerHistorySettings::default(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwarderSettings {
    /// Fan-in degree of the partition tree. 0 disables forwarding.
    #[serde(default = "default_max_children_per_node")]
    pub max_children_per_node: u32,

    /// Rate cap on task forwards to the parent.
    #[serde(default = "default_forwarder_max_rate_per_second")]
    pub max_rate_per_second: f64,

    /// Admission tokens for concurrent poll forwards.
    #[serde(default = "default_forwarder_max_outstanding")]
    pub max_outstanding_polls: usize,

    /// Admission tokens for concurrent task/query forwards.
    #[serde(default = "default_forwarder_max_outstanding")]
    pub max_outstanding_tasks: usize,

    /// Pause before re-arming a forwarding branch after an RPC error, so
    /// an unreachable parent cannot hot-spin the matcher's races.
    #[serde(default = "default_forward_error_backoff_ms")]
    pub forward_error_backoff_ms: u64,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            max_children_per_node: default_max_children_per_node(),
            max_rate_per_second: default_forwarder_max_rate_per_second(),
            max_outstanding_polls: default_forwarder_max_outstanding(),
            max_outstanding_tasks: default_forwarder_max_outstanding(),
            forward_error_backoff_ms: default_forward_error_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserDataSettings {
    #[serde(default = "default_user_data_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,

    /// Quiet interval between successful fetches, bounding request rate
    /// under rapid changes.
    #[serde(default = "default_user_data_min_wait_time_ms")]
    pub min_wait_time_ms: u64,

    /// Served long polls answer this much before the caller's deadline.
    #[serde(default = "default_user_data_return_budget_ms")]
    pub return_budget_ms: u64,

    #[serde(default = "default_user_data_retry")]
    pub retry: RetrySettings,
}

impl Default for UserDataSettings {
    fn default() -> Self {
        Self {
            long_poll_timeout_ms: default_user_data_long_poll_timeout_ms(),
            min_wait_time_ms: default_user_data_min_wait_time_ms(),
            return_budget_ms: default_user_data_return_budget_ms(),
            retry: default_user_data_retry(),
        }
    }
}

/// Exponential backoff shape shared by persistence and RPC retries.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(default = "default_retry_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_retry_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Total time budget before giving up. 0 retries forever.
    #[serde(default = "default_retry_expiration_ms")]
    pub expiration_ms: u64,

    #[serde(default = "default_retry_backoff")]
    pub backoff: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_retry_initial_interval_ms(),
            max_interval_ms: default_retry_max_interval_ms(),
            expiration_ms: default_retry_expiration_ms(),
            backoff: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerHistorySettings {
    #[serde(default = "default_poller_history_capacity")]
    pub capacity: usize,

    #[serde(default = "default_poller_history_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for PollerHistorySettings {
    fn default() -> Self {
        Self {
            capacity: default_poller_history_capacity(),
            ttl_ms: default_poller_history_ttl_ms(),
        }
    }
}

fn default_range_size() -> i64 {
    100_000
}

fn default_max_tasks_per_page() -> usize {
    1_000
}

fn default_max_buffered_tasks() -> usize {
    1_000
}

fn default_max_append_batch_size() -> usize {
    100
}

fn default_long_poll_expiration_ms() -> u64 {
    60_000
}

fn default_return_empty_task_time_budget_ms() -> u64 {
    1_000
}

fn default_max_sync_match_wait_ms() -> u64 {
    200
}

fn default_backlog_idle_poll_interval_ms() -> u64 {
    60_000
}

fn default_task_dispatch_rps() -> f64 {
    100_000.0
}

fn default_max_dispatch_rewrites() -> u32 {
    3
}

fn default_gc_task_threshold() -> i64 {
    100
}

fn default_gc_min_interval_ms() -> u64 {
    60_000
}

fn default_max_children_per_node() -> u32 {
    20
}

fn default_forwarder_max_rate_per_second() -> f64 {
    10.0
}

fn default_forwarder_max_outstanding() -> usize {
    1
}

fn default_forward_error_backoff_ms() -> u64 {
    50
}

fn default_user_data_long_poll_timeout_ms() -> u64 {
    60_000
}

fn default_user_data_min_wait_time_ms() -> u64 {
    10_000
}

fn default_user_data_return_budget_ms() -> u64 {
    1_000
}

fn default_user_data_retry() -> RetrySettings {
    RetrySettings {
        initial_interval_ms: 200,
        max_interval_ms: 10_000,
        expiration_ms: 0,
        backoff: default_retry_backoff(),
    }
}

fn default_retry_initial_interval_ms() -> u64 {
    50
}

fn default_retry_max_interval_ms() -> u64 {
    2_000
}

fn default_retry_expiration_ms() -> u64 {
    30_000
}

fn default_retry_backoff() -> f64 {
    2.0
}

fn default_poller_history_capacity() -> usize {
    1_000
}

fn default_poller_history_ttl_ms() -> u64 {
    300_000
}

impl MatchingSettings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn long_poll_expiration(&self) -> Duration {
        Duration::from_millis(self.long_poll_expiration_ms)
    }

    pub fn return_empty_task_time_budget(&self) -> Duration {
        Duration::from_millis(self.return_empty_task_time_budget_ms)
    }

    pub fn max_sync_match_wait(&self) -> Duration {
        Duration::from_millis(self.max_sync_match_wait_ms)
    }

    pub fn backlog_idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.backlog_idle_poll_interval_ms)
    }

    pub fn gc_min_interval(&self) -> Duration {
        Duration::from_millis(self.gc_min_interval_ms)
    }
}

impl ForwarderSettings {
    pub fn forward_error_backoff(&self) -> Duration {
        Duration::from_millis(self.forward_error_backoff_ms)
    }
}

impl UserDataSettings {
    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn min_wait_time(&self) -> Duration {
        Duration::from_millis(self.min_wait_time_ms)
    }

    pub fn return_budget(&self) -> Duration {
        Duration::from_millis(self.return_budget_ms)
    }
}

impl PollerHistorySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}
