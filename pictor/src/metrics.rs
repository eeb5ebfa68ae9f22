//! Per-task and per-session timing aggregation.
//!
//! Metrics are collected on the pipeline context as stages start and finish,
//! then handed to the pipeline's metrics handler (if one is installed) on the
//! delivery context after the task terminates. Cancelled tasks get metrics
//! even though they get no completion callback.

use chrono::{DateTime, Utc};

/// Timings and flags for one task.
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    /// The task's numeric identifier.
    pub task_id: u64,
    /// When the task was submitted.
    pub start_date: DateTime<Utc>,
    /// When the task reached a terminal state.
    pub end_date: Option<DateTime<Utc>>,
    /// True when the task was cancelled before completion.
    pub was_cancelled: bool,
    /// True when the task joined an already-running load session.
    pub was_subscribed_to_existing_session: bool,
    /// True when the task was served directly from the memory cache.
    pub is_memory_cache_hit: bool,
    /// When the task's final processing run started.
    pub process_start_date: Option<DateTime<Utc>>,
    /// When the task's final processing run finished.
    pub process_end_date: Option<DateTime<Utc>>,
    /// Metrics of the load session this task subscribed to, when one ran.
    pub session: Option<SessionMetrics>,
}

impl TaskMetrics {
    /// Creates metrics for a freshly submitted task.
    pub fn new(task_id: u64) -> Self {
        Self {
            task_id,
            start_date: Utc::now(),
            end_date: None,
            was_cancelled: false,
            was_subscribed_to_existing_session: false,
            is_memory_cache_hit: false,
            process_start_date: None,
            process_end_date: None,
            session: None,
        }
    }

    /// Wall-clock duration from submit to terminal, when finished.
    pub fn total_duration(&self) -> Option<chrono::Duration> {
        self.end_date.map(|end| end - self.start_date)
    }
}

/// Timings and counters for one load session.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// The session's numeric identifier.
    pub session_id: u64,
    /// Disk-cache probe window.
    pub disk_probe_start_date: Option<DateTime<Utc>>,
    pub disk_probe_end_date: Option<DateTime<Utc>>,
    /// Network transfer window.
    pub network_start_date: Option<DateTime<Utc>>,
    pub network_end_date: Option<DateTime<Utc>>,
    /// Final decode window.
    pub decode_start_date: Option<DateTime<Utc>>,
    pub decode_end_date: Option<DateTime<Utc>>,
    /// Bytes fetched over the network during this session (excludes any
    /// resumed prefix).
    pub downloaded_data_count: u64,
    /// True when the session started from stored resumable data.
    pub was_resumed: bool,
    /// Size of the resumed prefix in bytes.
    pub resumed_data_count: u64,
    /// True when the server honored the conditional range request.
    pub server_confirmed_resume: bool,
    /// True when the session was torn down by cancellation.
    pub was_cancelled: bool,
    /// When the session was removed from the session table.
    pub end_date: Option<DateTime<Utc>>,
}

impl SessionMetrics {
    /// Creates metrics for a freshly created session.
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            disk_probe_start_date: None,
            disk_probe_end_date: None,
            network_start_date: None,
            network_end_date: None,
            decode_start_date: None,
            decode_end_date: None,
            downloaded_data_count: 0,
            was_resumed: false,
            resumed_data_count: 0,
            server_confirmed_resume: false,
            was_cancelled: false,
            end_date: None,
        }
    }
}
