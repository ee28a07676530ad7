use serde::{Deserialize, Serialize};

/// Queue lifecycle states. `stalled` is transient: the watchdog moves a
/// stalled job back to `waiting` (or to `failed`) in the same transaction
/// that detects it, so it is observable mainly in historical rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Stalled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "stalled" => Some(JobState::Stalled),
            _ => None,
        }
    }
}

/// One row of the durable job queue.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub seq: i64,
    pub job_id: String,
    pub name: String,
    pub priority: i64,
    pub state: JobState,
    pub run_at_ms: i64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub stall_count: u32,
    pub max_stalled: u32,
    pub progress: u8,
    pub lock_expires_at_ms: Option<i64>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

/// Per-state row counts for the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// The outcome of one pipeline execution. Immutable once produced; stored
/// as the job's return value and in the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub articles_scraped: u32,
    pub articles_created: u32,
    pub duration_seconds: f64,
    pub success: bool,
    pub errors: Vec<String>,
}

impl RunResult {
    /// A run that failed before producing anything.
    pub fn failed(error: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            articles_scraped: 0,
            articles_created: 0,
            duration_seconds,
            success: false,
            errors: vec![error.into()],
        }
    }
}

/// One persisted row of the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub result: RunResult,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

/// Aggregates over the run log for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub total_executions: i64,
    pub successful_executions: i64,
    pub success_rate_pct: i64,
    pub last_finished_at_ms: Option<i64>,
    pub last_success: Option<bool>,
}

/// A generated article ready for persistence.
#[derive(Debug, Clone)]
pub struct ArticleDraft {
    pub slug: String,
    pub title: String,
    pub body: String,
    pub content_hash: String,
    pub trend_score: f64,
}

/// Agent settings as read from the settings rows, with defaults applied.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsSnapshot {
    pub enabled: bool,
    pub interval_hours: i64,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
}
