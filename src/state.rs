use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};

/// Supervision status of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppStatus {
    Running,
    Down,
    Restarting,
    Failed,
}

impl AppStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppStatus::Running => "RUNNING",
            AppStatus::Down => "DOWN",
            AppStatus::Restarting => "RESTARTING",
            AppStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per‑application bookkeeping, owned by the supervisor.
///
/// Fields are only written by [`crate::supervisor::Supervisor`] and
/// [`crate::restart::RestartController`]; everything else gets `&AppState`.
#[derive(Debug, Clone)]
pub struct AppState {
    pub status: AppStatus,
    pub last_seen_running: Option<Instant>,
    pub last_restart_attempt: Option<Instant>,
    pub restart_attempts_in_window: u32,
    /// Opened by the first attempt after a reset.
    pub window_started: Option<Instant>,
    pub last_notified_status: Option<AppStatus>,
    /// False until the first probe that produced an observation.
    pub established: bool,
}

impl AppState {
    /// Forget the budget used so far. `last_restart_attempt` is kept so the
    /// cooldown still spaces out the next launch.
    pub(crate) fn clear_restart_counters(&mut self) {
        self.restart_attempts_in_window = 0;
        self.window_started = None;
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            status: AppStatus::Down,
            last_seen_running: None,
            last_restart_attempt: None,
            restart_attempts_in_window: 0,
            window_started: None,
            last_notified_status: None,
            established: false,
        }
    }
}

/// A status transition worth telling a human about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub app: String,
    pub old: AppStatus,
    pub new: AppStatus,
    pub at: DateTime<Utc>,
}

impl fmt::Display for StatusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} → {}", self.app, self.old, self.new)
    }
}
