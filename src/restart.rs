//! Restart policy (cooldown + windowed budget) and process launching.

use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::AppSpec;
use crate::error::LaunchError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Cooldown,
    BudgetExhausted,
}

#[derive(Debug)]
pub enum RestartOutcome {
    /// A launch was tried and charged to the budget, whether or not it worked.
    Attempted(Result<u32, LaunchError>),
    Skipped(SkipReason),
}

/// Starts processes. The supervisor never waits on what it launches.
pub trait Launcher: Send {
    /// Start `spec` and return the child pid.
    fn launch(&mut self, spec: &AppSpec) -> Result<u32, LaunchError>;

    /// Collect exited children. Called once per tick.
    fn reap(&mut self) {}
}

/// Spawns the configured command in its own process group so a signal aimed
/// at the daemon does not take the children with it.
#[derive(Debug, Default)]
pub struct CommandLauncher {
    children: Vec<(String, Child)>,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Launcher for CommandLauncher {
    fn launch(&mut self, spec: &AppSpec) -> Result<u32, LaunchError> {
        let program = which::which(&spec.command).map_err(|source| LaunchError::NotFound {
            command: spec.command.clone(),
            source,
        })?;

        let child = Command::new(&program)
            .args(&spec.arguments)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: spec.command.clone(),
                source,
            })?;

        let pid = child.id();
        self.children.push((spec.name.clone(), child));
        Ok(pid)
    }

    fn reap(&mut self) {
        self.children.retain_mut(|(name, child)| match child.try_wait() {
            Ok(Some(status)) => {
                info!("{name}: launched pid {} exited with {status}", child.id());
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("{name}: cannot wait on pid {}: {e}", child.id());
                false
            }
        });
    }
}

pub struct RestartController {
    launcher: Box<dyn Launcher>,
}

impl RestartController {
    pub fn new(launcher: Box<dyn Launcher>) -> Self {
        Self { launcher }
    }

    pub fn reap(&mut self) {
        self.launcher.reap();
    }

    /// Apply the restart policy to an app already known to be down.
    ///
    /// Order matters: the window is rolled first, then cooldown, then budget.
    /// Only an actual launch touches the counters.
    pub fn attempt_restart(
        &mut self,
        spec: &AppSpec,
        state: &mut AppState,
        now: Instant,
    ) -> RestartOutcome {
        if let Some(opened) = state.window_started
            && now.saturating_duration_since(opened) >= spec.restart_window
        {
            debug!(
                "{}: restart window elapsed, budget restored ({} used)",
                spec.name, state.restart_attempts_in_window
            );
            state.restart_attempts_in_window = 0;
            state.window_started = None;
        }

        if let Some(last) = state.last_restart_attempt
            && now.saturating_duration_since(last) < spec.restart_cooldown
        {
            return RestartOutcome::Skipped(SkipReason::Cooldown);
        }

        if state.restart_attempts_in_window >= spec.max_restarts_per_window {
            return RestartOutcome::Skipped(SkipReason::BudgetExhausted);
        }

        let result = self.launcher.launch(spec);
        state.restart_attempts_in_window += 1;
        state.last_restart_attempt = Some(now);
        state.window_started.get_or_insert(now);

        match &result {
            Ok(pid) => info!(
                "{}: launched '{}' as pid {pid} (attempt {}/{})",
                spec.name, spec.command, state.restart_attempts_in_window, spec.max_restarts_per_window
            ),
            Err(e) => warn!(
                "{}: launch failed: {e} (attempt {}/{})",
                spec.name, state.restart_attempts_in_window, spec.max_restarts_per_window
            ),
        }
        RestartOutcome::Attempted(result)
    }
}
