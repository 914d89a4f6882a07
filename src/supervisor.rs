//! Per‑tick evaluation of every supervised application.
//!
//! The [`Supervisor`] owns one [`AppState`] per [`AppSpec`] and is the only
//! thing that mutates them. Probing fans out to worker threads; the
//! resulting observations are applied back here one app at a time, in
//! configuration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::config::{AppSpec, validate_apps};
use crate::error::ConfigError;
use crate::probe::{LivenessProbe, ProbeResult, probe_all};
use crate::restart::{RestartController, RestartOutcome, SkipReason};
use crate::state::{AppState, AppStatus, StatusChange};

pub struct Supervisor {
    specs: Vec<AppSpec>,
    states: HashMap<String, AppState>,
    probe: Arc<dyn LivenessProbe>,
    restarts: RestartController,
    probe_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        specs: Vec<AppSpec>,
        probe: Arc<dyn LivenessProbe>,
        restarts: RestartController,
        probe_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        validate_apps(&specs)?;
        let states = specs
            .iter()
            .map(|s| (s.name.clone(), AppState::default()))
            .collect();
        Ok(Self {
            specs,
            states,
            probe,
            restarts,
            probe_timeout,
        })
    }

    pub fn specs(&self) -> &[AppSpec] {
        &self.specs
    }

    pub fn state(&self, name: &str) -> Option<&AppState> {
        self.states.get(name)
    }

    /// `(name, status)` in configuration order.
    pub fn statuses(&self) -> impl Iterator<Item = (&str, AppStatus)> + '_ {
        self.specs
            .iter()
            .filter_map(|s| self.states.get(&s.name).map(|st| (s.name.as_str(), st.status)))
    }

    /// Run one poll cycle and return the status changes worth alerting on.
    ///
    /// `restarts_allowed` is asked right before each launch; once it says no
    /// (daemon stopping) observations are still applied but nothing starts.
    pub fn tick(
        &mut self,
        now: Instant,
        restarts_allowed: impl Fn() -> bool,
    ) -> Vec<StatusChange> {
        self.restarts.reap();

        let names: Vec<String> = self.specs.iter().map(|s| s.process_name.clone()).collect();
        let results = probe_all(&self.probe, &names, self.probe_timeout);

        let mut changes = Vec::new();
        for (spec, result) in self.specs.iter().zip(results) {
            let Some(state) = self.states.get_mut(&spec.name) else {
                error!("BUG: no state for configured app '{}'", spec.name);
                continue;
            };
            if let Some(change) =
                evaluate(spec, state, result, &mut self.restarts, now, &restarts_allowed)
            {
                changes.push(change);
            }
        }
        changes
    }
}

/// Apply one observation to one app. Returns the alert to emit, if any.
fn evaluate(
    spec: &AppSpec,
    state: &mut AppState,
    result: ProbeResult,
    restarts: &mut RestartController,
    now: Instant,
    restarts_allowed: &dyn Fn() -> bool,
) -> Option<StatusChange> {
    let running = match result {
        ProbeResult::Running => true,
        ProbeResult::NotRunning => false,
        ProbeResult::Unknown(e) => {
            warn!("{}: no observation this tick: {e}", spec.name);
            return None;
        }
    };
    if running {
        state.last_seen_running = Some(now);
    }

    let old = state.status;
    let new = next_status(spec, state, running, restarts, now, restarts_allowed);
    state.status = new;

    if !state.established {
        state.established = true;
        if new == AppStatus::Running {
            debug!("{}: found running at startup", spec.name);
            state.last_notified_status = Some(AppStatus::Running);
            return None;
        }
    }

    if old == new {
        return None;
    }
    info!("{} → {new} (was {old})", spec.name);

    if state.last_notified_status == Some(new) {
        return None;
    }
    state.last_notified_status = Some(new);
    Some(StatusChange {
        app: spec.name.clone(),
        old,
        new,
        at: Utc::now(),
    })
}

fn next_status(
    spec: &AppSpec,
    state: &mut AppState,
    running: bool,
    restarts: &mut RestartController,
    now: Instant,
    restarts_allowed: &dyn Fn() -> bool,
) -> AppStatus {
    use AppStatus::*;

    match (state.status, running) {
        (Failed, _) => Failed,
        (Running, true) | (Restarting, true) => Running,
        // Wait for a second observation before acting on it.
        (Running, false) => Down,
        (Down, true) => {
            state.clear_restart_counters();
            Running
        }
        (Down, false) | (Restarting, false) if !restarts_allowed() => state.status,
        (current @ (Down | Restarting), false) => {
            match restarts.attempt_restart(spec, state, now) {
                RestartOutcome::Attempted(_) => Restarting,
                RestartOutcome::Skipped(SkipReason::Cooldown) => current,
                RestartOutcome::Skipped(SkipReason::BudgetExhausted) => {
                    error!(
                        "{}: {} restart(s) within {:?} did not bring it back, giving up",
                        spec.name, state.restart_attempts_in_window, spec.restart_window
                    );
                    Failed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::error::{LaunchError, ProbeError};
    use crate::restart::Launcher;

    /// Hands out pre‑recorded observations; `None` means a probe timeout.
    #[derive(Default)]
    struct Script(Mutex<HashMap<String, VecDeque<Option<bool>>>>);

    impl Script {
        fn push(&self, name: &str, obs: &[Option<bool>]) {
            self.0
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .extend(obs.iter().copied());
        }
    }

    impl LivenessProbe for Script {
        fn is_running(&self, name: &str) -> ProbeResult {
            match self.0.lock().unwrap().get_mut(name).and_then(|q| q.pop_front()) {
                Some(Some(true)) => ProbeResult::Running,
                Some(Some(false)) => ProbeResult::NotRunning,
                _ => ProbeResult::Unknown(ProbeError::Timeout(Duration::from_secs(1))),
            }
        }
    }

    #[derive(Clone, Default)]
    struct Count(Arc<Mutex<Vec<String>>>);

    impl Launcher for Count {
        fn launch(&mut self, spec: &AppSpec) -> Result<u32, LaunchError> {
            self.0.lock().unwrap().push(spec.name.clone());
            Ok(1)
        }
    }

    const UP: Option<bool> = Some(true);
    const DOWN: Option<bool> = Some(false);
    const TIMEOUT: Option<bool> = None;

    fn fixture(specs: Vec<AppSpec>) -> (Supervisor, Arc<Script>, Count) {
        let script = Arc::new(Script::default());
        let launches = Count::default();
        let sup = Supervisor::new(
            specs,
            script.clone(),
            RestartController::new(Box::new(launches.clone())),
            Duration::from_secs(1),
        )
        .unwrap();
        (sup, script, launches)
    }

    fn app(name: &str, cooldown_s: u64, max: u32) -> AppSpec {
        AppSpec {
            restart_cooldown: Duration::from_secs(cooldown_s),
            max_restarts_per_window: max,
            ..AppSpec::new(name, format!("/usr/bin/{name}"))
        }
    }

    fn status(sup: &Supervisor, name: &str) -> AppStatus {
        sup.state(name).unwrap().status
    }

    #[test]
    fn test_initially_running_is_silent() {
        let (mut sup, script, launches) = fixture(vec![app("web", 0, 3)]);
        script.push("web", &[UP, UP]);
        let t0 = Instant::now();

        assert!(sup.tick(t0, || true).is_empty());
        assert_eq!(status(&sup, "web"), AppStatus::Running);
        assert!(sup.tick(t0 + Duration::from_secs(1), || true).is_empty());
        assert!(launches.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_running_to_down_waits_one_tick() {
        let (mut sup, script, launches) = fixture(vec![app("web", 0, 3)]);
        script.push("web", &[UP, DOWN, DOWN]);
        let t0 = Instant::now();

        sup.tick(t0, || true);
        let changes = sup.tick(t0 + Duration::from_secs(1), || true);
        assert_eq!(status(&sup, "web"), AppStatus::Down);
        assert_eq!(changes.len(), 1);
        assert_eq!((changes[0].old, changes[0].new), (AppStatus::Running, AppStatus::Down));
        assert!(launches.0.lock().unwrap().is_empty());

        let changes = sup.tick(t0 + Duration::from_secs(2), || true);
        assert_eq!(status(&sup, "web"), AppStatus::Restarting);
        assert_eq!(changes[0].new, AppStatus::Restarting);
        assert_eq!(launches.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_restarting_recovers_to_running() {
        let (mut sup, script, _) = fixture(vec![app("web", 0, 3)]);
        script.push("web", &[DOWN, UP]);
        let t0 = Instant::now();

        sup.tick(t0, || true);
        let changes = sup.tick(t0 + Duration::from_secs(1), || true);
        assert_eq!(status(&sup, "web"), AppStatus::Running);
        assert_eq!((changes[0].old, changes[0].new), (AppStatus::Restarting, AppStatus::Running));
    }

    #[test]
    fn test_down_to_running_clears_counters() {
        let (mut sup, script, _) = fixture(vec![app("web", 0, 3)]);
        script.push("web", &[DOWN, UP, DOWN, UP]);
        let t0 = Instant::now();

        sup.tick(t0, || true); // Restarting, 1 attempt
        sup.tick(t0 + Duration::from_secs(1), || true); // Running
        sup.tick(t0 + Duration::from_secs(2), || true); // Down
        assert_eq!(sup.state("web").unwrap().restart_attempts_in_window, 1);
        sup.tick(t0 + Duration::from_secs(3), || true); // Running again
        let st = sup.state("web").unwrap();
        assert_eq!(st.status, AppStatus::Running);
        assert_eq!(st.restart_attempts_in_window, 0);
        assert_eq!(st.window_started, None);
    }

    #[test]
    fn test_cooldown_keeps_status_and_spacing() {
        let (mut sup, script, launches) = fixture(vec![app("web", 10, 5)]);
        script.push("web", &[DOWN, DOWN, DOWN, DOWN]);
        let t0 = Instant::now();

        sup.tick(t0, || true);
        sup.tick(t0 + Duration::from_secs(4), || true);
        sup.tick(t0 + Duration::from_secs(8), || true);
        assert_eq!(status(&sup, "web"), AppStatus::Restarting);
        assert_eq!(launches.0.lock().unwrap().len(), 1);

        sup.tick(t0 + Duration::from_secs(10), || true);
        assert_eq!(launches.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_is_terminal() {
        let (mut sup, script, launches) = fixture(vec![app("web", 0, 1)]);
        script.push("web", &[DOWN, DOWN, UP, DOWN, UP]);
        let t0 = Instant::now();

        for i in 0..5 {
            sup.tick(t0 + Duration::from_secs(i), || true);
        }
        assert_eq!(status(&sup, "web"), AppStatus::Failed);
        assert_eq!(launches.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_probe_timeout_changes_nothing() {
        let (mut sup, script, launches) = fixture(vec![app("x", 0, 3)]);
        script.push("x", &[UP, TIMEOUT, UP]);
        let t0 = Instant::now();

        sup.tick(t0, || true);
        let before = sup.state("x").unwrap().clone();
        assert!(sup.tick(t0 + Duration::from_secs(1), || true).is_empty());
        let after = sup.state("x").unwrap();
        assert_eq!(after.status, AppStatus::Running);
        assert_eq!(after.restart_attempts_in_window, before.restart_attempts_in_window);
        assert_eq!(after.last_seen_running, before.last_seen_running);
        assert!(launches.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_restart_while_stopping() {
        let (mut sup, script, launches) = fixture(vec![app("web", 0, 3)]);
        script.push("web", &[DOWN]);

        assert!(sup.tick(Instant::now(), || false).is_empty());
        assert_eq!(status(&sup, "web"), AppStatus::Down);
        assert!(launches.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_apps_are_independent() {
        let (mut sup, script, launches) =
            fixture(vec![app("a", 0, 1), app("b", 0, 1), app("c", 0, 1)]);
        script.push("a", &[UP, UP]);
        script.push("b", &[DOWN, DOWN]);
        script.push("c", &[TIMEOUT, UP]);
        let t0 = Instant::now();

        sup.tick(t0, || true);
        let changes = sup.tick(t0 + Duration::from_secs(1), || true);
        let statuses: Vec<_> = sup.statuses().collect();
        assert_eq!(
            statuses,
            [
                ("a", AppStatus::Running),
                ("b", AppStatus::Failed),
                ("c", AppStatus::Running),
            ]
        );
        assert_eq!(*launches.0.lock().unwrap(), ["b"]);
        // c's first observation is silent, b's failure is not.
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].app, "b");
    }

    #[test]
    fn test_duplicate_specs_rejected() {
        let result = Supervisor::new(
            vec![app("a", 0, 1), app("a", 0, 1)],
            Arc::new(Script::default()),
            RestartController::new(Box::new(Count::default())),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ConfigError::DuplicateApp(_))));
    }
}
