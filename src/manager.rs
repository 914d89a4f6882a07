use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{select, tick};
use log::{error, info, warn};

use crate::config::{AppSpec, GlobalSettings};
use crate::lifecycle::{Event, Lifecycle};
use crate::notify::{AlertDispatcher, AlertNotifier, LogNotifier, MailNotifier};
use crate::probe::{LivenessProbe, ProcessTableProbe};
use crate::restart::{CommandLauncher, RestartController};
use crate::state::AppStatus;
use crate::supervisor::Supervisor;

/// How often the loop looks at the signal flag.
const SIGNAL_POLL: Duration = Duration::from_millis(200);

/// Top‑level loop: drives the supervisor on a fixed interval until SIGINT /
/// SIGTERM, forwarding status changes to the alert dispatcher.
pub struct WatchManager {
    supervisor: Supervisor,
    alerts: AlertDispatcher,
    lifecycle: Lifecycle,
    poll_interval: Duration,
}

impl WatchManager {
    /// Wire up the production probe, launcher and notifier.
    pub fn new(settings: &GlobalSettings, apps: Vec<AppSpec>) -> Result<Self> {
        let probe: Arc<dyn LivenessProbe> = Arc::new(ProcessTableProbe::new(settings.probe_timeout));
        let restarts = RestartController::new(Box::new(CommandLauncher::new()));
        let supervisor = Supervisor::new(apps, probe, restarts, settings.probe_timeout)?;

        let notifier: Box<dyn AlertNotifier> = if settings.alert_recipients.is_empty() {
            warn!("no mail-addresses configured, alerts go to the log only");
            Box::new(LogNotifier)
        } else {
            info!("alerts will be mailed to {}", settings.alert_recipients.join(", "));
            Box::new(MailNotifier::from_settings(settings))
        };
        let alerts = AlertDispatcher::spawn(notifier).context("Failed to start alert dispatcher")?;

        Ok(Self::with_parts(supervisor, alerts, settings.poll_interval))
    }

    pub fn with_parts(supervisor: Supervisor, alerts: AlertDispatcher, poll_interval: Duration) -> Self {
        Self {
            supervisor,
            alerts,
            lifecycle: Lifecycle::default(),
            poll_interval,
        }
    }

    /// Central loop. Runs until SIGINT / SIGTERM.
    pub fn run(mut self) -> Result<()> {
        self.lifecycle.step(Event::Started);
        info!(
            "watching {} application(s) every {:?}",
            self.supervisor.specs().len(),
            self.poll_interval
        );

        // First look right away rather than one interval in.
        self.poll();

        let poll_tick = tick(self.poll_interval);
        let sig_tick = tick(SIGNAL_POLL);

        loop {
            select! {
                recv(poll_tick) -> _ => self.poll(),
                recv(sig_tick)  -> _ => {
                    if let Some(sig) = check_signals() {
                        info!("signal {sig:?} – orderly shutdown");
                        break;
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// One poll cycle. A tick already under way when a signal lands still
    /// completes, but launches stop as soon as the signal is seen.
    pub fn poll(&mut self) {
        let lifecycle = &self.lifecycle;
        let changes = self
            .supervisor
            .tick(Instant::now(), || lifecycle.restarts_allowed() && !signal_pending());
        self.alerts.publish(changes);
    }

    fn shutdown(mut self) {
        self.lifecycle.step(Event::StopRequested);

        for (name, status) in self.supervisor.statuses() {
            match status {
                AppStatus::Running => info!("{name}: {status}"),
                _ => warn!("{name}: {status}"),
            }
        }

        self.alerts.shutdown();
        self.lifecycle.step(Event::Drained);
        info!("watch loop stopped");
    }
}

// Cheap, polling‑based Unix signal handling (lock‑free).
static RECEIVED_SIGNAL: AtomicUsize = AtomicUsize::new(0);

/// Restores default dispositions for the handled signals when dropped.
#[must_use = "handlers are removed when the guard is dropped"]
pub struct SignalGuard {
    _private: (),
}

const HANDLED: [nix::sys::signal::Signal; 2] = [
    nix::sys::signal::Signal::SIGINT,
    nix::sys::signal::Signal::SIGTERM,
];

pub fn install_signal_handlers() -> Result<SignalGuard> {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
    extern "C" fn handler(sig: i32) {
        RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
    }
    let action = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty());
    for sig in HANDLED {
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
            anyhow::anyhow!(
                "Failed to register {sig} handler: {e}. Signal handling is required for daemon operation."
            )
        })?;
    }
    Ok(SignalGuard { _private: () })
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet};
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for sig in HANDLED {
            // SAFETY: restoring the default disposition.
            if let Err(e) = unsafe { signal::sigaction(sig, &default) } {
                error!("Failed to restore default {sig} handler: {e}");
            }
        }
    }
}

fn signal_pending() -> bool {
    RECEIVED_SIGNAL.load(Ordering::SeqCst) != 0
}

/// Non‑blocking check – returns Some(signal) once.
fn check_signals() -> Option<nix::sys::signal::Signal> {
    take_signal(&RECEIVED_SIGNAL)
}

fn take_signal(flag: &AtomicUsize) -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    let val = flag.swap(0, Ordering::AcqRel);
    if val == 0 {
        None
    } else {
        match Signal::try_from(val as i32) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!("BUG: Invalid signal number {val} from signal handler: {e}.");
                None
            }
        }
    }
}
