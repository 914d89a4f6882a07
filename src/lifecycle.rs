//! The daemon's own lifecycle, separate from the apps it watches.

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    StopRequested,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    BeginPolling,
    /// Stop scheduling ticks, flush alerts.
    Drain,
    Exit,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    phase: Phase,
}

impl Lifecycle {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// New launches are only allowed while fully running.
    pub fn restarts_allowed(&self) -> bool {
        self.is_running()
    }

    pub fn step(&mut self, event: Event) -> Action {
        let (next, action) = match (self.phase, event) {
            (Phase::Starting, Event::Started) => (Phase::Running, Action::BeginPolling),
            (Phase::Starting | Phase::Running, Event::StopRequested) => {
                (Phase::Stopping, Action::Drain)
            }
            (Phase::Stopping, Event::Drained) => (Phase::Stopped, Action::Exit),
            (phase, _) => (phase, Action::None),
        };
        if next != self.phase {
            debug!("daemon {:?} → {:?} on {:?}", self.phase, next, event);
        }
        self.phase = next;
        action
    }
}
