//! Alert delivery.
//!
//! The manager never talks to a notifier directly: status changes go over a
//! bounded bus to a dispatcher thread, which batches one poll cycle's worth
//! and hands it to the configured [`AlertNotifier`]. A slow or broken mail
//! relay therefore costs alerts, never ticks.

pub mod mail;

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded};
use log::{error, info, warn};

use crate::error::NotifyError;
use crate::ipc::Evt;
use crate::state::StatusChange;

pub use mail::MailNotifier;

/// Alert bus size. Small and fixed; overflow drops alerts, not ticks.
const BUS_BOUND: usize = 128;

/// How long shutdown waits for queued alerts to go out.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const JOIN_STEP: Duration = Duration::from_millis(20);

pub trait AlertNotifier: Send {
    fn notify(&self, event: &StatusChange) -> Result<(), NotifyError>;

    /// Deliver several changes. Notifiers that can merge them into one
    /// message should override this.
    fn notify_batch(&self, events: &[StatusChange]) -> Result<(), NotifyError> {
        for event in events {
            self.notify(event)?;
        }
        Ok(())
    }
}

/// Used when no recipients are configured: the log is the alert.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, event: &StatusChange) -> Result<(), NotifyError> {
        warn!("ALERT {event} at {}", event.at.format("%Y-%m-%d %H:%M:%S UTC"));
        Ok(())
    }
}

pub struct AlertDispatcher {
    tx: Sender<Evt>,
    handle: Option<JoinHandle<()>>,
}

impl AlertDispatcher {
    pub fn spawn(notifier: Box<dyn AlertNotifier>) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Evt>(BUS_BOUND);
        let handle = std::thread::Builder::new()
            .name("alerts".into())
            .spawn(move || dispatch(rx, notifier))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queue one tick's changes followed by a flush marker.
    pub fn publish(&self, changes: Vec<StatusChange>) {
        if changes.is_empty() {
            return;
        }
        for change in changes {
            self.send(Evt::Change(change));
        }
        self.send(Evt::TickComplete);
    }

    fn send(&self, evt: Evt) {
        match self.tx.try_send(evt) {
            Ok(()) => {}
            Err(TrySendError::Full(evt)) => warn!("alert bus full, dropping {evt:?}"),
            Err(TrySendError::Disconnected(evt)) => {
                error!("alert dispatcher is gone, dropping {evt:?}")
            }
        }
    }

    /// Flush what is queued and wait for the dispatcher to finish, at most
    /// [`SHUTDOWN_GRACE`].
    pub fn shutdown(self) {
        self.shutdown_within(SHUTDOWN_GRACE);
    }

    /// Like [`shutdown`](Self::shutdown) with an explicit grace period. A
    /// dispatcher still busy when it runs out is left behind and dies with
    /// the process.
    pub fn shutdown_within(mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        match self.tx.send_timeout(Evt::Shutdown, grace) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("alert bus still full after {grace:?}, abandoning queued alerts");
                return;
            }
            Err(SendTimeoutError::Disconnected(_)) => {}
        }

        let Some(handle) = self.handle.take() else {
            return;
        };
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("alert dispatcher still busy after {grace:?}, not waiting for it");
                return;
            }
            thread::sleep(JOIN_STEP);
        }
        if handle.join().is_err() {
            error!("alert dispatcher panicked");
        }
    }
}

fn dispatch(rx: Receiver<Evt>, notifier: Box<dyn AlertNotifier>) {
    let mut pending: Vec<StatusChange> = Vec::new();
    for evt in rx.iter() {
        match evt {
            Evt::Change(change) => pending.push(change),
            Evt::TickComplete => flush(notifier.as_ref(), &mut pending),
            Evt::Shutdown => break,
        }
    }
    flush(notifier.as_ref(), &mut pending);
}

fn flush(notifier: &dyn AlertNotifier, pending: &mut Vec<StatusChange>) {
    if pending.is_empty() {
        return;
    }
    match notifier.notify_batch(pending) {
        Ok(()) => info!("sent alert covering {} change(s)", pending.len()),
        Err(e) => error!("alert delivery failed ({} change(s) lost): {e}", pending.len()),
    }
    pending.clear();
}
