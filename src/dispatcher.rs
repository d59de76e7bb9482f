//! Deferred-callback runner behind the update coalescing state machine.
//!
//! One background thread owns two slots: the global "playlist update" tick
//! (immediate, or delayed by [`UPDATE_DELAY`]; re-scheduling replaces the
//! deadline) and the queued "scan complete" event. Re-queueing the latter
//! replaces the undelivered one, which is what deduplicates back-to-back
//! scan completions.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Delay for update ticks coalescing the per-scan drizzle of changes.
pub(crate) const UPDATE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Update,
    ScanComplete,
}

enum Command {
    ScheduleUpdate(Option<Duration>),
    CancelUpdate,
    QueueScanComplete,
    Shutdown,
}

pub(crate) struct Dispatcher {
    tx: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn spawn<F>(tick: F) -> Self
    where
        F: Fn(Tick) + Send + 'static,
    {
        let (tx, rx) = channel::<Command>();
        let thread = std::thread::spawn(move || {
            let mut update_at: Option<Instant> = None;
            let mut scan_complete_at: Option<Instant> = None;

            loop {
                let deadline = match (update_at, scan_complete_at) {
                    (Some(update), Some(scan)) => Some(update.min(scan)),
                    (update, scan) => update.or(scan),
                };
                let received = match deadline {
                    Some(deadline) => {
                        let wait = deadline.saturating_duration_since(Instant::now());
                        match rx.recv_timeout(wait) {
                            Ok(command) => Some(command),
                            Err(RecvTimeoutError::Timeout) => None,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match rx.recv() {
                        Ok(command) => Some(command),
                        Err(_) => break,
                    },
                };

                match received {
                    Some(Command::ScheduleUpdate(delay)) => {
                        update_at = Some(Instant::now() + delay.unwrap_or_default());
                    }
                    Some(Command::CancelUpdate) => update_at = None,
                    Some(Command::QueueScanComplete) => scan_complete_at = Some(Instant::now()),
                    Some(Command::Shutdown) => break,
                    None => {
                        let now = Instant::now();
                        if update_at.is_some_and(|at| at <= now) {
                            update_at = None;
                            tick(Tick::Update);
                        }
                        if scan_complete_at.is_some_and(|at| at <= now) {
                            scan_complete_at = None;
                            tick(Tick::ScanComplete);
                        }
                    }
                }
            }
        });

        Dispatcher {
            tx,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedules the update tick, replacing any pending schedule.
    pub fn schedule_update(&self, delay: Option<Duration>) {
        let _ = self.tx.send(Command::ScheduleUpdate(delay));
    }

    pub fn cancel_update(&self) {
        let _ = self.tx.send(Command::CancelUpdate);
    }

    /// Queues the scan-complete event, replacing any undelivered one.
    pub fn queue_scan_complete(&self) {
        let _ = self.tx.send(Command::QueueScanComplete);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
