//! Status snapshot and notification fan-out.
//!
//! The controller updates the snapshot while it holds its structural lock, so
//! sink delivery happens on a separate task. Snapshots go through a watch
//! channel where the newest one replaces any the sink has not seen yet; level
//! readings and alerts go through a bounded queue. A stalled sink costs
//! dropped level readings and intermediate snapshots, never the final status
//! and never a blocked engine thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use nixon_core::{LevelReading, Notification, StatusSink, StatusSnapshot};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Level readings and alerts buffered between the controller and the sink.
pub const QUEUE_CAPACITY: usize = 64;

pub struct Broadcaster {
    status: watch::Sender<StatusSnapshot>,
    tx: mpsc::Sender<Notification>,
    dropped: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster whose forwarder task runs on `runtime`.
    pub fn new(sink: Arc<dyn StatusSink>, runtime: &Handle) -> Self {
        let (status, mut status_rx) = watch::channel(StatusSnapshot::default());
        let (tx, mut rx) = mpsc::channel::<Notification>(QUEUE_CAPACITY);

        runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = status_rx.borrow_and_update().clone();
                        sink.publish(Notification::Status(snapshot));
                    }
                    received = rx.recv() => match received {
                        Some(notification) => sink.publish(notification),
                        None => break,
                    },
                }
            }
            debug!("status forwarder stopped");
        });

        Self {
            status,
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Replace the snapshot and publish it if anything changed.
    pub fn update(&self, next: StatusSnapshot) -> bool {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn level(&self, reading: LevelReading) {
        self.enqueue(Notification::Level(reading));
    }

    pub fn warning(&self, source: &str, message: &str) {
        self.enqueue(Notification::Warning {
            source: source.to_string(),
            message: message.to_string(),
        });
    }

    pub fn error(&self, source: &str, message: &str) {
        self.enqueue(Notification::Error {
            source: source.to_string(),
            message: message.to_string(),
        });
    }

    /// Notifications discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(notification)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                match notification {
                    Notification::Level(_) => trace!(dropped, "status queue full, level dropped"),
                    other => warn!(dropped, notification = ?other, "status queue full, dropping"),
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!("status forwarder gone, notification discarded");
            }
        }
    }
}
