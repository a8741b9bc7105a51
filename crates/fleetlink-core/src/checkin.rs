//! Checkin reporter.
//!
//! Periodically announces the set of document sync ids currently active
//! on the agent: the decoder manifest, every active campaign, and any
//! state templates. The first checkin is held back until the campaign
//! manager has published a document snapshot, so restored documents are
//! reported instead of an empty set. A failed send is retried on the next
//! interval with the snapshot current at retry time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::ingestion::encode_checkin;
use crate::transport::Transport;
use crate::types::{SyncId, Timestamp};

/// Sends the periodic checkin. Shared with the campaign manager, which
/// pushes document snapshots into it.
pub struct CheckinSender {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    interval_ms: u64,
    /// `None` until the campaign manager publishes the first snapshot.
    documents: Mutex<Option<Vec<SyncId>>>,
    wake: Notify,
}

impl CheckinSender {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            clock,
            interval_ms: interval_ms.max(1),
            documents: Mutex::new(None),
            wake: Notify::new(),
        })
    }

    /// Replace the snapshot of documents to report.
    pub fn update_documents(&self, documents: Vec<SyncId>) {
        *self.documents.lock().expect("checkin documents poisoned") = Some(documents);
        self.wake.notify_one();
    }

    /// The snapshot that the next checkin will report, if one was
    /// published yet.
    #[must_use]
    pub fn current_documents(&self) -> Option<Vec<SyncId>> {
        self.documents
            .lock()
            .expect("checkin documents poisoned")
            .clone()
    }

    /// Start the reporter task.
    pub fn spawn(self: &Arc<Self>) -> CheckinHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let sender = Arc::clone(self);
        let task_stop = Arc::clone(&stop);
        let join = tokio::spawn(async move { sender.run(task_stop).await });
        CheckinHandle {
            stop,
            sender: Arc::clone(self),
            join,
        }
    }

    async fn run(self: Arc<Self>, stop: Arc<AtomicBool>) {
        info!(interval_ms = self.interval_ms, "checkin reporter started");
        // First checkin goes out as soon as a document snapshot exists.
        let mut next_due_ms: Timestamp = self.clock.monotonic_ms();
        while !stop.load(Ordering::Relaxed) {
            let Some(documents) = self.current_documents() else {
                trace!("no document snapshot yet, holding first checkin");
                self.wait(self.interval_ms).await;
                continue;
            };

            let now_ms = self.clock.monotonic_ms();
            if now_ms < next_due_ms {
                self.wait(next_due_ms - now_ms).await;
                continue;
            }

            let payload = encode_checkin(&documents, self.clock.system_time_ms());
            match self.transport.send_checkin(Bytes::from(payload)).await {
                Ok(()) => {
                    debug!(documents = documents.len(), "checkin sent");
                    next_due_ms = now_ms + self.interval_ms;
                }
                Err(error) => {
                    // Retry on the next interval; the snapshot is re-read
                    // then, so a fresher one is picked up automatically.
                    warn!(%error, "checkin failed");
                    next_due_ms = now_ms + self.interval_ms;
                }
            }
        }
        info!("checkin reporter stopped");
    }

    async fn wait(&self, ms: u64) {
        tokio::select! {
            () = self.wake.notified() => {}
            () = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
    }
}

impl std::fmt::Debug for CheckinSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckinSender")
            .field("interval_ms", &self.interval_ms)
            .finish_non_exhaustive()
    }
}

/// Running reporter; [`CheckinHandle::disconnect`] returns only after the
/// task has stopped.
pub struct CheckinHandle {
    stop: Arc<AtomicBool>,
    sender: Arc<CheckinSender>,
    join: JoinHandle<()>,
}

impl CheckinHandle {
    /// Stop the reporter and wait for it to finish.
    pub async fn disconnect(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.sender.wake.notify_one();
        if let Err(error) = self.join.await {
            warn!(%error, "checkin task failed");
        }
    }
}
