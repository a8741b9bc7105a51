//! Inspection worker: the single consumer of the signal pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::pipeline::SignalQueue;
use crate::types::TriggeredData;

use super::engine::InspectionEngine;
use super::InspectionMatrix;

/// Upper bound on one wait so the stop flag is observed even when no
/// deadline is near.
const WORKER_IDLE_TIME_MS: u64 = 1_000;

/// Runs the [`InspectionEngine`] against the signal pipeline.
///
/// Each frame is incorporated and evaluated before the next one is
/// pulled, so every condition sees every relevant sample exactly once.
pub struct InspectionWorker {
    queue: Arc<SignalQueue>,
    matrix_rx: watch::Receiver<Arc<InspectionMatrix>>,
    output: mpsc::Sender<TriggeredData>,
    clock: Arc<dyn Clock>,
    engine: InspectionEngine,
}

impl InspectionWorker {
    #[must_use]
    pub fn new(
        queue: Arc<SignalQueue>,
        matrix_rx: watch::Receiver<Arc<InspectionMatrix>>,
        output: mpsc::Sender<TriggeredData>,
        clock: Arc<dyn Clock>,
        engine: InspectionEngine,
    ) -> Self {
        Self {
            queue,
            matrix_rx,
            output,
            clock,
            engine,
        }
    }

    /// Start the worker task.
    pub fn spawn(self) -> InspectionWorkerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let queue = Arc::clone(&self.queue);
        let join = tokio::spawn(self.run(Arc::clone(&stop)));
        InspectionWorkerHandle { stop, queue, join }
    }

    async fn run(mut self, stop: Arc<AtomicBool>) {
        info!("inspection worker started");
        while !stop.load(Ordering::Relaxed) {
            if self.matrix_rx.has_changed().unwrap_or(false) {
                let matrix = Arc::clone(&*self.matrix_rx.borrow_and_update());
                self.engine.apply_matrix(&matrix);
            }

            let wait = self
                .engine
                .next_wait_ms(self.clock.time_point())
                .clamp(1, WORKER_IDLE_TIME_MS);
            let frame = self.queue.pop_timeout(Duration::from_millis(wait)).await;
            if let Some(frame) = &frame {
                self.engine.ingest_frame(frame);
            }

            let now = self.clock.time_point();
            self.engine.evaluate_conditions(now);
            while let Some(data) = self.engine.collect_next_data(now) {
                match self.output.try_send(data) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(data)) => {
                        warn!(
                            campaign = %data.metadata.campaign_sync_id,
                            "upload queue full, dropping triggered data"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("upload queue closed");
                        return;
                    }
                }
            }
        }
        info!("inspection worker stopped");
    }
}

/// Running worker; [`InspectionWorkerHandle::disconnect`] returns only
/// after the task has stopped.
pub struct InspectionWorkerHandle {
    stop: Arc<AtomicBool>,
    queue: Arc<SignalQueue>,
    join: JoinHandle<()>,
}

impl InspectionWorkerHandle {
    /// Stop the worker and wait for it to finish.
    pub async fn disconnect(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.queue.wake();
        if let Err(error) = self.join.await {
            warn!(%error, "inspection worker task failed");
        }
    }
}
