//! Upload path: serializes triggered data and hands it to the transport.
//!
//! Payloads produced while the transport is down are persisted when the
//! campaign asked for it (`persist_on_disconnect`) and re-published on
//! the next start. Raw-data pins taken at snapshot time are released once
//! the payload has left the agent (or was persisted/dropped).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::ingestion::encode_vehicle_data;
use crate::persistency::BlobStore;
use crate::rawdata::{BufferManager, BufferStage};
use crate::transport::Transport;
use crate::types::{SignalValue, TriggeredData};

/// Consumes the inspection engine's output queue.
pub struct Uploader {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    raw_data: Option<Arc<BufferManager>>,
    persistency: Option<Arc<BlobStore>>,
    input: mpsc::Receiver<TriggeredData>,
}

impl Uploader {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        raw_data: Option<Arc<BufferManager>>,
        persistency: Option<Arc<BlobStore>>,
        input: mpsc::Receiver<TriggeredData>,
    ) -> Self {
        Self {
            transport,
            clock,
            raw_data,
            persistency,
            input,
        }
    }

    /// Start the uploader task.
    pub fn spawn(self) -> UploaderHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(self.run(Arc::clone(&stop)));
        UploaderHandle { stop, join }
    }

    async fn run(mut self, stop: Arc<AtomicBool>) {
        info!("uploader started");
        self.republish_persisted().await;
        while !stop.load(Ordering::Relaxed) {
            let data = tokio::select! {
                data = self.input.recv() => data,
                () = tokio::time::sleep(Duration::from_millis(500)) => continue,
            };
            let Some(data) = data else {
                debug!("triggered data channel closed");
                break;
            };
            self.upload(data).await;
        }
        info!("uploader stopped");
    }

    async fn upload(&self, data: TriggeredData) {
        let payload = encode_vehicle_data(&data, self.raw_data.as_ref());
        let result = self
            .transport
            .send_vehicle_data(Bytes::from(payload.clone()))
            .await;
        match result {
            Ok(()) => {
                debug!(
                    campaign = %data.metadata.campaign_sync_id,
                    event_id = data.event_id,
                    bytes = payload.len(),
                    "uploaded triggered data"
                );
            }
            Err(error) => {
                if data.metadata.persist {
                    match &self.persistency {
                        Some(store) => {
                            match store.write_payload(&payload, self.clock.system_time_ms()) {
                                Ok(path) => debug!(
                                    campaign = %data.metadata.campaign_sync_id,
                                    path = %path.display(),
                                    "transport down, payload persisted"
                                ),
                                Err(persist_error) => warn!(
                                    campaign = %data.metadata.campaign_sync_id,
                                    %persist_error,
                                    "failed to persist payload after send failure"
                                ),
                            }
                        }
                        None => warn!(
                            campaign = %data.metadata.campaign_sync_id,
                            %error,
                            "send failed and persistency is disabled, payload lost"
                        ),
                    }
                } else {
                    warn!(
                        campaign = %data.metadata.campaign_sync_id,
                        %error,
                        "send failed, payload dropped"
                    );
                }
            }
        }
        self.release_pins(&data);
    }

    /// Drop the upload pins taken when the snapshot was assembled.
    fn release_pins(&self, data: &TriggeredData) {
        let Some(raw_data) = &self.raw_data else {
            return;
        };
        for sample in &data.signals {
            if let SignalValue::RawData { handle } = sample.value {
                raw_data.decrease_usage_hint(
                    sample.signal_id,
                    handle,
                    BufferStage::SelectedForUpload,
                );
            }
        }
    }

    /// Re-publish payloads persisted by a previous run.
    async fn republish_persisted(&self) {
        let Some(store) = &self.persistency else {
            return;
        };
        let payloads = store.drain_payloads();
        if payloads.is_empty() {
            return;
        }
        info!(count = payloads.len(), "re-publishing persisted payloads");
        for payload in payloads {
            if let Err(error) = self
                .transport
                .send_vehicle_data(Bytes::from(payload.clone()))
                .await
            {
                warn!(%error, "re-publish failed, persisting payload again");
                if let Err(persist_error) =
                    store.write_payload(&payload, self.clock.system_time_ms())
                {
                    warn!(%persist_error, "failed to re-persist payload, dropping it");
                }
            }
        }
    }
}

/// Running uploader; [`UploaderHandle::disconnect`] returns only after
/// the task has stopped.
pub struct UploaderHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl UploaderHandle {
    /// Stop the uploader and wait for it to finish.
    pub async fn disconnect(self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(error) = self.join.await {
            warn!(%error, "uploader task failed");
        }
    }
}
