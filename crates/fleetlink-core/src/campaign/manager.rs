//! Campaign manager: drives campaign lifecycles and republishes derived
//! state.
//!
//! Owns the campaign list, the active decoder manifest and the state
//! template set. On any change of the active campaign set it atomically
//! republishes two artifacts: the inspection matrix (to the engine) and
//! the decoder dictionary (to the bus decoders), plus the raw-data buffer
//! configuration and the checkin document snapshot.
//!
//! The manager task waits until the earliest upcoming start/expiry
//! deadline, capped at the configured idle time so wall-clock jumps and
//! stop requests are noticed in bounded time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::checkin::CheckinSender;
use crate::clock::Clock;
use crate::dictionary::{DecoderDictionary, DecoderManifest};
use crate::ingestion::{self, InvocationIdAllocator, StateTemplate, StateTemplatesDiff};
use crate::inspection::{ConditionWithData, InspectionMatrix, InspectionSignalInfo};
use crate::persistency::{BlobKind, BlobStore};
use crate::rawdata::{BufferManager, RawDataBufferConfig, SignalBufferConfig};
use crate::schemas::{self, StateTemplateMsg, StateTemplatesMsg};
use crate::types::{CampaignMetadata, SignalId, SyncId, Timestamp};

use super::{
    always_true, Campaign, CampaignList, CampaignTrigger, TriggerMode, MAX_ACTIVE_CAMPAIGNS,
};

/// A control-plane document as received from the transport.
#[derive(Debug, Clone)]
pub enum ControlDocument {
    DecoderManifest(Bytes),
    CollectionSchemes(Bytes),
    StateTemplates(Bytes),
}

/// Lifecycle state of one known campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    /// Known but not eligible (wrong manifest, or not yet validated).
    Inactive,
    /// Eligible, waiting for its start time.
    PendingStart,
    /// Evaluating and collecting.
    Active,
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("inactive"),
            Self::PendingStart => f.write_str("pending_start"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// State template set with the document version gate.
#[derive(Debug, Default)]
struct StateTemplateSet {
    last_version: u64,
    decoder_manifest_sync_id: SyncId,
    templates: BTreeMap<SyncId, StateTemplate>,
}

impl StateTemplateSet {
    /// Apply a diff. Diffs older than the last accepted version are
    /// ignored; removal of an unknown id is a no-op.
    fn apply(&mut self, diff: StateTemplatesDiff) -> bool {
        if diff.version < self.last_version {
            debug!(
                version = diff.version,
                last = self.last_version,
                "ignoring stale state templates diff"
            );
            return false;
        }
        self.last_version = diff.version;
        if !diff.decoder_manifest_sync_id.is_empty() {
            self.decoder_manifest_sync_id = diff.decoder_manifest_sync_id;
        }
        for template in diff.add {
            self.templates.insert(template.sync_id.clone(), template);
        }
        for sync_id in &diff.remove {
            self.templates.remove(sync_id);
        }
        true
    }

    fn sync_ids(&self) -> impl Iterator<Item = &SyncId> {
        self.templates.keys()
    }

    /// Full set re-encoded as one document, for persistence.
    fn encode(&self) -> Vec<u8> {
        schemas::encode(&StateTemplatesMsg {
            version: self.last_version,
            decoder_manifest_sync_id: self.decoder_manifest_sync_id.clone(),
            state_templates_to_add: self
                .templates
                .values()
                .map(|t| StateTemplateMsg {
                    state_template_sync_id: t.sync_id.clone(),
                    signal_ids: t.signal_ids.clone(),
                })
                .collect(),
            state_template_sync_ids_to_remove: Vec::new(),
        })
    }
}

/// Everything the manager republishes on a change, bundled for the
/// constructor.
pub struct CampaignManagerOutputs {
    pub matrix_tx: watch::Sender<Arc<InspectionMatrix>>,
    pub dictionary_tx: watch::Sender<Arc<DecoderDictionary>>,
    pub checkin: Arc<CheckinSender>,
    pub raw_data: Option<Arc<BufferManager>>,
}

/// The campaign lifecycle coordinator.
pub struct CampaignManager {
    clock: Arc<dyn Clock>,
    persistency: Option<Arc<BlobStore>>,
    documents: mpsc::Receiver<ControlDocument>,
    outputs: CampaignManagerOutputs,
    raw_data_config: RawDataBufferConfig,
    idle_time_ms: u64,
    invocation_ids: InvocationIdAllocator,

    manifest: Option<Arc<DecoderManifest>>,
    campaigns: Option<CampaignList>,
    state_templates: StateTemplateSet,
    /// Campaigns dropped after failing validation, so the failure is
    /// logged once rather than every recompute.
    rejected: HashSet<SyncId>,
    /// Signature of the last publication, to skip no-op republishes.
    published: Option<Vec<(SyncId, CampaignState)>>,
}

impl CampaignManager {
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        persistency: Option<Arc<BlobStore>>,
        documents: mpsc::Receiver<ControlDocument>,
        outputs: CampaignManagerOutputs,
        raw_data_config: RawDataBufferConfig,
        idle_time_ms: u64,
    ) -> Self {
        Self {
            clock,
            persistency,
            documents,
            outputs,
            raw_data_config,
            idle_time_ms: idle_time_ms.max(1),
            invocation_ids: InvocationIdAllocator::default(),
            manifest: None,
            campaigns: None,
            state_templates: StateTemplateSet::default(),
            rejected: HashSet::new(),
            published: None,
        }
    }

    /// Start the manager task.
    pub fn spawn(self) -> CampaignManagerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let join = tokio::spawn(self.run(Arc::clone(&stop), Arc::clone(&wake)));
        CampaignManagerHandle { stop, wake, join }
    }

    async fn run(mut self, stop: Arc<AtomicBool>, wake: Arc<Notify>) {
        info!("campaign manager started");
        // Restore before the first checkin so persisted documents are
        // reported rather than an empty set.
        self.restore_persisted();
        self.recompute_and_publish(true);

        while !stop.load(Ordering::Relaxed) {
            let wait_ms = self.next_wake_ms().min(self.idle_time_ms).max(1);
            tokio::select! {
                document = self.documents.recv() => {
                    match document {
                        Some(document) => {
                            let changed = self.process_document(document);
                            self.recompute_and_publish(changed);
                        }
                        None => {
                            debug!("control document channel closed");
                            break;
                        }
                    }
                }
                () = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                    self.recompute_and_publish(false);
                }
                () = wake.notified() => {}
            }
        }
        info!("campaign manager stopped");
    }

    /// Load persisted documents, tolerating absence and corruption.
    fn restore_persisted(&mut self) {
        let Some(store) = self.persistency.clone() else {
            return;
        };
        if let Ok(bytes) = store.read(BlobKind::DecoderManifest) {
            match ingestion::decode_decoder_manifest(&bytes) {
                Ok(manifest) => {
                    info!(manifest = %manifest.sync_id, "restored decoder manifest");
                    self.manifest = Some(Arc::new(manifest));
                }
                Err(error) => warn!(%error, "persisted decoder manifest unreadable, ignoring"),
            }
        }
        if let Ok(bytes) = store.read(BlobKind::CampaignList) {
            match ingestion::decode_collection_schemes(&bytes, &mut self.invocation_ids) {
                Ok(list) => {
                    info!(campaigns = list.campaigns.len(), "restored campaign list");
                    self.campaigns = Some(list);
                }
                Err(error) => warn!(%error, "persisted campaign list unreadable, ignoring"),
            }
        }
        if let Ok(bytes) = store.read(BlobKind::StateTemplates) {
            match ingestion::decode_state_templates(&bytes) {
                Ok(diff) => {
                    self.state_templates.apply(diff);
                    info!(
                        templates = self.state_templates.templates.len(),
                        "restored state templates"
                    );
                }
                Err(error) => warn!(%error, "persisted state templates unreadable, ignoring"),
            }
        }
    }

    /// Ingest one control document. Returns whether state changed.
    fn process_document(&mut self, document: ControlDocument) -> bool {
        match document {
            ControlDocument::DecoderManifest(bytes) => {
                match ingestion::decode_decoder_manifest(&bytes) {
                    Ok(manifest) => {
                        info!(manifest = %manifest.sync_id, "decoder manifest received");
                        self.persist(BlobKind::DecoderManifest, &bytes);
                        self.manifest = Some(Arc::new(manifest));
                        self.rejected.clear();
                        true
                    }
                    Err(error) => {
                        warn!(%error, "discarding malformed decoder manifest");
                        false
                    }
                }
            }
            ControlDocument::CollectionSchemes(bytes) => {
                match ingestion::decode_collection_schemes(&bytes, &mut self.invocation_ids) {
                    Ok(list) => {
                        info!(campaigns = list.campaigns.len(), "campaign list received");
                        self.persist(BlobKind::CampaignList, &bytes);
                        self.campaigns = Some(list);
                        self.rejected.clear();
                        true
                    }
                    Err(error) => {
                        warn!(%error, "discarding malformed campaign list");
                        false
                    }
                }
            }
            ControlDocument::StateTemplates(bytes) => {
                match ingestion::decode_state_templates(&bytes) {
                    Ok(diff) => {
                        let applied = self.state_templates.apply(diff);
                        if applied {
                            let encoded = self.state_templates.encode();
                            self.persist_bytes(BlobKind::StateTemplates, &encoded);
                        }
                        applied
                    }
                    Err(error) => {
                        warn!(%error, "discarding malformed state templates diff");
                        false
                    }
                }
            }
        }
    }

    fn persist(&self, kind: BlobKind, bytes: &Bytes) {
        self.persist_bytes(kind, bytes);
    }

    fn persist_bytes(&self, kind: BlobKind, bytes: &[u8]) {
        if let Some(store) = &self.persistency {
            if let Err(error) = store.write(kind, bytes) {
                warn!(?kind, %error, "failed to persist document");
            }
        }
    }

    /// Current lifecycle state of every known campaign.
    fn campaign_states(&mut self, now_wall_ms: Timestamp) -> Vec<(Arc<Campaign>, CampaignState)> {
        let Some(list) = &self.campaigns else {
            return Vec::new();
        };
        let mut states = Vec::with_capacity(list.campaigns.len());
        for campaign in &list.campaigns {
            if self.rejected.contains(&campaign.sync_id) {
                continue;
            }
            let Some(manifest) = &self.manifest else {
                states.push((Arc::clone(campaign), CampaignState::Inactive));
                continue;
            };
            if campaign.decoder_manifest_sync_id != manifest.sync_id {
                debug!(
                    campaign = %campaign.sync_id,
                    wants = %campaign.decoder_manifest_sync_id,
                    active = %manifest.sync_id,
                    "manifest mismatch, campaign stays inactive"
                );
                states.push((Arc::clone(campaign), CampaignState::Inactive));
                continue;
            }
            if now_wall_ms >= campaign.expiry_time_ms {
                trace!(campaign = %campaign.sync_id, "campaign expired");
                continue;
            }
            if let Err(error) = campaign.type_check(manifest) {
                warn!(campaign = %campaign.sync_id, %error, "dropping campaign");
                self.rejected.insert(campaign.sync_id.clone());
                continue;
            }
            if now_wall_ms < campaign.start_time_ms {
                states.push((Arc::clone(campaign), CampaignState::PendingStart));
            } else {
                states.push((Arc::clone(campaign), CampaignState::Active));
            }
        }
        states
    }

    /// Recompute derived state; republish when the active set changed (or
    /// `force` is set).
    fn recompute_and_publish(&mut self, force: bool) {
        let now_wall_ms = self.clock.time_point().system_time_ms;
        let states = self.campaign_states(now_wall_ms);

        let signature: Vec<(SyncId, CampaignState)> = states
            .iter()
            .map(|(c, s)| (c.sync_id.clone(), *s))
            .collect();
        if !force && self.published.as_ref() == Some(&signature) {
            return;
        }

        let mut active: Vec<&Arc<Campaign>> = states
            .iter()
            .filter(|(_, state)| *state == CampaignState::Active)
            .map(|(campaign, _)| campaign)
            .collect();
        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.sync_id.cmp(&b.sync_id))
        });
        if active.len() > MAX_ACTIVE_CAMPAIGNS {
            warn!(
                count = active.len(),
                limit = MAX_ACTIVE_CAMPAIGNS,
                "too many active campaigns, lowest priorities deferred"
            );
            active.truncate(MAX_ACTIVE_CAMPAIGNS);
        }

        let manifest = self.manifest.clone();
        let matrix = build_matrix(&active, manifest.as_deref());
        let required: HashSet<SignalId> = matrix
            .conditions
            .iter()
            .flat_map(|c| c.signals.iter().map(|s| s.signal_id))
            .collect();

        // Dictionary first, then matrix: a decoder acting on the new
        // dictionary only produces signals the engine is about to need.
        let dictionary = match &manifest {
            Some(manifest) => Arc::new(DecoderDictionary::extract(manifest, &required)),
            None => DecoderDictionary::empty(),
        };
        self.outputs.dictionary_tx.send_replace(dictionary);

        self.update_raw_data_config(manifest.as_deref(), &required);
        self.outputs.matrix_tx.send_replace(Arc::new(matrix));

        let mut documents: Vec<SyncId> = Vec::new();
        if let Some(manifest) = &manifest {
            documents.push(manifest.sync_id.clone());
        }
        let mut campaign_ids: Vec<SyncId> = states
            .iter()
            .filter(|(_, state)| {
                matches!(state, CampaignState::Active | CampaignState::PendingStart)
            })
            .map(|(campaign, _)| campaign.sync_id.clone())
            .collect();
        campaign_ids.sort();
        documents.extend(campaign_ids);
        documents.extend(self.state_templates.sync_ids().cloned());
        self.outputs.checkin.update_documents(documents);

        info!(
            active = active.len(),
            known = signature.len(),
            "campaign set republished"
        );
        self.published = Some(signature);
    }

    /// Reconfigure raw-data buffers for the complex signals campaigns
    /// need.
    fn update_raw_data_config(
        &self,
        manifest: Option<&DecoderManifest>,
        required: &HashSet<SignalId>,
    ) {
        let Some(raw_data) = &self.outputs.raw_data else {
            return;
        };
        let Some(manifest) = manifest else {
            let _ = raw_data.update_config(&HashMap::new());
            return;
        };
        let configs: HashMap<SignalId, SignalBufferConfig> = required
            .iter()
            .filter(|id| manifest.signal_type(**id).is_some_and(|t| t.is_complex()))
            .map(|&id| (id, self.raw_data_config.signal_config(id)))
            .collect();
        if let Err(error) = raw_data.update_config(&configs) {
            warn!(%error, "raw data buffer reconfiguration failed");
        }
    }

    /// Milliseconds until the next campaign start or expiry.
    fn next_wake_ms(&self) -> u64 {
        let now_wall_ms = self.clock.time_point().system_time_ms;
        let mut next = u64::MAX;
        if let Some(list) = &self.campaigns {
            for campaign in &list.campaigns {
                if self.rejected.contains(&campaign.sync_id) {
                    continue;
                }
                if campaign.start_time_ms > now_wall_ms {
                    next = next.min(campaign.start_time_ms - now_wall_ms);
                }
                if campaign.expiry_time_ms > now_wall_ms {
                    next = next.min(campaign.expiry_time_ms - now_wall_ms);
                }
            }
        }
        next
    }
}

/// Build the engine-facing matrix from the active campaigns, ordered by
/// (priority, sync id).
fn build_matrix(
    active: &[&Arc<Campaign>],
    manifest: Option<&DecoderManifest>,
) -> InspectionMatrix {
    let mut conditions = Vec::with_capacity(active.len());
    for campaign in active {
        let (condition, min_interval_ms, mode) = match &campaign.trigger {
            CampaignTrigger::TimeBased { period_ms } => (
                Arc::new(always_true()),
                *period_ms,
                TriggerMode::Always,
            ),
            CampaignTrigger::ConditionBased {
                condition,
                min_interval_ms,
                mode,
            } => (Arc::clone(condition), *min_interval_ms, *mode),
        };
        let always_evaluate = condition.is_static();

        let mut signals: Vec<InspectionSignalInfo> = Vec::new();
        let mut covered: HashSet<SignalId> = HashSet::new();
        for requirement in &campaign.signal_requirements {
            let Some(signal_type) =
                manifest.and_then(|m| m.signal_type(requirement.signal_id))
            else {
                warn!(
                    campaign = %campaign.sync_id,
                    signal_id = requirement.signal_id,
                    "requirement for a signal missing from the manifest, skipping"
                );
                continue;
            };
            covered.insert(requirement.signal_id);
            signals.push(InspectionSignalInfo {
                signal_id: requirement.signal_id,
                sample_buffer_size: requirement.sample_buffer_size as usize,
                minimum_sample_interval_ms: requirement.minimum_sample_period_ms,
                fixed_window_period_ms: requirement.fixed_window_period_ms,
                condition_only: requirement.condition_only,
                signal_type,
            });
        }
        // Signals referenced only by the condition tree still need a
        // buffer for their latest value.
        condition.for_each_signal(&mut |signal_id| {
            if covered.insert(signal_id) {
                if let Some(signal_type) = manifest.and_then(|m| m.signal_type(signal_id)) {
                    signals.push(InspectionSignalInfo {
                        signal_id,
                        sample_buffer_size: 1,
                        minimum_sample_interval_ms: 0,
                        fixed_window_period_ms: 0,
                        condition_only: true,
                        signal_type,
                    });
                }
            }
        });

        conditions.push(ConditionWithData {
            condition,
            min_interval_ms,
            after_duration_ms: campaign.after_duration_ms,
            trigger_mode: mode,
            always_evaluate,
            signals,
            include_active_dtcs: campaign.include_active_dtcs,
            metadata: CampaignMetadata {
                campaign_sync_id: campaign.sync_id.clone(),
                decoder_manifest_sync_id: campaign.decoder_manifest_sync_id.clone(),
                priority: campaign.priority,
                persist: campaign.persist_on_disconnect,
                compress: campaign.compress,
            },
        });
    }
    InspectionMatrix { conditions }
}

/// Running manager; [`CampaignManagerHandle::disconnect`] returns only
/// after the task has stopped.
pub struct CampaignManagerHandle {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
}

impl CampaignManagerHandle {
    /// Stop the manager and wait for it to finish.
    pub async fn disconnect(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wake.notify_one();
        if let Err(error) = self.join.await {
            warn!(%error, "campaign manager task failed");
        }
    }
}
