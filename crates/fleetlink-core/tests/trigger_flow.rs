//! End-to-end flow: control documents in, triggered vehicle data out.
//!
//! Wires the campaign manager, inspection worker and uploader together
//! the way the agent binary does, drives them with a manual clock and a
//! recording transport, and checks the payloads that reach the cloud.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;

use fleetlink_core::campaign::manager::{
    CampaignManager, CampaignManagerHandle, CampaignManagerOutputs, ControlDocument,
};
use fleetlink_core::checkin::CheckinSender;
use fleetlink_core::clock::{Clock, ManualClock};
use fleetlink_core::dictionary::DecoderDictionary;
use fleetlink_core::inspection::custom::{
    CustomFunctionRegistry, MultiRisingEdgeTrigger, MULTI_RISING_EDGE_FUNCTION_NAME,
    MULTI_RISING_EDGE_SIGNAL_NAME,
};
use fleetlink_core::inspection::worker::InspectionWorkerHandle;
use fleetlink_core::inspection::{InspectionEngine, InspectionMatrix, InspectionWorker};
use fleetlink_core::pipeline::SignalQueue;
use fleetlink_core::rawdata::{BufferManager, RawDataBufferConfig};
use fleetlink_core::schemas::{
    self, CollectionSchemeMsg, CollectionSchemesMsg, CollectionType,
    ConditionBasedCollectionMsg, ConditionNodeMsg, ConditionNodeType, CustomSignalMsg,
    DecoderManifestMsg, SignalInformationMsg, SignalTypeMsg, TriggerModeMsg, VehicleDataMsg,
};
use fleetlink_core::transport::{Transport, TransportError};
use fleetlink_core::types::{SignalFrame, SignalSample, SignalValue, Timestamp};
use fleetlink_core::uploader::{Uploader, UploaderHandle};
use tokio::sync::{mpsc, watch};

const WALL_BASE_MS: Timestamp = 1_700_000_000_000;

// =============================================================================
// Transport double
// =============================================================================

#[derive(Default)]
struct RecordingTransport {
    vehicle_data: Mutex<Vec<Vec<u8>>>,
}

impl RecordingTransport {
    fn vehicle_data_count(&self) -> usize {
        self.vehicle_data.lock().unwrap().len()
    }

    fn vehicle_data_at(&self, index: usize) -> VehicleDataMsg {
        let sent = self.vehicle_data.lock().unwrap();
        VehicleDataMsg::decode(sent[index].as_slice()).unwrap()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_checkin(&self, _payload: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_vehicle_data(&self, payload: Bytes) -> Result<(), TransportError> {
        self.vehicle_data.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    transport: Arc<RecordingTransport>,
    clock: Arc<ManualClock>,
    queue: Arc<SignalQueue>,
    documents_tx: mpsc::Sender<ControlDocument>,
    manager: CampaignManagerHandle,
    worker: InspectionWorkerHandle,
    uploader: UploaderHandle,
}

impl Harness {
    fn start() -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let clock = Arc::new(ManualClock::new(WALL_BASE_MS));
        let raw_config = RawDataBufferConfig::default();
        let raw_data = BufferManager::new(&raw_config);

        let queue = SignalQueue::new(1_024, "inspection");
        let (matrix_tx, matrix_rx) = watch::channel(InspectionMatrix::empty());
        let (dictionary_tx, dictionary_rx) = watch::channel(DecoderDictionary::empty());
        let (triggered_tx, triggered_rx) = mpsc::channel(32);
        let (documents_tx, documents_rx) = mpsc::channel(8);

        let checkin = CheckinSender::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            60_000,
        );

        let mut custom_functions = CustomFunctionRegistry::new().with_math_functions();
        custom_functions.register(
            MULTI_RISING_EDGE_FUNCTION_NAME,
            Box::new(MultiRisingEdgeTrigger::new(
                dictionary_rx,
                Some(Arc::clone(&raw_data)),
            )),
        );

        let manager = CampaignManager::new(
            Arc::clone(&clock) as Arc<dyn Clock>,
            None,
            documents_rx,
            CampaignManagerOutputs {
                matrix_tx,
                dictionary_tx,
                checkin,
                raw_data: Some(Arc::clone(&raw_data)),
            },
            raw_config,
            500,
        )
        .spawn();

        let engine = InspectionEngine::new(Some(Arc::clone(&raw_data)), custom_functions);
        let worker = InspectionWorker::new(
            Arc::clone(&queue),
            matrix_rx,
            triggered_tx,
            Arc::clone(&clock) as Arc<dyn Clock>,
            engine,
        )
        .spawn();

        let uploader = Uploader::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Some(raw_data),
            None,
            triggered_rx,
        )
        .spawn();

        Self {
            transport,
            clock,
            queue,
            documents_tx,
            manager,
            worker,
            uploader,
        }
    }

    async fn send_document(&self, document: ControlDocument) {
        self.documents_tx.send(document).await.unwrap();
    }

    /// Let the spawned tasks churn through some virtual time.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    async fn wait_for_uploads(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(120), async {
            while self.transport.vehicle_data_count() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {count} uploads, saw {}",
                self.transport.vehicle_data_count()
            )
        });
    }

    fn push_floats(&self, at_ms: Timestamp, samples: &[(u32, f64)]) {
        let frame = SignalFrame {
            samples: samples
                .iter()
                .map(|&(signal_id, value)| SignalSample {
                    signal_id,
                    timestamp_ms: WALL_BASE_MS + at_ms,
                    value: SignalValue::Float64(value),
                })
                .collect(),
            active_dtcs: None,
        };
        assert!(self.queue.push(frame));
    }

    fn push_bools(&self, at_ms: Timestamp, samples: &[(u32, bool)]) {
        let frame = SignalFrame {
            samples: samples
                .iter()
                .map(|&(signal_id, value)| SignalSample {
                    signal_id,
                    timestamp_ms: WALL_BASE_MS + at_ms,
                    value: SignalValue::Bool(value),
                })
                .collect(),
            active_dtcs: None,
        };
        assert!(self.queue.push(frame));
    }

    async fn shutdown(self) {
        self.manager.disconnect().await;
        self.worker.disconnect().await;
        self.uploader.disconnect().await;
    }
}

// =============================================================================
// Document builders
// =============================================================================

fn manifest_bytes(sync_id: &str, signals: &[(u32, &str, SignalTypeMsg)]) -> Bytes {
    let msg = DecoderManifestMsg {
        sync_id: sync_id.into(),
        custom_signals: signals
            .iter()
            .map(|&(signal_id, name, signal_type)| CustomSignalMsg {
                signal_id,
                name: name.into(),
                signal_type: signal_type as i32,
            })
            .collect(),
        ..DecoderManifestMsg::default()
    };
    Bytes::from(schemas::encode(&msg))
}

fn signal_node(signal_id: u32) -> ConditionNodeMsg {
    ConditionNodeMsg {
        node_type: ConditionNodeType::Signal as i32,
        signal_id,
        ..ConditionNodeMsg::default()
    }
}

fn string_node(value: &str) -> ConditionNodeMsg {
    ConditionNodeMsg {
        node_type: ConditionNodeType::StringValue as i32,
        string_value: value.into(),
        ..ConditionNodeMsg::default()
    }
}

fn number_node(value: f64) -> ConditionNodeMsg {
    ConditionNodeMsg {
        node_type: ConditionNodeType::Number as i32,
        number_value: value,
        ..ConditionNodeMsg::default()
    }
}

fn schemes_bytes(schemes: Vec<CollectionSchemeMsg>) -> Bytes {
    Bytes::from(schemas::encode(&CollectionSchemesMsg {
        collection_schemes: schemes,
        timestamp_ms_epoch: WALL_BASE_MS,
    }))
}

fn condition_scheme(
    sync_id: &str,
    manifest: &str,
    tree: ConditionNodeMsg,
    signals: Vec<SignalInformationMsg>,
) -> CollectionSchemeMsg {
    CollectionSchemeMsg {
        campaign_sync_id: sync_id.into(),
        decoder_manifest_sync_id: manifest.into(),
        start_time_ms_epoch: 0,
        expiry_time_ms_epoch: u64::MAX,
        collection_type: Some(CollectionType::ConditionBased(ConditionBasedCollectionMsg {
            condition_tree: Some(Box::new(tree)),
            condition_minimum_interval_ms: 0,
            trigger_mode: TriggerModeMsg::Always as i32,
        })),
        signal_information: signals,
        ..CollectionSchemeMsg::default()
    }
}

fn signal_info(signal_id: u32, buffer: u32, condition_only: bool) -> SignalInformationMsg {
    SignalInformationMsg {
        signal_id,
        sample_buffer_size: buffer,
        minimum_sample_period_ms: 0,
        fixed_window_period_ms: 0,
        condition_only_signal: condition_only,
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn threshold_campaign_uploads_on_rising_edge() {
    let harness = Harness::start();

    harness
        .send_document(ControlDocument::DecoderManifest(manifest_bytes(
            "DM1",
            &[(1, "Vehicle.Speed", SignalTypeMsg::Float64)],
        )))
        .await;
    let tree = ConditionNodeMsg {
        node_type: ConditionNodeType::OperatorBigger as i32,
        left: Some(Box::new(signal_node(1))),
        right: Some(Box::new(number_node(100.0))),
        ..ConditionNodeMsg::default()
    };
    let mut scheme = condition_scheme("C1", "DM1", tree, vec![signal_info(1, 4, false)]);
    if let Some(CollectionType::ConditionBased(condition)) = &mut scheme.collection_type {
        condition.trigger_mode = TriggerModeMsg::RisingEdge as i32;
    }
    harness
        .send_document(ControlDocument::CollectionSchemes(schemes_bytes(vec![scheme])))
        .await;
    harness.settle().await;

    // Below the threshold: nothing goes out.
    harness.push_floats(0, &[(1, 50.0)]);
    harness.settle().await;
    assert_eq!(harness.transport.vehicle_data_count(), 0);

    // Crossing the threshold fires exactly once.
    harness.clock.advance(100);
    harness.push_floats(100, &[(1, 150.0)]);
    harness.wait_for_uploads(1).await;

    let upload = harness.transport.vehicle_data_at(0);
    assert_eq!(upload.campaign_sync_id, "C1");
    let values: Vec<f64> = upload
        .captured_signals
        .iter()
        .map(|s| s.double_value)
        .collect();
    assert!(values.contains(&150.0));

    // Still above: no further rising edge.
    harness.clock.advance(100);
    harness.push_floats(200, &[(1, 160.0)]);
    harness.settle().await;
    assert_eq!(harness.transport.vehicle_data_count(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn multi_rising_edge_labels_reach_the_cloud() {
    let harness = Harness::start();

    harness
        .send_document(ControlDocument::DecoderManifest(manifest_bytes(
            "DM1",
            &[
                (1, MULTI_RISING_EDGE_SIGNAL_NAME, SignalTypeMsg::String),
                (10, "Vehicle.DoorOpen", SignalTypeMsg::Bool),
                (11, "Vehicle.HoodOpen", SignalTypeMsg::Bool),
            ],
        )))
        .await;

    // multi_rising_edge_trigger("abc", signal 10, "def", signal 11)
    let tree = ConditionNodeMsg {
        node_type: ConditionNodeType::CustomFunction as i32,
        function_name: MULTI_RISING_EDGE_FUNCTION_NAME.into(),
        function_args: vec![
            string_node("abc"),
            signal_node(10),
            string_node("def"),
            signal_node(11),
        ],
        ..ConditionNodeMsg::default()
    };
    harness
        .send_document(ControlDocument::CollectionSchemes(schemes_bytes(vec![
            condition_scheme(
                "C1",
                "DM1",
                tree,
                vec![
                    signal_info(1, 4, false),
                    signal_info(10, 1, true),
                    signal_info(11, 1, true),
                ],
            ),
        ])))
        .await;
    harness.settle().await;

    // Baseline: both flags false, no fire.
    harness.push_bools(0, &[(10, false), (11, false)]);
    harness.settle().await;
    assert_eq!(harness.transport.vehicle_data_count(), 0);

    let labels_of = |upload: &VehicleDataMsg| -> Vec<String> {
        let raw = upload
            .captured_signals
            .iter()
            .find(|s| s.signal_id == 1)
            .expect("complex signal missing")
            .raw_data
            .clone();
        serde_json::from_slice(&raw).unwrap()
    };

    // abc rises.
    harness.clock.advance(100);
    harness.push_bools(100, &[(10, true), (11, false)]);
    harness.wait_for_uploads(1).await;
    assert_eq!(labels_of(&harness.transport.vehicle_data_at(0)), vec!["abc"]);

    // abc falls, def rises.
    harness.clock.advance(100);
    harness.push_bools(200, &[(10, false), (11, true)]);
    harness.wait_for_uploads(2).await;
    assert_eq!(labels_of(&harness.transport.vehicle_data_at(1)), vec!["def"]);

    // Both fall, then both rise together.
    harness.clock.advance(100);
    harness.push_bools(300, &[(10, false), (11, false)]);
    harness.settle().await;
    harness.clock.advance(100);
    harness.push_bools(400, &[(10, true), (11, true)]);
    harness.wait_for_uploads(3).await;
    assert_eq!(
        labels_of(&harness.transport.vehicle_data_at(2)),
        vec!["abc", "def"]
    );

    harness.shutdown().await;
}
