//! Document ingestion and payload serialization.
//!
//! Converts the wire schema into internal types, validating as it goes. A
//! malformed document yields [`IngestionError::DecodeFailed`] and the
//! previous state is retained by the caller; a malformed campaign inside
//! an otherwise valid list is skipped without poisoning its siblings.

use std::sync::Arc;

use prost::Message;
use thiserror::Error;
use tracing::warn;

use crate::campaign::{
    ArithmeticOp, Campaign, CampaignList, CampaignTrigger, ComparisonOp, ConditionNode,
    InvocationId, LogicalOp, SignalRequirement, TriggerMode, WindowFunction, MAX_CONDITION_DEPTH,
};
use crate::dictionary::{
    CanSignalDecoding, CustomSignalDecoding, DecoderManifest, ObdSignalDecoding, SignalDecoding,
    SignalSource,
};
use crate::rawdata::BufferManager;
use crate::schemas::{
    self, CapturedSignalMsg, CheckinMsg, CollectionSchemeMsg, CollectionType, ConditionNodeMsg,
    ConditionNodeType, DecoderManifestMsg, DtcDataMsg, SignalTypeMsg, StateTemplatesMsg,
    TriggerModeMsg, VehicleDataMsg, WindowFunctionMsg,
};
use crate::types::{SignalType, SignalValue, SyncId, Timestamp, TriggeredData};

/// Why an inbound document was discarded.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestionError {
    /// The payload does not parse against the schema.
    #[error("document decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),

    /// The payload parses but violates a structural invariant.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

/// Allocator for custom-function call-site ids, owned by the campaign
/// manager so ids stay unique across successive document generations.
#[derive(Debug, Default)]
pub struct InvocationIdAllocator {
    next: InvocationId,
}

impl InvocationIdAllocator {
    fn next(&mut self) -> InvocationId {
        self.next += 1;
        self.next
    }
}

fn signal_type_from_msg(raw: i32) -> Option<SignalType> {
    match SignalTypeMsg::try_from(raw).ok()? {
        SignalTypeMsg::Unknown => None,
        SignalTypeMsg::Int8 => Some(SignalType::Int8),
        SignalTypeMsg::Int16 => Some(SignalType::Int16),
        SignalTypeMsg::Int32 => Some(SignalType::Int32),
        SignalTypeMsg::Int64 => Some(SignalType::Int64),
        SignalTypeMsg::Uint8 => Some(SignalType::Uint8),
        SignalTypeMsg::Uint16 => Some(SignalType::Uint16),
        SignalTypeMsg::Uint32 => Some(SignalType::Uint32),
        SignalTypeMsg::Uint64 => Some(SignalType::Uint64),
        SignalTypeMsg::Float32 => Some(SignalType::Float32),
        SignalTypeMsg::Float64 => Some(SignalType::Float64),
        SignalTypeMsg::Bool => Some(SignalType::Bool),
        SignalTypeMsg::String => Some(SignalType::String),
        SignalTypeMsg::Bytes => Some(SignalType::Bytes),
    }
}

// =============================================================================
// Decoder manifest
// =============================================================================

/// Decode and validate a decoder manifest document.
///
/// # Errors
///
/// [`IngestionError::DecodeFailed`] on a malformed payload,
/// [`IngestionError::InvalidDocument`] on a missing sync id. Signals of
/// unknown type are skipped with a warning.
pub fn decode_decoder_manifest(bytes: &[u8]) -> Result<DecoderManifest, IngestionError> {
    let msg = DecoderManifestMsg::decode(bytes)?;
    if msg.sync_id.is_empty() {
        return Err(IngestionError::InvalidDocument(
            "decoder manifest without sync id".into(),
        ));
    }
    let mut manifest = DecoderManifest {
        sync_id: msg.sync_id,
        ..DecoderManifest::default()
    };

    for can in msg.can_signals {
        let Some(signal_type) = signal_type_from_msg(can.signal_type) else {
            warn!(signal_id = can.signal_id, "skipping CAN signal of unknown type");
            continue;
        };
        manifest.signals.insert(
            can.signal_id,
            SignalDecoding {
                source: SignalSource::Can {
                    interface_id: can.interface_id.clone(),
                    decoding: CanSignalDecoding {
                        signal_id: can.signal_id,
                        message_id: can.message_id,
                        start_bit: can.start_bit as u16,
                        length_bits: can.length as u16,
                        factor: can.factor,
                        offset: can.offset,
                        is_big_endian: can.is_big_endian,
                        is_signed: can.is_signed,
                        signal_type,
                    },
                },
                signal_type,
            },
        );
    }
    for obd in msg.obd_pid_signals {
        let Some(signal_type) = signal_type_from_msg(obd.signal_type) else {
            warn!(signal_id = obd.signal_id, "skipping OBD signal of unknown type");
            continue;
        };
        manifest.signals.insert(
            obd.signal_id,
            SignalDecoding {
                source: SignalSource::Obd {
                    decoding: ObdSignalDecoding {
                        signal_id: obd.signal_id,
                        pid: obd.pid as u8,
                        byte_offset: obd.byte_offset as u8,
                        byte_length: obd.byte_length as u8,
                        scaling: obd.scaling,
                        offset: obd.offset,
                        signal_type,
                    },
                },
                signal_type,
            },
        );
    }
    for custom in msg.custom_signals {
        let Some(signal_type) = signal_type_from_msg(custom.signal_type) else {
            warn!(signal_id = custom.signal_id, "skipping custom signal of unknown type");
            continue;
        };
        manifest.signals.insert(
            custom.signal_id,
            SignalDecoding {
                source: SignalSource::Custom {
                    decoding: CustomSignalDecoding {
                        signal_id: custom.signal_id,
                        name: custom.name,
                        signal_type,
                    },
                },
                signal_type,
            },
        );
    }
    Ok(manifest)
}

// =============================================================================
// Collection schemes
// =============================================================================

/// Decode a collection schemes document into a campaign list.
///
/// Individual malformed campaigns are skipped; duplicated sync ids keep
/// the first occurrence.
///
/// # Errors
///
/// [`IngestionError::DecodeFailed`] when the envelope itself does not
/// parse.
pub fn decode_collection_schemes(
    bytes: &[u8],
    invocation_ids: &mut InvocationIdAllocator,
) -> Result<CampaignList, IngestionError> {
    let msg = schemas::CollectionSchemesMsg::decode(bytes)?;
    let mut list = CampaignList::default();
    let mut seen = std::collections::HashSet::new();
    for scheme in msg.collection_schemes {
        let sync_id = scheme.campaign_sync_id.clone();
        match campaign_from_msg(scheme, invocation_ids) {
            Ok(campaign) => {
                if seen.insert(campaign.sync_id.clone()) {
                    list.campaigns.push(Arc::new(campaign));
                } else {
                    warn!(campaign = %sync_id, "duplicate campaign sync id, keeping the first");
                }
            }
            Err(error) => {
                warn!(campaign = %sync_id, %error, "skipping malformed campaign");
            }
        }
    }
    Ok(list)
}

fn campaign_from_msg(
    msg: CollectionSchemeMsg,
    invocation_ids: &mut InvocationIdAllocator,
) -> Result<Campaign, IngestionError> {
    if msg.campaign_sync_id.is_empty() {
        return Err(IngestionError::InvalidDocument("campaign without sync id".into()));
    }
    if msg.decoder_manifest_sync_id.is_empty() {
        return Err(IngestionError::InvalidDocument(
            "campaign without decoder manifest sync id".into(),
        ));
    }
    let trigger = match msg.collection_type {
        Some(CollectionType::TimeBased(time_based)) => {
            if time_based.period_ms == 0 {
                return Err(IngestionError::InvalidDocument(
                    "time based campaign with zero period".into(),
                ));
            }
            CampaignTrigger::TimeBased {
                period_ms: u32::try_from(time_based.period_ms).unwrap_or(u32::MAX),
            }
        }
        Some(CollectionType::ConditionBased(condition_based)) => {
            let Some(tree) = condition_based.condition_tree else {
                return Err(IngestionError::InvalidDocument(
                    "condition based campaign without a condition tree".into(),
                ));
            };
            let condition = condition_from_msg(&tree, invocation_ids, MAX_CONDITION_DEPTH * 2)?;
            let mode = match TriggerModeMsg::try_from(condition_based.trigger_mode) {
                Ok(TriggerModeMsg::RisingEdge) => TriggerMode::RisingEdge,
                _ => TriggerMode::Always,
            };
            CampaignTrigger::ConditionBased {
                condition: Arc::new(condition),
                min_interval_ms: condition_based.condition_minimum_interval_ms,
                mode,
            }
        }
        None => {
            return Err(IngestionError::InvalidDocument(
                "campaign without a collection type".into(),
            ));
        }
    };
    let signal_requirements = msg
        .signal_information
        .iter()
        .map(|info| SignalRequirement {
            signal_id: info.signal_id,
            sample_buffer_size: info.sample_buffer_size.max(1),
            minimum_sample_period_ms: info.minimum_sample_period_ms,
            fixed_window_period_ms: info.fixed_window_period_ms,
            condition_only: info.condition_only_signal,
        })
        .collect();
    Ok(Campaign {
        sync_id: msg.campaign_sync_id,
        decoder_manifest_sync_id: msg.decoder_manifest_sync_id,
        start_time_ms: msg.start_time_ms_epoch,
        expiry_time_ms: msg.expiry_time_ms_epoch,
        trigger,
        after_duration_ms: msg.after_duration_ms,
        signal_requirements,
        include_active_dtcs: msg.include_active_dtcs,
        priority: msg.priority,
        persist_on_disconnect: msg.persist_all_collected_data,
        compress: msg.compress_collected_data,
    })
}

fn condition_from_msg(
    msg: &ConditionNodeMsg,
    invocation_ids: &mut InvocationIdAllocator,
    remaining_depth: usize,
) -> Result<ConditionNode, IngestionError> {
    if remaining_depth == 0 {
        return Err(IngestionError::InvalidDocument(
            "condition tree exceeds depth limit".into(),
        ));
    }
    let next = remaining_depth - 1;
    let node_type = ConditionNodeType::try_from(msg.node_type)
        .map_err(|_| IngestionError::InvalidDocument("unknown condition node type".into()))?;

    enum BinaryOp {
        Compare(ComparisonOp),
        Logic(LogicalOp),
        Arith(ArithmeticOp),
    }
    let binary = |op: BinaryOp,
                  ids: &mut InvocationIdAllocator|
     -> Result<ConditionNode, IngestionError> {
        let (Some(left), Some(right)) = (&msg.left, &msg.right) else {
            return Err(IngestionError::InvalidDocument(
                "binary operator with a missing operand".into(),
            ));
        };
        let left = Box::new(condition_from_msg(left, ids, next)?);
        let right = Box::new(condition_from_msg(right, ids, next)?);
        Ok(match op {
            BinaryOp::Compare(op) => ConditionNode::Comparison { op, left, right },
            BinaryOp::Logic(op) => ConditionNode::Logical { op, left, right },
            BinaryOp::Arith(op) => ConditionNode::Arithmetic { op, left, right },
        })
    };

    Ok(match node_type {
        ConditionNodeType::Number => ConditionNode::Number(msg.number_value),
        ConditionNodeType::Boolean => ConditionNode::Boolean(msg.boolean_value),
        ConditionNodeType::StringValue => ConditionNode::Text(msg.string_value.clone()),
        ConditionNodeType::Signal => ConditionNode::Signal(msg.signal_id),
        ConditionNodeType::WindowFunction => {
            let function = match WindowFunctionMsg::try_from(msg.window_function) {
                Ok(WindowFunctionMsg::LastFixedWindowAvg) => WindowFunction::LastAvg,
                Ok(WindowFunctionMsg::PrevLastFixedWindowAvg) => WindowFunction::PrevLastAvg,
                Ok(WindowFunctionMsg::LastFixedWindowMin) => WindowFunction::LastMin,
                Ok(WindowFunctionMsg::PrevLastFixedWindowMin) => WindowFunction::PrevLastMin,
                Ok(WindowFunctionMsg::LastFixedWindowMax) => WindowFunction::LastMax,
                Ok(WindowFunctionMsg::PrevLastFixedWindowMax) => WindowFunction::PrevLastMax,
                Err(_) => {
                    return Err(IngestionError::InvalidDocument(
                        "unknown window function".into(),
                    ));
                }
            };
            ConditionNode::Window {
                function,
                signal_id: msg.signal_id,
            }
        }
        ConditionNodeType::OperatorSmaller => {
            binary(BinaryOp::Compare(ComparisonOp::Less), invocation_ids)?
        }
        ConditionNodeType::OperatorBigger => {
            binary(BinaryOp::Compare(ComparisonOp::Greater), invocation_ids)?
        }
        ConditionNodeType::OperatorSmallerEqual => {
            binary(BinaryOp::Compare(ComparisonOp::LessEqual), invocation_ids)?
        }
        ConditionNodeType::OperatorBiggerEqual => {
            binary(BinaryOp::Compare(ComparisonOp::GreaterEqual), invocation_ids)?
        }
        ConditionNodeType::OperatorEqual => {
            binary(BinaryOp::Compare(ComparisonOp::Equal), invocation_ids)?
        }
        ConditionNodeType::OperatorNotEqual => {
            binary(BinaryOp::Compare(ComparisonOp::NotEqual), invocation_ids)?
        }
        ConditionNodeType::OperatorLogicalAnd => {
            binary(BinaryOp::Logic(LogicalOp::And), invocation_ids)?
        }
        ConditionNodeType::OperatorLogicalOr => {
            binary(BinaryOp::Logic(LogicalOp::Or), invocation_ids)?
        }
        ConditionNodeType::OperatorLogicalNot => {
            let Some(left) = &msg.left else {
                return Err(IngestionError::InvalidDocument(
                    "negation without an operand".into(),
                ));
            };
            ConditionNode::Not(Box::new(condition_from_msg(left, invocation_ids, next)?))
        }
        ConditionNodeType::OperatorArithmeticPlus => {
            binary(BinaryOp::Arith(ArithmeticOp::Plus), invocation_ids)?
        }
        ConditionNodeType::OperatorArithmeticMinus => {
            binary(BinaryOp::Arith(ArithmeticOp::Minus), invocation_ids)?
        }
        ConditionNodeType::OperatorArithmeticMultiply => {
            binary(BinaryOp::Arith(ArithmeticOp::Multiply), invocation_ids)?
        }
        ConditionNodeType::OperatorArithmeticDivide => {
            binary(BinaryOp::Arith(ArithmeticOp::Divide), invocation_ids)?
        }
        ConditionNodeType::CustomFunction => {
            if msg.function_name.is_empty() {
                return Err(IngestionError::InvalidDocument(
                    "custom function without a name".into(),
                ));
            }
            let mut args = Vec::with_capacity(msg.function_args.len());
            for arg in &msg.function_args {
                args.push(condition_from_msg(arg, invocation_ids, next)?);
            }
            ConditionNode::CustomFunction {
                name: msg.function_name.clone(),
                invocation_id: invocation_ids.next(),
                args,
            }
        }
        ConditionNodeType::IsNull => {
            let Some(left) = &msg.left else {
                return Err(IngestionError::InvalidDocument(
                    "isnull without an operand".into(),
                ));
            };
            ConditionNode::IsNull(Box::new(condition_from_msg(left, invocation_ids, next)?))
        }
    })
}

// =============================================================================
// State templates
// =============================================================================

/// One state template known to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTemplate {
    pub sync_id: SyncId,
    pub signal_ids: Vec<u32>,
}

/// A versioned diff of the state template set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateTemplatesDiff {
    pub version: u64,
    pub decoder_manifest_sync_id: SyncId,
    pub add: Vec<StateTemplate>,
    pub remove: Vec<SyncId>,
}

/// Decode a state templates diff document.
///
/// # Errors
///
/// [`IngestionError::DecodeFailed`] on a malformed payload.
pub fn decode_state_templates(bytes: &[u8]) -> Result<StateTemplatesDiff, IngestionError> {
    let msg = StateTemplatesMsg::decode(bytes)?;
    Ok(StateTemplatesDiff {
        version: msg.version,
        decoder_manifest_sync_id: msg.decoder_manifest_sync_id,
        add: msg
            .state_templates_to_add
            .into_iter()
            .map(|t| StateTemplate {
                sync_id: t.state_template_sync_id,
                signal_ids: t.signal_ids,
            })
            .collect(),
        remove: msg.state_template_sync_ids_to_remove,
    })
}

// =============================================================================
// Outbound encoding
// =============================================================================

/// Encode a checkin payload.
#[must_use]
pub fn encode_checkin(sync_ids: &[SyncId], timestamp_ms: Timestamp) -> Vec<u8> {
    schemas::encode(&CheckinMsg {
        document_sync_ids: sync_ids.to_vec(),
        timestamp_ms_epoch: timestamp_ms,
    })
}

/// Serialize a triggered bundle to the vehicle data schema.
///
/// Complex payloads are resolved through the raw data buffer manager at
/// this point; handles whose bytes were evicted in the meantime are
/// skipped.
#[must_use]
pub fn encode_vehicle_data(
    data: &TriggeredData,
    raw_data: Option<&Arc<BufferManager>>,
) -> Vec<u8> {
    let trigger_ms = data.trigger_time_ms;
    let mut captured_signals = Vec::with_capacity(data.signals.len());
    for sample in &data.signals {
        let relative_time_ms = sample.timestamp_ms as i64 - trigger_ms as i64;
        match sample.value {
            SignalValue::RawData { handle } => {
                let Some(loan) =
                    raw_data.and_then(|r| r.borrow_frame(sample.signal_id, handle))
                else {
                    warn!(
                        signal_id = sample.signal_id,
                        handle, "raw payload no longer available, skipping signal"
                    );
                    continue;
                };
                captured_signals.push(CapturedSignalMsg {
                    signal_id: sample.signal_id,
                    relative_time_ms,
                    double_value: 0.0,
                    raw_data: loan.data().to_vec(),
                });
            }
            _ => {
                captured_signals.push(CapturedSignalMsg {
                    signal_id: sample.signal_id,
                    relative_time_ms,
                    double_value: sample.value.as_f64().unwrap_or(0.0),
                    raw_data: Vec::new(),
                });
            }
        }
    }
    let dtc_data = data.active_dtcs.as_ref().map(|dtcs| DtcDataMsg {
        relative_time_ms: dtcs.observed_at_ms as i64 - trigger_ms as i64,
        active_dtc_codes: dtcs.codes.clone(),
    });
    schemas::encode(&VehicleDataMsg {
        campaign_sync_id: data.metadata.campaign_sync_id.clone(),
        decoder_manifest_sync_id: data.metadata.decoder_manifest_sync_id.clone(),
        collection_event_id: data.event_id,
        collection_event_time_ms_epoch: trigger_ms,
        captured_signals,
        dtc_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{
        CanSignalMsg, CollectionSchemesMsg, ConditionBasedCollectionMsg, StateTemplateMsg,
        TimeBasedCollectionMsg,
    };

    fn signal_node(signal_id: u32) -> ConditionNodeMsg {
        ConditionNodeMsg {
            node_type: ConditionNodeType::Signal as i32,
            signal_id,
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

    fn greater_node(left: ConditionNodeMsg, right: ConditionNodeMsg) -> ConditionNodeMsg {
        ConditionNodeMsg {
            node_type: ConditionNodeType::OperatorBigger as i32,
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
            ..ConditionNodeMsg::default()
        }
    }

    fn condition_scheme(sync_id: &str, tree: ConditionNodeMsg) -> CollectionSchemeMsg {
        CollectionSchemeMsg {
            campaign_sync_id: sync_id.into(),
            decoder_manifest_sync_id: "dm-1".into(),
            expiry_time_ms_epoch: u64::MAX,
            collection_type: Some(CollectionType::ConditionBased(
                ConditionBasedCollectionMsg {
                    condition_tree: Some(Box::new(tree)),
                    condition_minimum_interval_ms: 1_000,
                    trigger_mode: TriggerModeMsg::RisingEdge as i32,
                },
            )),
            ..CollectionSchemeMsg::default()
        }
    }

    #[test]
    fn manifest_decodes_and_skips_unknown_types() {
        let msg = DecoderManifestMsg {
            sync_id: "dm-1".into(),
            can_signals: vec![
                CanSignalMsg {
                    signal_id: 1,
                    interface_id: "can0".into(),
                    message_id: 0x100,
                    signal_type: SignalTypeMsg::Float64 as i32,
                    ..CanSignalMsg::default()
                },
                CanSignalMsg {
                    signal_id: 2,
                    interface_id: "can0".into(),
                    message_id: 0x101,
                    signal_type: SignalTypeMsg::Unknown as i32,
                    ..CanSignalMsg::default()
                },
            ],
            ..DecoderManifestMsg::default()
        };
        let manifest = decode_decoder_manifest(&schemas::encode(&msg)).unwrap();
        assert_eq!(manifest.sync_id, "dm-1");
        assert!(manifest.contains(1));
        assert!(!manifest.contains(2));
    }

    #[test]
    fn manifest_without_sync_id_is_invalid() {
        let msg = DecoderManifestMsg::default();
        assert!(matches!(
            decode_decoder_manifest(&schemas::encode(&msg)),
            Err(IngestionError::InvalidDocument(_))
        ));
    }

    #[test]
    fn schemes_decode_with_condition_tree() {
        let msg = CollectionSchemesMsg {
            collection_schemes: vec![condition_scheme(
                "c-1",
                greater_node(signal_node(7), number_node(21.5)),
            )],
            timestamp_ms_epoch: 0,
        };
        let mut ids = InvocationIdAllocator::default();
        let list = decode_collection_schemes(&schemas::encode(&msg), &mut ids).unwrap();
        assert_eq!(list.campaigns.len(), 1);
        let campaign = &list.campaigns[0];
        assert_eq!(campaign.sync_id, "c-1");
        let condition = campaign.condition().unwrap();
        assert_eq!(condition.referenced_signals().len(), 1);
        match &**condition {
            ConditionNode::Comparison { op, .. } => assert_eq!(*op, ComparisonOp::Greater),
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[test]
    fn malformed_campaign_does_not_poison_the_list() {
        let broken = CollectionSchemeMsg {
            campaign_sync_id: "broken".into(),
            decoder_manifest_sync_id: "dm-1".into(),
            collection_type: None,
            ..CollectionSchemeMsg::default()
        };
        let good = CollectionSchemeMsg {
            campaign_sync_id: "good".into(),
            decoder_manifest_sync_id: "dm-1".into(),
            collection_type: Some(CollectionType::TimeBased(TimeBasedCollectionMsg {
                period_ms: 5_000,
            })),
            ..CollectionSchemeMsg::default()
        };
        let msg = CollectionSchemesMsg {
            collection_schemes: vec![broken, good],
            timestamp_ms_epoch: 0,
        };
        let mut ids = InvocationIdAllocator::default();
        let list = decode_collection_schemes(&schemas::encode(&msg), &mut ids).unwrap();
        assert_eq!(list.campaigns.len(), 1);
        assert_eq!(list.campaigns[0].sync_id, "good");
    }

    #[test]
    fn custom_functions_get_distinct_invocation_ids() {
        let call = |name: &str| ConditionNodeMsg {
            node_type: ConditionNodeType::CustomFunction as i32,
            function_name: name.into(),
            function_args: vec![number_node(1.0)],
            ..ConditionNodeMsg::default()
        };
        let tree = ConditionNodeMsg {
            node_type: ConditionNodeType::OperatorLogicalAnd as i32,
            left: Some(Box::new(call("f"))),
            right: Some(Box::new(call("f"))),
            ..ConditionNodeMsg::default()
        };
        let msg = CollectionSchemesMsg {
            collection_schemes: vec![condition_scheme("c-1", tree)],
            timestamp_ms_epoch: 0,
        };
        let mut ids = InvocationIdAllocator::default();
        let list = decode_collection_schemes(&schemas::encode(&msg), &mut ids).unwrap();
        let mut seen = Vec::new();
        list.campaigns[0]
            .condition()
            .unwrap()
            .for_each_invocation(&mut |id| seen.push(id));
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
    }

    #[test]
    fn state_templates_diff_round_trips() {
        let msg = StateTemplatesMsg {
            version: 456,
            decoder_manifest_sync_id: "dm-1".into(),
            state_templates_to_add: vec![StateTemplateMsg {
                state_template_sync_id: "LKS1".into(),
                signal_ids: vec![1, 2],
            }],
            state_template_sync_ids_to_remove: vec!["LKS0".into()],
        };
        let diff = decode_state_templates(&schemas::encode(&msg)).unwrap();
        assert_eq!(diff.version, 456);
        assert_eq!(diff.add[0].sync_id, "LKS1");
        assert_eq!(diff.remove, vec!["LKS0".to_string()]);
    }

    #[test]
    fn vehicle_data_encodes_relative_times() {
        let data = TriggeredData {
            metadata: crate::types::CampaignMetadata {
                campaign_sync_id: "c-1".into(),
                decoder_manifest_sync_id: "dm-1".into(),
                ..Default::default()
            },
            event_id: 7,
            trigger_time_ms: 1_000,
            signals: vec![crate::types::SignalSample {
                signal_id: 1,
                timestamp_ms: 900,
                value: SignalValue::Float64(3.5),
            }],
            active_dtcs: None,
        };
        let bytes = encode_vehicle_data(&data, None);
        let decoded = VehicleDataMsg::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.collection_event_id, 7);
        assert_eq!(decoded.captured_signals[0].relative_time_ms, -100);
        assert_eq!(decoded.captured_signals[0].double_value, 3.5);
    }
}
