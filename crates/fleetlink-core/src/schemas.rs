//! Wire schema mirrors.
//!
//! The cloud owns these schemas; the structs here are hand-written prost
//! mirrors of the subset the agent consumes and produces. Inbound:
//! decoder manifests, collection schemes, state templates. Outbound:
//! checkins and vehicle data payloads.

use prost::Message;

// =============================================================================
// Shared enumerations
// =============================================================================

/// Signal primitive type as declared by the decoder manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum SignalTypeMsg {
    Unknown = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Uint8 = 5,
    Uint16 = 6,
    Uint32 = 7,
    Uint64 = 8,
    Float32 = 9,
    Float64 = 10,
    Bool = 11,
    String = 12,
    Bytes = 13,
}

// =============================================================================
// Decoder manifest (inbound)
// =============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct DecoderManifestMsg {
    #[prost(string, tag = "1")]
    pub sync_id: String,
    #[prost(message, repeated, tag = "2")]
    pub can_signals: Vec<CanSignalMsg>,
    #[prost(message, repeated, tag = "3")]
    pub obd_pid_signals: Vec<ObdPidSignalMsg>,
    #[prost(message, repeated, tag = "4")]
    pub custom_signals: Vec<CustomSignalMsg>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CanSignalMsg {
    #[prost(uint32, tag = "1")]
    pub signal_id: u32,
    #[prost(string, tag = "2")]
    pub interface_id: String,
    #[prost(uint32, tag = "3")]
    pub message_id: u32,
    #[prost(bool, tag = "4")]
    pub is_big_endian: bool,
    #[prost(bool, tag = "5")]
    pub is_signed: bool,
    #[prost(uint32, tag = "6")]
    pub start_bit: u32,
    #[prost(uint32, tag = "7")]
    pub length: u32,
    #[prost(double, tag = "8")]
    pub factor: f64,
    #[prost(double, tag = "9")]
    pub offset: f64,
    #[prost(enumeration = "SignalTypeMsg", tag = "10")]
    pub signal_type: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ObdPidSignalMsg {
    #[prost(uint32, tag = "1")]
    pub signal_id: u32,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
    #[prost(uint32, tag = "3")]
    pub byte_offset: u32,
    #[prost(uint32, tag = "4")]
    pub byte_length: u32,
    #[prost(double, tag = "5")]
    pub scaling: f64,
    #[prost(double, tag = "6")]
    pub offset: f64,
    #[prost(enumeration = "SignalTypeMsg", tag = "7")]
    pub signal_type: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct CustomSignalMsg {
    #[prost(uint32, tag = "1")]
    pub signal_id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(enumeration = "SignalTypeMsg", tag = "3")]
    pub signal_type: i32,
}

// =============================================================================
// Collection schemes (inbound)
// =============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct CollectionSchemesMsg {
    #[prost(message, repeated, tag = "1")]
    pub collection_schemes: Vec<CollectionSchemeMsg>,
    #[prost(uint64, tag = "2")]
    pub timestamp_ms_epoch: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct CollectionSchemeMsg {
    #[prost(string, tag = "1")]
    pub campaign_sync_id: String,
    #[prost(string, tag = "2")]
    pub decoder_manifest_sync_id: String,
    #[prost(uint64, tag = "3")]
    pub start_time_ms_epoch: u64,
    #[prost(uint64, tag = "4")]
    pub expiry_time_ms_epoch: u64,
    #[prost(oneof = "CollectionType", tags = "5, 6")]
    pub collection_type: Option<CollectionType>,
    #[prost(uint32, tag = "7")]
    pub after_duration_ms: u32,
    #[prost(bool, tag = "8")]
    pub include_active_dtcs: bool,
    #[prost(bool, tag = "9")]
    pub persist_all_collected_data: bool,
    #[prost(bool, tag = "10")]
    pub compress_collected_data: bool,
    #[prost(uint32, tag = "11")]
    pub priority: u32,
    #[prost(message, repeated, tag = "12")]
    pub signal_information: Vec<SignalInformationMsg>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum CollectionType {
    #[prost(message, tag = "5")]
    TimeBased(TimeBasedCollectionMsg),
    #[prost(message, tag = "6")]
    ConditionBased(ConditionBasedCollectionMsg),
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeBasedCollectionMsg {
    #[prost(uint64, tag = "1")]
    pub period_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum TriggerModeMsg {
    Always = 0,
    RisingEdge = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConditionBasedCollectionMsg {
    #[prost(message, optional, boxed, tag = "1")]
    pub condition_tree: Option<Box<ConditionNodeMsg>>,
    #[prost(uint32, tag = "2")]
    pub condition_minimum_interval_ms: u32,
    #[prost(enumeration = "TriggerModeMsg", tag = "3")]
    pub trigger_mode: i32,
}

/// Kind discriminator of one condition tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ConditionNodeType {
    Number = 0,
    Boolean = 1,
    Signal = 2,
    WindowFunction = 3,
    OperatorSmaller = 4,
    OperatorBigger = 5,
    OperatorSmallerEqual = 6,
    OperatorBiggerEqual = 7,
    OperatorEqual = 8,
    OperatorNotEqual = 9,
    OperatorLogicalAnd = 10,
    OperatorLogicalOr = 11,
    OperatorLogicalNot = 12,
    OperatorArithmeticPlus = 13,
    OperatorArithmeticMinus = 14,
    OperatorArithmeticMultiply = 15,
    OperatorArithmeticDivide = 16,
    CustomFunction = 17,
    IsNull = 18,
    StringValue = 19,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum WindowFunctionMsg {
    LastFixedWindowAvg = 0,
    PrevLastFixedWindowAvg = 1,
    LastFixedWindowMin = 2,
    PrevLastFixedWindowMin = 3,
    LastFixedWindowMax = 4,
    PrevLastFixedWindowMax = 5,
}

/// One node of the condition AST, pre-order with explicit children.
#[derive(Clone, PartialEq, Message)]
pub struct ConditionNodeMsg {
    #[prost(enumeration = "ConditionNodeType", tag = "1")]
    pub node_type: i32,
    #[prost(message, optional, boxed, tag = "2")]
    pub left: Option<Box<ConditionNodeMsg>>,
    #[prost(message, optional, boxed, tag = "3")]
    pub right: Option<Box<ConditionNodeMsg>>,
    #[prost(double, tag = "4")]
    pub number_value: f64,
    #[prost(bool, tag = "5")]
    pub boolean_value: bool,
    #[prost(uint32, tag = "6")]
    pub signal_id: u32,
    #[prost(enumeration = "WindowFunctionMsg", tag = "7")]
    pub window_function: i32,
    #[prost(string, tag = "8")]
    pub function_name: String,
    #[prost(message, repeated, tag = "9")]
    pub function_args: Vec<ConditionNodeMsg>,
    #[prost(string, tag = "10")]
    pub string_value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignalInformationMsg {
    #[prost(uint32, tag = "1")]
    pub signal_id: u32,
    #[prost(uint32, tag = "2")]
    pub sample_buffer_size: u32,
    #[prost(uint32, tag = "3")]
    pub minimum_sample_period_ms: u32,
    #[prost(uint32, tag = "4")]
    pub fixed_window_period_ms: u32,
    #[prost(bool, tag = "5")]
    pub condition_only_signal: bool,
}

// =============================================================================
// State templates (inbound)
// =============================================================================

/// Versioned diff of the state template set.
#[derive(Clone, PartialEq, Message)]
pub struct StateTemplatesMsg {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(string, tag = "2")]
    pub decoder_manifest_sync_id: String,
    #[prost(message, repeated, tag = "3")]
    pub state_templates_to_add: Vec<StateTemplateMsg>,
    #[prost(string, repeated, tag = "4")]
    pub state_template_sync_ids_to_remove: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StateTemplateMsg {
    #[prost(string, tag = "1")]
    pub state_template_sync_id: String,
    #[prost(uint32, repeated, tag = "2")]
    pub signal_ids: Vec<u32>,
}

// =============================================================================
// Checkin (outbound)
// =============================================================================

/// Periodic self-report of the document versions known to the agent.
#[derive(Clone, PartialEq, Message)]
pub struct CheckinMsg {
    #[prost(string, repeated, tag = "1")]
    pub document_sync_ids: Vec<String>,
    #[prost(uint64, tag = "2")]
    pub timestamp_ms_epoch: u64,
}

// =============================================================================
// Vehicle data (outbound)
// =============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct VehicleDataMsg {
    #[prost(string, tag = "1")]
    pub campaign_sync_id: String,
    #[prost(string, tag = "2")]
    pub decoder_manifest_sync_id: String,
    #[prost(uint32, tag = "3")]
    pub collection_event_id: u32,
    #[prost(uint64, tag = "4")]
    pub collection_event_time_ms_epoch: u64,
    #[prost(message, repeated, tag = "5")]
    pub captured_signals: Vec<CapturedSignalMsg>,
    #[prost(message, optional, tag = "6")]
    pub dtc_data: Option<DtcDataMsg>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CapturedSignalMsg {
    #[prost(uint32, tag = "1")]
    pub signal_id: u32,
    /// Capture time relative to `collection_event_time_ms_epoch`.
    #[prost(sint64, tag = "2")]
    pub relative_time_ms: i64,
    #[prost(double, tag = "3")]
    pub double_value: f64,
    /// Complex payload bytes, resolved from the raw data buffer at
    /// serialization time. Empty for scalar signals.
    #[prost(bytes = "vec", tag = "4")]
    pub raw_data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DtcDataMsg {
    #[prost(sint64, tag = "1")]
    pub relative_time_ms: i64,
    #[prost(string, repeated, tag = "2")]
    pub active_dtc_codes: Vec<String>,
}

/// Encode any schema message to its wire bytes.
#[must_use]
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_tree_round_trips() {
        let tree = ConditionNodeMsg {
            node_type: ConditionNodeType::OperatorBigger as i32,
            left: Some(Box::new(ConditionNodeMsg {
                node_type: ConditionNodeType::Signal as i32,
                signal_id: 42,
                ..ConditionNodeMsg::default()
            })),
            right: Some(Box::new(ConditionNodeMsg {
                node_type: ConditionNodeType::Number as i32,
                number_value: 99.5,
                ..ConditionNodeMsg::default()
            })),
            ..ConditionNodeMsg::default()
        };
        let bytes = encode(&tree);
        let decoded = ConditionNodeMsg::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn garbage_does_not_decode() {
        let garbage = vec![0xFF; 32];
        assert!(CollectionSchemesMsg::decode(garbage.as_slice()).is_err());
    }
}
