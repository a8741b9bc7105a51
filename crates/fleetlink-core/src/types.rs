//! Core signal and document types shared across the agent.

use std::fmt;

/// Unique signal identifier assigned by the cloud.
///
/// Stable only within the lifetime of one decoder manifest; a manifest swap
/// may remap every id.
pub type SignalId = u32;

/// Signal id that is never assigned to a real signal.
pub const INVALID_SIGNAL_ID: SignalId = 0;

/// Opaque, cloud-assigned string identifying one version of a document
/// (campaign, decoder manifest or state template).
pub type SyncId = String;

/// Milliseconds, either since the Unix epoch (wall) or since an arbitrary
/// anchor (monotonic) depending on context.
pub type Timestamp = u64;

/// Handle into the raw data buffer manager.
pub type RawDataHandle = u32;

/// Raw data handle that is never returned by a successful store.
pub const INVALID_RAW_DATA_HANDLE: RawDataHandle = 0;

/// A pair of wall-clock and monotonic readings taken at the same instant.
///
/// Deadline arithmetic must use the monotonic part; comparisons against
/// cloud-supplied epoch times use the wall part. Wall-clock jumps therefore
/// never corrupt scheduled waits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimePoint {
    /// Milliseconds since the Unix epoch.
    pub system_time_ms: Timestamp,
    /// Milliseconds since an arbitrary process-local anchor.
    pub monotonic_time_ms: Timestamp,
}

/// Type of a decoded signal as declared by the decoder manifest.
///
/// The type of a given [`SignalId`] is immutable within one manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Bool,
    /// UTF-8 payload stored in the raw data buffer manager.
    String,
    /// Opaque byte payload stored in the raw data buffer manager.
    Bytes,
}

impl SignalType {
    /// Whether values of this type are stored out-of-line in the raw data
    /// buffer manager and travel by handle.
    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::String | Self::Bytes)
    }

    /// Whether values of this type can participate in numeric expressions.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !self.is_complex()
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int8 => "i8",
            Self::Int16 => "i16",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::Uint8 => "u8",
            Self::Uint16 => "u16",
            Self::Uint32 => "u32",
            Self::Uint64 => "u64",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A decoded signal value.
///
/// Complex payloads (strings, images, serialized frames) are not carried by
/// value; they are stored in the raw data buffer manager and referenced by
/// handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    /// Reference to a frame held by the raw data buffer manager.
    RawData { handle: RawDataHandle },
}

impl SignalValue {
    /// Numeric view of the value, if it has one.
    ///
    /// Booleans coerce to 0.0/1.0 the way condition expressions expect;
    /// raw-data handles have no numeric view.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int8(v) => Some(f64::from(v)),
            Self::Int16(v) => Some(f64::from(v)),
            Self::Int32(v) => Some(f64::from(v)),
            Self::Int64(v) => Some(v as f64),
            Self::Uint8(v) => Some(f64::from(v)),
            Self::Uint16(v) => Some(f64::from(v)),
            Self::Uint32(v) => Some(f64::from(v)),
            Self::Uint64(v) => Some(v as f64),
            Self::Float32(v) => Some(f64::from(v)),
            Self::Float64(v) => Some(v),
            Self::Bool(v) => Some(if v { 1.0 } else { 0.0 }),
            Self::RawData { .. } => None,
        }
    }

    /// The raw-data handle, if this value is a complex payload reference.
    #[must_use]
    pub const fn raw_data_handle(&self) -> Option<RawDataHandle> {
        match *self {
            Self::RawData { handle } => Some(handle),
            _ => None,
        }
    }

    /// The [`SignalType`] bucket this value belongs to.
    ///
    /// Raw-data references report [`SignalType::Bytes`]; whether the payload
    /// is a string is only known to the decoder manifest.
    #[must_use]
    pub const fn signal_type(&self) -> SignalType {
        match *self {
            Self::Int8(_) => SignalType::Int8,
            Self::Int16(_) => SignalType::Int16,
            Self::Int32(_) => SignalType::Int32,
            Self::Int64(_) => SignalType::Int64,
            Self::Uint8(_) => SignalType::Uint8,
            Self::Uint16(_) => SignalType::Uint16,
            Self::Uint32(_) => SignalType::Uint32,
            Self::Uint64(_) => SignalType::Uint64,
            Self::Float32(_) => SignalType::Float32,
            Self::Float64(_) => SignalType::Float64,
            Self::Bool(_) => SignalType::Bool,
            Self::RawData { .. } => SignalType::Bytes,
        }
    }
}

/// One decoded sample as produced by a bus/source decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSample {
    pub signal_id: SignalId,
    /// Reception time on the physical bus, epoch milliseconds. Monotonic
    /// per source, not globally.
    pub timestamp_ms: Timestamp,
    pub value: SignalValue,
}

/// Snapshot of the diagnostic trouble codes currently active on the
/// vehicle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtcInfo {
    pub codes: Vec<String>,
    pub observed_at_ms: Timestamp,
}

/// Unit of work on the signal pipeline: the samples one decoder observed
/// together, or a DTC snapshot.
#[derive(Debug, Clone, Default)]
pub struct SignalFrame {
    pub samples: Vec<SignalSample>,
    pub active_dtcs: Option<DtcInfo>,
}

impl SignalFrame {
    /// Frame carrying a single sample.
    #[must_use]
    pub fn from_sample(sample: SignalSample) -> Self {
        Self {
            samples: vec![sample],
            active_dtcs: None,
        }
    }

    /// Frame carrying a DTC snapshot only.
    #[must_use]
    pub fn from_dtcs(dtcs: DtcInfo) -> Self {
        Self {
            samples: Vec::new(),
            active_dtcs: Some(dtcs),
        }
    }
}

/// Campaign attributes forwarded unchanged from ingest to upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignMetadata {
    pub campaign_sync_id: SyncId,
    pub decoder_manifest_sync_id: SyncId,
    /// Lower number takes precedence on concurrent triggers.
    pub priority: u32,
    /// Persist the payload locally when the transport is unavailable.
    pub persist: bool,
    /// Ask the transport to compress the payload.
    pub compress: bool,
}

/// Identifier of one trigger event, unique per agent run.
pub type EventId = u32;

/// A triggered data bundle: the buffered history snapshot produced when a
/// campaign's condition fires.
#[derive(Debug, Clone, Default)]
pub struct TriggeredData {
    pub metadata: CampaignMetadata,
    pub event_id: EventId,
    /// Wall-clock time of the trigger, epoch milliseconds.
    pub trigger_time_ms: Timestamp,
    pub signals: Vec<SignalSample>,
    pub active_dtcs: Option<DtcInfo>,
}
