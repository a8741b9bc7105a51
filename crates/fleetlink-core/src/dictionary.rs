//! Decoder manifest and decoder dictionary.
//!
//! The manifest is the cloud's mapping from external bus identifiers to
//! internal signal ids and types; exactly one is active at a time. The
//! dictionary is the manifest filtered down to the signals the active
//! campaigns actually need, split into per-protocol sub-maps for the bus
//! decoders. Both are immutable after publication: consumers receive fresh
//! `Arc` snapshots through a `watch` channel and hold them for the duration
//! of a sample's processing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::types::{SignalId, SignalType, SyncId};

/// Cloud-assigned identifier of a physical network interface.
pub type InterfaceId = String;

/// CAN frame identifier as seen on the bus.
pub type CanFrameId = u32;

/// Bit-level extraction rule for one signal inside a CAN frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CanSignalDecoding {
    pub signal_id: SignalId,
    pub message_id: CanFrameId,
    pub start_bit: u16,
    pub length_bits: u16,
    pub factor: f64,
    pub offset: f64,
    pub is_big_endian: bool,
    pub is_signed: bool,
    pub signal_type: SignalType,
}

/// Extraction rule for one signal inside an OBD PID response.
#[derive(Debug, Clone, PartialEq)]
pub struct ObdSignalDecoding {
    pub signal_id: SignalId,
    pub pid: u8,
    pub byte_offset: u8,
    pub byte_length: u8,
    pub scaling: f64,
    pub offset: f64,
    pub signal_type: SignalType,
}

/// Decoding rule for a signal published by a custom source under a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSignalDecoding {
    pub signal_id: SignalId,
    pub name: String,
    pub signal_type: SignalType,
}

/// Where and how a signal is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalSource {
    Can {
        interface_id: InterfaceId,
        decoding: CanSignalDecoding,
    },
    Obd {
        decoding: ObdSignalDecoding,
    },
    Custom {
        decoding: CustomSignalDecoding,
    },
}

/// One manifest entry: the source and type of a signal id.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDecoding {
    pub source: SignalSource,
    pub signal_type: SignalType,
}

/// The currently authoritative mapping from external identifiers to signal
/// ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderManifest {
    pub sync_id: SyncId,
    pub signals: HashMap<SignalId, SignalDecoding>,
}

impl DecoderManifest {
    /// Type of a signal, if the manifest knows it.
    #[must_use]
    pub fn signal_type(&self, signal_id: SignalId) -> Option<SignalType> {
        self.signals.get(&signal_id).map(|d| d.signal_type)
    }

    #[must_use]
    pub fn contains(&self, signal_id: SignalId) -> bool {
        self.signals.contains_key(&signal_id)
    }
}

/// Read-only decoder dictionary snapshot handed to the bus decoders.
///
/// Built from the active manifest restricted to `required` signals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderDictionary {
    /// Manifest this dictionary was derived from.
    pub manifest_sync_id: SyncId,
    /// CAN: interface id → frame id → signals within the frame.
    pub can: HashMap<InterfaceId, HashMap<CanFrameId, Vec<CanSignalDecoding>>>,
    /// OBD: PID → signals within the response.
    pub obd: HashMap<u8, Vec<ObdSignalDecoding>>,
    /// Custom sources: published name → decoding.
    pub custom: HashMap<String, CustomSignalDecoding>,
    signal_ids: HashSet<SignalId>,
}

impl DecoderDictionary {
    /// Build a dictionary from `manifest`, keeping only `required`
    /// signals.
    #[must_use]
    pub fn extract(manifest: &DecoderManifest, required: &HashSet<SignalId>) -> Self {
        let mut dictionary = Self {
            manifest_sync_id: manifest.sync_id.clone(),
            ..Self::default()
        };
        for (&signal_id, decoding) in &manifest.signals {
            if !required.contains(&signal_id) {
                continue;
            }
            match &decoding.source {
                SignalSource::Can {
                    interface_id,
                    decoding,
                } => {
                    dictionary
                        .can
                        .entry(interface_id.clone())
                        .or_default()
                        .entry(decoding.message_id)
                        .or_default()
                        .push(decoding.clone());
                }
                SignalSource::Obd { decoding } => {
                    dictionary
                        .obd
                        .entry(decoding.pid)
                        .or_default()
                        .push(decoding.clone());
                }
                SignalSource::Custom { decoding } => {
                    dictionary
                        .custom
                        .insert(decoding.name.clone(), decoding.clone());
                }
            }
            dictionary.signal_ids.insert(signal_id);
        }
        dictionary
    }

    /// Empty dictionary: nothing is decoded.
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signal id published by a custom source under `name`, if decoded.
    #[must_use]
    pub fn named_signal_id(&self, name: &str) -> Option<SignalId> {
        self.custom.get(name).map(|d| d.signal_id)
    }

    #[must_use]
    pub fn contains_signal(&self, signal_id: SignalId) -> bool {
        self.signal_ids.contains(&signal_id)
    }

    /// Number of signals this dictionary decodes.
    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.signal_ids.len()
    }
}
