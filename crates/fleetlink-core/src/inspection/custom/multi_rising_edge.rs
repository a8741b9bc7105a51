//! Multi-rising-edge trigger.
//!
//! Takes pairs of `(label, flag)` arguments, remembers the previous flag
//! per label and call site, and returns `true` when at least one flag
//! rose. At `condition_end` the risen labels are published as one complex
//! signal whose payload is a JSON array of the labels, provided the
//! tagged signal is collected by the triggering campaign and has a raw
//! data buffer configured.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::warn;

use crate::campaign::InvocationId;
use crate::dictionary::DecoderDictionary;
use crate::inspection::engine::ExpressionError;
use crate::inspection::value::InspectionValue;
use crate::rawdata::{BufferManager, BufferStage};
use crate::types::{SignalId, SignalSample, SignalValue, Timestamp, TriggeredData};

use super::CustomFunction;

/// Name condition trees call this function by.
pub const MULTI_RISING_EDGE_FUNCTION_NAME: &str = "multi_rising_edge_trigger";

/// Name under which the decoder manifest must publish the output signal.
pub const MULTI_RISING_EDGE_SIGNAL_NAME: &str = "Vehicle.MultiRisingEdgeTrigger";

struct InvocationState {
    last_flags: Vec<bool>,
}

/// See the module docs for the contract.
pub struct MultiRisingEdgeTrigger {
    dictionary: watch::Receiver<Arc<DecoderDictionary>>,
    raw_data: Option<Arc<BufferManager>>,
    states: HashMap<InvocationId, InvocationState>,
    risen_labels: Vec<String>,
}

impl MultiRisingEdgeTrigger {
    #[must_use]
    pub fn new(
        dictionary: watch::Receiver<Arc<DecoderDictionary>>,
        raw_data: Option<Arc<BufferManager>>,
    ) -> Self {
        Self {
            dictionary,
            raw_data,
            states: HashMap::new(),
            risen_labels: Vec::new(),
        }
    }

    /// Validate one `(label, flag)` pair and return the flag's effective
    /// boolean. `Undefined` flags count as `true` so they can never
    /// produce an edge on a later `true`.
    fn flag_value(label: &InspectionValue, flag: &InspectionValue) -> Result<bool, ExpressionError> {
        if !matches!(label, InspectionValue::Text(_)) {
            return Err(ExpressionError::TypeMismatch);
        }
        match flag {
            InspectionValue::Undefined => Ok(true),
            other => other.as_bool().ok_or(ExpressionError::TypeMismatch),
        }
    }
}

impl CustomFunction for MultiRisingEdgeTrigger {
    fn invoke(
        &mut self,
        invocation_id: InvocationId,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, ExpressionError> {
        if args.len() < 2 || args.len() % 2 != 0 {
            return Err(ExpressionError::TypeMismatch);
        }
        let pairs = args.len() / 2;

        let Some(state) = self.states.get_mut(&invocation_id) else {
            // First invocation establishes the baseline without firing.
            let mut last_flags = Vec::with_capacity(pairs);
            for pair in args.chunks_exact(2) {
                last_flags.push(Self::flag_value(&pair[0], &pair[1])?);
            }
            self.states
                .insert(invocation_id, InvocationState { last_flags });
            return Ok(InspectionValue::Bool(false));
        };

        if state.last_flags.len() != pairs {
            // Argument count changed since the first invocation.
            return Err(ExpressionError::TypeMismatch);
        }

        let mut any_rising = false;
        for (index, pair) in args.chunks_exact(2).enumerate() {
            let current = Self::flag_value(&pair[0], &pair[1])?;
            let is_defined = !pair[1].is_undefined();
            if is_defined && current && !state.last_flags[index] {
                any_rising = true;
                if let InspectionValue::Text(label) = &pair[0] {
                    self.risen_labels.push(label.to_string());
                }
            }
            state.last_flags[index] = current;
        }
        Ok(InspectionValue::Bool(any_rising))
    }

    fn condition_end(
        &mut self,
        collected_signals: &HashSet<SignalId>,
        timestamp_ms: Timestamp,
        output: Option<&mut TriggeredData>,
    ) {
        if self.risen_labels.is_empty() {
            return;
        }
        // State is consumed per evaluation pass whether or not data
        // collection was triggered.
        let labels = std::mem::take(&mut self.risen_labels);
        let Some(output) = output else {
            return;
        };
        let Some(raw_data) = &self.raw_data else {
            warn!("raw data buffer manager disabled, dropping rising-edge labels");
            return;
        };
        let Some(signal_id) = self
            .dictionary
            .borrow()
            .named_signal_id(MULTI_RISING_EDGE_SIGNAL_NAME)
        else {
            warn!(
                signal = MULTI_RISING_EDGE_SIGNAL_NAME,
                "signal not present in decoder manifest"
            );
            return;
        };
        if !collected_signals.contains(&signal_id) {
            return;
        }
        let payload = match serde_json::to_vec(&labels) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to encode rising-edge labels");
                return;
            }
        };
        let handle = match raw_data.store(signal_id, Bytes::from(payload), timestamp_ms) {
            Ok(handle) => handle,
            Err(error) => {
                warn!(%error, signal_id, "failed to store rising-edge payload");
                return;
            }
        };
        // Pin the handle so it survives until the uploader is done.
        raw_data.increase_usage_hint(signal_id, handle, BufferStage::SelectedForUpload);
        output.signals.push(SignalSample {
            signal_id,
            timestamp_ms,
            value: SignalValue::RawData { handle },
        });
    }

    fn cleanup(&mut self, invocation_id: InvocationId) {
        self.states.remove(&invocation_id);
    }
}
