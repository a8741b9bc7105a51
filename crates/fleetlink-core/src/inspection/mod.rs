//! Inspection engine: evaluates active campaign conditions against
//! streaming signals and assembles triggered data bundles.

pub mod custom;
pub mod engine;
pub mod value;
pub mod worker;

use std::sync::Arc;

use crate::campaign::{ConditionNode, TriggerMode, MAX_ACTIVE_CAMPAIGNS};
use crate::types::{CampaignMetadata, SignalId, SignalType};

pub use engine::InspectionEngine;
pub use value::InspectionValue;
pub use worker::{InspectionWorker, InspectionWorkerHandle};

/// Buffering requirements for one signal within one condition, resolved
/// against the manifest's signal type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionSignalInfo {
    pub signal_id: SignalId,
    /// At least this many of the latest samples are kept buffered.
    pub sample_buffer_size: usize,
    /// Zero records every sample as seen on the bus.
    pub minimum_sample_interval_ms: u32,
    /// Zero means no fixed-window aggregation for this signal.
    pub fixed_window_period_ms: u32,
    /// Buffered for evaluation only, never uploaded.
    pub condition_only: bool,
    pub signal_type: SignalType,
}

/// One active campaign as the engine sees it.
#[derive(Debug, Clone)]
pub struct ConditionWithData {
    pub condition: Arc<ConditionNode>,
    pub min_interval_ms: u32,
    pub after_duration_ms: u32,
    pub trigger_mode: TriggerMode,
    /// Evaluate on every pass, not only when an input signal changed.
    /// Set for static trees (time-based campaigns).
    pub always_evaluate: bool,
    pub signals: Vec<InspectionSignalInfo>,
    pub include_active_dtcs: bool,
    pub metadata: CampaignMetadata,
}

/// Engine-facing consolidation of all active campaigns.
///
/// Conditions are ordered by (priority, campaign sync id); on concurrent
/// triggers the engine collects data in this order. Regenerated atomically
/// on any campaign or manifest change and published as an immutable
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct InspectionMatrix {
    pub conditions: Vec<ConditionWithData>,
}

impl InspectionMatrix {
    /// Matrix with no active campaigns.
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

const CONDITION_SET_WORDS: usize = MAX_ACTIVE_CAMPAIGNS / 64;

/// Fixed-size bit set over condition indices.
///
/// Sized for [`MAX_ACTIVE_CAMPAIGNS`]; used to track which conditions
/// depend on a signal, which saw an input change, and which campaigns
/// already consumed a buffered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConditionSet([u64; CONDITION_SET_WORDS]);

impl ConditionSet {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; CONDITION_SET_WORDS])
    }

    pub fn set(&mut self, index: usize) {
        if index < MAX_ACTIVE_CAMPAIGNS {
            self.0[index / 64] |= 1 << (index % 64);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < MAX_ACTIVE_CAMPAIGNS {
            self.0[index / 64] &= !(1 << (index % 64));
        }
    }

    #[must_use]
    pub const fn test(&self, index: usize) -> bool {
        if index >= MAX_ACTIVE_CAMPAIGNS {
            return false;
        }
        self.0[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn clear_all(&mut self) {
        self.0 = [0; CONDITION_SET_WORDS];
    }

    /// Merge another set into this one.
    pub fn union_with(&mut self, other: &Self) {
        for (word, other_word) in self.0.iter_mut().zip(other.0.iter()) {
            *word |= other_word;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_set_basics() {
        let mut set = ConditionSet::new();
        assert!(set.is_empty());
        set.set(0);
        set.set(63);
        set.set(200);
        assert!(set.test(0));
        assert!(set.test(63));
        assert!(set.test(200));
        assert!(!set.test(1));
        set.clear(63);
        assert!(!set.test(63));
    }

    #[test]
    fn condition_set_ignores_out_of_range() {
        let mut set = ConditionSet::new();
        set.set(MAX_ACTIVE_CAMPAIGNS + 5);
        assert!(set.is_empty());
        assert!(!set.test(MAX_ACTIVE_CAMPAIGNS + 5));
    }

    #[test]
    fn condition_set_union() {
        let mut a = ConditionSet::new();
        let mut b = ConditionSet::new();
        a.set(1);
        b.set(130);
        a.union_with(&b);
        assert!(a.test(1));
        assert!(a.test(130));
    }
}
