//! Campaign model: cloud-issued specifications of when and what to
//! collect, and the condition trees that drive them.

pub mod manager;

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::dictionary::DecoderManifest;
use crate::types::{SignalId, SyncId, Timestamp};

/// Condition trees deeper than this are rejected at activation.
pub const MAX_CONDITION_DEPTH: usize = 10;

/// Upper bound on simultaneously active campaigns; additional ones stay
/// inactive.
pub const MAX_ACTIVE_CAMPAIGNS: usize = 256;

/// Aggregate over a signal's fixed time window referenced from a
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowFunction {
    LastMin,
    LastMax,
    LastAvg,
    PrevLastMin,
    PrevLastMax,
    PrevLastAvg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Plus,
    Minus,
    Multiply,
    Divide,
}

/// Identifier of one custom-function call site, unique across all
/// campaigns received in one agent run. Lets a stateful function keep
/// separate state per call site and clean it up on campaign removal.
pub type InvocationId = u64;

/// Binary AST of a campaign condition. Built once at ingestion, read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    Number(f64),
    Boolean(bool),
    /// String literal, meaningful only as a custom-function argument.
    Text(String),
    /// Latest value of a signal.
    Signal(SignalId),
    /// Aggregate over a signal's fixed window.
    Window {
        function: WindowFunction,
        signal_id: SignalId,
    },
    Comparison {
        op: ComparisonOp,
        left: Box<ConditionNode>,
        right: Box<ConditionNode>,
    },
    Logical {
        op: LogicalOp,
        left: Box<ConditionNode>,
        right: Box<ConditionNode>,
    },
    Not(Box<ConditionNode>),
    Arithmetic {
        op: ArithmeticOp,
        left: Box<ConditionNode>,
        right: Box<ConditionNode>,
    },
    /// Extension-point call, dispatched by name through the custom
    /// function registry.
    CustomFunction {
        name: String,
        invocation_id: InvocationId,
        args: Vec<ConditionNode>,
    },
    /// Whether a signal currently has no known value.
    IsNull(Box<ConditionNode>),
}

impl ConditionNode {
    /// Depth of the tree (a leaf has depth 1).
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Number(_)
            | Self::Boolean(_)
            | Self::Text(_)
            | Self::Signal(_)
            | Self::Window { .. } => 1,
            Self::Comparison { left, right, .. }
            | Self::Logical { left, right, .. }
            | Self::Arithmetic { left, right, .. } => 1 + left.depth().max(right.depth()),
            Self::Not(inner) | Self::IsNull(inner) => 1 + inner.depth(),
            Self::CustomFunction { args, .. } => {
                1 + args.iter().map(Self::depth).max().unwrap_or(0)
            }
        }
    }

    /// Visit every signal id referenced by the tree.
    pub fn for_each_signal(&self, f: &mut impl FnMut(SignalId)) {
        match self {
            Self::Number(_) | Self::Boolean(_) | Self::Text(_) => {}
            Self::Signal(id) | Self::Window { signal_id: id, .. } => f(*id),
            Self::Comparison { left, right, .. }
            | Self::Logical { left, right, .. }
            | Self::Arithmetic { left, right, .. } => {
                left.for_each_signal(f);
                right.for_each_signal(f);
            }
            Self::Not(inner) | Self::IsNull(inner) => inner.for_each_signal(f),
            Self::CustomFunction { args, .. } => {
                for arg in args {
                    arg.for_each_signal(f);
                }
            }
        }
    }

    /// Visit every custom-function invocation id in the tree.
    pub fn for_each_invocation(&self, f: &mut impl FnMut(InvocationId)) {
        match self {
            Self::Number(_)
            | Self::Boolean(_)
            | Self::Text(_)
            | Self::Signal(_)
            | Self::Window { .. } => {}
            Self::Comparison { left, right, .. }
            | Self::Logical { left, right, .. }
            | Self::Arithmetic { left, right, .. } => {
                left.for_each_invocation(f);
                right.for_each_invocation(f);
            }
            Self::Not(inner) | Self::IsNull(inner) => inner.for_each_invocation(f),
            Self::CustomFunction {
                invocation_id,
                args,
                ..
            } => {
                f(*invocation_id);
                for arg in args {
                    arg.for_each_invocation(f);
                }
            }
        }
    }

    /// A static tree references no signals and calls no functions; its
    /// value never changes.
    #[must_use]
    pub fn is_static(&self) -> bool {
        match self {
            Self::Number(_) | Self::Boolean(_) | Self::Text(_) => true,
            Self::Signal(_) | Self::Window { .. } | Self::CustomFunction { .. } => false,
            Self::Comparison { left, right, .. }
            | Self::Logical { left, right, .. }
            | Self::Arithmetic { left, right, .. } => left.is_static() && right.is_static(),
            Self::Not(inner) | Self::IsNull(inner) => inner.is_static(),
        }
    }

    /// Signal ids referenced by the tree.
    #[must_use]
    pub fn referenced_signals(&self) -> HashSet<SignalId> {
        let mut ids = HashSet::new();
        self.for_each_signal(&mut |id| {
            ids.insert(id);
        });
        ids
    }
}

/// Literal `true`, used to materialize time-based campaigns as condition
/// trees that fire on every evaluation pass.
#[must_use]
pub fn always_true() -> ConditionNode {
    ConditionNode::Boolean(true)
}

/// How a condition-based campaign decides when `true` means "fire".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Fire on every `true` evaluation (rate limit permitting).
    Always,
    /// Fire only on the transition from not-`true` to `true`.
    RisingEdge,
}

/// What triggers a campaign.
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignTrigger {
    /// Fire every `period_ms`, regardless of signal values.
    TimeBased { period_ms: u32 },
    /// Fire when the condition tree evaluates to boolean `true`.
    ConditionBased {
        condition: Arc<ConditionNode>,
        min_interval_ms: u32,
        mode: TriggerMode,
    },
}

/// Buffering requirements for one signal a campaign wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRequirement {
    pub signal_id: SignalId,
    /// Ring buffer depth: the last N samples snapshotted on a trigger.
    pub sample_buffer_size: u32,
    /// Samples arriving faster than this are subsampled away. Zero keeps
    /// every sample.
    pub minimum_sample_period_ms: u32,
    /// Fixed aggregation window size; zero disables window functions.
    pub fixed_window_period_ms: u32,
    /// The signal feeds condition evaluation only and is never uploaded.
    pub condition_only: bool,
}

/// One cloud-issued data collection campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct Campaign {
    pub sync_id: SyncId,
    /// Manifest this campaign's signal ids refer to. The campaign cannot
    /// activate while a different manifest is active.
    pub decoder_manifest_sync_id: SyncId,
    /// Activation time, epoch milliseconds.
    pub start_time_ms: Timestamp,
    /// Deactivation time, epoch milliseconds.
    pub expiry_time_ms: Timestamp,
    pub trigger: CampaignTrigger,
    /// Delay between trigger and snapshot, letting buffers fill with
    /// post-trigger data.
    pub after_duration_ms: u32,
    pub signal_requirements: Vec<SignalRequirement>,
    pub include_active_dtcs: bool,
    /// Lower number takes precedence on concurrent triggers.
    pub priority: u32,
    /// Persist triggered payloads locally while the transport is down.
    pub persist_on_disconnect: bool,
    pub compress: bool,
}

/// Why a campaign was rejected during validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CampaignError {
    /// The condition tree is deeper than [`MAX_CONDITION_DEPTH`].
    #[error("condition tree depth {depth} exceeds limit {limit}")]
    TreeDepthExceeded { depth: usize, limit: usize },

    /// The condition tree does not type-check against the manifest.
    #[error("condition type check failed: {reason}")]
    TypecheckFailed { reason: String },
}

impl Campaign {
    /// The condition tree, if this campaign is condition based.
    #[must_use]
    pub fn condition(&self) -> Option<&Arc<ConditionNode>> {
        match &self.trigger {
            CampaignTrigger::ConditionBased { condition, .. } => Some(condition),
            CampaignTrigger::TimeBased { .. } => None,
        }
    }

    /// All signal ids this campaign touches: requirements plus condition
    /// references.
    #[must_use]
    pub fn required_signals(&self) -> HashSet<SignalId> {
        let mut ids: HashSet<SignalId> = self
            .signal_requirements
            .iter()
            .map(|r| r.signal_id)
            .collect();
        if let Some(condition) = self.condition() {
            condition.for_each_signal(&mut |id| {
                ids.insert(id);
            });
        }
        ids
    }

    /// Validate the condition tree against the active manifest.
    ///
    /// # Errors
    ///
    /// [`CampaignError::TreeDepthExceeded`] when the tree is too deep;
    /// [`CampaignError::TypecheckFailed`] when a referenced signal is
    /// missing from the manifest or a complex-typed signal is used where a
    /// numeric value is required.
    pub fn type_check(&self, manifest: &DecoderManifest) -> Result<(), CampaignError> {
        let Some(condition) = self.condition() else {
            return Ok(());
        };
        let depth = condition.depth();
        if depth > MAX_CONDITION_DEPTH {
            return Err(CampaignError::TreeDepthExceeded {
                depth,
                limit: MAX_CONDITION_DEPTH,
            });
        }
        check_node(condition, manifest, NodeContext::Numeric)
    }
}

/// Position a node appears in, for type checking.
#[derive(Clone, Copy, PartialEq)]
enum NodeContext {
    /// The node's value feeds a numeric or boolean operator.
    Numeric,
    /// The node is a custom-function argument; complex signals allowed.
    FunctionArg,
}

fn check_node(
    node: &ConditionNode,
    manifest: &DecoderManifest,
    context: NodeContext,
) -> Result<(), CampaignError> {
    match node {
        ConditionNode::Number(_) | ConditionNode::Boolean(_) => Ok(()),
        ConditionNode::Text(_) => {
            if context == NodeContext::Numeric {
                return Err(CampaignError::TypecheckFailed {
                    reason: "string literal used as a number".into(),
                });
            }
            Ok(())
        }
        ConditionNode::Signal(id) | ConditionNode::Window { signal_id: id, .. } => {
            let Some(signal_type) = manifest.signal_type(*id) else {
                return Err(CampaignError::TypecheckFailed {
                    reason: format!("signal {id} not in decoder manifest"),
                });
            };
            if context == NodeContext::Numeric && !signal_type.is_numeric() {
                return Err(CampaignError::TypecheckFailed {
                    reason: format!("signal {id} of type {signal_type} used as a number"),
                });
            }
            Ok(())
        }
        ConditionNode::Comparison { left, right, .. }
        | ConditionNode::Logical { left, right, .. }
        | ConditionNode::Arithmetic { left, right, .. } => {
            check_node(left, manifest, NodeContext::Numeric)?;
            check_node(right, manifest, NodeContext::Numeric)
        }
        ConditionNode::Not(inner) => check_node(inner, manifest, NodeContext::Numeric),
        ConditionNode::IsNull(inner) => check_node(inner, manifest, NodeContext::FunctionArg),
        ConditionNode::CustomFunction { args, .. } => {
            for arg in args {
                check_node(arg, manifest, NodeContext::FunctionArg)?;
            }
            Ok(())
        }
    }
}

/// Set of campaigns received in one CollectionSchemes document, all tied
/// to the same decoder manifest generation.
#[derive(Debug, Clone, Default)]
pub struct CampaignList {
    pub campaigns: Vec<Arc<Campaign>>,
}

impl CampaignList {
    #[must_use]
    pub fn sync_ids(&self) -> HashSet<SyncId> {
        self.campaigns.iter().map(|c| c.sync_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{CustomSignalDecoding, SignalDecoding, SignalSource};
    use crate::types::SignalType;

    fn manifest_with(signals: &[(SignalId, SignalType)]) -> DecoderManifest {
        let signals = signals
            .iter()
            .map(|&(id, signal_type)| {
                (
                    id,
                    SignalDecoding {
                        source: SignalSource::Custom {
                            decoding: CustomSignalDecoding {
                                signal_id: id,
                                name: format!("Signal.{id}"),
                                signal_type,
                            },
                        },
                        signal_type,
                    },
                )
            })
            .collect();
        DecoderManifest {
            sync_id: "dm-1".into(),
            signals,
        }
    }

    fn condition_campaign(condition: ConditionNode) -> Campaign {
        Campaign {
            sync_id: "c-1".into(),
            decoder_manifest_sync_id: "dm-1".into(),
            start_time_ms: 0,
            expiry_time_ms: u64::MAX,
            trigger: CampaignTrigger::ConditionBased {
                condition: Arc::new(condition),
                min_interval_ms: 0,
                mode: TriggerMode::Always,
            },
            after_duration_ms: 0,
            signal_requirements: Vec::new(),
            include_active_dtcs: false,
            priority: 0,
            persist_on_disconnect: false,
            compress: false,
        }
    }

    fn gt(signal: SignalId, threshold: f64) -> ConditionNode {
        ConditionNode::Comparison {
            op: ComparisonOp::Greater,
            left: Box::new(ConditionNode::Signal(signal)),
            right: Box::new(ConditionNode::Number(threshold)),
        }
    }

    #[test]
    fn depth_counts_the_longest_path() {
        let tree = ConditionNode::Logical {
            op: LogicalOp::And,
            left: Box::new(gt(1, 0.0)),
            right: Box::new(ConditionNode::Boolean(true)),
        };
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn type_check_rejects_unknown_signal() {
        let manifest = manifest_with(&[(1, SignalType::Float64)]);
        let campaign = condition_campaign(gt(99, 0.0));
        assert!(matches!(
            campaign.type_check(&manifest),
            Err(CampaignError::TypecheckFailed { .. })
        ));
    }

    #[test]
    fn type_check_rejects_complex_signal_in_numeric_position() {
        let manifest = manifest_with(&[(1, SignalType::String)]);
        let campaign = condition_campaign(gt(1, 0.0));
        assert!(matches!(
            campaign.type_check(&manifest),
            Err(CampaignError::TypecheckFailed { .. })
        ));
    }

    #[test]
    fn type_check_allows_complex_signal_as_function_arg() {
        let manifest = manifest_with(&[(1, SignalType::String)]);
        let campaign = condition_campaign(ConditionNode::CustomFunction {
            name: "present".into(),
            invocation_id: 1,
            args: vec![ConditionNode::Signal(1)],
        });
        assert!(campaign.type_check(&manifest).is_ok());
    }

    #[test]
    fn type_check_rejects_overdeep_tree() {
        let manifest = manifest_with(&[(1, SignalType::Float64)]);
        let mut tree = gt(1, 0.0);
        for _ in 0..MAX_CONDITION_DEPTH {
            tree = ConditionNode::Not(Box::new(tree));
        }
        let campaign = condition_campaign(tree);
        assert!(matches!(
            campaign.type_check(&manifest),
            Err(CampaignError::TreeDepthExceeded { .. })
        ));
    }

    #[test]
    fn required_signals_unions_requirements_and_condition() {
        let mut campaign = condition_campaign(gt(1, 0.0));
        campaign.signal_requirements.push(SignalRequirement {
            signal_id: 2,
            sample_buffer_size: 10,
            minimum_sample_period_ms: 0,
            fixed_window_period_ms: 0,
            condition_only: false,
        });
        let ids = campaign.required_signals();
        assert!(ids.contains(&1));
        assert!(ids.contains(&2));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn static_trees_are_detected() {
        assert!(always_true().is_static());
        assert!(!gt(1, 0.0).is_static());
    }
}
