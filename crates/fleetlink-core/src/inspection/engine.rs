//! Condition evaluation over buffered signal history.
//!
//! The engine is single-threaded by design: it is owned by the inspection
//! worker task and all ring-buffer state is task-local, so the hot path
//! takes no locks. Callers feed it samples, ask it to evaluate all due
//! conditions, then drain triggered data bundles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::campaign::{ConditionNode, InvocationId, TriggerMode, WindowFunction};
use crate::rawdata::{BufferManager, BufferStage};
use crate::types::{
    DtcInfo, EventId, SignalFrame, SignalId, SignalSample, SignalValue, TimePoint, Timestamp,
    TriggeredData,
};

use super::custom::CustomFunctionRegistry;
use super::value::{self, InspectionValue};
use super::{ConditionSet, ConditionWithData, InspectionMatrix, MAX_ACTIVE_CAMPAIGNS};

/// Failure local to one expression evaluation. Never propagates beyond
/// the expression: the engine folds it into `Undefined` and continues.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExpressionError {
    /// Referenced signal has no buffer in the current matrix.
    #[error("signal not found")]
    SignalNotFound,

    /// The fixed window has not produced a completed window yet.
    #[error("window data not available")]
    WindowDataNotAvailable,

    /// Recursion limit reached while walking the tree.
    #[error("expression depth limit reached")]
    DepthExceeded,

    /// Argument type or arity mismatch.
    #[error("type mismatch")]
    TypeMismatch,

    /// No custom function registered under the referenced name.
    #[error("unknown custom function")]
    UnknownFunction,
}

/// Evaluation recursion limit, one above the campaign-level tree depth
/// limit so a maximal valid tree still evaluates.
const MAX_EVAL_DEPTH: usize = crate::campaign::MAX_CONDITION_DEPTH + 1;

/// Aggregates of one completed fixed window.
#[derive(Debug, Clone, Copy, Default)]
struct WindowStats {
    min: f64,
    max: f64,
    avg: f64,
    available: bool,
}

/// Min/max/avg over consecutive wall-clock windows of fixed size.
///
/// Maintained online; the last two completed windows are retained.
#[derive(Debug)]
struct FixedWindow {
    window_size_ms: u64,
    /// End of the last completed window; zero until the first sample.
    last_rollover_ms: Timestamp,
    last: WindowStats,
    prev: WindowStats,
    collecting_min: f64,
    collecting_max: f64,
    collecting_sum: f64,
    collecting_count: u32,
}

impl FixedWindow {
    fn new(window_size_ms: u64) -> Self {
        Self {
            window_size_ms,
            last_rollover_ms: 0,
            last: WindowStats::default(),
            prev: WindowStats::default(),
            collecting_min: f64::INFINITY,
            collecting_max: f64::NEG_INFINITY,
            collecting_sum: 0.0,
            collecting_count: 0,
        }
    }

    fn collecting_stats(&self) -> WindowStats {
        WindowStats {
            min: self.collecting_min,
            max: self.collecting_max,
            avg: self.collecting_sum / f64::from(self.collecting_count.max(1)),
            available: self.collecting_count > 0,
        }
    }

    fn reset_collecting(&mut self, timestamp_ms: Timestamp) {
        self.collecting_min = f64::INFINITY;
        self.collecting_max = f64::NEG_INFINITY;
        self.collecting_sum = 0.0;
        self.collecting_count = 0;
        // Snap the window start onto the fixed grid.
        self.last_rollover_ms +=
            (timestamp_ms - self.last_rollover_ms) / self.window_size_ms * self.window_size_ms;
    }

    /// Roll completed windows forward. Returns `true` when the retained
    /// stats changed.
    fn update(&mut self, timestamp_ms: Timestamp) -> bool {
        if self.last_rollover_ms == 0 {
            self.last_rollover_ms = timestamp_ms;
            self.reset_collecting(timestamp_ms);
            return true;
        }
        if timestamp_ms >= self.last_rollover_ms + 2 * self.window_size_ms {
            // At least one whole window passed without a rollover: the
            // collected samples belong to a window older than "last".
            self.prev = self.collecting_stats();
            self.last = WindowStats::default();
            self.reset_collecting(timestamp_ms);
            true
        } else if timestamp_ms >= self.last_rollover_ms + self.window_size_ms {
            self.prev = self.last;
            self.last = self.collecting_stats();
            self.reset_collecting(timestamp_ms);
            true
        } else {
            false
        }
    }

    fn add_value(&mut self, value: f64, timestamp_ms: Timestamp) -> bool {
        let rolled = self.update(timestamp_ms);
        self.collecting_min = self.collecting_min.min(value);
        self.collecting_max = self.collecting_max.max(value);
        self.collecting_sum += value;
        self.collecting_count += 1;
        rolled
    }

    /// Next instant at which [`FixedWindow::update`] will roll.
    fn next_rollover_ms(&self) -> Option<Timestamp> {
        (self.last_rollover_ms > 0).then(|| self.last_rollover_ms + self.window_size_ms)
    }

    fn stats(&self, function: WindowFunction) -> Result<f64, ExpressionError> {
        let (stats, pick) = match function {
            WindowFunction::LastMin | WindowFunction::LastMax | WindowFunction::LastAvg => {
                (&self.last, function)
            }
            WindowFunction::PrevLastMin
            | WindowFunction::PrevLastMax
            | WindowFunction::PrevLastAvg => (&self.prev, function),
        };
        if !stats.available {
            return Err(ExpressionError::WindowDataNotAvailable);
        }
        Ok(match pick {
            WindowFunction::LastMin | WindowFunction::PrevLastMin => stats.min,
            WindowFunction::LastMax | WindowFunction::PrevLastMax => stats.max,
            WindowFunction::LastAvg | WindowFunction::PrevLastAvg => stats.avg,
        })
    }
}

#[derive(Debug, Clone)]
struct BufferedSample {
    value: SignalValue,
    timestamp_ms: Timestamp,
    /// Conditions that already published this sample.
    consumed: ConditionSet,
}

/// Ring buffer of the newest samples of one signal at one subsampling
/// rate.
#[derive(Debug)]
struct SignalHistoryBuffer {
    min_sample_interval_ms: u32,
    capacity: usize,
    /// Back is newest.
    samples: VecDeque<BufferedSample>,
    last_sample_ms: Option<Timestamp>,
    windows: Vec<FixedWindow>,
    /// Conditions to re-evaluate when this buffer changes.
    conditions: ConditionSet,
}

impl SignalHistoryBuffer {
    fn new(min_sample_interval_ms: u32, capacity: usize) -> Self {
        Self {
            min_sample_interval_ms,
            capacity: capacity.max(1),
            samples: VecDeque::new(),
            last_sample_ms: None,
            windows: Vec::new(),
            conditions: ConditionSet::new(),
        }
    }

    fn ensure_window(&mut self, window_size_ms: u32) {
        if window_size_ms == 0 {
            return;
        }
        let size = u64::from(window_size_ms);
        if !self.windows.iter().any(|w| w.window_size_ms == size) {
            self.windows.push(FixedWindow::new(size));
        }
    }

    fn window(&self, window_size_ms: u32) -> Option<&FixedWindow> {
        let size = u64::from(window_size_ms);
        self.windows.iter().find(|w| w.window_size_ms == size)
    }

    fn latest(&self) -> Option<&BufferedSample> {
        self.samples.back()
    }
}

/// A fire that happened but whose snapshot is still waiting for
/// `after_duration_ms` of post-trigger data.
#[derive(Debug, Clone, Copy)]
struct PendingSnapshot {
    snapshot_at_monotonic_ms: Timestamp,
    trigger_time_ms: Timestamp,
}

/// Per-condition evaluation state.
struct ActiveCondition {
    info: ConditionWithData,
    /// Buffer index per signal, into the signal's buffer list.
    buffer_refs: HashMap<SignalId, usize>,
    /// Whether the tree calls any custom function; gates the per-pass
    /// `condition_end` hook.
    uses_custom_functions: bool,
    last_trigger_monotonic_ms: Option<Timestamp>,
    pending: Option<PendingSnapshot>,
    /// Whether the last evaluation produced the boolean `true`.
    was_true: bool,
    dtcs_consumed: bool,
}

impl ActiveCondition {
    /// Signals this condition uploads (non-condition-only requirements).
    fn collected_signal_ids(&self) -> HashSet<SignalId> {
        self.info
            .signals
            .iter()
            .filter(|s| !s.condition_only)
            .map(|s| s.signal_id)
            .collect()
    }
}

/// The collection and inspection engine.
pub struct InspectionEngine {
    raw_data: Option<Arc<BufferManager>>,
    custom_functions: CustomFunctionRegistry,
    /// If set, a buffered sample is published at most once per condition.
    send_data_only_once_per_condition: bool,

    conditions: Vec<ActiveCondition>,
    signal_buffers: HashMap<SignalId, Vec<SignalHistoryBuffer>>,
    /// Conditions whose input signals changed since their last
    /// evaluation.
    conditions_with_input_changed: ConditionSet,
    /// Triggered bundles ready to be drained.
    ready: VecDeque<TriggeredData>,
    active_dtcs: Option<DtcInfo>,
    /// Invocation ids of the current matrix, for cleanup diffing.
    known_invocations: HashSet<InvocationId>,
    event_counter: u8,
}

impl InspectionEngine {
    #[must_use]
    pub fn new(
        raw_data: Option<Arc<BufferManager>>,
        custom_functions: CustomFunctionRegistry,
    ) -> Self {
        Self {
            raw_data,
            custom_functions,
            send_data_only_once_per_condition: true,
            conditions: Vec::new(),
            signal_buffers: HashMap::new(),
            conditions_with_input_changed: ConditionSet::new(),
            ready: VecDeque::new(),
            active_dtcs: None,
            known_invocations: HashSet::new(),
            event_counter: 0,
        }
    }

    /// Allow re-publishing buffered samples on every trigger.
    pub fn set_send_data_only_once_per_condition(&mut self, enabled: bool) {
        self.send_data_only_once_per_condition = enabled;
    }

    /// Adopt a new inspection matrix.
    ///
    /// All buffered history that was not yet published is discarded;
    /// custom-function state of removed call sites is cleaned up.
    pub fn apply_matrix(&mut self, matrix: &Arc<InspectionMatrix>) {
        let mut new_invocations = HashSet::new();
        for condition in &matrix.conditions {
            condition.condition.for_each_invocation(&mut |id| {
                new_invocations.insert(id);
            });
        }
        for stale in self.known_invocations.difference(&new_invocations) {
            self.custom_functions.cleanup(*stale);
        }
        self.known_invocations = new_invocations;

        self.release_history_hints();
        self.conditions.clear();
        self.signal_buffers.clear();
        self.conditions_with_input_changed.clear_all();
        self.ready.clear();

        if matrix.conditions.len() > MAX_ACTIVE_CAMPAIGNS {
            warn!(
                count = matrix.conditions.len(),
                limit = MAX_ACTIVE_CAMPAIGNS,
                "too many active conditions, ignoring the excess"
            );
        }
        for (index, info) in matrix
            .conditions
            .iter()
            .take(MAX_ACTIVE_CAMPAIGNS)
            .enumerate()
        {
            let mut buffer_refs = HashMap::new();
            for signal in &info.signals {
                let buffers = self.signal_buffers.entry(signal.signal_id).or_default();
                let buffer_index = match buffers
                    .iter()
                    .position(|b| b.min_sample_interval_ms == signal.minimum_sample_interval_ms)
                {
                    Some(existing) => {
                        buffers[existing].capacity =
                            buffers[existing].capacity.max(signal.sample_buffer_size);
                        existing
                    }
                    None => {
                        buffers.push(SignalHistoryBuffer::new(
                            signal.minimum_sample_interval_ms,
                            signal.sample_buffer_size,
                        ));
                        buffers.len() - 1
                    }
                };
                let buffer = &mut buffers[buffer_index];
                buffer.ensure_window(signal.fixed_window_period_ms);
                buffer.conditions.set(index);
                buffer_refs.insert(signal.signal_id, buffer_index);
            }
            let mut uses_custom_functions = false;
            info.condition.for_each_invocation(&mut |_| {
                uses_custom_functions = true;
            });
            self.conditions.push(ActiveCondition {
                info: info.clone(),
                buffer_refs,
                uses_custom_functions,
                last_trigger_monotonic_ms: None,
                pending: None,
                was_true: false,
                dtcs_consumed: false,
            });
        }
        debug!(conditions = self.conditions.len(), "inspection matrix applied");
    }

    /// Feed one pipeline frame into the buffers.
    pub fn ingest_frame(&mut self, frame: &SignalFrame) {
        for sample in &frame.samples {
            self.add_sample(sample);
        }
        if let Some(dtcs) = &frame.active_dtcs {
            self.active_dtcs = Some(dtcs.clone());
            for condition in &mut self.conditions {
                condition.dtcs_consumed = false;
            }
        }
    }

    fn add_sample(&mut self, sample: &SignalSample) {
        let Some(buffers) = self.signal_buffers.get_mut(&sample.signal_id) else {
            // Not needed by any active condition.
            return;
        };
        for buffer in buffers.iter_mut() {
            let due = match buffer.last_sample_ms {
                _ if buffer.min_sample_interval_ms == 0 => true,
                None => true,
                Some(last) => {
                    sample.timestamp_ms >= last + u64::from(buffer.min_sample_interval_ms)
                }
            };
            if !due {
                continue;
            }
            if buffer.samples.len() >= buffer.capacity {
                if let Some(evicted) = buffer.samples.pop_front() {
                    release_raw_hint(self.raw_data.as_ref(), sample.signal_id, &evicted.value);
                }
            }
            if let SignalValue::RawData { handle } = sample.value {
                if let Some(raw_data) = &self.raw_data {
                    raw_data.increase_usage_hint(
                        sample.signal_id,
                        handle,
                        BufferStage::HistoryBuffer,
                    );
                }
            }
            buffer.samples.push_back(BufferedSample {
                value: sample.value,
                timestamp_ms: sample.timestamp_ms,
                consumed: ConditionSet::new(),
            });
            buffer.last_sample_ms = Some(sample.timestamp_ms);
            if let Some(number) = sample.value.as_f64() {
                for window in &mut buffer.windows {
                    window.add_value(number, sample.timestamp_ms);
                }
            }
            self.conditions_with_input_changed
                .union_with(&buffer.conditions);
        }
    }

    /// Roll fixed windows that completed without new samples.
    fn update_windows(&mut self, now_ms: Timestamp) {
        for buffers in self.signal_buffers.values_mut() {
            for buffer in buffers.iter_mut() {
                for window in &mut buffer.windows {
                    if window.update(now_ms) {
                        self.conditions_with_input_changed
                            .union_with(&buffer.conditions);
                    }
                }
            }
        }
    }

    /// Evaluate every condition that is due at `now`.
    ///
    /// Returns `true` when at least one condition fired.
    pub fn evaluate_conditions(&mut self, now: TimePoint) -> bool {
        self.update_windows(now.system_time_ms);
        let mut any_fired = false;

        for index in 0..self.conditions.len() {
            // A condition whose snapshot is still pending is not
            // re-evaluated; its buffers keep filling meanwhile.
            if self.conditions[index].pending.is_some() {
                continue;
            }
            let due = self.conditions[index].info.always_evaluate
                || self.conditions_with_input_changed.test(index);
            if !due {
                continue;
            }
            let interval = u64::from(self.conditions[index].info.min_interval_ms);
            if interval > 0 {
                if let Some(last) = self.conditions[index].last_trigger_monotonic_ms {
                    if now.monotonic_time_ms < last + interval {
                        // Rate limited; leave the change flag set so the
                        // condition is revisited once the interval is over.
                        continue;
                    }
                }
            }

            self.conditions_with_input_changed.clear(index);

            let result = {
                let Self {
                    signal_buffers,
                    custom_functions,
                    conditions,
                    ..
                } = self;
                let condition = &conditions[index];
                evaluate_node(
                    &condition.info.condition,
                    condition,
                    signal_buffers,
                    custom_functions,
                    MAX_EVAL_DEPTH,
                )
            };
            let value = match result {
                Ok(value) => value,
                Err(error) => {
                    trace!(condition = index, %error, "expression fault");
                    InspectionValue::Undefined
                }
            };
            let satisfied = value.is_satisfied();
            let fired = match self.conditions[index].info.trigger_mode {
                TriggerMode::Always => satisfied,
                TriggerMode::RisingEdge => satisfied && !self.conditions[index].was_true,
            };
            self.conditions[index].was_true = satisfied;

            if fired {
                any_fired = true;
                self.conditions[index].last_trigger_monotonic_ms = Some(now.monotonic_time_ms);
                let after = u64::from(self.conditions[index].info.after_duration_ms);
                self.conditions[index].pending = Some(PendingSnapshot {
                    snapshot_at_monotonic_ms: now.monotonic_time_ms + after,
                    trigger_time_ms: now.system_time_ms,
                });
                if after == 0 {
                    // Snapshot immediately so the custom-function state of
                    // this pass ends up in this bundle.
                    if let Some(data) = self.snapshot_condition(index) {
                        self.ready.push_back(data);
                    }
                }
            } else if self.conditions[index].uses_custom_functions {
                // Flush per-pass custom-function state.
                let collected = self.conditions[index].collected_signal_ids();
                self.custom_functions
                    .condition_end(&collected, now.system_time_ms, None);
            }
        }
        any_fired
    }

    /// Next triggered bundle whose snapshot time has arrived, in
    /// (priority, sync id) order.
    pub fn collect_next_data(&mut self, now: TimePoint) -> Option<TriggeredData> {
        if let Some(ready) = self.ready.pop_front() {
            return Some(ready);
        }
        let due = (0..self.conditions.len()).find(|&index| {
            self.conditions[index]
                .pending
                .is_some_and(|p| p.snapshot_at_monotonic_ms <= now.monotonic_time_ms)
        })?;
        self.snapshot_condition(due)
    }

    /// Milliseconds until the engine next needs a timed wake-up: a pending
    /// snapshot, a rate-limited periodic campaign, or a window rollover.
    #[must_use]
    pub fn next_wait_ms(&self, now: TimePoint) -> u64 {
        let mut wait = u64::MAX;
        for (index, condition) in self.conditions.iter().enumerate() {
            if let Some(pending) = condition.pending {
                wait = wait.min(
                    pending
                        .snapshot_at_monotonic_ms
                        .saturating_sub(now.monotonic_time_ms),
                );
                continue;
            }
            let due = condition.info.always_evaluate
                || self.conditions_with_input_changed.test(index);
            if !due {
                continue;
            }
            let interval = u64::from(condition.info.min_interval_ms);
            let next = condition
                .last_trigger_monotonic_ms
                .map_or(0, |last| last + interval);
            wait = wait.min(next.saturating_sub(now.monotonic_time_ms));
        }
        for buffers in self.signal_buffers.values() {
            for buffer in buffers {
                for window in &buffer.windows {
                    if let Some(rollover) = window.next_rollover_ms() {
                        wait = wait.min(rollover.saturating_sub(now.system_time_ms));
                    }
                }
            }
        }
        wait
    }

    /// Assemble the triggered bundle for `index` and clear its pending
    /// state.
    fn snapshot_condition(&mut self, index: usize) -> Option<TriggeredData> {
        let pending = self.conditions[index].pending.take()?;
        let trigger_time_ms = pending.trigger_time_ms;
        let event_id = self.generate_event_id(trigger_time_ms);
        let send_once = self.send_data_only_once_per_condition;

        let mut signals = Vec::new();
        let condition = &mut self.conditions[index];
        for info in &condition.info.signals {
            if info.condition_only {
                continue;
            }
            let Some(&buffer_index) = condition.buffer_refs.get(&info.signal_id) else {
                continue;
            };
            let Some(buffer) = self
                .signal_buffers
                .get_mut(&info.signal_id)
                .and_then(|b| b.get_mut(buffer_index))
            else {
                continue;
            };
            let mut collected = 0usize;
            for sample in buffer.samples.iter_mut().rev() {
                if collected >= info.sample_buffer_size {
                    break;
                }
                if send_once && sample.consumed.test(index) {
                    continue;
                }
                if let SignalValue::RawData { handle } = sample.value {
                    let borrowable = self
                        .raw_data
                        .as_ref()
                        .is_some_and(|r| r.is_borrowable(info.signal_id, handle));
                    if !borrowable {
                        // The payload was evicted; nothing to upload.
                        continue;
                    }
                    if let Some(raw_data) = &self.raw_data {
                        raw_data.increase_usage_hint(
                            info.signal_id,
                            handle,
                            BufferStage::SelectedForUpload,
                        );
                    }
                }
                sample.consumed.set(index);
                signals.push(SignalSample {
                    signal_id: info.signal_id,
                    timestamp_ms: sample.timestamp_ms,
                    value: sample.value,
                });
                collected += 1;
            }
        }

        let active_dtcs = if condition.info.include_active_dtcs
            && !(send_once && condition.dtcs_consumed)
        {
            condition.dtcs_consumed = true;
            self.active_dtcs.clone()
        } else {
            None
        };

        let mut data = TriggeredData {
            metadata: condition.info.metadata.clone(),
            event_id,
            trigger_time_ms,
            signals,
            active_dtcs,
        };
        if condition.uses_custom_functions {
            let collected_ids = condition.collected_signal_ids();
            self.custom_functions
                .condition_end(&collected_ids, trigger_time_ms, Some(&mut data));
        }
        debug!(
            campaign = %data.metadata.campaign_sync_id,
            event_id,
            signals = data.signals.len(),
            "campaign triggered"
        );
        Some(data)
    }

    fn generate_event_id(&mut self, timestamp_ms: Timestamp) -> EventId {
        self.event_counter = self.event_counter.wrapping_add(1);
        (((timestamp_ms & 0xFF_FFFF) as u32) << 8) | u32::from(self.event_counter)
    }

    /// Latest known DTC snapshot.
    #[must_use]
    pub fn active_dtcs(&self) -> Option<&DtcInfo> {
        self.active_dtcs.as_ref()
    }

    fn release_history_hints(&mut self) {
        let Some(raw_data) = &self.raw_data else {
            return;
        };
        for (signal_id, buffers) in &self.signal_buffers {
            for buffer in buffers {
                for sample in &buffer.samples {
                    if let SignalValue::RawData { handle } = sample.value {
                        raw_data.decrease_usage_hint(*signal_id, handle, BufferStage::HistoryBuffer);
                    }
                }
            }
        }
    }
}

fn release_raw_hint(
    raw_data: Option<&Arc<BufferManager>>,
    signal_id: SignalId,
    value: &SignalValue,
) {
    if let (Some(raw_data), SignalValue::RawData { handle }) = (raw_data, value) {
        raw_data.decrease_usage_hint(signal_id, *handle, BufferStage::HistoryBuffer);
    }
}

/// Strict left-to-right evaluation of one tree node.
fn evaluate_node(
    node: &ConditionNode,
    condition: &ActiveCondition,
    signal_buffers: &HashMap<SignalId, Vec<SignalHistoryBuffer>>,
    custom_functions: &mut CustomFunctionRegistry,
    remaining_depth: usize,
) -> Result<InspectionValue, ExpressionError> {
    if remaining_depth == 0 {
        return Err(ExpressionError::DepthExceeded);
    }
    let next_depth = remaining_depth - 1;
    match node {
        ConditionNode::Number(v) => Ok(InspectionValue::Number(*v)),
        ConditionNode::Boolean(v) => Ok(InspectionValue::Bool(*v)),
        ConditionNode::Text(v) => Ok(InspectionValue::Text(v.as_str().into())),
        ConditionNode::Signal(signal_id) => {
            Ok(latest_signal_value(*signal_id, condition, signal_buffers))
        }
        ConditionNode::Window {
            function,
            signal_id,
        } => {
            let window_period = condition
                .info
                .signals
                .iter()
                .find(|s| s.signal_id == *signal_id)
                .map(|s| s.fixed_window_period_ms)
                .unwrap_or(0);
            if window_period == 0 {
                return Ok(InspectionValue::Undefined);
            }
            let stats = condition
                .buffer_refs
                .get(signal_id)
                .and_then(|&i| signal_buffers.get(signal_id).and_then(|b| b.get(i)))
                .and_then(|buffer| buffer.window(window_period))
                .map(|window| window.stats(*function));
            match stats {
                Some(Ok(value)) => Ok(InspectionValue::Number(value)),
                // Window exists but has no completed data yet, or the
                // buffer vanished: both are just "no value".
                Some(Err(_)) | None => Ok(InspectionValue::Undefined),
            }
        }
        ConditionNode::Comparison { op, left, right } => {
            let l = evaluate_node(left, condition, signal_buffers, custom_functions, next_depth)?;
            let r = evaluate_node(right, condition, signal_buffers, custom_functions, next_depth)?;
            Ok(value::compare(*op, &l, &r))
        }
        ConditionNode::Logical { op, left, right } => {
            let l = evaluate_node(left, condition, signal_buffers, custom_functions, next_depth)?;
            let r = evaluate_node(right, condition, signal_buffers, custom_functions, next_depth)?;
            Ok(value::combine(*op, &l, &r))
        }
        ConditionNode::Not(inner) => {
            let v = evaluate_node(inner, condition, signal_buffers, custom_functions, next_depth)?;
            Ok(value::negate(&v))
        }
        ConditionNode::Arithmetic { op, left, right } => {
            let l = evaluate_node(left, condition, signal_buffers, custom_functions, next_depth)?;
            let r = evaluate_node(right, condition, signal_buffers, custom_functions, next_depth)?;
            Ok(value::arithmetic(*op, &l, &r))
        }
        ConditionNode::IsNull(inner) => {
            let v = evaluate_node(inner, condition, signal_buffers, custom_functions, next_depth)?;
            Ok(InspectionValue::Bool(v.is_undefined()))
        }
        ConditionNode::CustomFunction {
            name,
            invocation_id,
            args,
        } => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(evaluate_node(
                    arg,
                    condition,
                    signal_buffers,
                    custom_functions,
                    next_depth,
                )?);
            }
            custom_functions.invoke(name, *invocation_id, &evaluated)
        }
    }
}

/// Latest buffered value of a signal from the condition's view.
fn latest_signal_value(
    signal_id: SignalId,
    condition: &ActiveCondition,
    signal_buffers: &HashMap<SignalId, Vec<SignalHistoryBuffer>>,
) -> InspectionValue {
    let sample = condition
        .buffer_refs
        .get(&signal_id)
        .and_then(|&i| signal_buffers.get(&signal_id).and_then(|b| b.get(i)))
        .and_then(SignalHistoryBuffer::latest);
    let Some(sample) = sample else {
        return InspectionValue::Undefined;
    };
    match sample.value.as_f64() {
        Some(number) => InspectionValue::Number(number),
        // Complex payloads have no scalar view in expressions.
        None => InspectionValue::Undefined,
    }
}
