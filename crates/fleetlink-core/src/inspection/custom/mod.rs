//! Custom functions: extension points invoked from condition trees.
//!
//! A custom function sees three hooks: [`CustomFunction::invoke`] during
//! expression evaluation, [`CustomFunction::condition_end`] once per
//! evaluation pass after the tree has run (letting the function contribute
//! signals to the outgoing triggered data), and
//! [`CustomFunction::cleanup`] when a campaign using it is removed.

mod math;
mod multi_rising_edge;

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::campaign::InvocationId;
use crate::inspection::engine::ExpressionError;
use crate::inspection::value::InspectionValue;
use crate::types::{SignalId, Timestamp, TriggeredData};

pub use math::MathFunction;
pub use multi_rising_edge::{
    MultiRisingEdgeTrigger, MULTI_RISING_EDGE_FUNCTION_NAME, MULTI_RISING_EDGE_SIGNAL_NAME,
};

/// An extension function callable from condition trees.
///
/// Implementations may keep per-call-site state keyed by the invocation
/// id; the engine guarantees `cleanup` is called for every invocation id
/// of a removed campaign.
pub trait CustomFunction: Send {
    /// Evaluate the function. Returning an error makes the surrounding
    /// expression `Undefined` without touching the engine.
    fn invoke(
        &mut self,
        invocation_id: InvocationId,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, ExpressionError>;

    /// Called once per evaluation pass after the condition tree has run.
    ///
    /// `output` is `Some` when the pass triggered data collection; the
    /// function may append additional collected signals to it.
    fn condition_end(
        &mut self,
        _collected_signals: &HashSet<SignalId>,
        _timestamp_ms: Timestamp,
        _output: Option<&mut TriggeredData>,
    ) {
    }

    /// Forget any state kept for `invocation_id`.
    fn cleanup(&mut self, _invocation_id: InvocationId) {}
}

/// Dispatches custom-function calls by name.
#[derive(Default)]
pub struct CustomFunctionRegistry {
    functions: HashMap<String, Box<dyn CustomFunction>>,
}

impl CustomFunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, function: Box<dyn CustomFunction>) {
        self.functions.insert(name.into(), function);
    }

    /// Preload the stateless math helpers. Stateful functions like the
    /// multi-rising-edge trigger are registered separately by the agent
    /// wiring, which owns their dependencies.
    pub fn with_math_functions(mut self) -> Self {
        for name in MathFunction::NAMES {
            self.register(*name, Box::new(MathFunction::by_name(name)));
        }
        self
    }

    /// Invoke `name`. Unknown names evaluate to an error, which the engine
    /// folds into `Undefined`.
    pub fn invoke(
        &mut self,
        name: &str,
        invocation_id: InvocationId,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, ExpressionError> {
        match self.functions.get_mut(name) {
            Some(function) => function.invoke(invocation_id, args),
            None => {
                warn!(function = name, "unknown custom function");
                Err(ExpressionError::UnknownFunction)
            }
        }
    }

    /// Run the `condition_end` hook of every registered function.
    pub fn condition_end(
        &mut self,
        collected_signals: &HashSet<SignalId>,
        timestamp_ms: Timestamp,
        mut output: Option<&mut TriggeredData>,
    ) {
        for function in self.functions.values_mut() {
            function.condition_end(collected_signals, timestamp_ms, output.as_deref_mut());
        }
    }

    /// Tell every function to drop state for `invocation_id`.
    pub fn cleanup(&mut self, invocation_id: InvocationId) {
        for function in self.functions.values_mut() {
            function.cleanup(invocation_id);
        }
    }
}

impl std::fmt::Debug for CustomFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
