//! Binds the pure AST interpreter to a live ring buffer store for one
//! condition's evaluation pass.

use std::collections::HashMap;

use condition_ast::{CustomFunctionId, ErrorKind, EvalContext, InvocationId, Value};
use ring_store::{RingBufferStore, SignalLookup};
use signal::SignalId;

use crate::custom_function::CustomFunctionRegistry;

/// `EvalContext` for a single condition's evaluation: resolves a bare
/// `SignalId` to the `(signal_id, interval)` ring buffer key the condition
/// actually bound, records which signals were touched (for
/// `condition_end`), and forwards custom-function calls to the registry.
pub(crate) struct EngineEvalContext<'a, F> {
    pub(crate) store: &'a mut RingBufferStore,
    pub(crate) signal_intervals: &'a HashMap<SignalId, u32>,
    pub(crate) epsilon: f64,
    pub(crate) custom_functions: &'a mut F,
    pub(crate) touched: Vec<SignalId>,
}

impl<'a, F: CustomFunctionRegistry> EvalContext for EngineEvalContext<'a, F> {
    fn signal_newest(&mut self, signal_id: SignalId) -> Result<f64, ErrorKind> {
        let Some(&interval) = self.signal_intervals.get(&signal_id) else {
            return Err(ErrorKind::SignalNotFound);
        };
        self.touched.push(signal_id);
        match self.store.lookup_newest(signal_id, interval) {
            SignalLookup::Value(value) => Ok(value),
            SignalLookup::NoBuffer | SignalLookup::Empty => Err(ErrorKind::SignalNotFound),
            SignalLookup::NonNumeric => Err(ErrorKind::TypeMismatch),
        }
    }

    fn window_query(&mut self, signal_id: SignalId, period_ms: u32, query: ring_store::WindowQuery) -> Option<f64> {
        let interval = *self.signal_intervals.get(&signal_id)?;
        self.touched.push(signal_id);
        self.store.query_window(signal_id, interval, period_ms, query)
    }

    fn custom_function(&mut self, function_id: CustomFunctionId, invocation_id: InvocationId, args: &[Value]) -> Result<Value, ErrorKind> {
        self.custom_functions.invoke(function_id, invocation_id, args)
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }
}
