//! Hook for externally registered functions an AST can invoke mid-expression.

use condition_ast::{CustomFunctionId, ErrorKind, InvocationId, Value};
use signal::SignalId;

/// Implemented by whatever owns a condition's custom-function instances.
/// `invoke` participates in evaluation; `condition_end` and `cleanup` are
/// lifecycle notifications the evaluator itself has no reason to call mid-
/// expression.
pub trait CustomFunctionRegistry {
    /// Evaluates one invocation of `function_id`, returning the value that
    /// takes its place in the enclosing expression.
    fn invoke(&mut self, function_id: CustomFunctionId, invocation_id: InvocationId, args: &[Value]) -> Result<Value, ErrorKind>;

    /// Called once after a condition has finished evaluating, with every
    /// signal id the evaluation touched, so a function can append output to
    /// the condition's eventual snapshot.
    fn condition_end(&mut self, touched_signal_ids: &[SignalId], now_ms: u64);

    /// Called when an invocation id will never be evaluated again.
    fn cleanup(&mut self, invocation_id: InvocationId);
}

/// A registry with nothing registered; every invocation fails with
/// `NOT_IMPLEMENTED_FUNCTION`, matching the evaluator's contract for an
/// unbound custom function.
#[derive(Debug, Default)]
pub struct NoCustomFunctions;

impl CustomFunctionRegistry for NoCustomFunctions {
    fn invoke(&mut self, _function_id: CustomFunctionId, _invocation_id: InvocationId, _args: &[Value]) -> Result<Value, ErrorKind> {
        Err(ErrorKind::NotImplementedFunction)
    }

    fn condition_end(&mut self, _touched_signal_ids: &[SignalId], _now_ms: u64) {}

    fn cleanup(&mut self, _invocation_id: InvocationId) {}
}
