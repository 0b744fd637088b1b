//! Depth-bounded recursive evaluation of an AST node against data supplied
//! by an `EvalContext` implementation owned by the caller (the inspection
//! engine binds signals, windows and custom functions to live ring buffers).

use crate::node::{Arena, AstNode, BinaryOp, CustomFunctionId, InvocationId, NodeId, UnaryOp};
use crate::ErrorKind;

use signal::SignalId;

use ring_store::WindowQuery;

/// The maximum recursive descent depth an expression may reach before
/// evaluation aborts with `StackDepthReached`.
pub const MAX_AST_DEPTH: u32 = 10;

/// The result of evaluating any AST node: everything reduces to either a
/// number or a boolean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// A numeric result.
    Float(f64),
    /// A boolean result.
    Bool(bool),
}

impl Value {
    /// Widens this value to `f64`. A boolean maps to `1.0`/`0.0`.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Float(v) => v,
            Value::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Narrows this value to `bool`. A numeric value is truthy when
    /// non-zero.
    pub fn as_bool(self) -> bool {
        match self {
            Value::Bool(b) => b,
            Value::Float(v) => v != 0.0,
        }
    }
}

/// Supplies live data to the evaluator: the newest sample of a bound
/// signal, a fixed-time-window query, and custom-function invocation.
/// Implemented by the inspection engine, which owns the ring buffer store
/// and the custom-function registry.
pub trait EvalContext {
    /// Returns the newest sample of `signal_id` as `f64`. `Err(SignalNotFound)`
    /// when no sample has been collected yet for the evaluating condition;
    /// `Err(TypeMismatch)` when the signal's declared type has no numeric
    /// representation (e.g. a handle-kind or `Unknown` signal).
    fn signal_newest(&mut self, signal_id: SignalId) -> Result<f64, ErrorKind>;

    /// Answers a fixed-time-window query over `signal_id`'s window of
    /// `period_ms`. `None` means `FUNCTION_DATA_NOT_AVAILABLE`, whether
    /// because the window never closed or because no window of that period
    /// is bound to the signal.
    fn window_query(&mut self, signal_id: SignalId, period_ms: u32, query: WindowQuery) -> Option<f64>;

    /// Invokes a registered custom function with its already-evaluated
    /// arguments, returning the value that participates in the enclosing
    /// expression.
    fn custom_function(&mut self, function_id: CustomFunctionId, invocation_id: InvocationId, args: &[Value]) -> Result<Value, ErrorKind>;

    /// The epsilon used for floating point equality comparisons.
    fn epsilon(&self) -> f64 {
        1e-9
    }
}

/// Evaluates `node` and its sub-tree against `ctx`, descending at most
/// `remaining_depth` levels further.
pub fn eval(arena: &Arena, node: NodeId, ctx: &mut dyn EvalContext, remaining_depth: u32) -> Result<Value, ErrorKind> {
    if remaining_depth == 0 {
        return Err(ErrorKind::StackDepthReached);
    }
    let Some(node) = arena.get(node) else {
        return Err(ErrorKind::StackDepthReached);
    };

    match node {
        AstNode::Float(v) => Ok(Value::Float(*v)),
        AstNode::Boolean(v) => Ok(Value::Bool(*v)),
        AstNode::Signal(signal_id) => ctx.signal_newest(*signal_id).map(Value::Float),
        AstNode::WindowFunction(signal_id, period_ms, query) => ctx
            .window_query(*signal_id, *period_ms, *query)
            .map(Value::Float)
            .ok_or(ErrorKind::FunctionDataNotAvailable),
        AstNode::CustomFunction(function_id, invocation_id, arg_ids) => {
            let mut args = Vec::with_capacity(arg_ids.len());
            for &arg_id in arg_ids {
                args.push(eval(arena, arg_id, ctx, remaining_depth - 1)?);
            }
            ctx.custom_function(*function_id, *invocation_id, &args)
        }
        AstNode::Unary(UnaryOp::Not, operand) => {
            let value = eval(arena, *operand, ctx, remaining_depth - 1)?;
            Ok(Value::Bool(!value.as_bool()))
        }
        AstNode::Binary(op, lhs, rhs) => {
            let epsilon = ctx.epsilon();
            eval_binary(arena, *op, *lhs, *rhs, ctx, remaining_depth, epsilon)
        }
    }
}

fn eval_binary(arena: &Arena, op: BinaryOp, lhs: NodeId, rhs: NodeId, ctx: &mut dyn EvalContext, remaining_depth: u32, epsilon: f64) -> Result<Value, ErrorKind> {
    // Logical operators are not short-circuiting: both branches are always
    // evaluated so side effects (custom functions, window access) stay total.
    let lhs = eval(arena, lhs, ctx, remaining_depth - 1)?;
    let rhs = eval(arena, rhs, ctx, remaining_depth - 1)?;

    Ok(match op {
        BinaryOp::And => Value::Bool(lhs.as_bool() && rhs.as_bool()),
        BinaryOp::Or => Value::Bool(lhs.as_bool() || rhs.as_bool()),
        BinaryOp::Lt => Value::Bool(lhs.as_f64() < rhs.as_f64()),
        BinaryOp::Le => Value::Bool(lhs.as_f64() <= rhs.as_f64()),
        BinaryOp::Gt => Value::Bool(lhs.as_f64() > rhs.as_f64()),
        BinaryOp::Ge => Value::Bool(lhs.as_f64() >= rhs.as_f64()),
        BinaryOp::Eq => Value::Bool((lhs.as_f64() - rhs.as_f64()).abs() < epsilon),
        BinaryOp::Ne => Value::Bool((lhs.as_f64() - rhs.as_f64()).abs() >= epsilon),
        BinaryOp::Add => Value::Float(lhs.as_f64() + rhs.as_f64()),
        BinaryOp::Sub => Value::Float(lhs.as_f64() - rhs.as_f64()),
        BinaryOp::Mul => Value::Float(lhs.as_f64() * rhs.as_f64()),
        BinaryOp::Div => Value::Float(lhs.as_f64() / rhs.as_f64()),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeCtx {
        signals: std::collections::HashMap<SignalId, f64>,
    }

    impl EvalContext for FakeCtx {
        fn signal_newest(&mut self, signal_id: SignalId) -> Result<f64, ErrorKind> {
            self.signals.get(&signal_id).copied().ok_or(ErrorKind::SignalNotFound)
        }

        fn window_query(&mut self, _signal_id: SignalId, _period_ms: u32, _query: WindowQuery) -> Option<f64> {
            None
        }

        fn custom_function(&mut self, _function_id: CustomFunctionId, _invocation_id: InvocationId, _args: &[Value]) -> Result<Value, ErrorKind> {
            Err(ErrorKind::NotImplementedFunction)
        }
    }

    fn ctx_with(signal_id: SignalId, value: f64) -> FakeCtx {
        let mut signals = std::collections::HashMap::new();
        let _ = signals.insert(signal_id, value);
        FakeCtx { signals }
    }

    #[test]
    fn signal_greater_than_literal() {
        let mut arena = Arena::new();
        let signal = arena.push(AstNode::Signal(1001));
        let literal = arena.push(AstNode::Float(42.0));
        let root = arena.push(AstNode::Binary(BinaryOp::Gt, signal, literal));

        let mut ctx = ctx_with(1001, 50.0);
        assert_eq!(eval(&arena, root, &mut ctx, MAX_AST_DEPTH).unwrap(), Value::Bool(true));
    }

    #[test]
    fn unbound_signal_is_signal_not_found() {
        let mut arena = Arena::new();
        let signal = arena.push(AstNode::Signal(9999));

        let mut ctx = ctx_with(1001, 1.0);
        assert_eq!(eval(&arena, signal, &mut ctx, MAX_AST_DEPTH), Err(ErrorKind::SignalNotFound));
    }

    #[test]
    fn window_function_without_data_is_function_data_not_available() {
        let mut arena = Arena::new();
        let node = arena.push(AstNode::WindowFunction(2001, 1_000, WindowQuery::LastAvg));

        let mut ctx = ctx_with(1001, 1.0);
        assert_eq!(eval(&arena, node, &mut ctx, MAX_AST_DEPTH), Err(ErrorKind::FunctionDataNotAvailable));
    }

    #[test]
    fn divide_by_zero_propagates_infinity() {
        let mut arena = Arena::new();
        let numerator = arena.push(AstNode::Float(1.0));
        let denominator = arena.push(AstNode::Float(0.0));
        let root = arena.push(AstNode::Binary(BinaryOp::Div, numerator, denominator));

        let mut ctx = ctx_with(1001, 1.0);
        assert_eq!(eval(&arena, root, &mut ctx, MAX_AST_DEPTH).unwrap(), Value::Float(f64::INFINITY));
    }

    #[test]
    fn depth_exactly_at_limit_still_evaluates() {
        // Build a left-leaning chain of `MAX_AST_DEPTH` nested NOT(NOT(...)) nodes.
        let mut arena = Arena::new();
        let mut node = arena.push(AstNode::Boolean(true));
        for _ in 0..MAX_AST_DEPTH - 1 {
            node = arena.push(AstNode::Unary(UnaryOp::Not, node));
        }

        let mut ctx = ctx_with(1001, 1.0);
        assert!(eval(&arena, node, &mut ctx, MAX_AST_DEPTH).is_ok());
    }

    #[test]
    fn depth_one_past_limit_hits_stack_depth_reached() {
        let mut arena = Arena::new();
        let mut node = arena.push(AstNode::Boolean(true));
        for _ in 0..MAX_AST_DEPTH {
            node = arena.push(AstNode::Unary(UnaryOp::Not, node));
        }

        let mut ctx = ctx_with(1001, 1.0);
        assert_eq!(eval(&arena, node, &mut ctx, MAX_AST_DEPTH), Err(ErrorKind::StackDepthReached));
    }

    #[test]
    fn equality_uses_epsilon() {
        let mut arena = Arena::new();
        let a = arena.push(AstNode::Float(1.0));
        let b = arena.push(AstNode::Float(1.0 + 1e-12));
        let root = arena.push(AstNode::Binary(BinaryOp::Eq, a, b));

        let mut ctx = ctx_with(1001, 1.0);
        assert_eq!(eval(&arena, root, &mut ctx, MAX_AST_DEPTH).unwrap(), Value::Bool(true));
    }

    #[test]
    fn logical_or_evaluates_both_branches() {
        struct CountingCtx {
            calls: std::cell::RefCell<u32>,
        }
        impl EvalContext for CountingCtx {
            fn signal_newest(&mut self, _signal_id: SignalId) -> Result<f64, ErrorKind> {
                *self.calls.borrow_mut() += 1;
                Ok(1.0)
            }
            fn window_query(&mut self, _signal_id: SignalId, _period_ms: u32, _query: WindowQuery) -> Option<f64> {
                None
            }
            fn custom_function(&mut self, _function_id: CustomFunctionId, _invocation_id: InvocationId, _args: &[Value]) -> Result<Value, ErrorKind> {
                Err(ErrorKind::NotImplementedFunction)
            }
        }

        let mut arena = Arena::new();
        let lhs = arena.push(AstNode::Boolean(true));
        let rhs = arena.push(AstNode::Signal(1001));
        let root = arena.push(AstNode::Binary(BinaryOp::Or, lhs, rhs));

        let mut ctx = CountingCtx { calls: std::cell::RefCell::new(0) };
        let result = eval(&arena, root, &mut ctx, MAX_AST_DEPTH).unwrap();
        assert_eq!(result, Value::Bool(true));
        assert_eq!(*ctx.calls.borrow(), 1, "OR must still evaluate its right-hand side even though the left is already true");
    }
}
