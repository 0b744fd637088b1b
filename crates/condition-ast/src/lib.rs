#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A depth-bounded recursive interpreter over a typed condition expression
//! tree: literals, bound signals, fixed-time-window queries, custom
//! functions, and the usual arithmetic/relational/logical operators.
//!
//! The arena stores nodes in depth-first preorder and never frees one while
//! the owning matrix is active, so a `NodeId` handed out by `Arena::push`
//! stays valid for the matrix's whole lifetime.

pub mod eval;
pub mod node;

pub use eval::{eval, EvalContext, Value, MAX_AST_DEPTH};
pub use node::{Arena, AstNode, BinaryOp, CustomFunctionId, InvocationId, NodeId, UnaryOp};

/// Every way evaluating a node can fail without aborting the enclosing
/// condition: each one silently resolves the condition to false for the
/// current tick except where noted.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Recursion reached the configured depth limit, or a null subtree was
    /// referenced.
    #[error("stack depth reached")]
    StackDepthReached,

    /// A node carries a type this evaluator build does not implement.
    #[error("not implemented: type")]
    NotImplementedType,

    /// A custom function id has no registered implementation.
    #[error("not implemented: function")]
    NotImplementedFunction,

    /// An operator was applied to operands it cannot accept.
    #[error("type mismatch")]
    TypeMismatch,

    /// A bound signal has no sample collected yet.
    #[error("signal not found")]
    SignalNotFound,

    /// A window query was made before the relevant window had closed.
    #[error("function data not available")]
    FunctionDataNotAvailable,
}
