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

//! The frozen, read-only set of active conditions the engine evaluates
//! every tick, plus the AST node arena their expressions reference.
//!
//! A matrix is loaded wholesale from its on-disk YAML representation and
//! then activated: items that violate a limit (invalid signal id, zero
//! buffer size, unknown signal type, too many conditions, too many
//! distinct signal ids) are rejected individually and counted, never
//! aborting the whole activation — a campaign with one bad condition still
//! gets every other condition running.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use condition_ast::{Arena, AstNode, NodeId};
use serde::{Deserialize, Serialize};
use signal::{SignalId, SignalType, INVALID_SIGNAL_ID};
use validator::Validate;

/// Maximum number of conditions a single matrix may activate.
pub const MAX_ACTIVE_CONDITIONS: usize = signal::bitset::MAX_ACTIVE_CONDITIONS;

/// Maximum number of distinct signal ids referenced across every active
/// condition.
pub const MAX_DISTINCT_SIGNAL_IDS: usize = 50_000;

/// Errors that abort loading a matrix outright (the file itself is
/// unreadable or malformed); per-item configuration problems are handled by
/// rejection + counting instead, see `Matrix::activate`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The matrix file could not be opened or read.
    #[error("could not read inspection matrix file `{file}`: {message}")]
    InvalidFile {
        /// The path that was attempted.
        file: String,
        /// The underlying error message.
        message: String,
    },

    /// The matrix file was read but did not parse as the expected shape.
    #[error("could not parse inspection matrix file `{file}`: {message}")]
    InvalidShape {
        /// The path that was attempted.
        file: String,
        /// The underlying error message.
        message: String,
    },
}

/// Describes one signal a condition collects or evaluates against.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SignalSpec {
    /// The signal this spec configures.
    pub signal_id: SignalId,
    /// Newest-first sample count retained for this signal, in snapshots.
    #[validate(range(min = 1))]
    pub sample_buffer_size: usize,
    /// Minimum spacing, in milliseconds, between admitted samples.
    pub min_sample_interval_ms: u32,
    /// Width, in milliseconds, of the fixed-time window attached to this
    /// signal. Zero means no window.
    pub fixed_window_period_ms: u32,
    /// When true, this signal is only used for condition evaluation and
    /// never collected into a snapshot.
    pub is_condition_only: bool,
    /// Declared type, checked against every sample pushed for this signal.
    pub signal_type: SignalType,
}

/// Campaign/decoder provenance and delivery hints carried by a condition,
/// opaque to the engine beyond what it needs for snapshot tagging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionMetadata {
    /// The campaign that defined this condition.
    pub campaign_id: String,
    /// The decoder manifest this condition's signal ids resolve against.
    pub decoder_id: String,
    /// Relative delivery priority; higher is sent first when queues are under pressure.
    pub priority: u8,
    /// Whether the outbound payload should be compressed before publish.
    pub compress: bool,
    /// Whether a disconnected sender should persist this snapshot rather than drop it.
    pub persist: bool,
    /// Optional ARN of the owning campaign, passed through to the backend.
    pub campaign_arn: Option<String>,
}

/// One boolean expression over signals that, when it fires subject to
/// pacing rules, causes a snapshot to be emitted.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Condition {
    /// Root node of this condition's expression, indexing into the
    /// matrix-wide arena.
    pub root_expr_ref: NodeId,
    /// Signals this condition binds, either for evaluation or collection.
    #[validate(nested)]
    pub signals: Vec<SignalSpec>,
    /// Minimum spacing, in milliseconds, between two arm events.
    pub min_publish_interval_ms: u64,
    /// Delay, in milliseconds, between arming and building the snapshot.
    pub after_duration_ms: u64,
    /// When true, suppress re-arming while the condition stays
    /// continuously true; only the false-to-true transition arms.
    pub trigger_only_on_rising_edge: bool,
    /// When true, attach the current DTC snapshot the first time it hasn't
    /// yet been consumed by this condition.
    pub include_active_dtcs: bool,
    /// When true, evaluate every tick regardless of whether any bound
    /// signal's input changed.
    pub always_evaluate: bool,
    /// When true, this condition is evaluated exactly once at activation
    /// and its result is latched for the rest of the matrix's lifetime.
    pub is_static: bool,
    /// Campaign/decoder provenance and delivery hints.
    pub metadata: ConditionMetadata,
}

#[derive(Debug, Deserialize)]
struct RawMatrix {
    nodes: Vec<AstNode>,
    conditions: Vec<Condition>,
}

/// The frozen, read-only set of active conditions plus their shared AST
/// arena. Replacing the matrix is the only way to change what's active;
/// there is no incremental mutation.
#[derive(Debug)]
pub struct InspectionMatrix {
    /// Every AST node referenced by any condition's expression, in
    /// depth-first preorder.
    pub arena: Arena,
    /// The conditions accepted during activation, in their original index
    /// order (index order is the tie-break the engine uses when two
    /// conditions arm in the same tick).
    pub conditions: Vec<Condition>,
}

impl InspectionMatrix {
    /// Loads and activates a matrix from a YAML file at `path`, rejecting
    /// individual items that violate a configured limit and recording each
    /// rejection via `diagnostics`.
    pub fn load(path: impl AsRef<Path>, diagnostics: &diagnostics::Counters) -> Result<Self, Error> {
        let display_path = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|err| Error::InvalidFile {
            file: display_path.clone(),
            message: err.to_string(),
        })?;
        let raw: RawMatrix = serde_yaml::from_reader(BufReader::new(file)).map_err(|err| Error::InvalidShape {
            file: display_path,
            message: err.to_string(),
        })?;

        Ok(Self::activate(raw.nodes, raw.conditions, diagnostics))
    }

    /// Activates a matrix from already-parsed nodes and conditions, useful
    /// for tests and for callers that assemble a matrix programmatically.
    pub fn activate(nodes: Vec<AstNode>, conditions: Vec<Condition>, diagnostics: &diagnostics::Counters) -> Self {
        let arena = Arena::from_nodes(nodes);
        let mut distinct_signal_ids = HashSet::new();
        let mut accepted = Vec::with_capacity(conditions.len());

        for mut condition in conditions {
            if accepted.len() >= MAX_ACTIVE_CONDITIONS {
                tracing::warn!(limit = MAX_ACTIVE_CONDITIONS, "dropping condition beyond the active-condition limit");
                diagnostics.inc_config_rejected();
                continue;
            }
            if let Err(errors) = condition.validate() {
                tracing::warn!(reason = %errors, "dropping condition that failed validation");
                diagnostics.inc_config_rejected();
                continue;
            }

            let had_signals = !condition.signals.is_empty();
            let mut kept_signals = Vec::with_capacity(condition.signals.len());
            for signal in condition.signals {
                if signal.signal_id == INVALID_SIGNAL_ID {
                    tracing::warn!("dropping signal binding with invalid signal id");
                    diagnostics.inc_config_rejected();
                    continue;
                }
                if signal.sample_buffer_size == 0 {
                    tracing::warn!(signal_id = signal.signal_id, "dropping signal binding with zero buffer size");
                    diagnostics.inc_config_rejected();
                    continue;
                }
                if signal.signal_type == SignalType::Unknown {
                    tracing::warn!(signal_id = signal.signal_id, "dropping signal binding with unknown signal type");
                    diagnostics.inc_config_rejected();
                    continue;
                }
                if !distinct_signal_ids.contains(&signal.signal_id) && distinct_signal_ids.len() >= MAX_DISTINCT_SIGNAL_IDS {
                    tracing::warn!(limit = MAX_DISTINCT_SIGNAL_IDS, "dropping signal binding beyond the distinct-signal-id limit");
                    diagnostics.inc_config_rejected();
                    continue;
                }
                let _ = distinct_signal_ids.insert(signal.signal_id);
                kept_signals.push(signal);
            }

            if kept_signals.is_empty() && had_signals {
                // Every one of this condition's signal bindings was rejected;
                // an expression with nothing bound can never usefully evaluate.
                continue;
            }

            condition.signals = kept_signals;
            accepted.push(condition);
        }

        Self { arena, conditions: accepted }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn metadata() -> ConditionMetadata {
        ConditionMetadata {
            campaign_id: "campaign-1".into(),
            decoder_id: "decoder-1".into(),
            priority: 0,
            compress: false,
            persist: true,
            campaign_arn: None,
        }
    }

    fn signal_spec(signal_id: SignalId) -> SignalSpec {
        SignalSpec {
            signal_id,
            sample_buffer_size: 4,
            min_sample_interval_ms: 0,
            fixed_window_period_ms: 0,
            is_condition_only: false,
            signal_type: SignalType::F64,
        }
    }

    fn condition(root_expr_ref: NodeId, signal_id: SignalId) -> Condition {
        Condition {
            root_expr_ref,
            signals: vec![signal_spec(signal_id)],
            min_publish_interval_ms: 1000,
            after_duration_ms: 0,
            trigger_only_on_rising_edge: true,
            include_active_dtcs: false,
            always_evaluate: false,
            is_static: false,
            metadata: metadata(),
        }
    }

    #[test]
    fn valid_condition_is_accepted() {
        let diagnostics = diagnostics::Counters::new();
        let matrix = InspectionMatrix::activate(vec![AstNode::Boolean(true)], vec![condition(0, 1001)], &diagnostics);
        assert_eq!(matrix.conditions.len(), 1);
        assert!(diagnostics.snapshot().iter().all(|c| c.value == 0));
    }

    #[test]
    fn invalid_signal_id_is_dropped_and_counted() {
        let diagnostics = diagnostics::Counters::new();
        let matrix = InspectionMatrix::activate(vec![AstNode::Boolean(true)], vec![condition(0, INVALID_SIGNAL_ID)], &diagnostics);
        assert!(matrix.conditions.is_empty(), "a condition with no surviving signal bindings is dropped");

        let snapshot = diagnostics.snapshot();
        let rejected = snapshot.iter().find(|c| c.name == "config_rejected").unwrap();
        assert_eq!(rejected.value, 1);
    }

    #[test]
    fn zero_buffer_size_is_dropped() {
        let diagnostics = diagnostics::Counters::new();
        let mut cond = condition(0, 1001);
        cond.signals[0].sample_buffer_size = 0;
        let matrix = InspectionMatrix::activate(vec![AstNode::Boolean(true)], vec![cond], &diagnostics);
        assert!(matrix.conditions.is_empty());
    }

    #[test]
    fn beyond_active_condition_limit_is_rejected() {
        let diagnostics = diagnostics::Counters::new();
        let conditions: Vec<_> = (0..MAX_ACTIVE_CONDITIONS + 1).map(|i| condition(0, 1000 + i as SignalId)).collect();
        let matrix = InspectionMatrix::activate(vec![AstNode::Boolean(true)], conditions, &diagnostics);
        assert_eq!(matrix.conditions.len(), MAX_ACTIVE_CONDITIONS);
    }
}
