#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! This is a library of the crates composing the in-vehicle edge telemetry
//! agent: a condition set evaluated over ring-buffered signals produces
//! snapshots, which a sender task publishes over MQTT or persists offline
//! while disconnected. See each crate's own documentation for its stage of
//! the pipeline; the `agent` binary (a separate workspace member) wires
//! them all together.

pub use agent_config;
pub use condition_ast;
pub use connectivity;
pub use diagnostics;
pub use engine;
pub use ingestion;
pub use inspection_matrix;
pub use ring_store;
pub use signal;
pub use snapshot_queue;
pub use task;
pub use telemetry_sender;
