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

//! Typed, validated startup configuration for the agent binary, loaded once
//! from a YAML file. Grounded on the teacher's own config-loading pattern:
//! parse, then run `validator` range checks over every field that has one,
//! and fail the whole load on the first problem rather than degrade —
//! unlike the inspection matrix, which drops individual bad items, a bad
//! agent config can't run at all.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Errors that abort loading the configuration outright.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be opened or read.
    #[error("could not read agent config file `{file}`: {message}")]
    InvalidFile {
        /// The path that was attempted.
        file: String,
        /// The underlying error message.
        message: String,
    },

    /// The config file was read but did not parse as the expected shape.
    #[error("could not parse agent config file `{file}`: {message}")]
    InvalidShape {
        /// The path that was attempted.
        file: String,
        /// The underlying error message.
        message: String,
    },

    /// The config parsed but failed field-level validation.
    #[error("agent config failed validation: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// MQTT broker endpoint, credentials, and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    /// Hostname or IP address of the MQTT broker.
    #[validate(length(min = 1))]
    pub host: String,
    /// TCP port of the MQTT broker.
    pub port: u16,
    /// Client id presented on connect.
    #[validate(length(min = 1))]
    pub client_id: String,
    /// Path to the CA certificate used to validate the broker's TLS chain.
    pub root_ca_path: Option<String>,
    /// Path to this device's TLS client certificate.
    pub certificate_path: Option<String>,
    /// Path to this device's TLS private key.
    pub private_key_path: Option<String>,
    /// Keep-alive interval, in seconds, negotiated with the broker.
    #[validate(range(min = 1))]
    pub keep_alive_secs: u64,
    /// Requested session expiry, in seconds. Zero requests a clean session.
    pub session_expiry_secs: u32,
    /// Initial backoff, in milliseconds, before the first reconnect attempt.
    #[validate(range(min = 1))]
    pub start_backoff_ms: u64,
    /// Backoff ceiling, in milliseconds, reconnect attempts never exceed.
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,
}

/// Telemetry sender timing, topic, and byte-budget policy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SenderConfig {
    /// Topic telemetry snapshots are published to.
    #[validate(length(min = 1))]
    pub topic: String,
    /// Requested QoS level, 0 (at-most-once) through 2 (exactly-once). The
    /// sender publishes at-least-once (1) per the spec; this is recorded for
    /// completeness and validated the same way the other timers are.
    #[validate(range(min = 0, max = 2))]
    pub qos: u8,
    /// Maximum bytes this task will have outstanding to the broker at once
    /// before new snapshots fall back to the offline store.
    #[validate(range(min = 1))]
    pub byte_budget: u64,
    /// How often, in milliseconds, the sender retries draining the offline
    /// store while connected.
    #[validate(range(min = 1))]
    pub reconnect_retry_interval_ms: u64,
    /// Path to the offline store's append-only file.
    #[validate(length(min = 1))]
    pub persistence_path: String,
}

/// Engine and ingestion worker timing and memory policy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    /// Total bytes across every signal's ring buffer.
    #[validate(range(min = 1))]
    pub ring_byte_budget: usize,
    /// Maximum time, in milliseconds, the ingestion worker sleeps between
    /// wake-ups when nothing is armed and no window is pending.
    #[validate(range(min = 1))]
    pub idle_time_ms: u64,
    /// Minimum spacing, in milliseconds, between evaluation passes run
    /// purely because nothing was drained.
    #[validate(range(min = 1))]
    pub evaluate_interval_ms: u64,
    /// Capacity of the bounded channel carrying decoded samples to the
    /// ingestion worker.
    #[validate(range(min = 1))]
    pub inbound_channel_capacity: usize,
    /// Capacity of the bounded queue carrying triggered snapshots from the
    /// ingestion worker to the sender.
    #[validate(range(min = 1))]
    pub snapshot_channel_capacity: usize,
}

/// The complete, validated agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AgentConfig {
    /// Path to the YAML file describing the active inspection matrix.
    #[validate(length(min = 1))]
    pub inspection_matrix_path: String,
    /// MQTT broker endpoint, credentials, and reconnect policy.
    #[validate(nested)]
    pub broker: BrokerConfig,
    /// Telemetry sender timing, topic, and byte-budget policy.
    #[validate(nested)]
    pub sender: SenderConfig,
    /// Engine and ingestion worker timing and memory policy.
    #[validate(nested)]
    pub engine: EngineConfig,
}

impl AgentConfig {
    /// Loads and validates a configuration from a YAML file at `path`.
    /// Any parse or validation failure is a fatal startup error: unlike the
    /// inspection matrix, there is no partial config to fall back to.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let display_path = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|err| Error::InvalidFile {
            file: display_path.clone(),
            message: err.to_string(),
        })?;
        let config: Self = serde_yaml::from_reader(BufReader::new(file)).map_err(|err| Error::InvalidShape {
            file: display_path,
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}
