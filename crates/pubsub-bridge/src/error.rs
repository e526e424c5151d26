//! Error types for the Kafka → Pub/Sub bridge.
//!
//! ## Error Categories
//!
//! ### Startup
//! - `ConfigInvalid`: a required option is missing, blank or malformed. Never starts.
//!
//! ### Fatal at runtime
//! - `AuthFailure`: the source or the sink rejected our credentials.
//! - `PublishRejected`: a record was permanently rejected and the gap policy is `halt`.
//! - `PublishUnavailable`: the sink kept failing with retryable errors past the retry cap.
//! - `CheckpointUnavailable`: storage stayed unavailable past the checkpoint retry cap.
//! - `CheckpointConflict`: another writer advanced the checkpoint of a partition we own.
//! - `DeadLetter`: the dead-letter hook failed to accept a record.
//!
//! ### Recoverable
//! - `TransientTransport`: broker or sink temporarily unavailable; retried locally.
//!
//! Rebalances and interrupts are lifecycle events, not errors.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::record::TopicPartition;
use crate::retry::Retryable;

/// Errors surfaced by the bridge engine.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Invalid or missing configuration.
    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    /// The source or sink rejected our credentials.
    #[error("Authentication failure ({system}): {message}")]
    AuthFailure {
        system: &'static str,
        message: String,
    },

    /// Broker or sink temporarily unavailable.
    #[error("Transient transport error: {0}")]
    TransientTransport(String),

    /// A record was permanently rejected by the sink.
    #[error("Publish rejected at {tp} offset {offset}: {reason}")]
    PublishRejected {
        tp: TopicPartition,
        offset: u64,
        reason: String,
    },

    /// The sink stayed unavailable past the retry cap.
    #[error("Sink unavailable at {tp} offset {offset}: {reason}")]
    PublishUnavailable {
        tp: TopicPartition,
        offset: u64,
        reason: String,
    },

    /// The checkpoint store stayed unavailable past the retry cap.
    #[error("Checkpoint unavailable for {tp}: {reason}")]
    CheckpointUnavailable { tp: TopicPartition, reason: String },

    /// Another writer advanced the checkpoint of a partition we own.
    #[error("Checkpoint conflict for {tp}: {reason}")]
    CheckpointConflict { tp: TopicPartition, reason: String },

    /// The dead-letter hook refused a record.
    #[error("Dead-letter hook failed at {tp} offset {offset}: {reason}")]
    DeadLetter {
        tp: TopicPartition,
        offset: u64,
        reason: String,
    },

    /// No starting position could be resolved for a partition.
    #[error("No committed offset for {0} and starting_offset_policy is 'committed'")]
    NoStartingOffset(TopicPartition),

    /// Error reported by the source consumer.
    #[error("Source error: {0}")]
    Source(String),

    /// Error in the bridge runtime itself (task panics, closed channels).
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl BridgeError {
    /// Short machine-friendly label, used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::AuthFailure { .. } => "auth_failure",
            BridgeError::TransientTransport(_) => "transient_transport",
            BridgeError::PublishRejected { .. } => "publish_rejected",
            BridgeError::PublishUnavailable { .. } => "publish_unavailable",
            BridgeError::CheckpointUnavailable { .. } => "checkpoint_unavailable",
            BridgeError::CheckpointConflict { .. } => "checkpoint_conflict",
            BridgeError::DeadLetter { .. } => "dead_letter",
            BridgeError::NoStartingOffset(_) => "no_starting_offset",
            BridgeError::Source(_) => "source",
            BridgeError::Runtime(_) => "runtime",
        }
    }

    /// Whether the error can be retried locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::TransientTransport(_))
    }

    /// Build the error reported when a checkpoint write gives up.
    pub(crate) fn from_checkpoint(tp: &TopicPartition, err: CheckpointError) -> Self {
        match err {
            CheckpointError::Conflict(reason) => BridgeError::CheckpointConflict {
                tp: tp.clone(),
                reason,
            },
            other => BridgeError::CheckpointUnavailable {
                tp: tp.clone(),
                reason: other.to_string(),
            },
        }
    }
}

impl Retryable for BridgeError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
