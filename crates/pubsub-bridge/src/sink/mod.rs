//! Sink side of the bridge: batching publisher and Pub/Sub transports.
//!
//! ```text
//! pipeline ── publish(request) ──▶ Publisher ──▶ lanes (per ordering key)
//!     ▲                               │              │ BatchBuffer
//!     │                               │              ▼
//!     └──── AckFuture ◀── ack ────────┴──── PublishTransport::publish(batch)
//! ```
//!
//! The [`PublishTransport`] seam is the only place that talks to Pub/Sub;
//! [`RestTransport`] speaks the REST `topics.publish` method and
//! [`InMemoryTransport`] is a programmable stand-in.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::PublishRequest;
use crate::retry::Retryable;

pub mod batch;
pub mod memory;
pub mod publisher;
pub mod rest;

pub use batch::BatchBuffer;
pub use memory::InMemoryTransport;
pub use publisher::{AckFuture, AckResult, PublishFailure, Publisher};
pub use rest::{
    MetadataTokenProvider, PubsubMessage, RestTransport, StaticTokenProvider, TokenProvider,
};

/// Status class of a failed publish call, following the Pub/Sub error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkStatus {
    Unavailable,
    ResourceExhausted,
    DeadlineExceeded,
    Internal,
    InvalidArgument,
    PermissionDenied,
    Unauthenticated,
    NotFound,
    Other,
}

impl SinkStatus {
    /// Whether a retry of the same batch could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SinkStatus::Unavailable
                | SinkStatus::ResourceExhausted
                | SinkStatus::DeadlineExceeded
                | SinkStatus::Internal
        )
    }

    /// Whether the failure is about credentials rather than the request.
    pub fn is_auth(&self) -> bool {
        matches!(self, SinkStatus::PermissionDenied | SinkStatus::Unauthenticated)
    }

    /// Parse a canonical status name such as `UNAVAILABLE`.
    pub fn from_code_name(name: &str) -> Self {
        match name {
            "UNAVAILABLE" => SinkStatus::Unavailable,
            "RESOURCE_EXHAUSTED" => SinkStatus::ResourceExhausted,
            "DEADLINE_EXCEEDED" => SinkStatus::DeadlineExceeded,
            "INTERNAL" => SinkStatus::Internal,
            "INVALID_ARGUMENT" => SinkStatus::InvalidArgument,
            "PERMISSION_DENIED" => SinkStatus::PermissionDenied,
            "UNAUTHENTICATED" => SinkStatus::Unauthenticated,
            "NOT_FOUND" => SinkStatus::NotFound,
            _ => SinkStatus::Other,
        }
    }

    /// Map an HTTP status code when the body carries no status name.
    pub fn from_http(code: u16) -> Self {
        match code {
            400 => SinkStatus::InvalidArgument,
            401 => SinkStatus::Unauthenticated,
            403 => SinkStatus::PermissionDenied,
            404 => SinkStatus::NotFound,
            408 | 504 => SinkStatus::DeadlineExceeded,
            429 => SinkStatus::ResourceExhausted,
            500 => SinkStatus::Internal,
            502 | 503 => SinkStatus::Unavailable,
            _ => SinkStatus::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkStatus::Unavailable => "UNAVAILABLE",
            SinkStatus::ResourceExhausted => "RESOURCE_EXHAUSTED",
            SinkStatus::DeadlineExceeded => "DEADLINE_EXCEEDED",
            SinkStatus::Internal => "INTERNAL",
            SinkStatus::InvalidArgument => "INVALID_ARGUMENT",
            SinkStatus::PermissionDenied => "PERMISSION_DENIED",
            SinkStatus::Unauthenticated => "UNAUTHENTICATED",
            SinkStatus::NotFound => "NOT_FOUND",
            SinkStatus::Other => "UNKNOWN",
        }
    }
}

impl fmt::Display for SinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed publish call.
#[derive(Debug, Clone, Error)]
#[error("{status}: {message}")]
pub struct TransportError {
    pub status: SinkStatus,
    pub message: String,
}

impl TransportError {
    pub fn new(status: SinkStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

/// Sends one batch of messages to a Pub/Sub topic.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    /// Publish `messages` to the fully-qualified `topic`.
    ///
    /// Returns one server-assigned message id per message, in order. A batch
    /// succeeds or fails as a whole.
    async fn publish(
        &self,
        topic: &str,
        messages: &[PublishRequest],
    ) -> Result<Vec<String>, TransportError>;
}
