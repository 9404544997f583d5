use async_trait::async_trait;

use crate::envelope::ErrorEnvelope;

/// Routing status returned by a [`Transform`], per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// The message processed cleanly.
    NoError,
    /// The message processed with a low-severity issue; still forwarded.
    Low,
    /// The message processed with a medium-severity issue; still forwarded.
    Medium,
    /// The message processed with a high-severity issue; still forwarded.
    High,
    /// The message could not be processed at all; not forwarded.
    Critical,
}

impl ErrorStatus {
    /// Whether a message with this status should still be published to the output queue.
    pub fn forwards_to_output(self) -> bool {
        !matches!(self, ErrorStatus::Critical)
    }

    /// Whether a message with this status should also be published to the error queue.
    pub fn publishes_envelope(self) -> bool {
        !matches!(self, ErrorStatus::NoError)
    }
}

/// What a [`Transform`] produces for a single input message.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    /// The transformed payload. Only published when `status.forwards_to_output()`.
    pub payload: Vec<u8>,
    /// Routing status.
    pub status: ErrorStatus,
    /// Structured error record. Must be `Some` when `status != NoError`, and should be `None`
    /// otherwise.
    pub envelope: Option<ErrorEnvelope>,
}

impl TransformOutcome {
    /// Builds a clean outcome: no error, payload forwarded as-is.
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            payload,
            status: ErrorStatus::NoError,
            envelope: None,
        }
    }

    /// Builds a faulty outcome at the given severity, still forwarding `payload` unless the
    /// severity is [`ErrorStatus::Critical`].
    pub fn faulty(payload: Vec<u8>, status: ErrorStatus, envelope: ErrorEnvelope) -> Self {
        debug_assert!(
            status != ErrorStatus::NoError,
            "faulty() requires a non-NoError status"
        );
        Self {
            payload,
            status,
            envelope: Some(envelope),
        }
    }
}

/// The message transform supplied by the host application.
///
/// Implementations must be reentrant and stateless with respect to other workers: the same
/// `Transform` instance is wrapped in an `Arc` and shared read-only across every worker task, so
/// any mutable state an implementation needs must be internally synchronized or worker-local.
///
/// A `Transform` must not panic in ordinary operation. If it does, the worker catches the unwind
/// and synthesizes a `Critical` envelope with `Blame=worker` on its behalf, so a single bad input
/// cannot take the whole pool down.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Processes one raw message and returns its routed outcome.
    async fn process(&self, message: &[u8]) -> TransformOutcome;
}
