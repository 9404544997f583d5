use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a faulty message, carried on the wire and used for routing (see [`crate::ErrorStatus`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Forwarded to the output queue; also mirrored to the error queue.
    Low,
    /// Forwarded to the output queue; also mirrored to the error queue.
    Medium,
    /// Forwarded to the output queue; also mirrored to the error queue.
    High,
    /// Not forwarded; only the envelope is published, to the error queue.
    Critical,
}

/// The `Payload` object nested inside an [`ErrorEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description of what went wrong.
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
    /// The original input that triggered the failure, as received off the wire.
    #[serde(rename = "Input")]
    pub input: String,
}

/// Structured error record published alongside (or instead of) a faulty message.
///
/// Serializes to the exact JSON shape expected on the error queue: `SourceProcess`, `Blame`,
/// `Timestamp` (ISO-8601, seconds precision), `Payload`, `Severity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Name of the process that produced the envelope.
    #[serde(rename = "SourceProcess")]
    pub source_process: String,
    /// Who is at fault: the transform, the worker runtime, or the input itself.
    #[serde(rename = "Blame")]
    pub blame: String,
    /// When the failure was observed, ISO-8601 with seconds precision.
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Error detail and the offending input.
    #[serde(rename = "Payload")]
    pub payload: ErrorPayload,
    /// Routing severity.
    #[serde(rename = "Severity")]
    pub severity: Severity,
}

impl ErrorEnvelope {
    /// Builds a new envelope stamped with the current time.
    pub fn new(
        source_process: impl Into<String>,
        blame: impl Into<String>,
        error_message: impl Into<String>,
        input: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            source_process: source_process.into(),
            blame: blame.into(),
            timestamp: Utc::now(),
            payload: ErrorPayload {
                error_message: error_message.into(),
                input: input.into(),
            },
            severity,
        }
    }

    /// Serializes the envelope as UTF-8 JSON bytes, ready to publish to the error queue.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Formats [`Self::timestamp`] as ISO-8601 with seconds precision, per the wire contract.
    pub fn timestamp_iso8601(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let envelope = ErrorEnvelope::new(
            "loomq-worker-3",
            "worker",
            "transform panicked",
            "{\"id\":42}",
            Severity::Critical,
        );
        let bytes = envelope.to_json_bytes().expect("serialize");
        let decoded: ErrorEnvelope = serde_json::from_slice(&bytes).expect("deserialize");

        assert_eq!(decoded.source_process, envelope.source_process);
        assert_eq!(decoded.blame, envelope.blame);
        assert_eq!(decoded.payload.error_message, envelope.payload.error_message);
        assert_eq!(decoded.payload.input, envelope.payload.input);
        assert_eq!(decoded.severity, envelope.severity);
        assert_eq!(
            decoded.timestamp.timestamp(),
            envelope.timestamp.timestamp()
        );
    }

    #[test]
    fn wire_shape_uses_expected_keys() {
        let envelope = ErrorEnvelope::new("p", "transform", "bad input", "raw", Severity::High);
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_json_bytes().unwrap()).unwrap();
        for key in ["SourceProcess", "Blame", "Timestamp", "Payload", "Severity"] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["Severity"], "HIGH");
        assert!(value["Payload"].get("ErrorMessage").is_some());
        assert!(value["Payload"].get("Input").is_some());
    }

    #[test]
    fn timestamp_has_seconds_precision() {
        let envelope = ErrorEnvelope::new("p", "worker", "msg", "in", Severity::Low);
        let formatted = envelope.timestamp_iso8601();
        assert!(!formatted.contains('.'), "expected no sub-second fraction: {formatted}");
    }
}
