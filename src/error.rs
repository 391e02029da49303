//! Crate-wide error taxonomy.
//!
//! Every failure mode named by the error handling design maps to exactly one
//! variant here. Recovery policy lives with the caller (gateway retry loop,
//! registry quarantine, orchestrator halt); this enum only carries enough
//! structured context to reconstruct an audit entry without re-deriving it.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A closed error taxonomy. Construction goes through the associated
/// functions below rather than struct literals.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport failure, rate limit, or mailbox 5xx. Bounded-retry eligible.
    #[error("transient error in {origin}: {message}")]
    Transient { origin: String, message: String },

    /// Classifier returned output that didn't survive the fallback parse
    /// chain or failed schema validation after retries were exhausted.
    #[error("schema error for profile {profile_id}: {message}")]
    SchemaError { profile_id: String, message: String },

    /// Circuit breaker is open; the call was not attempted.
    #[error("circuit breaker open for {subsystem}, retry after {retry_after_secs}s")]
    BreakerOpen {
        subsystem: String,
        retry_after_secs: u64,
    },

    /// Profile or configuration unit rejected at load time.
    #[error("validation failed for {unit}: {message}")]
    Validation { unit: String, message: String },

    /// Audit-chain hash mismatch. Always fatal to the running orchestrator.
    #[error("audit chain integrity failure at index {index}: {message}")]
    Integrity { index: u64, message: String },

    /// Unrecoverable I/O or auth expiry. Stops the batch.
    #[error("fatal error: {message}")]
    Fatal { message: String },

    /// A safety gate demoted a winning action to `none`.
    #[error("gated: {gate_name} required {required:.2}, got {actual:.2}")]
    Gated {
        gate_name: String,
        required: f64,
        actual: f64,
    },

    /// Caller deadline elapsed or cancellation signal observed.
    #[error("operation cancelled: {context}")]
    Cancelled { context: String },

    /// JSON plumbing failure, surfaced directly rather than wrapped.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML plumbing failure (profile parsing).
    #[error("yaml error: {0}")]
    YamlSerialization(#[from] serde_yaml::Error),

    /// I/O failure not otherwise classified (file reads during profile or
    /// audit-log loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transient(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            origin: source.into(),
            message: message.into(),
        }
    }

    pub fn schema_error(profile_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaError {
            profile_id: profile_id.into(),
            message: message.into(),
        }
    }

    pub fn breaker_open(subsystem: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::BreakerOpen {
            subsystem: subsystem.into(),
            retry_after_secs,
        }
    }

    pub fn validation(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            unit: unit.into(),
            message: message.into(),
        }
    }

    pub fn integrity(index: u64, message: impl Into<String>) -> Self {
        Self::Integrity {
            index,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn gated(gate_name: impl Into<String>, required: f64, actual: f64) -> Self {
        Self::Gated {
            gate_name: gate_name.into(),
            required,
            actual,
        }
    }

    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// The error-taxonomy kind, used to derive audit-entry `event_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::SchemaError { .. } => "schema_error",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Validation { .. } => "validation",
            Self::Integrity { .. } => "integrity",
            Self::Fatal { .. } => "fatal",
            Self::Gated { .. } => "gated",
            Self::Cancelled { .. } => "cancelled",
            Self::Serialization(_) | Self::YamlSerialization(_) | Self::Io(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_matches_taxonomy() {
        assert_eq!(Error::transient("mailbox", "timeout").kind(), "transient");
        assert_eq!(
            Error::schema_error("spam", "missing field").kind(),
            "schema_error"
        );
        assert_eq!(Error::breaker_open("classifier", 60).kind(), "breaker_open");
        assert_eq!(
            Error::validation("profile:spam", "bad version").kind(),
            "validation"
        );
        assert_eq!(Error::integrity(3, "hash mismatch").kind(), "integrity");
        assert_eq!(Error::fatal("disk full").kind(), "fatal");
        assert_eq!(Error::gated("archive", 0.85, 0.82).kind(), "gated");
        assert_eq!(Error::cancelled("batch 7").kind(), "cancelled");
    }

    #[test]
    fn gated_display_includes_thresholds() {
        let err = Error::gated("archive", 0.85, 0.82);
        let msg = err.to_string();
        assert!(msg.contains("0.85"));
        assert!(msg.contains("0.82"));
    }
}
