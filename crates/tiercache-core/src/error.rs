//! Error types for the cache runtime.
//!
//! Outcomes a caller is expected to branch on ("already exists", "nothing to
//! remove", "lost the update race") are reported through return values. The
//! variants here are reserved for conditions that should look exceptional.

use std::fmt;

/// Why an optimistic update did not store a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateFailureReason {
    /// The key was absent at the time of the final attempt.
    NotFound,
    /// Every attempt lost against a concurrent writer.
    TooManyRetries,
    /// The update function declined to produce a new value.
    Aborted,
}

impl fmt::Display for UpdateFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "item not found"),
            Self::TooManyRetries => write!(f, "too many retries"),
            Self::Aborted => write!(f, "update aborted by the update function"),
        }
    }
}

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key or region is not usable.
    #[error("Invalid key: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },

    /// A throwing update could not store a new value.
    #[error("Could not update {key}: {reason} after {tries} tries")]
    UpdateFailed {
        /// The key that was being updated.
        key: String,
        /// The region of the key, if any.
        region: Option<String>,
        /// Why the update did not happen.
        reason: UpdateFailureReason,
        /// Number of attempts made.
        tries: u32,
    },

    /// A tier operation failed for an infrastructure reason.
    #[error("Tier '{tier}' unavailable: {message}")]
    TierUnavailable {
        /// Name of the failing tier.
        tier: String,
        /// Description of the failure.
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },

    /// A backplane message could not be sent.
    #[error("Backplane send error: {message}")]
    BackplaneSend {
        /// Description of the failure.
        message: String,
    },

    /// The tier does not implement the requested primitive.
    #[error("Tier '{tier}' does not support {operation}")]
    Unsupported {
        /// Name of the tier.
        tier: String,
        /// The unsupported operation.
        operation: &'static str,
    },

    /// The cache could not be assembled from its configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },
}

impl CacheError {
    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates a new `UpdateFailed` error.
    #[must_use]
    pub fn update_failed(
        key: impl Into<String>,
        region: Option<String>,
        reason: UpdateFailureReason,
        tries: u32,
    ) -> Self {
        Self::UpdateFailed {
            key: key.into(),
            region,
            reason,
            tries,
        }
    }

    /// Creates a new `TierUnavailable` error.
    #[must_use]
    pub fn tier_unavailable(tier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier: tier.into(),
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `BackplaneSend` error.
    #[must_use]
    pub fn backplane_send(message: impl Into<String>) -> Self {
        Self::BackplaneSend {
            message: message.into(),
        }
    }

    /// Creates a new `Unsupported` error.
    #[must_use]
    pub fn unsupported(tier: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            tier: tier.into(),
            operation,
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns `true` if retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TierUnavailable { .. })
    }

    /// Returns `true` if this is a failed throwing update.
    #[must_use]
    pub fn is_update_failure(&self) -> bool {
        matches!(self, Self::UpdateFailed { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidKey { .. } => ErrorCategory::Validation,
            Self::UpdateFailed { .. } => ErrorCategory::Conflict,
            Self::TierUnavailable { .. } => ErrorCategory::Infrastructure,
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::BackplaneSend { .. } => ErrorCategory::Infrastructure,
            Self::Unsupported { .. } => ErrorCategory::Validation,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }
}

/// Categories of cache errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad input.
    Validation,
    /// Optimistic concurrency gave up or found nothing.
    Conflict,
    /// A backend or transport failed.
    Infrastructure,
    /// Encoding or decoding failed.
    Serialization,
    /// Invalid setup.
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::tier_unavailable("redis", "connection refused");
        assert_eq!(
            err.to_string(),
            "Tier 'redis' unavailable: connection refused"
        );

        let err = CacheError::update_failed("counter", None, UpdateFailureReason::NotFound, 1);
        assert_eq!(
            err.to_string(),
            "Could not update counter: item not found after 1 tries"
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(CacheError::tier_unavailable("redis", "timeout").is_transient());
        assert!(!CacheError::serialization("bad payload").is_transient());
        assert!(
            CacheError::update_failed("k", None, UpdateFailureReason::TooManyRetries, 50)
                .is_update_failure()
        );
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CacheError::invalid_key("empty").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            CacheError::backplane_send("closed").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(ErrorCategory::Serialization.to_string(), "serialization");
    }
}
