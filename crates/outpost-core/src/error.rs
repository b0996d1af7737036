//! The error taxonomy surfaced by core operations.
//!
//! The persistence layer reports failures as `anyhow::Error`; this module
//! classifies them at the component boundary so the HTTP layer can map each
//! kind to a status code and a stable error code string.

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input failed a schema, bounds, or enum check.
    #[error("{0}")]
    Validation(String),

    /// Caller lacks rights to the resource.
    #[error("{0}")]
    Authorization(String),

    /// The referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A version guard failed or an idempotency collision was detected.
    #[error("{message}")]
    Conflict {
        message: String,
        /// The version the caller expected, when version-related.
        expected_version: Option<i32>,
        /// The stale current version observed, when version-related.
        current_version: Option<i32>,
    },

    /// The tenant's tier limit was hit.
    #[error("{0}")]
    QuotaExceeded(String),

    /// A dependency (store, object store, container platform) is down.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Unclassified internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
            expected_version: None,
            current_version: None,
        }
    }

    pub fn version_conflict(msg: impl Into<String>, expected: i32, current: i32) -> Self {
        Self::Conflict {
            message: msg.into(),
            expected_version: Some(expected),
            current_version: Some(current),
        }
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// Stable machine-readable code for the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authorization(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(Error::authorization("x").code(), "FORBIDDEN");
        assert_eq!(Error::not_found("x").code(), "NOT_FOUND");
        assert_eq!(Error::conflict("x").code(), "CONFLICT");
        assert_eq!(Error::quota_exceeded("x").code(), "QUOTA_EXCEEDED");
        assert_eq!(Error::unavailable("x").code(), "SERVICE_UNAVAILABLE");
        assert_eq!(
            Error::Internal(anyhow::anyhow!("boom")).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn version_conflict_carries_both_versions() {
        let err = Error::version_conflict("stale", 2, 3);
        match err {
            Error::Conflict {
                expected_version,
                current_version,
                ..
            } => {
                assert_eq!(expected_version, Some(2));
                assert_eq!(current_version, Some(3));
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }
}
