//! AWS API error taxonomy.
//!
//! Service errors are classified by their AWS error code so callers can
//! distinguish "the resource is not there" (routinely converted to an absent
//! value) from throttling and from genuine failures.

use thiserror::Error;

use crate::cache::CacheError;

/// AWS error codes that mean the requested resource does not exist.
pub const NOT_FOUND_CODES: &[&str] = &[
    "404",
    "NoSuchKey",
    "NotFound",
    "NotFoundException",
    "DBClusterSnapshotNotFoundFault",
    "ExportTaskNotFound",
    "InvalidSnapshot.NotFound",
    "InvalidVolume.NotFound",
];

/// AWS error codes that indicate rate limiting.
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
];

#[derive(Debug, Error)]
pub enum ApiError {
    /// The resource addressed by the call does not exist.
    #[error("{service}.{operation}: not found in {region}: {message}")]
    NotFound {
        service: String,
        operation: String,
        region: String,
        message: String,
    },

    /// The endpoint could not be reached (network failure or timeout).
    #[error("{service}.{operation}: endpoint unreachable in {region}: {message}")]
    Unavailable {
        service: String,
        operation: String,
        region: String,
        message: String,
    },

    /// The service rejected the call due to rate limiting.
    #[error("{service}.{operation}: rate limited in {region}: {message}")]
    Throttled {
        service: String,
        operation: String,
        region: String,
        message: String,
    },

    /// The response did not carry the key the caller declared it would.
    /// This means the call contract is wrong, not that the data is absent.
    #[error(
        "{service}.{operation}: response in {region} is missing expected key '{expected_key}'"
    )]
    ProtocolMismatch {
        service: String,
        operation: String,
        region: String,
        expected_key: String,
    },

    /// No handler is registered for this service/operation pair.
    #[error("unsupported operation: {service}.{operation}")]
    UnknownOperation { service: String, operation: String },

    /// A mandatory pre-flight check failed; the run cannot proceed.
    #[error("pre-flight check failed: {message}")]
    Preflight { message: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Any other service error, with its AWS error code when one was given.
    #[error("{service}.{operation} failed in {region} ({code}): {message}")]
    Service {
        service: String,
        operation: String,
        region: String,
        code: String,
        message: String,
    },
}

impl ApiError {
    /// Build an error from the pieces an SDK service error exposes.
    pub fn classify(
        service: &str,
        operation: &str,
        region: &str,
        code: Option<&str>,
        message: &str,
    ) -> Self {
        let service = service.to_string();
        let operation = operation.to_string();
        let region = region.to_string();
        let message = message.to_string();
        match code {
            Some(code) if NOT_FOUND_CODES.contains(&code) => Self::NotFound {
                service,
                operation,
                region,
                message,
            },
            Some(code) if THROTTLING_CODES.contains(&code) => Self::Throttled {
                service,
                operation,
                region,
                message,
            },
            code => Self::Service {
                service,
                operation,
                region,
                code: code.unwrap_or("unknown").to_string(),
                message,
            },
        }
    }

    /// True when the error means "nothing is there", which single-shot
    /// lookups convert into an absent value.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Unavailable { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }
}
