use thiserror::Error;

/// Kind of correlation anomaly observed on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// An opaque was inserted while another request still held it.
    DuplicateKey,
    /// A response arrived for an opaque with no outstanding request.
    UnmatchedResponse,
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::DuplicateKey => write!(f, "duplicate key"),
            AnomalyKind::UnmatchedResponse => write!(f, "unmatched response"),
        }
    }
}

/// Errors produced by the request lifecycle.
///
/// The type is `Clone` because one outcome may be observed by several
/// waiters on the same response handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: u64, timeout_ms: u64 },

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("correlation anomaly on opaque {opaque}: {kind}")]
    CorrelationAnomaly { opaque: u32, kind: AnomalyKind },

    #[error("encoding error: {reason}")]
    Encoding { reason: String },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("no endpoint available for request")]
    NoEndpoint,

    #[error("timer wheel has been shut down")]
    TimerShutdown,

    #[error("request cancelled")]
    Cancelled,

    #[error("I/O error: {reason}")]
    Io { reason: String },
}

impl CoreError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CoreError::MalformedFrame {
            reason: reason.into(),
        }
    }

    pub(crate) fn encoding(reason: impl Into<String>) -> Self {
        CoreError::Encoding {
            reason: reason.into(),
        }
    }

    /// Returns `true` for the timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout { .. })
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io {
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
