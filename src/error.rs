//! Error taxonomy for extraction and loading
//!
//! Fetch and write failures are typed so the coordinator can decide what to
//! retry and how to report a failed resource. Application plumbing (config,
//! CLI, manifests) keeps using `eyre::Result`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure while fetching a single page
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network failure, timeout, 5xx or 429 response. Safe to retry.
    #[error("transient HTTP error: {0}")]
    Transient(String),

    /// 4xx response or a body that cannot be decoded into records
    #[error("fatal HTTP error: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure while persisting a batch to a sink
#[derive(Debug, Error)]
#[error("failed to write table '{table}': {source}")]
pub struct WriteError {
    pub table: String,
    #[source]
    pub source: std::io::Error,
}

impl WriteError {
    pub fn new(table: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            table: table.into(),
            source,
        }
    }
}

/// Resource-level failure reported by an extractor or the coordinator
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("page {page} still failing after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        page: u32,
        attempts: u32,
        #[source]
        last: FetchError,
    },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("paginator issued page {next} after page {previous}")]
    Pagination { previous: u32, next: u32 },

    #[error("extraction cancelled before page {page}")]
    Cancelled { page: u32 },

    #[error("worker for '{0}' panicked")]
    Panicked(String),

    #[error("worker for '{0}' stopped without reporting a result")]
    WorkerLost(String),
}

impl ExtractError {
    /// Coarse error category used in run traces
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(FetchError::Transient(_)) | Self::RetriesExhausted { .. } => {
                ErrorKind::TransientHttp
            }
            Self::Fetch(FetchError::Fatal(_)) => ErrorKind::FatalHttp,
            Self::Write(_) => ErrorKind::Write,
            Self::Pagination { .. }
            | Self::Cancelled { .. }
            | Self::Panicked(_)
            | Self::WorkerLost(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientHttp,
    FatalHttp,
    Write,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransientHttp => write!(f, "transient_http"),
            Self::FatalHttp => write!(f, "fatal_http"),
            Self::Write => write!(f, "write"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let fatal = ExtractError::from(FetchError::Fatal("404 Not Found".to_string()));
        assert_eq!(fatal.kind(), ErrorKind::FatalHttp);

        let exhausted = ExtractError::RetriesExhausted {
            page: 3,
            attempts: 5,
            last: FetchError::Transient("503".to_string()),
        };
        assert_eq!(exhausted.kind(), ErrorKind::TransientHttp);
        assert!(exhausted.to_string().contains("page 3"));

        let write = ExtractError::from(WriteError::new(
            "orders",
            std::io::Error::other("disk full"),
        ));
        assert_eq!(write.kind(), ErrorKind::Write);
        assert!(write.to_string().contains("orders"));
    }

    #[test]
    fn test_transient_check() {
        assert!(FetchError::Transient("timeout".to_string()).is_transient());
        assert!(!FetchError::Fatal("bad json".to_string()).is_transient());
    }
}
