use std::time::Duration;

use thiserror::Error;

/// An error that happens when looking up or fetching a resource.
///
/// Transient errors ([`DownloadError`](Self::DownloadError) and [`Timeout`](Self::Timeout))
/// are eligible for retries, every other failure of a fetch is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The request could not be turned into a cache key, e.g. because it has neither a url
    /// nor an explicit key.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The resource was neither cached nor could it be fetched from anywhere.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the remote's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource was fetched successfully, but is invalid in some way.
    ///
    /// For example, this could result from bytes that fail to decode.
    #[error("malformed: {0}")]
    Malformed(String),
    /// Reading or writing the disk tier failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// The fetch was cancelled before it started.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in fetchcache itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "Cache storage failed");
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Whether retrying the fetch that produced this error is pointless.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DownloadError(_) | Self::Timeout(_))
    }

    /// A short, static name of the error kind, used as metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid-argument",
            Self::NotFound => "not-found",
            Self::PermissionDenied(_) => "permission-denied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "download-error",
            Self::Malformed(_) => "malformed",
            Self::Storage(_) => "storage",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}
