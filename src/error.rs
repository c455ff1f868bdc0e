use std::time::Duration;

use thiserror::Error;

/// Errors produced by the cache proxy.
///
/// The variants are grouped the way the control flow consumes them:
/// configuration errors are synchronous and fatal to the caller, network
/// errors are retried by the download loop, protocol and cache-consistency
/// errors trigger a cache reset, lifecycle errors are terminal for the
/// stream, and response errors are delivered only to the affected
/// subscriber.
///
/// `Clone` is required because a single failure may complete several
/// pending requests and progress subscribers at once; error sources are
/// therefore carried as strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    RequestTimedOut(Duration),

    #[error("read timed out after {0:?}")]
    ReadTimedOut(Duration),

    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16 },

    /// The origin's range response does not line up with the requested range.
    #[error("range response mismatch: requested start {requested}, response starts at {received}")]
    HttpRange { requested: u64, received: u64 },

    /// The origin resource changed under a resumed download.
    #[error("cache source changed")]
    SourceChanged,

    /// The cache was reset explicitly.
    #[error("cache reset")]
    CacheReset,

    /// The partial file does not have the size the headers promised.
    #[error("invalid cache length: file is {actual} bytes, expected {expected}")]
    InvalidCacheLength { actual: u64, expected: u64 },

    /// The download stopped while the stream was still retained.
    #[error("download stopped")]
    DownloadStopped,

    /// The stream was disposed; terminal.
    #[error("cache stream disposed")]
    Disposed,

    #[error("stream response cancelled")]
    ResponseCancelled,

    /// A subscriber fell too far behind and its buffer exceeded the limit.
    #[error("subscriber buffer exceeded {0} bytes")]
    ExceededMaxBufferSize(usize),

    #[error("cache write failed: {0}")]
    Write(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),
}

impl CacheError {
    /// Errors meaning the on-disk cache can no longer be trusted. The
    /// download loop responds by resetting the cache instead of retrying.
    pub fn is_invalid_cache(&self) -> bool {
        matches!(
            self,
            CacheError::SourceChanged
                | CacheError::CacheReset
                | CacheError::InvalidCacheLength { .. }
                | CacheError::HttpRange { .. }
        )
    }

    /// Errors that end the stream's lifecycle; nothing is retried after these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CacheError::Disposed | CacheError::DownloadStopped)
    }

    pub(crate) fn network(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            CacheError::RequestTimedOut(Duration::from_secs(0))
        } else {
            CacheError::Network(err.to_string())
        }
    }

    pub(crate) fn write(err: &std::io::Error) -> Self {
        CacheError::Write(err.to_string())
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
