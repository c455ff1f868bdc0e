use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Minimum allowed value for [`CacheConfig::max_buffer_size`].
pub const MIN_BUFFER_SIZE: usize = 1024 * 1024;

/// Configuration for the cache proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on in-memory bytes held by the write sink and by each
    /// response subscriber. Must be at least 1 MiB.
    pub max_buffer_size: usize,

    /// Body chunks are coalesced to at least this size before being
    /// handed downstream.
    pub min_chunk_size: usize,

    /// Minimum gap (bytes) between a requested start and the current
    /// cache position before the request is served by an independent
    /// origin range download instead of the shared downloader.
    /// `None` disables split downloads.
    pub range_request_split_threshold: Option<u64>,

    /// Timeout for the initial response and for each inter-chunk gap,
    /// and the per-request socket write timeout on the loopback side.
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    /// Timeout for cache validation HEAD requests.
    #[serde(with = "duration_secs")]
    pub validate_timeout: Duration,

    /// Delay before the download loop retries after a network error.
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,

    /// When true, cached origin headers are copied into proxy responses.
    pub copy_cached_response_headers: bool,

    /// When true, an expired cache is revalidated with a HEAD request on
    /// stream creation.
    pub validate_outdated_cache: bool,

    /// When false, the partial file and its metadata are deleted when a
    /// stream is disposed before completion.
    pub save_partial_cache: bool,

    /// When false, the metadata file is deleted when a stream is
    /// disposed after completion.
    pub save_metadata: bool,

    /// When false, only the headers needed for caching decisions are
    /// persisted in the metadata file.
    pub save_all_headers: bool,

    /// Extra headers sent on every origin request.
    pub request_headers: HashMap<String, String>,

    /// Headers overriding the proxy's responses.
    pub response_headers: HashMap<String, String>,

    /// Directory holding cache files. Defaults to a subdirectory of the
    /// platform temp dir.
    pub cache_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 25 * 1024 * 1024,
            min_chunk_size: 64 * 1024,
            range_request_split_threshold: None,
            read_timeout: Duration::from_secs(30),
            validate_timeout: Duration::from_secs(15),
            retry_delay: Duration::from_secs(5),
            copy_cached_response_headers: false,
            validate_outdated_cache: false,
            save_partial_cache: true,
            save_metadata: true,
            save_all_headers: true,
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            cache_dir: None,
        }
    }
}

impl CacheConfig {
    /// Validate configuration values. Invalid values are an error for the
    /// caller, raised before any stream is created.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size < MIN_BUFFER_SIZE {
            return Err(CacheError::Config(format!(
                "max_buffer_size must be at least {} bytes, got {}",
                MIN_BUFFER_SIZE, self.max_buffer_size
            )));
        }

        if self.min_chunk_size == 0 {
            return Err(CacheError::Config(
                "min_chunk_size must be greater than 0".into(),
            ));
        }

        if self.min_chunk_size > self.max_buffer_size {
            return Err(CacheError::Config(format!(
                "min_chunk_size {} exceeds max_buffer_size {}",
                self.min_chunk_size, self.max_buffer_size
            )));
        }

        if self.read_timeout.is_zero() {
            return Err(CacheError::Config("read_timeout must be non-zero".into()));
        }

        if self.validate_timeout.is_zero() {
            return Err(CacheError::Config(
                "validate_timeout must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// The cache directory, falling back to `<temp>/http_cache_stream`.
    pub fn cache_directory(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("http_cache_stream"))
    }
}

/// Per-stream options layered over the global [`CacheConfig`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Extra headers for this stream's origin requests.
    pub request_headers: HashMap<String, String>,

    /// Headers overriding this stream's proxy responses.
    pub response_headers: HashMap<String, String>,

    /// When true (the default), stream headers are combined on top of the
    /// global headers; when false, only stream headers apply.
    pub use_global_headers: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamOptions {
    pub fn new() -> Self {
        Self {
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            use_global_headers: true,
        }
    }

    /// The effective origin request headers: global first, stream-level
    /// entries winning on conflict.
    pub fn combined_request_headers(&self, config: &CacheConfig) -> HashMap<String, String> {
        let mut headers = if self.use_global_headers {
            config.request_headers.clone()
        } else {
            HashMap::new()
        };
        headers.extend(
            self.request_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        headers
    }

    /// The effective proxy response header overrides.
    pub fn combined_response_headers(&self, config: &CacheConfig) -> HashMap<String, String> {
        let mut headers = if self.use_global_headers {
            config.response_headers.clone()
        } else {
            HashMap::new()
        };
        headers.extend(
            self.response_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        headers
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
