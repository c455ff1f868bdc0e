//! A local HTTP caching proxy for streamed media.
//!
//! A media player points at a loopback URL; the proxy fetches the origin
//! exactly once, streams bytes through as they arrive, persists them to a
//! partial cache file, and serves any later request for the same resource
//! (fully or partially, with byte ranges) from cache. Downloads resume
//! across restarts, resources can be pre-cached in the background, and
//! active playback always takes priority over pre-fetch.
//!
//! ```no_run
//! use spool::{CacheConfig, CacheManager};
//! use url::Url;
//!
//! # async fn demo() -> Result<(), spool::CacheError> {
//! let manager = CacheManager::new(CacheConfig::default()).await?;
//! let source = Url::parse("http://media.example.com/show/ep1.mp4").unwrap();
//!
//! let stream = manager.create_stream(source.clone()).await?;
//! let play_url = manager.proxy_url(&source)?;
//! // hand `play_url` to the player; it will be served through the cache
//!
//! stream.dispose(false).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod downloader;
mod error;
mod files;
mod headers;
mod manager;
mod priority;
mod range;
mod response;
mod server;
mod sink;
mod stream;
mod worker;


pub use config::{CacheConfig, StreamOptions, MIN_BUFFER_SIZE};
pub use error::{CacheError, Result};
pub use files::{CacheFiles, CacheMetadata, METADATA_SUFFIX, PARTIAL_SUFFIX};
pub use headers::CachedHeaders;
pub use manager::{CacheManager, CacheStats};
pub use priority::{PrecachePermit, PriorityGate};
pub use range::{parse_range_header, ByteRange};
pub use response::{ByteStream, StreamResponse};
pub use server::ProxyStats;
pub use stream::{CacheStream, ProgressEvent};
