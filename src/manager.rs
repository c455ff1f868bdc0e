use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use once_cell::sync::OnceCell;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{CacheConfig, StreamOptions};
use crate::error::{CacheError, Result};
use crate::files::{METADATA_SUFFIX, PARTIAL_SUFFIX};
use crate::priority::PriorityGate;
use crate::server::CacheServer;
use crate::stream::CacheStream;

static GLOBAL: OnceCell<CacheManager> = OnceCell::new();

/// Live streams keyed by source URL. Lookups are cheap; the map is the
/// single place a stream is registered, and the stream's disposal hook is
/// the single place it is removed.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    streams: StdRwLock<HashMap<String, CacheStream>>,
}

impl StreamRegistry {
    pub fn get(&self, url: &Url) -> Option<CacheStream> {
        self.streams
            .read()
            .expect("registry poisoned")
            .get(url.as_str())
            .cloned()
    }

    pub fn insert(&self, stream: CacheStream) {
        self.streams
            .write()
            .expect("registry poisoned")
            .insert(stream.url().to_string(), stream);
    }

    pub fn remove(&self, url: &str) {
        self.streams.write().expect("registry poisoned").remove(url);
    }

    pub fn find_by_lookup_key(&self, key: &str) -> Option<CacheStream> {
        self.streams
            .read()
            .expect("registry poisoned")
            .values()
            .find(|s| s.lookup_key() == key)
            .cloned()
    }

    pub fn all(&self) -> Vec<CacheStream> {
        self.streams
            .read()
            .expect("registry poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Aggregate numbers for the cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub complete_files: u64,
    pub partial_files: u64,
    pub complete_bytes: u64,
    pub partial_bytes: u64,
}

struct ManagerInner {
    config: Arc<CacheConfig>,
    client: Client,
    registry: Arc<StreamRegistry>,
    server: CacheServer,
    priority: Arc<PriorityGate>,
}

/// The process-wide front object: deduplicates [`CacheStream`]s by source
/// URL, owns the shared HTTP client (unless one is injected), runs the
/// loopback server, trims the cache directory, and schedules pre-caching
/// behind the playback priority gate.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Create a manager with its own HTTP client.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(config, client).await
    }

    /// Create a manager around an injected HTTP client.
    pub async fn with_client(config: CacheConfig, client: Client) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        tokio::fs::create_dir_all(config.cache_directory())
            .await
            .map_err(|e| CacheError::write(&e))?;

        let registry = Arc::new(StreamRegistry::default());
        let server = CacheServer::start(registry.clone(), config.clone()).await?;
        info!("cache proxy listening on {}", server.addr());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                client,
                registry,
                server,
                priority: Arc::new(PriorityGate::new()),
            }),
        })
    }

    /// Install `manager` as the process-wide instance. May be called once.
    pub fn init_global(manager: CacheManager) -> Result<()> {
        GLOBAL
            .set(manager)
            .map_err(|_| CacheError::Config("global cache manager already initialized".into()))
    }

    /// The process-wide instance. An error before [`init_global`].
    pub fn global() -> Result<&'static CacheManager> {
        GLOBAL
            .get()
            .ok_or_else(|| CacheError::Config("global cache manager not initialized".into()))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn port(&self) -> u16 {
        self.inner.server.port()
    }

    pub fn priority(&self) -> &Arc<PriorityGate> {
        &self.inner.priority
    }

    /// The loopback URL a player should use for a source URL: same path
    /// and query, scheme/host/port rewritten to this proxy.
    pub fn proxy_url(&self, source: &Url) -> Result<Url> {
        self.inner.server.proxy_url(source)
    }

    /// Get or create the stream for a source URL. An existing stream is
    /// retained and shared; a new one starts with a retain count of one.
    pub async fn create_stream(&self, url: Url) -> Result<CacheStream> {
        self.create_stream_with_options(url, StreamOptions::new())
            .await
    }

    pub async fn create_stream_with_options(
        &self,
        url: Url,
        options: StreamOptions,
    ) -> Result<CacheStream> {
        if let Some(existing) = self.inner.registry.get(&url) {
            match existing.retain().await {
                Ok(()) => return Ok(existing),
                // Lost a race with disposal; fall through and replace it.
                Err(CacheError::Disposed) => {}
                Err(e) => return Err(e),
            }
        }

        debug!("creating cache stream for {}", url);
        let stream = CacheStream::open(
            url.clone(),
            self.inner.config.clone(),
            options,
            self.inner.client.clone(),
        )
        .await;

        let registry = self.inner.registry.clone();
        let key = url.to_string();
        stream.set_on_dispose(Box::new(move || registry.remove(&key)));

        self.inner.registry.insert(stream.clone());
        Ok(stream)
    }

    /// The stream for a source URL, if one is live.
    pub fn get_stream(&self, url: &Url) -> Option<CacheStream> {
        self.inner.registry.get(url)
    }

    /// Download a resource into the cache without an attached player,
    /// yielding to active playback. The stream is disposed afterwards.
    pub async fn pre_cache(&self, url: Url) -> Result<PathBuf> {
        let stream = self.create_stream(url).await?;
        let permit = self.inner.priority.acquire(stream.clone()).await;

        let result = stream.download().await;
        drop(permit);
        stream.dispose(false).await?;
        result
    }

    /// Signal that playback started; pre-caching pauses while any playback
    /// is active.
    pub async fn playback_started(&self) {
        self.inner.priority.playback_started().await;
    }

    pub async fn playback_finished(&self) {
        self.inner.priority.playback_finished().await;
    }

    /// Walk the cache directory and delete files no live stream claims.
    /// With `partial_only`, only `.part` files and orphaned `.metadata`
    /// files (whose complete file is gone) are removed. Returns the bytes
    /// freed.
    pub async fn delete_cache(&self, partial_only: bool) -> Result<u64> {
        let root = self.inner.config.cache_directory();
        let claimed: Vec<PathBuf> = self
            .inner
            .registry
            .all()
            .iter()
            .flat_map(|s| {
                let files = s.files();
                [
                    files.complete.clone(),
                    files.partial.clone(),
                    files.metadata.clone(),
                ]
            })
            .collect();

        let mut freed = 0u64;
        let mut directories = vec![root.clone()];
        while let Some(dir) = directories.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    directories.push(path);
                    continue;
                }
                if claimed.iter().any(|c| c == &path) {
                    continue;
                }
                if partial_only && !is_trimmable_partial(&path).await {
                    continue;
                }

                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!("trimmed cache file {:?}", path);
                        freed += size;
                    }
                    Err(e) => warn!("failed to trim {:?}: {}", path, e),
                }
            }
        }

        if freed > 0 {
            info!("cache trim freed {} bytes", freed);
        }
        Ok(freed)
    }

    /// Aggregate file counts and byte totals for the cache directory.
    pub async fn cache_stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        let mut directories = vec![self.inner.config.cache_directory()];
        while let Some(dir) = directories.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                match entry.file_type().await {
                    Ok(t) if t.is_dir() => {
                        directories.push(path);
                        continue;
                    }
                    Ok(_) => {}
                    Err(_) => continue,
                }
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                let name = path.to_string_lossy();
                if name.ends_with(PARTIAL_SUFFIX) {
                    stats.partial_files += 1;
                    stats.partial_bytes += size;
                } else if !name.ends_with(METADATA_SUFFIX) {
                    stats.complete_files += 1;
                    stats.complete_bytes += size;
                }
            }
        }
        stats
    }

    /// Shut down: stop the server and dispose every stream. The owned
    /// client drops with the manager.
    pub async fn dispose(&self) -> Result<()> {
        info!("disposing cache manager");
        self.inner.server.shutdown().await;
        for stream in self.inner.registry.all() {
            stream.dispose(true).await?;
        }
        Ok(())
    }
}

/// Whether a path is fair game for a partial-only trim: `.part` files
/// always, `.metadata` files only when their complete file is gone.
async fn is_trimmable_partial(path: &Path) -> bool {
    let name = path.to_string_lossy();
    if name.ends_with(PARTIAL_SUFFIX) {
        return true;
    }
    if let Some(complete) = name.strip_suffix(METADATA_SUFFIX) {
        return !tokio::fs::try_exists(Path::new(complete)).await.unwrap_or(false);
    }
    false
}
