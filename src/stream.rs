use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue, ACCEPT_ENCODING};
use reqwest::Client;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{CacheConfig, StreamOptions};
use crate::downloader::{CacheDownloader, DownloadShared, StreamRequest};
use crate::error::{CacheError, Result};
use crate::files::{CacheFiles, CacheMetadata};
use crate::headers::CachedHeaders;
use crate::range::ByteRange;
use crate::response::{FileResponse, SplitRangeResponse, StreamResponse};
use crate::sink::BufferedSink;
use crate::worker::{DownloadWorker, WorkerEvent};

/// Events published on a stream's progress channel. Progress values are
/// rounded to two decimals; `1.0` is published only once the complete
/// file exists.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Progress(f64),
    Error(CacheError),
}

struct StreamState {
    downloader: Option<Arc<CacheDownloader>>,
    loop_running: bool,
    download_waiters: Vec<oneshot::Sender<Result<PathBuf>>>,
    retain_count: usize,
    disposed: bool,
}

pub(crate) struct StreamInner {
    url: Url,
    files: CacheFiles,
    config: Arc<CacheConfig>,
    options: StreamOptions,
    client: Client,
    shared: Arc<DownloadShared>,
    state: Mutex<StreamState>,
    validating: AtomicBool,
    validation_done: Notify,
    progress_tx: StdMutex<Option<broadcast::Sender<ProgressEvent>>>,
    last_progress: StdMutex<Option<f64>>,
    last_error: StdMutex<Option<CacheError>>,
    on_dispose: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// One cached resource: the proxy-side object binding a source URL, its
/// cache files, at most one active downloader, and the queue of client
/// requests against it. Created and deduplicated by the manager; kept
/// alive by its retain count and torn down by [`dispose`](Self::dispose).
#[derive(Clone)]
pub struct CacheStream {
    inner: Arc<StreamInner>,
}

impl CacheStream {
    /// Open (or re-open) the stream for a source URL, loading any metadata
    /// left by a previous run so the download can resume.
    pub(crate) async fn open(
        url: Url,
        config: Arc<CacheConfig>,
        options: StreamOptions,
        client: Client,
    ) -> Self {
        let files = CacheFiles::for_url(&config.cache_directory(), &url);
        let metadata = CacheMetadata::load(url.clone(), files.clone()).await;

        let shared = Arc::new(DownloadShared::default());
        // A partial file is only trustworthy alongside its metadata.
        if metadata.headers.is_some() || files.complete_size().await.is_some() {
            shared.set_headers(metadata.headers.clone());
        } else {
            files.delete_partial().await;
        }

        let (progress_tx, _) = broadcast::channel(64);
        let inner = Arc::new(StreamInner {
            url,
            files,
            config,
            options,
            client,
            shared,
            state: Mutex::new(StreamState {
                downloader: None,
                loop_running: false,
                download_waiters: Vec::new(),
                retain_count: 1,
                disposed: false,
            }),
            validating: AtomicBool::new(false),
            validation_done: Notify::new(),
            progress_tx: StdMutex::new(Some(progress_tx)),
            last_progress: StdMutex::new(None),
            last_error: StdMutex::new(None),
            on_dispose: StdMutex::new(None),
        });

        let stream = Self { inner };
        if stream.inner.config.validate_outdated_cache {
            if let Err(e) = stream.validate_cache(false, true).await {
                warn!("cache validation for {} failed: {}", stream.inner.url, e);
            }
        }
        stream
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn files(&self) -> &CacheFiles {
        &self.inner.files
    }

    /// The loopback lookup key: path plus query of the source URL.
    pub fn lookup_key(&self) -> String {
        lookup_key_of(&self.inner.url)
    }

    pub fn headers(&self) -> Option<CachedHeaders> {
        self.inner.shared.headers()
    }

    pub(crate) fn response_header_overrides(&self) -> HashMap<String, String> {
        self.inner
            .options
            .combined_response_headers(&self.inner.config)
    }

    pub fn last_error(&self) -> Option<CacheError> {
        self.inner.last_error.lock().expect("last_error poisoned").clone()
    }

    /// Latest progress value, `None` while the source length is unknown.
    pub fn progress(&self) -> Option<f64> {
        *self.inner.last_progress.lock().expect("progress poisoned")
    }

    /// Subscribe to progress updates and inline errors.
    pub fn progress_stream(&self) -> broadcast::Receiver<ProgressEvent> {
        let guard = self.inner.progress_tx.lock().expect("progress poisoned");
        match &*guard {
            Some(tx) => tx.subscribe(),
            // Disposed: hand out an already-closed channel.
            None => broadcast::channel(1).1,
        }
    }

    /// Whether the resource is fully cached on disk.
    pub async fn is_cached(&self) -> bool {
        self.inner.files.complete_size().await.is_some()
    }

    /// Increment the retain count. Illegal once disposed.
    pub async fn retain(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.disposed {
            return Err(CacheError::Disposed);
        }
        state.retain_count += 1;
        Ok(())
    }

    /// Request a byte range of the resource. Fully cached content is
    /// served from the file immediately; a far seek beyond the configured
    /// split threshold is served by an independent origin download; every
    /// other request is queued against the shared downloader.
    pub async fn request(&self, range: ByteRange) -> Result<StreamResponse> {
        let inner = &self.inner;

        loop {
            // Register before checking, or a wake between the check and the
            // await is lost.
            let mut wait = std::pin::pin!(inner.validation_done.notified());
            wait.as_mut().enable();
            if !inner.validating.load(Ordering::Acquire) {
                break;
            }
            wait.await;
        }

        if inner.state.lock().await.disposed {
            return Err(CacheError::Disposed);
        }

        let headers = inner.shared.headers();
        if let Some(length) = headers.as_ref().and_then(|h| h.source_length()) {
            range.validate_against(length)?;
        }

        // Fully cached: no downloader involved.
        if let Some(size) = inner.files.complete_size().await {
            range.validate_against(size)?;
            let end = range.end.unwrap_or(size);
            return Ok(StreamResponse::File(FileResponse::new(
                inner.files.clone(),
                ByteRange {
                    start: range.start,
                    end: Some(end),
                },
                headers,
                inner.config.min_chunk_size,
            )));
        }

        if let Some(threshold) = inner.config.range_request_split_threshold {
            let position = self.cache_position().await;
            let supports_ranges = headers
                .as_ref()
                .map(|h| h.accepts_range_requests())
                .unwrap_or(false);
            if supports_ranges && range.start > position.saturating_add(threshold) {
                debug!(
                    "far seek to {} (cache at {}); bypassing shared download",
                    range.start, position
                );
                let response = SplitRangeResponse::open(
                    &inner.client,
                    &inner.url,
                    &inner.options.combined_request_headers(&inner.config),
                    range,
                    headers,
                    inner.config.min_chunk_size,
                    inner.config.read_timeout,
                )
                .await?;
                return Ok(StreamResponse::SplitRange(response));
            }
        }

        let (tx, rx) = oneshot::channel();
        inner.shared.queue.push(StreamRequest {
            range,
            responder: tx,
        });

        self.ensure_download_loop().await;
        let downloader = inner.state.lock().await.downloader.clone();
        if let Some(downloader) = downloader {
            downloader.process_requests(false).await;
        }

        rx.await.map_err(|_| CacheError::ResponseCancelled)?
    }

    /// Download the whole resource to the cache. Idempotent; resolves with
    /// the complete file path once the partial file has been promoted.
    pub async fn download(&self) -> Result<PathBuf> {
        if let Some(size) = self.inner.files.complete_size().await {
            debug!("{} already cached ({} bytes)", self.inner.url, size);
            return Ok(self.inner.files.complete.clone());
        }

        let rx = {
            let mut state = self.inner.state.lock().await;
            if state.disposed {
                return Err(CacheError::Disposed);
            }
            let (tx, rx) = oneshot::channel();
            state.download_waiters.push(tx);
            rx
        };

        self.ensure_download_loop().await;
        rx.await.map_err(|_| CacheError::DownloadStopped)?
    }

    /// Revalidate the cached resource against the origin with a HEAD
    /// request. Returns `None` when there is nothing to validate (no cache
    /// file, a download in progress, no stored headers, or a fresh cache
    /// without `force`).
    pub async fn validate_cache(&self, force: bool, reset_invalid: bool) -> Result<Option<bool>> {
        let inner = &self.inner;

        {
            let state = inner.state.lock().await;
            if state.loop_running || state.disposed {
                return Ok(None);
            }
        }

        let has_cache = inner.files.complete_size().await.is_some()
            || inner.files.partial_size().await.is_some();
        if !has_cache {
            return Ok(None);
        }

        let Some(previous) = inner.shared.headers() else {
            return Ok(None);
        };
        if !force && !previous.should_revalidate(Utc::now()) {
            return Ok(None);
        }

        if inner.validating.swap(true, Ordering::AcqRel) {
            // Another validation is already running; wait it out and report
            // nothing new.
            loop {
                let mut wait = std::pin::pin!(inner.validation_done.notified());
                wait.as_mut().enable();
                if !inner.validating.load(Ordering::Acquire) {
                    break;
                }
                wait.await;
            }
            return Ok(None);
        }

        let result = self.head_origin().await;
        inner.validating.store(false, Ordering::Release);
        inner.validation_done.notify_waiters();

        let next = result?;
        let valid = previous.matches(&next);
        if !valid {
            info!("cached copy of {} is no longer valid", inner.url);
            if reset_invalid {
                self.reset_cache().await;
            }
        }
        Ok(Some(valid))
    }

    async fn head_origin(&self) -> Result<CachedHeaders> {
        let inner = &self.inner;
        let mut request = inner
            .client
            .head(inner.url.clone())
            .header(ACCEPT_ENCODING, "identity");
        for (name, value) in inner.options.combined_request_headers(&inner.config) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                request = request.header(name, value);
            }
        }

        let response = tokio::time::timeout(inner.config.validate_timeout, request.send())
            .await
            .map_err(|_| CacheError::RequestTimedOut(inner.config.validate_timeout))?
            .map_err(|e| CacheError::network(&e))?;

        if !response.status().is_success() {
            return Err(CacheError::HttpStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(CachedHeaders::from_response(response.headers(), true))
    }

    /// Throw away the cached bytes and headers. An active download is
    /// cancelled with a reset (which the download loop does not surface as
    /// an error) and restarted when requests are still waiting.
    pub async fn reset_cache(&self) {
        let downloader = {
            let state = self.inner.state.lock().await;
            state.downloader.clone()
        };

        if let Some(downloader) = downloader {
            // The download loop observes the reset, clears the files and
            // restarts as needed.
            downloader.fail(CacheError::CacheReset);
            return;
        }

        self.inner.reset_files().await;
        if !self.inner.shared.queue.is_empty() {
            self.ensure_download_loop().await;
        }
    }

    /// Decrement the retain count; at zero the stream shuts down: the
    /// downloader is cancelled with a clean flush, queued requests and
    /// download waiters fail, the progress channel closes, and partial
    /// artifacts are removed according to the configuration.
    pub async fn dispose(&self, force: bool) -> Result<()> {
        let inner = &self.inner;
        let (downloader, waiters) = {
            let mut state = inner.state.lock().await;
            if state.disposed {
                return Ok(());
            }
            state.retain_count = if force {
                0
            } else {
                state.retain_count.saturating_sub(1)
            };
            if state.retain_count > 0 {
                return Ok(());
            }
            state.disposed = true;
            (
                state.downloader.take(),
                std::mem::take(&mut state.download_waiters),
            )
        };

        info!("disposing cache stream for {}", inner.url);

        if let Some(hook) = inner.on_dispose.lock().expect("dispose hook poisoned").take() {
            hook();
        }

        if let Some(downloader) = downloader {
            downloader.fail(CacheError::Disposed);
        }
        inner.shared.queue.fail_all(CacheError::Disposed);
        for waiter in waiters {
            let _ = waiter.send(Err(CacheError::Disposed));
        }

        // Closing the channel tells subscribers the stream is gone.
        inner.progress_tx.lock().expect("progress poisoned").take();

        let completed = inner.files.complete_size().await.is_some();
        if !completed && !inner.config.save_partial_cache {
            inner.files.delete_partial().await;
            inner.files.delete_metadata().await;
        }
        if completed && !inner.config.save_metadata {
            inner.files.delete_metadata().await;
        }

        Ok(())
    }

    pub(crate) fn set_on_dispose(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.inner.on_dispose.lock().expect("dispose hook poisoned") = Some(hook);
    }

    /// Pause the stream's active download, for pre-cache throttling.
    pub async fn suspend(&self) {
        if let Some(downloader) = self.inner.state.lock().await.downloader.clone() {
            downloader.worker().pause();
        }
    }

    /// Resume a suspended download.
    pub async fn resume(&self) {
        if let Some(downloader) = self.inner.state.lock().await.downloader.clone() {
            downloader.worker().resume();
        }
    }

    /// The highest byte position the cache has reached: the live download
    /// position when active, the partial file size otherwise.
    async fn cache_position(&self) -> u64 {
        if let Some(downloader) = self.inner.state.lock().await.downloader.clone() {
            return downloader.download_position();
        }
        self.inner
            .files
            .partial_size()
            .await
            .or(self.inner.files.complete_size().await)
            .unwrap_or(0)
    }

    async fn ensure_download_loop(&self) {
        let mut state = self.inner.state.lock().await;
        if state.loop_running || state.disposed {
            return;
        }
        state.loop_running = true;
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_download_loop(inner).await;
        });
    }
}

fn lookup_key_of(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

impl StreamInner {
    fn emit_progress(&self, value: f64) {
        let rounded = (value * 100.0).floor() / 100.0;
        let mut last = self.last_progress.lock().expect("progress poisoned");
        if *last == Some(rounded) {
            return;
        }
        *last = Some(rounded);
        if let Some(tx) = &*self.progress_tx.lock().expect("progress poisoned") {
            let _ = tx.send(ProgressEvent::Progress(rounded));
        }
    }

    fn emit_error(&self, error: &CacheError) {
        // A reset is a deliberate transition, not a failure.
        if matches!(error, CacheError::CacheReset) {
            return;
        }
        *self.last_error.lock().expect("last_error poisoned") = Some(error.clone());
        if let Some(tx) = &*self.progress_tx.lock().expect("progress poisoned") {
            let _ = tx.send(ProgressEvent::Error(error.clone()));
        }
    }

    async fn reset_files(&self) {
        debug!("resetting cache files for {}", self.url);
        self.files.delete_partial().await;
        self.files.delete_complete().await;
        self.files.delete_metadata().await;
        self.shared.set_headers(None);
        *self.last_progress.lock().expect("progress poisoned") = None;
        self.emit_progress(0.0);
    }

    async fn is_retained(&self) -> bool {
        let state = self.state.lock().await;
        !state.disposed && state.retain_count > 0
    }
}

/// The stream's download loop: one session per iteration, retrying after
/// network errors, resetting after cache-consistency errors, finishing
/// when the partial file has been promoted.
async fn run_download_loop(inner: Arc<StreamInner>) {
    loop {
        if inner.files.complete_size().await.is_some() {
            finish_loop(&inner, Ok(inner.files.complete.clone())).await;
            inner.emit_progress(1.0);
            return;
        }

        match run_session(&inner).await {
            Ok(()) => {
                finish_loop(&inner, Ok(inner.files.complete.clone())).await;
                inner.emit_progress(1.0);
                return;
            }
            Err(e) if e.is_terminal() => {
                finish_loop(&inner, Err(e)).await;
                return;
            }
            Err(e) if e.is_invalid_cache() => {
                inner.emit_error(&e);
                inner.reset_files().await;
                let restart =
                    inner.is_retained().await || !inner.shared.queue.is_empty();
                if !restart {
                    finish_loop(&inner, Err(CacheError::DownloadStopped)).await;
                    return;
                }
                info!("cache for {} was reset; restarting download", inner.url);
            }
            Err(e) => {
                inner.emit_error(&e);
                if !inner.is_retained().await {
                    inner.shared.queue.fail_all(e.clone());
                    finish_loop(&inner, Err(CacheError::DownloadStopped)).await;
                    return;
                }
                warn!(
                    "download of {} failed ({}); retrying in {:?}",
                    inner.url, e, inner.config.retry_delay
                );
                tokio::time::sleep(inner.config.retry_delay).await;
            }
        }
    }
}

async fn finish_loop(inner: &Arc<StreamInner>, result: Result<PathBuf>) {
    let waiters = {
        let mut state = inner.state.lock().await;
        state.loop_running = false;
        state.downloader = None;
        std::mem::take(&mut state.download_waiters)
    };
    if let Err(e) = &result {
        inner.shared.queue.fail_all(e.clone());
        inner.emit_error(e);
    }
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

/// One download session: build the sink/worker/downloader triple and pump
/// worker events through the per-chunk protocol until the body ends.
async fn run_session(inner: &Arc<StreamInner>) -> Result<()> {
    let saved_headers = inner.shared.headers();
    let can_resume = saved_headers
        .as_ref()
        .map(|h| h.can_resume_download())
        .unwrap_or(false);
    let start = if can_resume {
        inner.files.partial_size().await.unwrap_or(0)
    } else {
        0
    };

    let sink = Arc::new(BufferedSink::open(&inner.files.partial, start).await?);

    let downloader_slot: Arc<StdMutex<Option<Arc<CacheDownloader>>>> =
        Arc::new(StdMutex::new(None));
    let provider_slot = downloader_slot.clone();
    let provider_shared = inner.shared.clone();
    let range_provider = Arc::new(move || {
        let position = provider_slot
            .lock()
            .ok()?
            .as_ref()
            .map(|d| d.download_position())?;
        if position == 0 {
            return Some(0);
        }
        let resumable = provider_shared
            .headers()
            .map(|h| h.can_resume_download())
            .unwrap_or(false);
        resumable.then_some(position)
    });

    let mut worker = DownloadWorker::new(
        inner.client.clone(),
        inner.url.clone(),
        inner.options.combined_request_headers(&inner.config),
        range_provider,
        inner.config.read_timeout,
        inner.config.retry_delay,
        inner.config.min_chunk_size,
    );

    let metadata = CacheMetadata {
        url: inner.url.clone(),
        files: inner.files.clone(),
        headers: saved_headers.clone(),
    };
    let downloader = Arc::new(CacheDownloader::new(
        inner.url.clone(),
        inner.config.clone(),
        inner.shared.clone(),
        metadata,
        sink,
        worker.handle(),
        start,
        saved_headers,
    ));
    *downloader_slot.lock().expect("downloader slot poisoned") = Some(downloader.clone());

    {
        let mut state = inner.state.lock().await;
        if state.disposed {
            downloader.abort(&CacheError::Disposed).await;
            return Err(CacheError::Disposed);
        }
        state.downloader = Some(downloader.clone());
    }

    info!("starting download of {} at byte {}", inner.url, start);

    let source_length = || inner.shared.headers().and_then(|h| h.source_length());

    let result = loop {
        match worker.next_event().await {
            Ok(Some(WorkerEvent::Headers(headers))) => {
                if let Err(e) = downloader.on_headers(headers).await {
                    break Err(e);
                }
            }
            Ok(Some(WorkerEvent::Data(chunk))) => {
                if let Err(e) = downloader.on_chunk(chunk).await {
                    break Err(e);
                }
                if let Some(length) = source_length() {
                    if length > 0 {
                        let ratio = downloader.download_position() as f64 / length as f64;
                        // 1.0 is reserved for the promoted file.
                        inner.emit_progress(ratio.min(0.99));
                    }
                }
            }
            Ok(None) => break downloader.on_complete().await,
            Err(e) => {
                // A failure recorded by a background flush or a cancel wins
                // over the worker's generic stop error.
                break Err(downloader.take_failure().unwrap_or(e));
            }
        }
    };

    if let Err(e) = &result {
        downloader.abort(e).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_key_includes_query() {
        let url = Url::parse("http://media.example.com/a/b.mp4?token=x").unwrap();
        assert_eq!(lookup_key_of(&url), "/a/b.mp4?token=x");

        let plain = Url::parse("http://media.example.com/a/b.mp4").unwrap();
        assert_eq!(lookup_key_of(&plain), "/a/b.mp4");
    }

    #[tokio::test]
    async fn retain_and_dispose_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(CacheConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let stream = CacheStream::open(
            Url::parse("http://example.com/video.mp4").unwrap(),
            config,
            StreamOptions::new(),
            Client::new(),
        )
        .await;

        stream.retain().await.unwrap();
        // First dispose only drops the extra retain.
        stream.dispose(false).await.unwrap();
        assert!(stream.retain().await.is_ok());

        stream.dispose(false).await.unwrap();
        stream.dispose(false).await.unwrap();
        assert!(matches!(stream.retain().await, Err(CacheError::Disposed)));

        // Idempotent: disposing again changes nothing.
        stream.dispose(false).await.unwrap();
        let range = ByteRange::full();
        assert!(matches!(
            stream.request(range).await,
            Err(CacheError::Disposed)
        ));
    }

    #[tokio::test]
    async fn force_dispose_skips_remaining_retains() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(CacheConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let stream = CacheStream::open(
            Url::parse("http://example.com/video.mp4").unwrap(),
            config,
            StreamOptions::new(),
            Client::new(),
        )
        .await;

        stream.retain().await.unwrap();
        stream.retain().await.unwrap();
        stream.dispose(true).await.unwrap();
        assert!(matches!(stream.retain().await, Err(CacheError::Disposed)));
    }

    #[tokio::test]
    async fn disposal_hook_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(CacheConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let stream = CacheStream::open(
            Url::parse("http://example.com/video.mp4").unwrap(),
            config,
            StreamOptions::new(),
            Client::new(),
        )
        .await;

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        stream.set_on_dispose(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        stream.dispose(false).await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
