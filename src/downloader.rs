use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::files::CacheMetadata;
use crate::headers::CachedHeaders;
use crate::range::ByteRange;
use crate::response::{CombinedResponse, DownloadResponse, FileResponse, StreamResponse};
use crate::sink::BufferedSink;
use crate::worker::WorkerHandle;

/// A client request waiting to be matched against the download's progress.
/// Owned by exactly one queue; completed at most once.
pub(crate) struct StreamRequest {
    pub range: ByteRange,
    pub responder: oneshot::Sender<Result<StreamResponse>>,
}

impl StreamRequest {
    pub fn complete(self, response: Result<StreamResponse>) {
        // The requester may have gone away; nothing to do then.
        let _ = self.responder.send(response);
    }
}

/// Pending requests for one cache stream. The queue outlives download
/// sessions so requests survive retries and reconnects.
#[derive(Default)]
pub(crate) struct RequestQueue {
    requests: StdMutex<Vec<StreamRequest>>,
}

impl RequestQueue {
    pub fn push(&self, request: StreamRequest) {
        self.requests
            .lock()
            .expect("request queue poisoned")
            .push(request);
    }

    pub fn take_all(&self) -> Vec<StreamRequest> {
        std::mem::take(&mut *self.requests.lock().expect("request queue poisoned"))
    }

    pub fn restore(&self, requests: Vec<StreamRequest>) {
        self.requests
            .lock()
            .expect("request queue poisoned")
            .extend(requests);
    }

    pub fn is_empty(&self) -> bool {
        self.requests
            .lock()
            .expect("request queue poisoned")
            .is_empty()
    }

    pub fn fail_all(&self, error: CacheError) {
        for request in self.take_all() {
            request.complete(Err(error.clone()));
        }
    }
}

/// State shared between a cache stream and its download sessions: the
/// latest origin headers and the pending request queue.
#[derive(Default)]
pub(crate) struct DownloadShared {
    pub headers: StdMutex<Option<CachedHeaders>>,
    pub queue: RequestQueue,
}

impl DownloadShared {
    pub fn headers(&self) -> Option<CachedHeaders> {
        self.headers.lock().expect("headers poisoned").clone()
    }

    pub fn set_headers(&self, headers: Option<CachedHeaders>) {
        *self.headers.lock().expect("headers poisoned") = headers;
    }
}

/// A live subscription to the downloader's byte broadcast.
#[derive(Debug)]
pub(crate) struct Subscription {
    /// Absolute offset of the first byte this subscription will observe.
    pub position: u64,
    pub rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    /// Bytes queued in the channel, shared with the publisher so it can
    /// enforce the per-subscriber cap.
    pub queued: Arc<AtomicUsize>,
}

struct BroadcastEntry {
    tx: mpsc::UnboundedSender<Result<Bytes>>,
    queued: Arc<AtomicUsize>,
}

struct BroadcastState {
    entries: Vec<BroadcastEntry>,
    /// Absolute offset up to which bytes have been published. Attaching
    /// and publishing share one lock, so a subscription's start position
    /// is exact: it sees every byte from `position` on, and none before.
    published: u64,
}

/// Fan-out of downloaded bytes to range readers. One publisher, N
/// subscribers, each with its own channel. A subscriber that stops reading
/// is cut off with [`CacheError::ExceededMaxBufferSize`] once its queued
/// bytes pass the cap, rather than stalling the download for everyone.
pub(crate) struct ByteBroadcast {
    state: StdMutex<BroadcastState>,
    max_queued: usize,
}

impl ByteBroadcast {
    pub fn new(max_queued: usize, base: u64) -> Self {
        Self {
            state: StdMutex::new(BroadcastState {
                entries: Vec::new(),
                published: base,
            }),
            max_queued,
        }
    }

    /// The highest offset already offered to subscribers.
    pub fn published(&self) -> u64 {
        self.state.lock().expect("broadcast poisoned").published
    }

    /// Attach a subscriber for a range starting at `min_start`, provided
    /// no byte at or past `min_start` has been published yet (otherwise
    /// the head of the range is unreachable and the caller must go through
    /// the cache file).
    pub fn subscribe_at(&self, min_start: u64) -> Option<Subscription> {
        let mut state = self.state.lock().expect("broadcast poisoned");
        if min_start < state.published {
            return None;
        }
        Some(Self::attach(&mut state))
    }

    /// Attach a subscriber at exactly the published position.
    pub fn subscribe_current(&self) -> Subscription {
        let mut state = self.state.lock().expect("broadcast poisoned");
        Self::attach(&mut state)
    }

    fn attach(state: &mut BroadcastState) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let position = state.published;
        state.entries.push(BroadcastEntry {
            tx,
            queued: queued.clone(),
        });
        Subscription {
            position,
            rx,
            queued,
        }
    }

    pub fn publish(&self, chunk: &Bytes) {
        let mut state = self.state.lock().expect("broadcast poisoned");
        state.published += chunk.len() as u64;
        let max_queued = self.max_queued;
        state.entries.retain(|entry| {
            let queued = entry.queued.load(Ordering::Acquire);
            if queued + chunk.len() > max_queued {
                let _ = entry
                    .tx
                    .send(Err(CacheError::ExceededMaxBufferSize(max_queued)));
                return false;
            }
            entry.queued.fetch_add(chunk.len(), Ordering::Release);
            entry.tx.send(Ok(chunk.clone())).is_ok()
        });
    }

    /// Deliver a terminal error to every subscriber and detach them.
    pub fn fail(&self, error: &CacheError) {
        let mut state = self.state.lock().expect("broadcast poisoned");
        for entry in state.entries.drain(..) {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    /// End of stream: dropping the senders closes every channel.
    pub fn finish(&self) {
        self.state
            .lock()
            .expect("broadcast poisoned")
            .entries
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().expect("broadcast poisoned").entries.len()
    }
}

/// One download session: a worker feeding a sink, with positions tracked
/// for request matching and a broadcast for attached readers.
///
/// Per-chunk ordering: append to sink, flush (inline under back-pressure,
/// in the background otherwise), advance the download position, match
/// pending requests, then publish — so a request that becomes satisfiable
/// by this chunk attaches before the chunk goes out and observes it on its
/// own subscription.
pub(crate) struct CacheDownloader {
    url: Url,
    config: Arc<CacheConfig>,
    shared: Arc<DownloadShared>,
    metadata: CacheMetadata,
    sink: Arc<BufferedSink>,
    worker: WorkerHandle,
    start_position: u64,
    received: AtomicU64,
    broadcast: ByteBroadcast,
    active: AtomicBool,
    failure: StdMutex<Option<CacheError>>,
    resumed_from_headers: Option<CachedHeaders>,
    /// Serializes the pause → flush → fulfill-combined → resume handover.
    processing: AtomicBool,
}

impl CacheDownloader {
    pub fn new(
        url: Url,
        config: Arc<CacheConfig>,
        shared: Arc<DownloadShared>,
        metadata: CacheMetadata,
        sink: Arc<BufferedSink>,
        worker: WorkerHandle,
        start_position: u64,
        resumed_from_headers: Option<CachedHeaders>,
    ) -> Self {
        let cap = config.max_buffer_size;
        Self {
            url,
            config,
            shared,
            metadata,
            sink,
            worker,
            start_position,
            received: AtomicU64::new(0),
            broadcast: ByteBroadcast::new(cap, start_position),
            active: AtomicBool::new(true),
            failure: StdMutex::new(None),
            resumed_from_headers,
            processing: AtomicBool::new(false),
        }
    }

    /// Total bytes received from the origin, as an absolute offset.
    pub fn download_position(&self) -> u64 {
        self.start_position + self.received.load(Ordering::Acquire)
    }

    /// The highest offset already offered on the broadcast.
    pub fn stream_position(&self) -> u64 {
        self.broadcast.published()
    }

    /// Durable bytes on disk, as an absolute offset.
    pub fn file_position(&self) -> u64 {
        self.start_position + self.sink.flushed_bytes()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcast.subscriber_count()
    }

    /// Record a failure raised outside the session loop (a background
    /// flush) and stop the worker; the session loop surfaces it.
    pub fn fail(&self, error: CacheError) {
        let mut failure = self.failure.lock().expect("failure poisoned");
        if failure.is_none() {
            *failure = Some(error);
        }
        drop(failure);
        self.worker.close();
    }

    pub fn take_failure(&self) -> Option<CacheError> {
        self.failure.lock().expect("failure poisoned").take()
    }

    /// First headers of the session. Validates a resume against the
    /// previously saved headers, records and persists the new snapshot,
    /// then matches pending requests.
    pub async fn on_headers(self: &Arc<Self>, headers: CachedHeaders) -> Result<()> {
        if self.start_position > 0 {
            if let Some(previous) = &self.resumed_from_headers {
                if !previous.matches(&headers) {
                    warn!("origin changed under resumed download of {}", self.url);
                    return Err(CacheError::SourceChanged);
                }
            }
        }

        self.shared.set_headers(Some(headers.clone()));
        self.persist_metadata(headers).await;
        self.process_requests(true).await;
        Ok(())
    }

    async fn persist_metadata(&self, headers: CachedHeaders) {
        let mut metadata = self.metadata.clone();
        metadata.headers = Some(headers);
        if let Err(e) = metadata.save(self.config.save_all_headers).await {
            // Metadata is best-effort; resuming just will not survive a
            // restart without it.
            warn!("failed to persist metadata for {}: {}", self.url, e);
        }
    }

    /// The ordered per-chunk protocol. Runs only on the session task.
    pub async fn on_chunk(self: &Arc<Self>, chunk: Bytes) -> Result<()> {
        self.sink.add(&chunk)?;

        if self.sink.buffer_size() > self.config.max_buffer_size {
            // Back-pressure: stop the origin until the disk catches up.
            let was_paused = self.worker.is_paused();
            self.worker.pause();
            self.sink.flush().await?;
            if !was_paused {
                self.worker.resume();
            }
        } else if !self.sink.is_flushing() {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.sink.flush().await {
                    this.fail(e);
                }
            });
        }

        self.received.fetch_add(chunk.len() as u64, Ordering::Release);

        self.process_requests(true).await;

        self.broadcast.publish(&chunk);
        Ok(())
    }

    /// End of body: make everything durable, verify the partial file
    /// length, promote it, and correct the headers when the origin never
    /// advertised a length.
    pub async fn on_complete(self: &Arc<Self>) -> Result<()> {
        self.sink.close(true).await?;
        self.active.store(false, Ordering::Release);

        let actual = self.metadata.files.partial_size().await.unwrap_or(0);
        let headers = self.shared.headers();
        let advertised = headers.as_ref().and_then(|h| h.source_length());
        let expected = advertised.unwrap_or_else(|| self.download_position());

        if actual != expected {
            return Err(CacheError::InvalidCacheLength { actual, expected });
        }

        self.metadata.files.promote().await?;
        info!("completed cache of {} ({} bytes)", self.url, actual);

        if advertised.is_none() {
            if let Some(headers) = headers {
                let corrected = headers.with_source_length(actual);
                self.shared.set_headers(Some(corrected.clone()));
                self.persist_metadata(corrected).await;
            }
        }

        self.broadcast.finish();
        self.process_requests(true).await;
        Ok(())
    }

    /// Tear down after a failed session, delivering `error` to every
    /// subscriber. Pending requests stay queued unless the error is
    /// terminal; the stream decides their fate.
    pub async fn abort(&self, error: &CacheError) {
        self.active.store(false, Ordering::Release);
        self.worker.close();
        if let Err(e) = self.sink.close(true).await {
            warn!("failed to close sink for {}: {}", self.url, e);
        }
        self.broadcast.fail(error);
    }

    /// Examine every pending request against the current positions and
    /// complete the satisfiable ones.
    ///
    /// `from_session` marks calls made by the session task itself (headers,
    /// chunk, completion). Only that task may run the combined handover —
    /// it is the sole publisher, so pausing the worker and flushing really
    /// does freeze the stream position. Requests needing a handover that
    /// surface on another task stay queued until the next chunk.
    pub async fn process_requests(self: &Arc<Self>, from_session: bool) {
        loop {
            let pending = self.shared.queue.take_all();
            if pending.is_empty() {
                return;
            }

            let mut deferred = Vec::new();
            let mut needs_handover = Vec::new();

            for request in pending {
                match self.try_fulfill(request, from_session) {
                    FulfillOutcome::Done => {}
                    FulfillOutcome::Defer(request) => deferred.push(request),
                    FulfillOutcome::NeedsHandover(request) => needs_handover.push(request),
                }
            }

            self.shared.queue.restore(deferred);

            if needs_handover.is_empty() {
                return;
            }
            if !self.handover_combined(needs_handover).await {
                return;
            }
            // The handover may have let deferred requests become
            // satisfiable; go around again.
        }
    }

    /// Decide how to serve one request, in order: not yet downloaded or
    /// headers unknown → defer; durable on disk → file; at or past the
    /// published position → live download (attach is atomic with the
    /// check); otherwise a combined response is needed.
    fn try_fulfill(self: &Arc<Self>, request: StreamRequest, from_session: bool) -> FulfillOutcome {
        if request.range.start > self.download_position() {
            return FulfillOutcome::Defer(request);
        }

        let headers = match self.shared.headers() {
            Some(headers) => headers,
            None => return FulfillOutcome::Defer(request),
        };

        let end_bound = request.range.end.or_else(|| headers.source_length());
        if let Some(end) = end_bound {
            if self.file_position() >= end {
                self.fulfill_file(request, end);
                return FulfillOutcome::Done;
            }
        }

        if !self.is_active() {
            return FulfillOutcome::Defer(request);
        }

        if let Some(subscription) = self.broadcast.subscribe_at(request.range.start) {
            self.fulfill_download(request, subscription);
            return FulfillOutcome::Done;
        }

        if !from_session {
            return FulfillOutcome::Defer(request);
        }

        // On the session task the published position cannot move under us:
        // if the disk has already caught up, the handover flush is free.
        if self.file_position() == self.broadcast.published() {
            let subscription = self.broadcast.subscribe_current();
            self.fulfill_combined(request, subscription);
            return FulfillOutcome::Done;
        }

        FulfillOutcome::NeedsHandover(request)
    }

    fn fulfill_file(&self, request: StreamRequest, end: u64) {
        let response = FileResponse::new(
            self.metadata.files.clone(),
            ByteRange {
                start: request.range.start,
                end: Some(end),
            },
            self.shared.headers(),
            self.config.min_chunk_size,
        );
        debug!(
            "serving {}..{} of {} from the cache file",
            request.range.start, end, self.url
        );
        request.complete(Ok(StreamResponse::File(response)));
    }

    fn fulfill_download(&self, request: StreamRequest, subscription: Subscription) {
        debug!(
            "serving {:?} of {} live from the download at {}",
            request.range, self.url, subscription.position
        );
        let response = DownloadResponse::new(subscription, request.range, self.shared.headers());
        request.complete(Ok(StreamResponse::Download(response)));
    }

    fn fulfill_combined(&self, request: StreamRequest, subscription: Subscription) {
        let switch = subscription.position;
        let headers = self.shared.headers();
        let file = FileResponse::new(
            self.metadata.files.clone(),
            ByteRange {
                start: request.range.start,
                end: Some(switch),
            },
            headers.clone(),
            self.config.min_chunk_size,
        );
        let download = DownloadResponse::new(
            subscription,
            ByteRange {
                start: switch,
                end: request.range.end,
            },
            headers,
        );
        debug!(
            "serving {:?} of {} as file+download combined at {}",
            request.range, self.url, switch
        );
        request.complete(Ok(StreamResponse::Combined(CombinedResponse::new(
            file, download,
        ))));
    }

    /// The file lags the broadcast: hold the origin, line the disk up with
    /// the published position, then hand each request over. Returns whether
    /// the queue should be examined again.
    async fn handover_combined(self: &Arc<Self>, requests: Vec<StreamRequest>) -> bool {
        if self.processing.swap(true, Ordering::AcqRel) {
            self.shared.queue.restore(requests);
            return false;
        }

        let was_paused = self.worker.is_paused();
        self.worker.pause();
        let result = self.sink.flush().await;
        let again = match result {
            Ok(()) => {
                // The flush moved the file position up to the download
                // position; a request whose end is now durable no longer
                // needs the download tail at all.
                let source_length = self.shared.headers().and_then(|h| h.source_length());
                for request in requests {
                    let end_bound = request.range.end.or(source_length);
                    match end_bound {
                        Some(end) if self.file_position() >= end => {
                            self.fulfill_file(request, end);
                        }
                        _ => {
                            let subscription = self.broadcast.subscribe_current();
                            self.fulfill_combined(request, subscription);
                        }
                    }
                }
                if !was_paused {
                    self.worker.resume();
                }
                true
            }
            Err(e) => {
                for request in requests {
                    request.complete(Err(e.clone()));
                }
                self.fail(e);
                false
            }
        };
        self.processing.store(false, Ordering::Release);
        again
    }
}

enum FulfillOutcome {
    Done,
    Defer(StreamRequest),
    NeedsHandover(StreamRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_delivers_in_order_to_all_subscribers() {
        let broadcast = ByteBroadcast::new(1024, 0);
        let mut a = broadcast.subscribe_at(0).unwrap();
        let mut b = broadcast.subscribe_at(0).unwrap();

        broadcast.publish(&Bytes::from_static(b"one"));
        broadcast.publish(&Bytes::from_static(b"two"));
        broadcast.finish();

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.rx.try_recv().unwrap().unwrap(), "one");
            assert_eq!(sub.rx.try_recv().unwrap().unwrap(), "two");
            assert!(sub.rx.try_recv().is_err());
        }
    }

    #[test]
    fn broadcast_tracks_published_position() {
        let broadcast = ByteBroadcast::new(1024, 500);
        assert_eq!(broadcast.published(), 500);

        broadcast.publish(&Bytes::from_static(b"12345"));
        assert_eq!(broadcast.published(), 505);

        // A range starting before the published position cannot attach.
        assert!(broadcast.subscribe_at(504).is_none());
        let sub = broadcast.subscribe_at(505).unwrap();
        assert_eq!(sub.position, 505);
        let ahead = broadcast.subscribe_at(999).unwrap();
        assert_eq!(ahead.position, 505);
    }

    #[test]
    fn broadcast_cuts_off_slow_subscriber() {
        let broadcast = ByteBroadcast::new(8, 0);
        let mut slow = broadcast.subscribe_at(0).unwrap();

        broadcast.publish(&Bytes::from_static(b"12345"));
        // 5 queued + 5 more exceeds the cap of 8
        broadcast.publish(&Bytes::from_static(b"67890"));

        assert_eq!(slow.rx.try_recv().unwrap().unwrap(), "12345");
        assert!(matches!(
            slow.rx.try_recv().unwrap(),
            Err(CacheError::ExceededMaxBufferSize(8))
        ));
        assert_eq!(broadcast.subscriber_count(), 0);
    }

    #[test]
    fn broadcast_skips_cutoff_when_reader_drains() {
        let broadcast = ByteBroadcast::new(8, 0);
        let mut sub = broadcast.subscribe_at(0).unwrap();

        broadcast.publish(&Bytes::from_static(b"12345"));
        let chunk = sub.rx.try_recv().unwrap().unwrap();
        sub.queued.fetch_sub(chunk.len(), Ordering::Release);

        broadcast.publish(&Bytes::from_static(b"67890"));
        assert_eq!(sub.rx.try_recv().unwrap().unwrap(), "67890");
        assert_eq!(broadcast.subscriber_count(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned_on_publish() {
        let broadcast = ByteBroadcast::new(1024, 0);
        let sub = broadcast.subscribe_at(0).unwrap();
        drop(sub);
        broadcast.publish(&Bytes::from_static(b"data"));
        assert_eq!(broadcast.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn chunk_protocol_tracks_positions_and_serves_from_file() {
        use std::collections::HashMap;
        use std::time::Duration;

        use crate::files::CacheFiles;
        use crate::headers::CachedHeaders;
        use crate::worker::DownloadWorker;

        let dir = tempfile::tempdir().unwrap();
        let files = CacheFiles::from_complete(dir.path().join("clip.mp4"));
        let url = Url::parse("http://example.com/clip.mp4").unwrap();
        let config = Arc::new(CacheConfig::default());

        let shared = Arc::new(DownloadShared::default());
        shared.set_headers(Some(CachedHeaders::from_pairs([(
            "Content-Length",
            "100",
        )])));

        let sink = Arc::new(
            crate::sink::BufferedSink::open(&files.partial, 0)
                .await
                .unwrap(),
        );
        let worker = DownloadWorker::new(
            reqwest::Client::new(),
            url.clone(),
            HashMap::new(),
            Arc::new(|| Some(0)),
            Duration::from_secs(30),
            Duration::from_secs(5),
            64 * 1024,
        );
        let metadata = CacheMetadata {
            url: url.clone(),
            files: files.clone(),
            headers: shared.headers(),
        };
        let downloader = Arc::new(CacheDownloader::new(
            url,
            config,
            shared.clone(),
            metadata,
            sink.clone(),
            worker.handle(),
            0,
            None,
        ));

        downloader.on_chunk(Bytes::from(vec![1u8; 10])).await.unwrap();
        assert_eq!(downloader.download_position(), 10);
        assert_eq!(downloader.stream_position(), 10);
        assert_eq!(downloader.subscriber_count(), 0);

        // The background flush catches the file position up.
        sink.flush().await.unwrap();
        assert_eq!(downloader.file_position(), 10);

        // A request covered by durable bytes is served from the file.
        let (tx, rx) = oneshot::channel();
        shared.queue.push(StreamRequest {
            range: ByteRange {
                start: 0,
                end: Some(5),
            },
            responder: tx,
        });
        downloader.process_requests(false).await;
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.kind(), "file");
    }

    #[tokio::test]
    async fn queue_failure_completes_every_request() {
        let queue = RequestQueue::default();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            queue.push(StreamRequest {
                range: ByteRange::full(),
                responder: tx,
            });
            receivers.push(rx);
        }

        queue.fail_all(CacheError::Disposed);
        assert!(queue.is_empty());
        for rx in receivers {
            assert_eq!(rx.await.unwrap().unwrap_err(), CacheError::Disposed);
        }
    }
}
