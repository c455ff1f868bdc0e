use std::collections::HashMap;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use url::Url;

use crate::downloader::Subscription;
use crate::error::{CacheError, Result};
use crate::files::CacheFiles;
use crate::headers::{content_range_start, normalize_partial_headers, CachedHeaders};
use crate::range::ByteRange;

/// The byte stream of a response, clamped to its served range.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// How a client request is being served. Dropping a response cancels it:
/// file handles close, broadcast subscriptions detach and free their
/// buffers, split-range origin connections are torn down.
#[derive(Debug)]
pub enum StreamResponse {
    /// Entirely from the cache file on disk.
    File(FileResponse),
    /// Live from the shared download's broadcast.
    Download(DownloadResponse),
    /// A cache-file prefix seamlessly followed by the live download.
    Combined(CombinedResponse),
    /// An independent origin range request bypassing the shared download.
    SplitRange(SplitRangeResponse),
}

impl StreamResponse {
    pub fn headers(&self) -> Option<&CachedHeaders> {
        match self {
            StreamResponse::File(r) => r.headers.as_ref(),
            StreamResponse::Download(r) => r.headers.as_ref(),
            StreamResponse::Combined(r) => r.file.headers.as_ref(),
            StreamResponse::SplitRange(r) => r.headers.as_ref(),
        }
    }

    /// The range this response serves. The end is `None` only when the
    /// resource length is still unknown.
    pub fn range(&self) -> ByteRange {
        match self {
            StreamResponse::File(r) => r.range,
            StreamResponse::Download(r) => r.range,
            StreamResponse::Combined(r) => ByteRange {
                start: r.file.range.start,
                end: r.download.range.end,
            },
            StreamResponse::SplitRange(r) => r.range,
        }
    }

    pub fn source_length(&self) -> Option<u64> {
        self.headers().and_then(|h| h.source_length())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamResponse::File(_) => "file",
            StreamResponse::Download(_) => "download",
            StreamResponse::Combined(_) => "combined",
            StreamResponse::SplitRange(_) => "split-range",
        }
    }

    pub fn into_stream(self) -> ByteStream {
        match self {
            StreamResponse::File(r) => r.into_stream(),
            StreamResponse::Download(r) => r.into_stream(),
            StreamResponse::Combined(r) => r.into_stream(),
            StreamResponse::SplitRange(r) => r.into_stream(),
        }
    }
}

/// Serves `[start, end)` from the cache file. Prefers the complete file
/// and falls back to the partial file, whose prefix is valid by the
/// file-position check that admitted this response.
#[derive(Debug)]
pub struct FileResponse {
    files: CacheFiles,
    pub(crate) range: ByteRange,
    pub(crate) headers: Option<CachedHeaders>,
    chunk_size: usize,
}

impl FileResponse {
    pub(crate) fn new(
        files: CacheFiles,
        range: ByteRange,
        headers: Option<CachedHeaders>,
        chunk_size: usize,
    ) -> Self {
        debug_assert!(range.end.is_some(), "file responses need a bounded range");
        Self {
            files,
            range,
            headers,
            chunk_size,
        }
    }

    pub fn into_stream(self) -> ByteStream {
        Box::pin(stream! {
            let end = match self.range.end {
                Some(end) => end,
                None => {
                    yield Err(CacheError::InvalidRange(
                        "file response with unbounded range".into(),
                    ));
                    return;
                }
            };

            let path = if tokio::fs::try_exists(&self.files.complete)
                .await
                .unwrap_or(false)
            {
                &self.files.complete
            } else {
                &self.files.partial
            };

            let mut file = match tokio::fs::File::open(path).await {
                Ok(file) => file,
                Err(e) => {
                    yield Err(CacheError::write(&e));
                    return;
                }
            };
            if let Err(e) = file.seek(SeekFrom::Start(self.range.start)).await {
                yield Err(CacheError::write(&e));
                return;
            }

            let mut remaining = end.saturating_sub(self.range.start);
            while remaining > 0 {
                let take = (self.chunk_size as u64).min(remaining) as usize;
                let mut buf = vec![0u8; take];
                match file.read(&mut buf).await {
                    Ok(0) => {
                        yield Err(CacheError::Write(
                            "cache file ended before the served range".into(),
                        ));
                        return;
                    }
                    Ok(n) => {
                        buf.truncate(n);
                        remaining -= n as u64;
                        yield Ok(Bytes::from(buf));
                    }
                    Err(e) => {
                        yield Err(CacheError::write(&e));
                        return;
                    }
                }
            }
        })
    }
}

/// Serves bytes live from the shared download's broadcast, attached at the
/// stream position. Bytes before the requested start are clipped off the
/// head, the tail is clipped at the requested end, and the response then
/// terminates. Unconsumed bytes sit in the subscription channel and count
/// toward the per-subscriber cap; an overflowing subscriber receives
/// [`CacheError::ExceededMaxBufferSize`] instead of slowing the download.
#[derive(Debug)]
pub struct DownloadResponse {
    subscription: Subscription,
    pub(crate) range: ByteRange,
    pub(crate) headers: Option<CachedHeaders>,
}

impl DownloadResponse {
    pub(crate) fn new(
        subscription: Subscription,
        range: ByteRange,
        headers: Option<CachedHeaders>,
    ) -> Self {
        Self {
            subscription,
            range,
            headers,
        }
    }

    pub fn into_stream(self) -> ByteStream {
        let DownloadResponse {
            mut subscription,
            range,
            ..
        } = self;
        Box::pin(stream! {
            let mut position = subscription.position;
            while let Some(item) = subscription.rx.recv().await {
                match item {
                    Ok(chunk) => {
                        subscription
                            .queued
                            .fetch_sub(chunk.len(), Ordering::Release);
                        let chunk_start = position;
                        let chunk_end = position + chunk.len() as u64;
                        position = chunk_end;

                        let lo = range.start.max(chunk_start);
                        let hi = range.end.map_or(chunk_end, |e| e.min(chunk_end));
                        if hi > lo {
                            yield Ok(chunk.slice(
                                (lo - chunk_start) as usize..(hi - chunk_start) as usize,
                            ));
                        }
                        if let Some(end) = range.end {
                            if position >= end {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }
}

/// Byte concatenation of a file segment `[start, switch)` and a download
/// segment `[switch, end)`. The switch-over is invisible to the listener;
/// an error on either side ends the stream. Dropping the response drops
/// the download subscription regardless of playback position.
#[derive(Debug)]
pub struct CombinedResponse {
    pub(crate) file: FileResponse,
    pub(crate) download: DownloadResponse,
}

impl CombinedResponse {
    pub(crate) fn new(file: FileResponse, download: DownloadResponse) -> Self {
        debug_assert_eq!(file.range.end, Some(download.range.start));
        Self { file, download }
    }

    pub fn into_stream(self) -> ByteStream {
        let CombinedResponse { file, download } = self;
        Box::pin(stream! {
            // An empty file segment happens when the request starts exactly
            // at the switch position.
            if file.range.end != Some(file.range.start) {
                let mut head = file.into_stream();
                while let Some(item) = head.next().await {
                    let failed = item.is_err();
                    yield item;
                    if failed {
                        return;
                    }
                }
            }

            let mut tail = download.into_stream();
            while let Some(item) = tail.next().await {
                let failed = item.is_err();
                yield item;
                if failed {
                    return;
                }
            }
        })
    }
}

/// A one-off origin range download for far seeks, so a jump ahead does not
/// starve the shared cache fill. The served bytes never touch the cache
/// file.
#[derive(Debug)]
pub struct SplitRangeResponse {
    response: reqwest::Response,
    pub(crate) range: ByteRange,
    pub(crate) headers: Option<CachedHeaders>,
    min_chunk_size: usize,
    read_timeout: Duration,
}

impl SplitRangeResponse {
    /// Open the independent origin connection and validate its status
    /// against the requested range.
    pub(crate) async fn open(
        client: &Client,
        url: &Url,
        request_headers: &HashMap<String, String>,
        range: ByteRange,
        cached_headers: Option<CachedHeaders>,
        min_chunk_size: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut request = client
            .get(url.clone())
            .header(ACCEPT_ENCODING, "identity");
        for (name, value) in request_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                request = request.header(name, value);
            }
        }
        let range_value = match range.last_byte() {
            Some(last) => format!("bytes={}-{}", range.start, last),
            None => format!("bytes={}-", range.start),
        };
        request = request.header(RANGE, range_value);

        debug!("opening split range download of {:?} from {}", range, url);
        let response = tokio::time::timeout(read_timeout, request.send())
            .await
            .map_err(|_| CacheError::RequestTimedOut(read_timeout))?
            .map_err(|e| CacheError::network(&e))?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                let received = content_range_start(response.headers().get(CONTENT_RANGE));
                if received != Some(range.start) {
                    return Err(CacheError::HttpRange {
                        requested: range.start,
                        received: received.unwrap_or(0),
                    });
                }
            }
            StatusCode::OK if range.start == 0 => {}
            status => {
                return Err(CacheError::HttpStatus {
                    status: status.as_u16(),
                });
            }
        }

        let headers = cached_headers.or_else(|| {
            let captured = CachedHeaders::from_response(response.headers(), true);
            Some(if status == StatusCode::PARTIAL_CONTENT {
                normalize_partial_headers(captured, response.headers().get(CONTENT_RANGE))
            } else {
                captured
            })
        });

        Ok(Self {
            response,
            range,
            headers,
            min_chunk_size,
            read_timeout,
        })
    }

    pub fn into_stream(self) -> ByteStream {
        let SplitRangeResponse {
            response,
            min_chunk_size,
            read_timeout,
            ..
        } = self;
        Box::pin(stream! {
            let mut body = response.bytes_stream();
            let mut pending = BytesMut::new();
            loop {
                match tokio::time::timeout(read_timeout, body.next()).await {
                    Err(_) => {
                        yield Err(CacheError::ReadTimedOut(read_timeout));
                        return;
                    }
                    Ok(None) => {
                        if !pending.is_empty() {
                            yield Ok(pending.freeze());
                        }
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        yield Err(CacheError::network(&e));
                        return;
                    }
                    Ok(Some(Ok(chunk))) => {
                        pending.extend_from_slice(&chunk);
                        if pending.len() >= min_chunk_size {
                            yield Ok(std::mem::take(&mut pending).freeze());
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::ByteBroadcast;

    async fn collect(stream: ByteStream) -> Result<Vec<u8>> {
        let mut stream = stream;
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.extend_from_slice(&item?);
        }
        Ok(out)
    }

    fn files_in(dir: &std::path::Path) -> CacheFiles {
        CacheFiles::from_complete(dir.join("video.mp4"))
    }

    #[tokio::test]
    async fn file_response_serves_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let files = files_in(dir.path());
        std::fs::write(&files.partial, (0u16..100).map(|i| i as u8).collect::<Vec<_>>())
            .unwrap();

        let response = FileResponse::new(
            files,
            ByteRange {
                start: 10,
                end: Some(20),
            },
            None,
            4,
        );
        let body = collect(response.into_stream()).await.unwrap();
        assert_eq!(body, (10u8..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn file_response_prefers_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = files_in(dir.path());
        std::fs::write(&files.complete, b"complete!").unwrap();
        std::fs::write(&files.partial, b"partial--").unwrap();

        let response = FileResponse::new(
            files,
            ByteRange {
                start: 0,
                end: Some(8),
            },
            None,
            1024,
        );
        let body = collect(response.into_stream()).await.unwrap();
        assert_eq!(body, b"complete");
    }

    #[tokio::test]
    async fn file_response_errors_on_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = files_in(dir.path());
        std::fs::write(&files.partial, b"tiny").unwrap();

        let response = FileResponse::new(
            files,
            ByteRange {
                start: 0,
                end: Some(100),
            },
            None,
            1024,
        );
        assert!(collect(response.into_stream()).await.is_err());
    }

    #[tokio::test]
    async fn download_response_clips_head_and_tail() {
        let broadcast = ByteBroadcast::new(1 << 20, 100);
        // Subscription starts at absolute offset 100.
        let subscription = broadcast.subscribe_at(100).unwrap();
        let response = DownloadResponse::new(
            subscription,
            ByteRange {
                start: 105,
                end: Some(115),
            },
            None,
        );

        // Chunks covering 100..120.
        broadcast.publish(&Bytes::from_static(b"AAAAAAAAAA"));
        broadcast.publish(&Bytes::from_static(b"BBBBBBBBBB"));
        broadcast.finish();

        let body = collect(response.into_stream()).await.unwrap();
        assert_eq!(body, b"AAAAABBBBB");
    }

    #[tokio::test]
    async fn download_response_ends_with_channel_when_unbounded() {
        let broadcast = ByteBroadcast::new(1 << 20, 0);
        let subscription = broadcast.subscribe_at(0).unwrap();
        let response = DownloadResponse::new(subscription, ByteRange::full(), None);

        broadcast.publish(&Bytes::from_static(b"all of it"));
        broadcast.finish();

        let body = collect(response.into_stream()).await.unwrap();
        assert_eq!(body, b"all of it");
    }

    #[tokio::test]
    async fn download_response_surfaces_buffer_overflow() {
        let broadcast = ByteBroadcast::new(4, 0);
        let subscription = broadcast.subscribe_at(0).unwrap();
        let response = DownloadResponse::new(subscription, ByteRange::full(), None);

        broadcast.publish(&Bytes::from_static(b"123"));
        broadcast.publish(&Bytes::from_static(b"456"));

        let result = collect(response.into_stream()).await;
        assert_eq!(result.unwrap_err(), CacheError::ExceededMaxBufferSize(4));
    }

    #[tokio::test]
    async fn combined_response_concatenates_seamlessly() {
        let dir = tempfile::tempdir().unwrap();
        let files = files_in(dir.path());
        std::fs::write(&files.partial, b"0123456789").unwrap();

        let broadcast = ByteBroadcast::new(1 << 20, 10);
        let subscription = broadcast.subscribe_at(10).unwrap();

        let file = FileResponse::new(
            files,
            ByteRange {
                start: 2,
                end: Some(10),
            },
            None,
            1024,
        );
        let download = DownloadResponse::new(
            subscription,
            ByteRange {
                start: 10,
                end: Some(14),
            },
            None,
        );
        let combined = CombinedResponse::new(file, download);

        broadcast.publish(&Bytes::from_static(b"abcdef"));
        broadcast.finish();

        let body = collect(combined.into_stream()).await.unwrap();
        assert_eq!(body, b"23456789abcd");
    }

    #[test]
    fn response_reports_range_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let files = files_in(dir.path());
        let response = StreamResponse::File(FileResponse::new(
            files,
            ByteRange {
                start: 5,
                end: Some(25),
            },
            Some(CachedHeaders::from_pairs([("Content-Length", "100")])),
            1024,
        ));
        assert_eq!(response.kind(), "file");
        assert_eq!(response.range().len(), Some(20));
        assert_eq!(response.source_length(), Some(100));
    }
}
