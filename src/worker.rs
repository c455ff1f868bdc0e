use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use crate::error::{CacheError, Result};
use crate::headers::{content_range_start, normalize_partial_headers, CachedHeaders};

/// Provides the byte offset at which the next origin connection should
/// start, or `None` when the download cannot be resumed mid-session (the
/// worker then propagates instead of reconnecting).
pub(crate) type RangeProvider = Arc<dyn Fn() -> Option<u64> + Send + Sync>;

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Origin response headers; emitted once per connection.
    Headers(CachedHeaders),
    /// A coalesced body chunk.
    Data(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    paused: bool,
    closed: bool,
}

/// Pause/resume/close control over a running [`DownloadWorker`], usable
/// from any task.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    control: watch::Sender<Control>,
}

impl WorkerHandle {
    pub fn pause(&self) {
        self.control.send_modify(|c| c.paused = true);
    }

    pub fn resume(&self) {
        self.control.send_modify(|c| c.paused = false);
    }

    pub fn close(&self) {
        self.control.send_modify(|c| c.closed = true);
    }

    pub fn is_paused(&self) -> bool {
        self.control.borrow().paused
    }

    pub fn is_closed(&self) -> bool {
        self.control.borrow().closed
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Streams one origin resource: opens the GET (ranged when resuming),
/// validates the status line against the requested range, coalesces body
/// chunks, and enforces the inter-chunk read timeout. While paused the
/// body is simply not polled, which stalls the transfer at the socket.
///
/// A read failure mid-body closes the response and reconnects after a
/// backoff as long as the range provider still permits resuming; errors
/// that invalidate the cache always propagate.
pub(crate) struct DownloadWorker {
    client: Client,
    url: Url,
    request_headers: HashMap<String, String>,
    range_provider: RangeProvider,
    read_timeout: Duration,
    retry_delay: Duration,
    min_chunk_size: usize,
    control: watch::Sender<Control>,
    control_rx: watch::Receiver<Control>,
    body: Option<BodyStream>,
    pending: BytesMut,
    headers: Option<CachedHeaders>,
    headers_delivered: bool,
    done: bool,
}

impl DownloadWorker {
    pub fn new(
        client: Client,
        url: Url,
        request_headers: HashMap<String, String>,
        range_provider: RangeProvider,
        read_timeout: Duration,
        retry_delay: Duration,
        min_chunk_size: usize,
    ) -> Self {
        let (control, control_rx) = watch::channel(Control {
            paused: false,
            closed: false,
        });
        Self {
            client,
            url,
            request_headers,
            range_provider,
            read_timeout,
            retry_delay,
            min_chunk_size,
            control,
            control_rx,
            body: None,
            pending: BytesMut::new(),
            headers: None,
            headers_delivered: false,
            done: false,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            control: self.control.clone(),
        }
    }

    /// The next event in order: headers first, then coalesced data chunks,
    /// then `None` at end of body.
    pub async fn next_event(&mut self) -> Result<Option<WorkerEvent>> {
        loop {
            let control = *self.control_rx.borrow();
            if control.closed {
                return Err(CacheError::DownloadStopped);
            }
            if control.paused {
                // Not polling the body is the pause; the read timer restarts
                // once we resume.
                self.wait_for_control_change().await?;
                continue;
            }

            if self.done {
                if !self.pending.is_empty() {
                    return Ok(Some(WorkerEvent::Data(self.take_pending())));
                }
                return Ok(None);
            }

            if self.body.is_none() {
                let headers = self.connect().await?;
                if let Some(headers) = headers {
                    return Ok(Some(WorkerEvent::Headers(headers)));
                }
                continue;
            }

            match self.read_chunk().await? {
                Some(event) => return Ok(Some(event)),
                None => continue,
            }
        }
    }

    async fn wait_for_control_change(&mut self) -> Result<()> {
        self.control_rx
            .changed()
            .await
            .map_err(|_| CacheError::DownloadStopped)
    }

    /// Open the origin connection at the provider's position. Returns the
    /// validated headers on the first connection of the session.
    async fn connect(&mut self) -> Result<Option<CachedHeaders>> {
        let start = (self.range_provider)().ok_or(CacheError::ReadTimedOut(self.read_timeout))?;

        let mut request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT_ENCODING, "identity");
        for (name, value) in &self.request_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                request = request.header(name, value);
            }
        }
        if start > 0 {
            request = request.header(RANGE, format!("bytes={start}-"));
        }

        debug!("opening origin connection to {} at byte {}", self.url, start);
        let response = tokio::time::timeout(self.read_timeout, request.send())
            .await
            .map_err(|_| CacheError::RequestTimedOut(self.read_timeout))?
            .map_err(|e| CacheError::network(&e))?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                if start > 0 {
                    // The origin ignored the range; resuming would corrupt
                    // the partial file.
                    return Err(CacheError::HttpRange {
                        requested: start,
                        received: 0,
                    });
                }
            }
            StatusCode::PARTIAL_CONTENT => {
                let received = content_range_start(response.headers().get(CONTENT_RANGE));
                if received != Some(start) {
                    return Err(CacheError::HttpRange {
                        requested: start,
                        received: received.unwrap_or(0),
                    });
                }
            }
            _ => {
                return Err(CacheError::HttpStatus {
                    status: status.as_u16(),
                });
            }
        }

        let mut headers = CachedHeaders::from_response(response.headers(), true);
        if status == StatusCode::PARTIAL_CONTENT {
            headers = normalize_partial_headers(headers, response.headers().get(CONTENT_RANGE));
        }
        if let Some(previous) = &self.headers {
            // A reconnect that no longer describes the same resource would
            // splice two different bodies together.
            if !previous.matches(&headers) {
                return Err(CacheError::SourceChanged);
            }
        }
        self.headers = Some(headers.clone());
        self.body = Some(Box::pin(response.bytes_stream()));

        if self.headers_delivered {
            Ok(None)
        } else {
            self.headers_delivered = true;
            Ok(Some(headers))
        }
    }

    /// Poll the body once, with the read timeout and control changes in the
    /// race. Returns `Some(Data)` when a coalesced chunk is ready.
    async fn read_chunk(&mut self) -> Result<Option<WorkerEvent>> {
        let outcome = {
            let timeout = self.read_timeout;
            let body = self.body.as_mut().expect("read_chunk without body");
            tokio::select! {
                changed = self.control_rx.changed() => match changed {
                    Ok(()) => ReadOutcome::ControlChanged,
                    Err(_) => ReadOutcome::ControlDropped,
                },
                read = tokio::time::timeout(timeout, body.next()) => match read {
                    Err(_) => ReadOutcome::TimedOut,
                    Ok(None) => ReadOutcome::EndOfBody,
                    Ok(Some(Err(e))) => ReadOutcome::Failed(CacheError::network(&e)),
                    Ok(Some(Ok(chunk))) => ReadOutcome::Chunk(chunk),
                },
            }
        };

        match outcome {
            ReadOutcome::ControlChanged => Ok(None),
            ReadOutcome::ControlDropped => Err(CacheError::DownloadStopped),
            ReadOutcome::TimedOut => {
                self.body = None;
                self.retry_or_fail(CacheError::ReadTimedOut(self.read_timeout))
                    .await?;
                Ok(None)
            }
            ReadOutcome::EndOfBody => {
                self.body = None;
                self.done = true;
                Ok(None)
            }
            ReadOutcome::Failed(error) => {
                self.body = None;
                self.retry_or_fail(error).await?;
                Ok(None)
            }
            ReadOutcome::Chunk(chunk) => {
                self.pending.extend_from_slice(&chunk);
                if self.pending.len() >= self.min_chunk_size {
                    Ok(Some(WorkerEvent::Data(self.take_pending())))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// After a dropped response: back off and reconnect when the session
    /// can be resumed, propagate otherwise.
    async fn retry_or_fail(&mut self, error: CacheError) -> Result<()> {
        if error.is_invalid_cache() {
            return Err(error);
        }
        if (self.range_provider)().is_none() {
            return Err(error);
        }

        warn!(
            "origin read failed for {} ({}); retrying in {:?}",
            self.url, error, self.retry_delay
        );

        let sleep = tokio::time::sleep(self.retry_delay);
        tokio::pin!(sleep);
        loop {
            let control_dropped = tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = self.control_rx.changed() => changed.is_err(),
            };
            if control_dropped || self.control_rx.borrow().closed {
                return Err(CacheError::DownloadStopped);
            }
        }
    }

    fn take_pending(&mut self) -> Bytes {
        std::mem::take(&mut self.pending).freeze()
    }
}

enum ReadOutcome {
    ControlChanged,
    ControlDropped,
    TimedOut,
    EndOfBody,
    Failed(CacheError),
    Chunk(Bytes),
}
