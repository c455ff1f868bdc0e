use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::manager::StreamRegistry;
use crate::range::{parse_range_header, ByteRange};
use crate::response::{ByteStream, StreamResponse};
use crate::stream::CacheStream;

/// Request counters, reported by the server for observability.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub requests_served: AtomicU64,
    pub range_requests: AtomicU64,
    pub streams_not_found: AtomicU64,
}

struct ServerState {
    registry: Arc<StreamRegistry>,
    config: Arc<CacheConfig>,
    stats: Arc<ProxyStats>,
}

/// The loopback HTTP server media players talk to. Binds an ephemeral
/// port on 127.0.0.1, looks streams up by path+query, and pipes their
/// responses with a per-request write watchdog.
pub struct CacheServer {
    addr: SocketAddr,
    shutdown: Arc<Notify>,
    stats: Arc<ProxyStats>,
}

impl CacheServer {
    pub(crate) async fn start(
        registry: Arc<StreamRegistry>,
        config: Arc<CacheConfig>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| CacheError::Config(format!("failed to bind proxy server: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CacheError::Config(format!("failed to read proxy address: {e}")))?;

        let stats = Arc::new(ProxyStats::default());
        let state = Arc::new(ServerState {
            registry,
            config,
            stats: stats.clone(),
        });
        let app = Router::new().fallback(handle).with_state(state);

        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await });
            if let Err(e) = serve.await {
                error!("proxy server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            shutdown,
            stats,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Rewrite a source URL's scheme, host and port to this proxy; path
    /// and query are preserved as the lookup key.
    pub fn proxy_url(&self, source: &Url) -> Result<Url> {
        let mut url = source.clone();
        url.set_scheme("http")
            .map_err(|_| CacheError::Config(format!("cannot proxy non-http URL {source}")))?;
        url.set_host(Some("127.0.0.1"))
            .map_err(|_| CacheError::Config(format!("cannot rewrite host of {source}")))?;
        url.set_port(Some(self.addr.port()))
            .map_err(|_| CacheError::Config(format!("cannot rewrite port of {source}")))?;
        Ok(url)
    }

    pub async fn shutdown(&self) {
        info!("shutting down proxy server on {}", self.addr);
        self.shutdown.notify_waiters();
    }
}

async fn handle(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    state.stats.requests_served.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return simple_status(StatusCode::METHOD_NOT_ALLOWED);
    }

    let key = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let Some(stream) = state.registry.find_by_lookup_key(&key) else {
        warn!("no cache stream registered for {}", key);
        state.stats.streams_not_found.fetch_add(1, Ordering::Relaxed);
        return simple_status(StatusCode::SERVICE_UNAVAILABLE);
    };

    let range_header = request
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let (range, ranged) = match &range_header {
        Some(value) => match parse_range_header(value) {
            Ok(range) => {
                state.stats.range_requests.fetch_add(1, Ordering::Relaxed);
                (range, true)
            }
            Err(e) => {
                debug!("rejecting malformed range {:?}: {}", value, e);
                return simple_status(StatusCode::BAD_REQUEST);
            }
        },
        None => (ByteRange::full(), false),
    };

    if method == Method::HEAD {
        return serve_head(&state, &stream).await;
    }

    let response = match tokio::time::timeout(state.config.read_timeout, stream.request(range))
        .await
    {
        Err(_) => return simple_status(StatusCode::GATEWAY_TIMEOUT),
        Ok(Err(e)) => return error_response(&stream, e).await,
        Ok(Ok(response)) => response,
    };

    debug!(
        "serving {} as {} ({:?})",
        key,
        response.kind(),
        response.range()
    );
    serve_response(&state, &stream, response, ranged)
}

/// Map a request failure to a status. Errors here happen before any body
/// byte was written, so a status response is still possible.
async fn error_response(stream: &CacheStream, error: CacheError) -> Response {
    match error {
        CacheError::InvalidRange(_) | CacheError::HttpRange { .. } => {
            let mut builder = Response::builder().status(StatusCode::RANGE_NOT_SATISFIABLE);
            let total = match stream.headers().and_then(|h| h.source_length()) {
                Some(total) => total.to_string(),
                None => "*".to_string(),
            };
            builder = builder.header(header::CONTENT_RANGE, format!("bytes */{total}"));
            builder
                .body(Body::empty())
                .unwrap_or_else(|_| simple_status(StatusCode::INTERNAL_SERVER_ERROR))
        }
        CacheError::Disposed => simple_status(StatusCode::SERVICE_UNAVAILABLE),
        CacheError::RequestTimedOut(_) | CacheError::ReadTimedOut(_) => {
            simple_status(StatusCode::GATEWAY_TIMEOUT)
        }
        _ => simple_status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn serve_response(
    state: &Arc<ServerState>,
    stream: &CacheStream,
    response: StreamResponse,
    ranged: bool,
) -> Response {
    let served = response.range();
    let source_length = response.source_length();
    let from_file = response.kind() == "file";
    // An open-ended range still has a known extent once the origin told
    // us the resource length.
    let effective_end = served.end.or(source_length);

    let status = if ranged {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder().status(status);

    let content_type = response
        .headers()
        .and_then(|h| h.content_type())
        .map(str::to_owned)
        .or_else(|| {
            mime_guess::from_path(Path::new(stream.url().path()))
                .first_raw()
                .map(str::to_owned)
        })
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    builder = builder.header(header::CONTENT_TYPE, content_type);

    if let Some(end) = effective_end {
        let length = end.saturating_sub(served.start);
        builder = builder.header(header::CONTENT_LENGTH, length.to_string());
    }

    if status == StatusCode::PARTIAL_CONTENT {
        let last = effective_end
            .filter(|end| *end > served.start)
            .map(|end| end - 1)
            .unwrap_or(served.start);
        let total = source_length
            .map(|t| t.to_string())
            .unwrap_or_else(|| "*".to_string());
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", served.start, last, total),
        );
    }

    let origin_supports_ranges = response
        .headers()
        .map(|h| h.accepts_range_requests())
        .unwrap_or(false);
    if origin_supports_ranges || from_file {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }

    if state.config.copy_cached_response_headers {
        if let Some(headers) = response.headers() {
            for (name, value) in headers.iter() {
                if is_managed_header(name) {
                    continue;
                }
                if let (Ok(name), Ok(value)) =
                    (HeaderName::try_from(name), HeaderValue::try_from(value))
                {
                    builder = builder.header(name, value);
                }
            }
        }
    }

    for (name, value) in stream.response_header_overrides() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let body = watchdog_body(response.into_stream(), state.config.read_timeout);
    builder
        .body(body)
        .unwrap_or_else(|_| simple_status(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Headers the proxy computes itself; cached copies must not override them.
fn is_managed_header(name: &str) -> bool {
    matches!(
        name,
        "content-length"
            | "content-range"
            | "content-type"
            | "content-encoding"
            | "transfer-encoding"
            | "accept-ranges"
            | "connection"
            | "keep-alive"
    )
}

/// Answer a HEAD probe from what the cache already knows, without
/// touching the origin or starting a download.
async fn serve_head(state: &Arc<ServerState>, stream: &CacheStream) -> Response {
    let headers = stream.headers();
    let length = match headers.as_ref().and_then(|h| h.source_length()) {
        Some(length) => Some(length),
        None => stream.files().complete_size().await,
    };

    let mut builder = Response::builder().status(StatusCode::OK);
    let content_type = headers
        .as_ref()
        .and_then(|h| h.content_type())
        .map(str::to_owned)
        .or_else(|| {
            mime_guess::from_path(Path::new(stream.url().path()))
                .first_raw()
                .map(str::to_owned)
        })
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    builder = builder.header(header::CONTENT_TYPE, content_type);
    if let Some(length) = length {
        builder = builder.header(header::CONTENT_LENGTH, length.to_string());
    }
    let supports_ranges = headers
        .as_ref()
        .map(|h| h.accepts_range_requests())
        .unwrap_or(false);
    if supports_ranges || length.is_some() {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }

    builder
        .body(Body::empty())
        .unwrap_or_else(|_| simple_status(StatusCode::INTERNAL_SERVER_ERROR))
    // HEAD bodies are stripped by the HTTP layer.
}

fn simple_status(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response")
}

/// Pipe a response stream into the socket body behind a bounded channel.
/// If the client stops consuming for longer than the write timeout, the
/// forwarder drops the connection instead of buffering without bound; an
/// upstream error after headers likewise terminates the connection
/// mid-body rather than surfacing a late status.
fn watchdog_body(mut source: ByteStream, write_timeout: Duration) -> Body {
    let (tx, mut rx) = mpsc::channel::<Result<bytes::Bytes>>(8);

    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            let is_err = item.is_err();
            match tx.send_timeout(item, write_timeout).await {
                Ok(()) => {
                    if is_err {
                        return;
                    }
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!("client stalled past the write timeout; dropping connection");
                    return;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => return,
            }
        }
    });

    Body::from_stream(stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn proxy_url_rewrites_only_the_authority() {
        let registry = Arc::new(StreamRegistry::default());
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(CacheConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let server = CacheServer::start(registry, config).await.unwrap();

        let source = Url::parse("https://media.example.com:8443/a/b.mp4?sig=abc").unwrap();
        let proxied = server.proxy_url(&source).unwrap();
        assert_eq!(proxied.scheme(), "http");
        assert_eq!(proxied.host_str(), Some("127.0.0.1"));
        assert_eq!(proxied.port(), Some(server.port()));
        assert_eq!(proxied.path(), "/a/b.mp4");
        assert_eq!(proxied.query(), Some("sig=abc"));

        server.shutdown().await;
    }

    #[test]
    fn managed_headers_are_not_copied() {
        assert!(is_managed_header("content-length"));
        assert!(is_managed_header("transfer-encoding"));
        assert!(!is_managed_header("etag"));
        assert!(!is_managed_header("cache-control"));
    }
}
