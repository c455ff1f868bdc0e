use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Header names that caching decisions depend on. These survive even when
/// `save_all_headers` is off.
const ESSENTIAL_HEADERS: &[&str] = &[
    "content-length",
    "accept-ranges",
    "content-type",
    "last-modified",
    "date",
    "expires",
    "cache-control",
    "etag",
    "content-encoding",
    "transfer-encoding",
];

/// A snapshot of the origin's response headers, filtered and normalized to
/// lowercase names. Immutable once captured; a corrected copy is produced
/// with [`CachedHeaders::with_source_length`] when a download finishes and
/// the origin never told us the length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CachedHeaders {
    headers: BTreeMap<String, String>,
}

impl CachedHeaders {
    /// Capture headers from an origin response. With `save_all` unset only
    /// the caching-relevant subset is kept.
    pub fn from_response(headers: &HeaderMap, save_all: bool) -> Self {
        let mut map = BTreeMap::new();
        for (name, value) in headers {
            let name = name.as_str().to_ascii_lowercase();
            if !save_all && !ESSENTIAL_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                map.entry(name)
                    .and_modify(|existing: &mut String| {
                        existing.push_str(", ");
                        existing.push_str(value);
                    })
                    .or_insert_with(|| value.to_string());
            }
        }
        Self { headers: map }
    }

    #[cfg(test)]
    pub(crate) fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            headers: pairs
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Drop everything but the caching-relevant subset.
    pub fn essential_only(&self) -> Self {
        Self {
            headers: self
                .headers
                .iter()
                .filter(|(name, _)| ESSENTIAL_HEADERS.contains(&name.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn is_compressed_or_chunked(&self) -> bool {
        let gzip = self
            .get("content-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));
        let chunked = self
            .get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        gzip || chunked
    }

    /// The resource length, when the Content-Length can be trusted: a
    /// compressed or chunked body makes the advertised length meaningless
    /// for byte-offset math.
    pub fn source_length(&self) -> Option<u64> {
        if self.is_compressed_or_chunked() {
            return None;
        }
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    pub fn accepts_range_requests(&self) -> bool {
        self.get("accept-ranges")
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
    }

    /// Whether an interrupted download of this resource can be resumed
    /// with a range request.
    pub fn can_resume_download(&self) -> bool {
        self.accepts_range_requests() && !self.is_compressed_or_chunked()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    pub fn etag(&self) -> Option<&str> {
        self.get("etag")
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        parse_http_date(self.get("last-modified")?)
    }

    fn date(&self) -> Option<DateTime<Utc>> {
        parse_http_date(self.get("date")?)
    }

    fn max_age(&self) -> Option<i64> {
        let cache_control = self.get("cache-control")?;
        cache_control.split(',').find_map(|directive| {
            let directive = directive.trim();
            directive
                .strip_prefix("max-age=")
                .and_then(|secs| secs.parse().ok())
        })
    }

    /// When this snapshot stops being fresh: the explicit `Expires` header,
    /// else `Date` plus `Cache-Control: max-age`.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        if let Some(expires) = self.get("expires").and_then(parse_http_date) {
            return Some(expires);
        }
        let date = self.date()?;
        let max_age = self.max_age()?;
        Some(date + ChronoDuration::seconds(max_age))
    }

    /// Whether the cache should be revalidated against the origin. With no
    /// freshness information at all the snapshot counts as stale.
    pub fn should_revalidate(&self, now: DateTime<Utc>) -> bool {
        match self.expires() {
            Some(expires) => now >= expires,
            None => true,
        }
    }

    /// Whether `next` still describes the same resource as this snapshot.
    /// Compared in order: etag when both sides carry one; else the origin
    /// must not have been modified since; else the lengths must agree.
    pub fn matches(&self, next: &CachedHeaders) -> bool {
        if let (Some(previous), Some(current)) = (self.etag(), next.etag()) {
            return previous == current;
        }
        if let (Some(previous), Some(current)) = (self.last_modified(), next.last_modified()) {
            return current <= previous;
        }
        self.source_length() == next.source_length()
    }

    /// A corrected snapshot with the now-known resource length. The body on
    /// disk is stored decoded, so the encoding markers no longer apply.
    pub fn with_source_length(&self, length: u64) -> Self {
        let mut headers = self.headers.clone();
        headers.remove("content-encoding");
        headers.remove("transfer-encoding");
        headers.insert("content-length".into(), length.to_string());
        Self { headers }
    }

    /// A snapshot with no length claim at all. Used when a partial
    /// response's Content-Length (which covers only the served range)
    /// cannot be replaced by a total from Content-Range.
    pub fn without_source_length(&self) -> Self {
        let mut headers = self.headers.clone();
        headers.remove("content-length");
        Self { headers }
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract the start offset from a `Content-Range: bytes S-E/TOTAL` value.
pub(crate) fn content_range_start(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = value?.to_str().ok()?;
    let rest = value.trim().strip_prefix("bytes ")?;
    let (start, _) = rest.split_once('-')?;
    start.trim().parse().ok()
}

/// Extract the total length from a `Content-Range: bytes S-E/TOTAL` value.
/// `None` for an unknown (`*`) or malformed total.
pub(crate) fn content_range_total(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = value?.to_str().ok()?;
    let rest = value.trim().strip_prefix("bytes ")?;
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

/// Normalize headers captured from a partial (206) response: their
/// Content-Length describes the served range, so the resource length must
/// come from the Content-Range total or be dropped entirely.
pub(crate) fn normalize_partial_headers(
    headers: CachedHeaders,
    content_range: Option<&reqwest::header::HeaderValue>,
) -> CachedHeaders {
    match content_range_total(content_range) {
        Some(total) => headers.with_source_length(total),
        None => headers.without_source_length(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn source_length_requires_identity_encoding() {
        let plain = CachedHeaders::from_pairs([("Content-Length", "1000")]);
        assert_eq!(plain.source_length(), Some(1000));

        let gzipped = CachedHeaders::from_pairs([
            ("Content-Length", "1000"),
            ("Content-Encoding", "gzip"),
        ]);
        assert_eq!(gzipped.source_length(), None);

        let chunked = CachedHeaders::from_pairs([
            ("Content-Length", "1000"),
            ("Transfer-Encoding", "chunked"),
        ]);
        assert_eq!(chunked.source_length(), None);
    }

    #[test]
    fn resume_requires_ranges_and_identity() {
        let resumable = CachedHeaders::from_pairs([
            ("Accept-Ranges", "bytes"),
            ("Content-Length", "1000"),
        ]);
        assert!(resumable.can_resume_download());

        let no_ranges = CachedHeaders::from_pairs([("Content-Length", "1000")]);
        assert!(!no_ranges.can_resume_download());

        let chunked = CachedHeaders::from_pairs([
            ("Accept-Ranges", "bytes"),
            ("Transfer-Encoding", "chunked"),
        ]);
        assert!(!chunked.can_resume_download());
    }

    #[test]
    fn expires_from_date_and_max_age() {
        let headers = CachedHeaders::from_pairs([
            ("Date", "Wed, 01 Jan 2025 00:00:00 GMT"),
            ("Cache-Control", "public, max-age=3600"),
        ]);
        let expected = Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap();
        assert_eq!(headers.expires(), Some(expected));

        assert!(!headers.should_revalidate(expected - ChronoDuration::seconds(1)));
        assert!(headers.should_revalidate(expected));
    }

    #[test]
    fn explicit_expires_wins() {
        let headers = CachedHeaders::from_pairs([
            ("Date", "Wed, 01 Jan 2025 00:00:00 GMT"),
            ("Cache-Control", "max-age=3600"),
            ("Expires", "Wed, 01 Jan 2025 00:10:00 GMT"),
        ]);
        let expected = Utc.with_ymd_and_hms(2025, 1, 1, 0, 10, 0).unwrap();
        assert_eq!(headers.expires(), Some(expected));
    }

    #[test]
    fn no_freshness_info_counts_as_stale() {
        let headers = CachedHeaders::from_pairs([("Content-Length", "10")]);
        assert!(headers.should_revalidate(Utc::now()));
    }

    #[test]
    fn matching_prefers_etag() {
        let previous = CachedHeaders::from_pairs([("ETag", "\"v1\""), ("Content-Length", "10")]);
        let same = CachedHeaders::from_pairs([("ETag", "\"v1\""), ("Content-Length", "20")]);
        let changed = CachedHeaders::from_pairs([("ETag", "\"v2\""), ("Content-Length", "10")]);
        assert!(previous.matches(&same));
        assert!(!previous.matches(&changed));
    }

    #[test]
    fn matching_falls_back_to_last_modified_then_length() {
        let previous =
            CachedHeaders::from_pairs([("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT")]);
        let older = CachedHeaders::from_pairs([("Last-Modified", "Tue, 31 Dec 2024 00:00:00 GMT")]);
        let newer = CachedHeaders::from_pairs([("Last-Modified", "Thu, 02 Jan 2025 00:00:00 GMT")]);
        assert!(previous.matches(&older));
        assert!(!previous.matches(&newer));

        let by_len_a = CachedHeaders::from_pairs([("Content-Length", "10")]);
        let by_len_b = CachedHeaders::from_pairs([("Content-Length", "10")]);
        let by_len_c = CachedHeaders::from_pairs([("Content-Length", "12")]);
        assert!(by_len_a.matches(&by_len_b));
        assert!(!by_len_a.matches(&by_len_c));
    }

    #[test]
    fn corrected_length_clears_encoding_markers() {
        let headers = CachedHeaders::from_pairs([
            ("Transfer-Encoding", "chunked"),
            ("Content-Type", "video/mp4"),
        ]);
        assert_eq!(headers.source_length(), None);

        let corrected = headers.with_source_length(4096);
        assert_eq!(corrected.source_length(), Some(4096));
        assert_eq!(corrected.content_type(), Some("video/mp4"));
        assert!(corrected.get("transfer-encoding").is_none());
    }

    #[test]
    fn parses_content_range_start() {
        use reqwest::header::HeaderValue;

        let value = HeaderValue::from_static("bytes 500-999/1000");
        assert_eq!(content_range_start(Some(&value)), Some(500));

        let unbounded = HeaderValue::from_static("bytes 0-99/*");
        assert_eq!(content_range_start(Some(&unbounded)), Some(0));

        let malformed = HeaderValue::from_static("0-99/1000");
        assert_eq!(content_range_start(Some(&malformed)), None);
        assert_eq!(content_range_start(None), None);
    }

    #[test]
    fn partial_response_headers_take_length_from_content_range() {
        use reqwest::header::HeaderValue;

        let partial = CachedHeaders::from_pairs([
            ("Content-Length", "500"),
            ("ETag", "\"v1\""),
        ]);

        let with_total = normalize_partial_headers(
            partial.clone(),
            Some(&HeaderValue::from_static("bytes 500-999/1000")),
        );
        assert_eq!(with_total.source_length(), Some(1000));
        assert_eq!(with_total.etag(), Some("\"v1\""));

        let unknown_total = normalize_partial_headers(
            partial,
            Some(&HeaderValue::from_static("bytes 500-999/*")),
        );
        assert_eq!(unknown_total.source_length(), None);
    }

    #[test]
    fn essential_filter_drops_extras() {
        let headers = CachedHeaders::from_pairs([
            ("Content-Length", "10"),
            ("X-Request-Id", "abc123"),
            ("ETag", "\"v1\""),
        ]);
        let essential = headers.essential_only();
        assert_eq!(essential.get("content-length"), Some("10"));
        assert_eq!(essential.get("etag"), Some("\"v1\""));
        assert!(essential.get("x-request-id").is_none());
    }
}
