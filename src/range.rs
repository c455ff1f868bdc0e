use crate::error::{CacheError, Result};

/// A requested byte range, half-open: `[start, end)`.
///
/// `end == None` means "until the end of the resource", used both for
/// full-file requests and open-ended `Range: bytes=N-` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// The full resource.
    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    pub fn new(start: u64, end: Option<u64>) -> Result<Self> {
        if let Some(end) = end {
            if end < start {
                return Err(CacheError::InvalidRange(format!(
                    "end {} precedes start {}",
                    end, start
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Validate against a known source length. A range starting at or past
    /// the end of the resource is unsatisfiable, except the degenerate
    /// `[0, 0)` request against an empty resource.
    pub fn validate_against(&self, source_length: u64) -> Result<()> {
        if self.start > source_length || (self.start == source_length && source_length > 0) {
            return Err(CacheError::InvalidRange(format!(
                "start {} exceeds source length {}",
                self.start, source_length
            )));
        }
        if let Some(end) = self.end {
            if end > source_length {
                return Err(CacheError::InvalidRange(format!(
                    "end {} exceeds source length {}",
                    end, source_length
                )));
            }
        }
        Ok(())
    }

    /// Resolve the open end against a known source length.
    pub fn clamp(&self, source_length: u64) -> ByteRange {
        ByteRange {
            start: self.start,
            end: Some(self.end.unwrap_or(source_length).min(source_length)),
        }
    }

    /// Number of bytes covered, when the end is known.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.end == Some(self.start)
    }

    /// Whether this range covers the whole resource.
    pub fn is_full(&self, source_length: Option<u64>) -> bool {
        self.start == 0
            && match (self.end, source_length) {
                (None, _) => true,
                (Some(end), Some(len)) => end >= len,
                (Some(_), None) => false,
            }
    }

    /// Inclusive end offset for `Content-Range` headers. `None` for an
    /// empty range.
    pub fn last_byte(&self) -> Option<u64> {
        match self.end {
            Some(end) if end > self.start => Some(end - 1),
            _ => None,
        }
    }
}

/// Parse an HTTP `Range` header into a [`ByteRange`].
///
/// Only single positive ranges are supported: `bytes=N-` and `bytes=N-M`
/// (M inclusive). Suffix ranges (`bytes=-N`) and multipart ranges are
/// rejected; the server answers those with 400.
pub fn parse_range_header(value: &str) -> Result<ByteRange> {
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| CacheError::InvalidRange(format!("unsupported range unit: {value}")))?;

    if spec.contains(',') {
        return Err(CacheError::InvalidRange(
            "multipart ranges are not supported".into(),
        ));
    }

    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| CacheError::InvalidRange(format!("malformed range: {value}")))?;

    if start.is_empty() {
        return Err(CacheError::InvalidRange(
            "suffix ranges are not supported".into(),
        ));
    }

    let start: u64 = start
        .parse()
        .map_err(|_| CacheError::InvalidRange(format!("malformed range start: {value}")))?;

    let end = if end.is_empty() {
        None
    } else {
        let last: u64 = end
            .parse()
            .map_err(|_| CacheError::InvalidRange(format!("malformed range end: {value}")))?;
        if last < start {
            return Err(CacheError::InvalidRange(format!(
                "range end {last} precedes start {start}"
            )));
        }
        Some(last + 1)
    };

    ByteRange::new(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_open_and_closed_ranges() {
        assert_eq!(
            parse_range_header("bytes=0-").unwrap(),
            ByteRange {
                start: 0,
                end: None
            }
        );
        assert_eq!(
            parse_range_header("bytes=200-799").unwrap(),
            ByteRange {
                start: 200,
                end: Some(800)
            }
        );
        assert_eq!(
            parse_range_header("bytes=5-5").unwrap(),
            ByteRange {
                start: 5,
                end: Some(6)
            }
        );
    }

    #[test]
    fn rejects_suffix_and_multipart_ranges() {
        assert!(parse_range_header("bytes=-500").is_err());
        assert!(parse_range_header("bytes=0-1,5-9").is_err());
        assert!(parse_range_header("items=0-1").is_err());
        assert!(parse_range_header("bytes=9-2").is_err());
    }

    #[test]
    fn validates_against_source_length() {
        let range = ByteRange::new(200, Some(800)).unwrap();
        assert!(range.validate_against(1000).is_ok());
        assert!(range.validate_against(500).is_err());

        // start == sourceLength is unsatisfiable
        let at_end = ByteRange::new(1000, None).unwrap();
        assert!(at_end.validate_against(1000).is_err());

        // ...except the zero-length request against an empty resource
        let empty = ByteRange::new(0, Some(0)).unwrap();
        assert!(empty.validate_against(0).is_ok());
    }

    #[test]
    fn clamp_resolves_open_end() {
        let range = ByteRange::full().clamp(1000);
        assert_eq!(range.end, Some(1000));
        assert_eq!(range.len(), Some(1000));
        assert_eq!(range.last_byte(), Some(999));
    }

    #[test]
    fn full_detection() {
        assert!(ByteRange::full().is_full(None));
        assert!(ByteRange::full().is_full(Some(10)));
        assert!(ByteRange::new(0, Some(10)).unwrap().is_full(Some(10)));
        assert!(!ByteRange::new(1, None).unwrap().is_full(Some(10)));
        assert!(!ByteRange::new(0, Some(9)).unwrap().is_full(Some(10)));
    }
}
