use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use url::Url;

use crate::error::{CacheError, Result};
use crate::headers::CachedHeaders;

/// Suffix of the append-only partial file.
pub const PARTIAL_SUFFIX: &str = ".part";
/// Suffix of the JSON metadata sidecar.
pub const METADATA_SUFFIX: &str = ".metadata";

/// Maximum length of a single path component.
const MAX_COMPONENT_LEN: usize = 255;
/// Conservative cap on the full cache path length.
const MAX_PATH_LEN: usize = 4000;

/// The three on-disk artifacts of one cached resource. The complete file's
/// presence is the ground truth that the resource is fully cached; the
/// partial file is the append-only download target; the metadata sidecar
/// makes resumes possible across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFiles {
    pub complete: PathBuf,
    pub partial: PathBuf,
    pub metadata: PathBuf,
}

impl CacheFiles {
    pub fn for_url(cache_dir: &Path, url: &Url) -> Self {
        let complete = cache_path_for(cache_dir, url);
        Self::from_complete(complete)
    }

    pub fn from_complete(complete: PathBuf) -> Self {
        let partial = append_suffix(&complete, PARTIAL_SUFFIX);
        let metadata = append_suffix(&complete, METADATA_SUFFIX);
        Self {
            complete,
            partial,
            metadata,
        }
    }

    pub async fn complete_size(&self) -> Option<u64> {
        tokio::fs::metadata(&self.complete).await.ok().map(|m| m.len())
    }

    pub async fn partial_size(&self) -> Option<u64> {
        tokio::fs::metadata(&self.partial).await.ok().map(|m| m.len())
    }

    /// Promote the partial file to the complete file.
    pub async fn promote(&self) -> Result<()> {
        tokio::fs::rename(&self.partial, &self.complete)
            .await
            .map_err(|e| CacheError::write(&e))
    }

    pub async fn delete_partial(&self) {
        remove_if_exists(&self.partial).await;
    }

    pub async fn delete_complete(&self) {
        remove_if_exists(&self.complete).await;
    }

    pub async fn delete_metadata(&self) {
        remove_if_exists(&self.metadata).await;
    }
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {:?}: {}", path, e);
        }
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    path.with_file_name(name)
}

/// Derive the complete-file path for a source URL:
/// `<cache_dir>/<host>/<path segments…>`, each component sanitized to
/// `[A-Za-z0-9._-]` and truncated, with `.cache` appended when the name
/// has no extension. Any URL this scheme cannot express falls back to a
/// hash-derived flat name.
fn cache_path_for(cache_dir: &Path, url: &Url) -> PathBuf {
    match derived_path(cache_dir, url) {
        Some(path) => path,
        None => cache_dir.join(hashed_file_name(url)),
    }
}

fn derived_path(cache_dir: &Path, url: &Url) -> Option<PathBuf> {
    let host = sanitize_component(url.host_str()?);
    if host.is_empty() {
        return None;
    }

    let segments: Vec<String> = url
        .path_segments()?
        .map(sanitize_component)
        .filter(|s| !s.is_empty())
        .collect();
    let (file_name, dirs) = segments.split_last()?;

    let mut file_name = file_name.clone();
    if Path::new(&file_name).extension().is_none() {
        file_name.push_str(".cache");
        if file_name.len() > MAX_COMPONENT_LEN {
            return None;
        }
    }

    let mut path = cache_dir.join(host);
    for dir in dirs {
        path.push(dir);
    }
    path.push(file_name);

    if path.as_os_str().len() + METADATA_SUFFIX.len() > MAX_PATH_LEN {
        return None;
    }
    Some(path)
}

fn sanitize_component(component: &str) -> String {
    let mut out: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_COMPONENT_LEN);
    // A bare dot component would change the path shape
    if out.chars().all(|c| c == '.') {
        return String::new();
    }
    out
}

fn hashed_file_name(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    let mut name = hex_string(&digest);
    name.truncate(40);

    let extension = Path::new(url.path())
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 20 && e.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = extension {
        name.push('.');
        name.push_str(ext);
    }
    name
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Persistent description of a cached resource: its files, its source URL
/// and the last observed origin headers.
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    pub url: Url,
    pub files: CacheFiles,
    pub headers: Option<CachedHeaders>,
}

#[derive(Serialize, Deserialize)]
struct MetadataDocument {
    #[serde(rename = "Url")]
    url: Option<String>,
    #[serde(default)]
    headers: Option<CachedHeaders>,
}

impl CacheMetadata {
    pub fn new(url: Url, files: CacheFiles) -> Self {
        Self {
            url,
            files,
            headers: None,
        }
    }

    /// Load the metadata sidecar. Returns `None` when the file is absent,
    /// unparseable, names a different URL, or lacks a URL entirely.
    pub async fn load(url: Url, files: CacheFiles) -> Self {
        let headers = match tokio::fs::read(&files.metadata).await {
            Ok(bytes) => parse_document(&bytes, &url),
            Err(_) => None,
        };
        Self { url, files, headers }
    }

    /// Persist the sidecar. Callers treat failures as best-effort; the
    /// error is surfaced for logging only.
    pub async fn save(&self, save_all_headers: bool) -> Result<()> {
        let headers = self.headers.as_ref().map(|h| {
            if save_all_headers {
                h.clone()
            } else {
                h.essential_only()
            }
        });
        let document = MetadataDocument {
            url: Some(self.url.to_string()),
            headers,
        };
        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| CacheError::Write(e.to_string()))?;

        if let Some(parent) = self.files.metadata.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::write(&e))?;
        }
        tokio::fs::write(&self.files.metadata, json)
            .await
            .map_err(|e| CacheError::write(&e))
    }
}

fn parse_document(bytes: &[u8], expected_url: &Url) -> Option<CachedHeaders> {
    let document: MetadataDocument = serde_json::from_slice(bytes).ok()?;
    let url = document.url?;
    if Url::parse(&url).ok()? != *expected_url {
        return None;
    }
    document.headers
}
