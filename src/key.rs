//! `FileKey`: the normalized, path-traversal-checked identity of a cached file.
//!
//! A `FileKey` is derived once from the raw request URI (percent-decoded,
//! leading `/` stripped) and shared from then on by the Serializer, the
//! Downloader, and the request actor so nobody re-derives or re-validates the
//! path differently (see spec section 9, "Path safety").

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::ClassifyError;

/// A validated, percent-decoded request path, guaranteed not to escape the
/// cache root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey(String);

impl FileKey {
    /// Parses a raw request URI into a `FileKey`, rejecting any path that
    /// would escape the cache root once percent-decoded and normalized.
    pub fn parse(raw_uri: &str) -> Result<Self, ClassifyError> {
        let decoded = percent_decode_str(raw_uri)
            .decode_utf8()
            .map_err(|_| ClassifyError::InvalidPath)?;
        let stripped = decoded.trim_start_matches('/');

        if stripped.is_empty() {
            return Err(ClassifyError::InvalidPath);
        }

        if !is_safe(stripped) {
            return Err(ClassifyError::InvalidPath);
        }

        Ok(FileKey(stripped.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `basename(URI)`, used as the Content-Length Cache key.
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Joins this key under `cache_directory/pkg/` to get the on-disk path.
    pub fn cache_path(&self, cache_directory: &Path) -> PathBuf {
        cache_directory.join("pkg").join(&self.0)
    }

    pub fn ends_with_db(&self) -> bool {
        self.basename().ends_with(".db")
    }
}

/// Rejects any decoded path containing `..`, an absolute root, or a prefix
/// component (Windows drive letters) — the normalized path must stay a
/// strictly-descending walk from the cache root.
fn is_safe(path: &str) -> bool {
    let path = Path::new(path);
    path.components().all(|c| matches!(c, Component::Normal(_)))
}
