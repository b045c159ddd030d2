use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::CacheError;
use crate::fetcher::FetchRequest;

/// Auxiliary attributes stored alongside an entry, which have to match for a lookup to hit.
pub type SecondaryAttrs = BTreeMap<String, String>;

/// Whether every attribute in `wanted` is present in `stored` with exactly the same value.
pub fn attrs_match(stored: &SecondaryAttrs, wanted: &SecondaryAttrs) -> bool {
    wanted
        .iter()
        .all(|(name, value)| stored.get(name) == Some(value))
}

#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    key: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Uses `key` verbatim as cache key.
    pub fn new(key: &str) -> Result<Self, CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty cache key".into()));
        }
        Ok(CacheKeyBuilder {
            key: key.to_owned(),
        }
        .build())
    }

    /// Derives the cache key for fetching `url` with the given request headers.
    ///
    /// Header names are compared case-insensitively, and the order in which headers were
    /// supplied does not matter. Without headers the key is the url itself.
    pub fn for_url(url: &str, headers: &BTreeMap<String, String>) -> Result<Self, CacheError> {
        if url.is_empty() {
            return Err(CacheError::InvalidArgument(
                "request has neither url nor cache key".into(),
            ));
        }
        let mut builder = CacheKeyBuilder {
            key: url.to_owned(),
        };
        // `fmt::Write` for a `String` never fails
        let _ = builder.write_headers(headers);
        Ok(builder.build())
    }

    /// Resolves the cache key of a [`FetchRequest`].
    ///
    /// An explicit key on the request takes precedence over the url and headers.
    pub fn from_request(request: &FetchRequest) -> Result<Self, CacheError> {
        match request.cache_key() {
            Some(key) => Self::new(key),
            None => Self::for_url(request.url(), request.headers()),
        }
    }

    /// Restores a key that has been validated before, e.g. one read back from the disk index.
    pub(super) fn from_index(key: &str) -> Self {
        CacheKeyBuilder {
            key: key.to_owned(),
        }
        .build()
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder { key: key.into() }.build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// The accumulated text is stable across runs and is hashed to address the entry on disk.
struct CacheKeyBuilder {
    key: String,
}

impl CacheKeyBuilder {
    fn write_headers(&mut self, headers: &BTreeMap<String, String>) -> fmt::Result {
        let mut lines: Vec<_> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
            .collect();
        lines.sort();
        for (name, value) in lines {
            write!(self.key, "\n{name}: {value}")?;
        }
        Ok(())
    }

    fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.key).into();

        CacheKey {
            key: self.key.into(),
            hash,
        }
    }
}
