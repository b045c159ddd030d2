//! The boundary to the transport that actually downloads resources.

use std::collections::BTreeMap;
use std::time::SystemTime;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::{CacheError, SecondaryAttrs};

/// A request for a single resource.
///
/// The cache key of a request is derived from its url and headers, unless an explicit key
/// is given with [`with_cache_key`](Self::with_cache_key).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    url: String,
    headers: BTreeMap<String, String>,
    cache_key: Option<String>,
    secondary: SecondaryAttrs,
    expires: Option<SystemTime>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// A request that can only be served from the cache tiers.
    pub fn for_key(key: impl Into<String>) -> Self {
        Self::default().with_cache_key(key)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Adds an attribute that a cached entry has to carry to be a hit for this request.
    ///
    /// Fetched resources are stored with all the secondary attributes of the request.
    pub fn with_secondary(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secondary.insert(name.into(), value.into());
        self
    }

    /// Overrides the configured max age for the resource fetched by this request.
    pub fn with_expiry(mut self, expires: SystemTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn secondary(&self) -> &SecondaryAttrs {
        &self.secondary
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    /// Whether the request has anything to fetch from, as opposed to a pure cache lookup.
    pub fn is_fetchable(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Downloads the resource a [`FetchRequest`] points at.
///
/// Errors are classified with [`CacheError::is_fatal`]: transient errors may be retried,
/// fatal ones are reported to every waiter right away.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> BoxFuture<'a, Result<Bytes, CacheError>>;
}

/// A [`Fetcher`] that never reaches out to any remote.
///
/// Used for tooling that only works on what is already cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

impl Fetcher for Offline {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> BoxFuture<'a, Result<Bytes, CacheError>> {
        tracing::debug!(url = request.url(), "Not fetching while offline");
        Box::pin(async { Err(CacheError::NotFound) })
    }
}
