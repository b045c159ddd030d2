use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::future::{Cache, CacheBuilder};

use crate::fetcher::FetchRequest;

use super::memory::saturating_duration_since;
use super::{CacheError, CacheKey, Cacher, Queue, SecondaryAttrs, attrs_match};

/// Turns raw bytes into a typed in-memory representation, e.g. a decoded image.
pub trait Decode: Send + Sync + 'static {
    /// The decoded item.
    type Item: Clone + Send + Sync + 'static;
    /// The error returned for bytes that can not be decoded.
    type Error: fmt::Display;

    fn decode(&self, data: Bytes) -> Result<Self::Item, Self::Error>;

    /// The "cost" of keeping this item in the in-memory cache.
    fn weight(item: &Self::Item) -> u32 {
        std::mem::size_of_val(item) as u32
    }
}

/// A decoded item, along with the attributes and deadline of the raw entry it was decoded from.
#[derive(Clone)]
struct DecodedItem<T> {
    item: T,
    secondary: SecondaryAttrs,
    deadline: Option<Instant>,
}

/// Expires decoded items together with their raw entry.
struct DecodedExpiration;

impl<T> moka::Expiry<CacheKey, DecodedItem<T>> for DecodedExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &DecodedItem<T>,
        current_time: Instant,
    ) -> Option<Duration> {
        value
            .deadline
            .and_then(|deadline| saturating_duration_since(current_time, deadline))
    }
}

/// A cache of decoded items in front of a [`Cacher`].
///
/// Concurrent requests for the same key share a single fetch and a single decode. Bytes that
/// fail to decode are removed from both tiers of the underlying cache, so that the next request
/// fetches them anew.
///
/// A decoded item is only handed out while its raw entry is still cached with the secondary
/// attributes of the request.
pub struct DecodedCacher<D: Decode> {
    cacher: Cacher,
    decoder: Arc<D>,
    items: Cache<CacheKey, DecodedItem<D::Item>>,
}

impl<D: Decode> Clone for DecodedCacher<D> {
    fn clone(&self) -> Self {
        Self {
            cacher: self.cacher.clone(),
            decoder: Arc::clone(&self.decoder),
            items: self.items.clone(),
        }
    }
}

impl<D: Decode> fmt::Debug for DecodedCacher<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedCacher")
            .field("cacher", &self.cacher)
            .field("decoded items", &self.items.entry_count())
            .finish()
    }
}

impl<D: Decode> DecodedCacher<D> {
    /// Creates a decoded cache holding up to `capacity` of weight.
    pub fn new(cacher: Cacher, decoder: D, capacity: u64) -> Self {
        let items = CacheBuilder::new(capacity)
            .name(&format!("{}-decoded", cacher.name()))
            .expire_after(DecodedExpiration)
            .weigher(|_k, v: &DecodedItem<D::Item>| D::weight(&v.item))
            .build();
        Self {
            cacher,
            decoder: Arc::new(decoder),
            items,
        }
    }

    pub fn cacher(&self) -> &Cacher {
        &self.cacher
    }

    /// Returns the decoded item for `request`, fetching and decoding it on a miss.
    pub async fn get_or_fetch(
        &self,
        request: FetchRequest,
        queue: Queue,
    ) -> Result<D::Item, CacheError> {
        let key = CacheKey::from_request(&request)?;
        if queue == Queue::Fast {
            // a background fetch of the raw bytes may already be waiting in the slow queue
            self.cacher.move_to_fast_queue(&key);
        }

        // the raw entry may have been removed, flushed or replaced in the meantime
        if let Some(decoded) = self.items.get(&key).await {
            if self.is_current(&key, &decoded, request.secondary()) {
                return Ok(decoded.item);
            }
            self.items.invalidate(&key).await;
        }

        let init = async {
            let data = self.cacher.get_or_fetch(request.clone(), queue).await?;
            let item = self.decode(&key, data)?;
            let raw = self.cacher.inner.memory.get(&key, request.secondary());
            Ok(DecodedItem {
                item,
                secondary: request.secondary().clone(),
                deadline: raw.and_then(|raw| raw.deadline()),
            })
        };

        let decoded = self
            .items
            .try_get_with(key.clone(), init)
            .await
            .map_err(|err: Arc<CacheError>| (*err).clone())?;
        if attrs_match(&decoded.secondary, request.secondary()) {
            return Ok(decoded.item);
        }

        // raced with a request for different secondary attributes
        let data = self.cacher.get_or_fetch(request, queue).await?;
        self.decode(&key, data)
    }

    /// Removes the decoded item and the raw entry for `key`.
    pub async fn remove(&self, key: &CacheKey) {
        self.items.invalidate(key).await;
        self.cacher.remove(key);
    }

    /// Drops all decoded items, leaving the raw entries in place.
    pub fn clear(&self) {
        self.items.invalidate_all();
    }

    fn is_current(
        &self,
        key: &CacheKey,
        decoded: &DecodedItem<D::Item>,
        wanted: &SecondaryAttrs,
    ) -> bool {
        attrs_match(&decoded.secondary, wanted) && self.cacher.inner.has(key, wanted)
    }

    fn decode(&self, key: &CacheKey, data: Bytes) -> Result<D::Item, CacheError> {
        self.decoder.decode(data).map_err(|err| {
            tracing::warn!(cache = self.cacher.name(), key = %key, "Failed to decode cached resource: {}", err);
            self.cacher.remove(key);
            CacheError::Malformed(err.to_string())
        })
    }
}
