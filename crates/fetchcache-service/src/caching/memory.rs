use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;

use super::{CacheKey, SecondaryAttrs, attrs_match};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
pub struct InMemoryItem {
    /// When to evict this item from the in-memory cache, `None` if never.
    deadline: Option<Instant>,
    /// When the item was first written to any tier.
    pub created: SystemTime,
    pub secondary: SecondaryAttrs,
    /// The actual data.
    pub data: Bytes,
}

impl InMemoryItem {
    pub fn new(
        data: Bytes,
        created: SystemTime,
        expires: Option<SystemTime>,
        secondary: SecondaryAttrs,
    ) -> Self {
        let deadline = expires.map(|expires| {
            let remaining = expires
                .duration_since(SystemTime::now())
                .unwrap_or_default();
            Instant::now() + remaining
        });
        Self {
            deadline,
            created,
            secondary,
            data,
        }
    }

    /// When this item expires, `None` if never.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] [`Instant`] as the explicit
/// expiration time.
struct CacheExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
pub(super) fn saturating_duration_since(
    current_time: Instant,
    target_time: Instant,
) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<CacheKey, InMemoryItem> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        value
            .deadline
            .and_then(|deadline| saturating_duration_since(current_time, deadline))
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .and_then(|deadline| saturating_duration_since(current_time, deadline))
    }
}

/// The volatile tier of a cache instance.
///
/// Items are weighed by their size in bytes and may be evicted at any time, a miss here
/// is never authoritative.
#[derive(Clone)]
pub struct MemoryCache {
    cache: moka::sync::Cache<CacheKey, InMemoryItem>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("in-memory items", &self.cache.entry_count())
            .field("weighted size", &self.cache.weighted_size())
            .finish()
    }
}

impl MemoryCache {
    /// Creates the memory tier, bounded to `capacity` bytes if given.
    pub fn new(name: &str, capacity: Option<u64>) -> Self {
        let mut builder = moka::sync::Cache::builder()
            .name(name)
            .expire_after(CacheExpiration)
            // NOTE: we count the bookkeeping structures to the weight as well
            .weigher(|_k: &CacheKey, v: &InMemoryItem| {
                let size = std::mem::size_of::<(CacheKey, InMemoryItem)>() + v.data.len();
                u32::try_from(size).unwrap_or(u32::MAX)
            });
        if let Some(capacity) = capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            cache: builder.build(),
        }
    }

    /// Returns the item for `key` if it carries all the `wanted` secondary attributes.
    pub fn get(&self, key: &CacheKey, wanted: &SecondaryAttrs) -> Option<InMemoryItem> {
        let now = Instant::now();
        self.cache
            .get(key)
            .filter(|item| item.deadline.is_none_or(|deadline| deadline > now))
            .filter(|item| attrs_match(&item.secondary, wanted))
    }

    pub fn put(&self, key: CacheKey, item: InMemoryItem) {
        self.cache.insert(key, item);
    }

    pub fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    pub fn remove_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn remove_all_except(&self, keep: &HashSet<&str>) {
        self.remove_where(|key, _| !keep.contains(key.as_str()));
    }

    /// Removes items created more than `age` ago.
    pub fn remove_older_than(&self, age: Duration) {
        let cutoff = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.remove_where(|_, item| item.created < cutoff);
    }

    fn remove_where(&self, f: impl Fn(&CacheKey, &InMemoryItem) -> bool) {
        let keys: Vec<_> = self
            .cache
            .iter()
            .filter(|(key, item)| f(key, item))
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.cache.invalidate(&*key);
        }
    }

    #[cfg(test)]
    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}
