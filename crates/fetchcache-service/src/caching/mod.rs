//! # Fetchcache Caching infrastructure
//!
//! A cache instance hands out resources identified by a [`CacheKey`], fetching each resource
//! at most once no matter how many callers ask for it concurrently.
//!
//! ## Cache Layers
//!
//! Every [`Cacher`] consists of the following layers:
//!
//! - An in-memory layer, bounded by the weight of the cached bytes. Items may be evicted from it
//!   at any time, a miss here always falls through to the next layer.
//! - A file-system layer that persists fetched resources, together with a JSON index of their
//!   creation time, expiry, size and secondary attributes.
//! - A registry of in-flight fetch tasks, which is used for request coalescing (deduplicating
//!   concurrent accesses).
//!
//! A cache request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it will try to load the entry from the file-system, if enabled.
//! - On miss, it attaches to the in-flight task for the same key, or creates a new one.
//! - The task runs on either the fast or the slow queue, and finally invokes the [`Fetcher`].
//! - The fetched resource is stored in memory and on the file-system, and handed to every caller
//!   that attached to the task while it was in flight.
//!
//! ### Queues
//!
//! The fast queue runs a bounded number of fetches concurrently, the slow queue runs them one
//! after another. A task that is still waiting in the slow queue is moved over to the fast queue
//! once somebody requests its key on the fast queue. Tasks that have started already are not moved,
//! the new caller just waits for the running fetch.
//!
//! ### Metrics
//!
//! We collect a couple of metrics, each of those is tagged with a `cache` field that corresponds to
//! the cache instance name. Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.file.hit`: Accesses served by the file-system layer.
//! - `caches.fetch`: Actual fetches being run, and not served by any of the caching layers.
//! - `caches.tasks.coalesced`: Accesses that attached to an in-flight task.
//! - `caches.tasks.migrated`: Tasks moved from the slow to the fast queue.
//!
//! Various other metrics are being collected as well, including:
//! - `caches.file.size`: A histogram for the size (in bytes) of the written cache files.
//! - `caches.file.write`: The number of entries being written to disk.
//! - `caches.file.evicted`: The number of entries evicted to stay within the size budget.
//! - `caches.fetch.error` and `caches.fetch.retry`: Failed fetches, tagged by error kind.
//!
//! ### Configuration
//!
//! The file-system layer is gated by the [`Config::cache_dir`] option. If no `cache_dir` is
//! configured, fetched resources are only kept in memory.
//!
//! Each instance lives in its own directory below the `cache_dir`, and has its own limits, see
//! [`CacheConfigs`](crate::config::CacheConfigs). Entries expire after the configured `max_age`
//! unless they were written with an explicit expiry. Expired entries are invisible right away,
//! but their files are only removed by the next cleanup.
//!
//! ## [`CacheError`]
//!
//! [`CacheError::DownloadError`] and [`CacheError::Timeout`] are transient, a fetch failing with
//! either of those invokes the retry callbacks of all waiters, and may be attempted again up to the
//! configured `max_attempts`. Every other error is fatal and is handed to the waiters right away.
//!
//! Failing to write the file-system layer never fails a fetch, it is logged instead.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;

use crate::config::Config;
use crate::fetcher::Fetcher;

mod cache_error;
mod cache_key;
mod cacher;
mod cleanup;
mod decoded;
mod disk;
mod memory;
mod queue;
mod registry;
mod task;

pub use cache_error::*;
pub use cache_key::*;
pub use cacher::Cacher;
pub use cleanup::{CleanupStats, cleanup};
pub use decoded::{Decode, DecodedCacher};
pub use disk::{DiskCache, DiskEntry, IndexEntry};
pub use queue::Queue;
pub use registry::Callbacks;

/// The name of the cache instance used when none is given.
pub const DEFAULT_CACHE: &str = "default";

/// All cache instances of the process, created on first reference by name.
pub struct Caches {
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    instances: Mutex<BTreeMap<String, Cacher>>,
}

impl std::fmt::Debug for Caches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let instances = self
            .instances
            .try_lock()
            .map(|i| i.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("Caches")
            .field("cache_dir", &self.config.cache_dir)
            .field("instances", &instances)
            .finish()
    }
}

impl Caches {
    pub fn from_config(config: &Config, fetcher: Arc<dyn Fetcher>) -> anyhow::Result<Self> {
        if let Some(dir) = &config.cache_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache dir `{}`", dir.display()))?;
        }
        Ok(Self {
            config: config.clone(),
            fetcher,
            instances: Default::default(),
        })
    }

    /// Returns the cache instance called `name`, creating it if necessary.
    pub fn get(&self, name: &str) -> Result<Cacher, CacheError> {
        if name.is_empty() || name == disk::TMP_DIR || name.contains(['/', '\\', '.']) {
            return Err(CacheError::InvalidArgument(format!(
                "invalid cache name `{name}`"
            )));
        }

        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cacher) = instances.get(name) {
            return Ok(cacher.clone());
        }

        let cache_config = self.config.caches.for_name(name);
        let disk = self
            .config
            .cache_dir(name)
            .map(|dir| DiskCache::open(name, dir, cache_config))
            .transpose()?;
        let cacher = Cacher::new(
            name,
            cache_config,
            disk,
            Arc::clone(&self.fetcher),
            self.config.queues.fast_concurrency(),
            self.config.logging.categories,
        );
        tracing::debug!(cache = name, "Created cache instance");
        instances.insert(name.to_owned(), cacher.clone());
        Ok(cacher)
    }

    /// Returns the default cache instance.
    pub fn default_cache(&self) -> Result<Cacher, CacheError> {
        self.get(DEFAULT_CACHE)
    }

    /// Returns a cache of items decoded by `decoder`, backed by the instance called `name`.
    pub fn decoded<D: Decode>(
        &self,
        name: &str,
        decoder: D,
    ) -> Result<DecodedCacher<D>, CacheError> {
        let cacher = self.get(name)?;
        Ok(DecodedCacher::new(
            cacher,
            decoder,
            self.config.caches.decoded_memory_size(),
        ))
    }

    /// Names of all instances that are configured, were created, or have a directory on disk.
    pub fn known_names(&self) -> anyhow::Result<Vec<String>> {
        let mut names: Vec<String> = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.push(DEFAULT_CACHE.to_owned());
        names.extend(self.config.caches.named.keys().cloned());

        if let Some(dir) = &self.config.cache_dir {
            for entry in fs::read_dir(dir).context("failed to list cache dir")? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    names.extend(entry.file_name().to_str().map(str::to_owned));
                }
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Periodically cleans up all instances, every `interval`.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let caches = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let caches = Arc::clone(&caches);
                let result = tokio::task::spawn_blocking(move || caches.cleanup()).await;
                match result {
                    Ok(Err(err)) => {
                        let stderr: &dyn std::error::Error = &*err;
                        tracing::error!(stderr, "Periodic cache cleanup failed");
                    }
                    Err(err) => tracing::error!("Periodic cache cleanup panicked: {}", err),
                    Ok(Ok(())) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests;
