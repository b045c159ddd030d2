use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::oneshot;

use crate::config::{CacheConfig, LogCategories};
use crate::fetcher::{FetchRequest, Fetcher};

use super::disk::{DiskCache, DiskEntry};
use super::memory::{InMemoryItem, MemoryCache};
use super::queue::{Queue, Scheduler};
use super::registry::{Callbacks, Task, TaskRegistry, TaskState};
use super::{CacheError, CacheKey};

/// Logs cache activity at `INFO` level if its category is enabled, and at `TRACE` otherwise.
macro_rules! cache_log {
    ($inner:expr, $category:ident, $($arg:tt)+) => {{
        let inner = &$inner;
        if inner.categories.contains($crate::config::LogCategories::$category) {
            tracing::info!(cache = %inner.name, $($arg)+)
        } else {
            tracing::trace!(cache = %inner.name, $($arg)+)
        }
    }};
}
pub(super) use cache_log;

/// Registry and scheduler of a cache instance, mutated together under one lock.
#[derive(Debug)]
pub(super) struct State {
    pub registry: TaskRegistry,
    pub scheduler: Scheduler,
}

pub(super) struct Inner {
    pub name: String,
    pub config: CacheConfig,
    pub categories: LogCategories,
    pub memory: MemoryCache,
    pub disk: Option<Arc<DiskCache>>,
    pub fetcher: Arc<dyn Fetcher>,
    state: Mutex<State>,
    next_id: AtomicU64,
}

/// A run admitted by the scheduler, to be spawned once the state lock is released.
pub(super) type Admitted = Vec<(CacheKey, u64, Queue)>;

/// A named cache instance.
///
/// Looks up resources in the memory tier, then in the disk tier, and otherwise fetches
/// them with the [`Fetcher`]. Concurrent requests for the same key share a single fetch,
/// the result of which is persisted to both tiers and handed to every waiter.
///
/// All methods that may start a fetch have to be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Cacher {
    pub(super) inner: Arc<Inner>,
}

impl fmt::Debug for Cacher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (tasks, running, pending) = self
            .inner
            .state
            .try_lock()
            .map(|s| {
                let running = s.scheduler.running(Queue::Fast) + s.scheduler.running(Queue::Slow);
                let pending = s.scheduler.pending(Queue::Fast) + s.scheduler.pending(Queue::Slow);
                (s.registry.len(), running, pending)
            })
            .unwrap_or_default();
        f.debug_struct("Cacher")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("memory", &self.inner.memory)
            .field("disk", &self.inner.disk.as_ref().map(|d| d.dir().to_owned()))
            .field("live tasks", &tasks)
            .field("running fetches", &running)
            .field("pending fetches", &pending)
            .finish()
    }
}

impl Cacher {
    pub fn new(
        name: &str,
        config: CacheConfig,
        disk: Option<DiskCache>,
        fetcher: Arc<dyn Fetcher>,
        fast_concurrency: usize,
        categories: LogCategories,
    ) -> Self {
        let inner = Inner {
            name: name.to_owned(),
            config,
            categories,
            memory: MemoryCache::new(name, config.max_memory_size()),
            disk: disk.map(Arc::new),
            fetcher,
            state: Mutex::new(State {
                registry: TaskRegistry::default(),
                scheduler: Scheduler::new(fast_concurrency),
            }),
            next_id: AtomicU64::new(1),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The disk tier, if a cache directory is configured.
    pub fn disk(&self) -> Option<&DiskCache> {
        self.inner.disk.as_deref()
    }

    /// Returns the resource for `request`, fetching it on the given queue on a miss.
    ///
    /// A request without url can not be fetched, on a miss it only waits for a fetch of its
    /// key that is already in flight and fails with [`CacheError::NotFound`] otherwise.
    pub async fn get_or_fetch(
        &self,
        request: FetchRequest,
        queue: Queue,
    ) -> Result<Bytes, CacheError> {
        let key = CacheKey::from_request(&request)?;
        metric!(counter("caches.access") += 1, "cache" => self.inner.name.as_str());

        if let Some(data) = self.inner.lookup(&key, &request).await {
            return Ok(data);
        }
        self.subscribe_async(key, request, queue, false).await
    }

    /// Shorthand for [`get_or_fetch`](Self::get_or_fetch) on the slow queue.
    pub async fn slow_get_or_fetch(&self, request: FetchRequest) -> Result<Bytes, CacheError> {
        self.get_or_fetch(request, Queue::Slow).await
    }

    /// Fetches the resource for `request` without consulting the cache tiers.
    ///
    /// The fetched resource is still persisted to both tiers. A request without url can only
    /// wait for a fetch that is already in flight.
    pub async fn get_remote(
        &self,
        request: FetchRequest,
        queue: Queue,
    ) -> Result<Bytes, CacheError> {
        let key = CacheKey::from_request(&request)?;
        self.subscribe_async(key, request, queue, true).await
    }

    /// Callback flavor of [`get_or_fetch`](Self::get_or_fetch).
    ///
    /// A hit in the memory tier invokes the completion callback right away, otherwise the
    /// callbacks are attached to the task for the key. Requests without a valid key fail
    /// immediately, requests without url are looked up in the background.
    pub fn get_or_fetch_with(&self, request: FetchRequest, queue: Queue, callbacks: Callbacks) {
        let key = match CacheKey::from_request(&request) {
            Ok(key) => key,
            Err(err) => return callbacks.fail(err, true),
        };

        if !request.is_fetchable() {
            let cacher = self.clone();
            let lookup = async move {
                match cacher.get_or_fetch(request, queue).await {
                    Ok(data) => callbacks.complete(data),
                    Err(err) => {
                        let is_fatal = err.is_fatal();
                        callbacks.fail(err, is_fatal)
                    }
                }
            };
            tokio::spawn(lookup.bind_hub(Hub::new_from_top(Hub::current())));
            return;
        }

        metric!(counter("caches.access") += 1, "cache" => self.inner.name.as_str());
        if let Some(item) = self.inner.memory.get(&key, request.secondary()) {
            metric!(counter("caches.memory.hit") += 1, "cache" => self.inner.name.as_str());
            return callbacks.complete(item.data);
        }
        if let Err(callbacks) = self.inner.subscribe(key, request, queue, false, callbacks) {
            callbacks.fail(CacheError::NotFound, true);
        }
    }

    /// Returns the cached resource for `key` without ever fetching.
    pub async fn cached(&self, key: &CacheKey) -> Option<Bytes> {
        self.inner.lookup(key, &FetchRequest::default()).await
    }

    /// Whether a fresh entry for `key` exists in any tier.
    pub fn have(&self, key: &CacheKey) -> bool {
        self.inner.has(key, &Default::default())
    }

    /// Removes the entry for `key` from both tiers.
    pub fn remove(&self, key: &CacheKey) {
        self.inner.memory.remove(key);
        if let Some(disk) = &self.inner.disk {
            disk.remove(key);
        }
        cache_log!(self.inner, EVICTION, key = %key, "Removed cache entry");
    }

    /// Removes every entry from both tiers.
    pub fn clear(&self) {
        self.inner.memory.remove_all();
        if let Some(disk) = &self.inner.disk {
            let removed = disk.clear();
            cache_log!(self.inner, EVICTION, removed, "Cleared cache");
        }
    }

    /// Removes every entry from both tiers that is not in `keys`.
    pub fn remove_all_except(&self, keys: &[CacheKey]) {
        let keep: HashSet<&str> = keys.iter().map(CacheKey::as_str).collect();
        self.inner.memory.remove_all_except(&keep);
        if let Some(disk) = &self.inner.disk {
            let removed = disk.remove_all_except(&keep);
            cache_log!(self.inner, EVICTION, removed = removed.len(), "Removed cache entries");
        }
    }

    /// Removes entries created more than `age` ago, as well as all expired entries.
    pub fn flush_older_than(&self, age: Duration) {
        self.inner.memory.remove_older_than(age);
        if let Some(disk) = &self.inner.disk {
            let removed = disk.remove_older_than(age);
            for key in &removed {
                cache_log!(self.inner, EVICTION, key = key.as_str(), "Flushed cache entry");
            }
        }
    }

    /// Stores `data` as the entry for `key` in both tiers, without fetching anything.
    pub async fn add_raw(&self, data: Bytes, key: &CacheKey) -> Result<(), CacheError> {
        self.add_raw_with(data, key, Default::default(), None).await
    }

    /// Like [`add_raw`](Self::add_raw), with secondary attributes and an explicit expiry.
    pub async fn add_raw_with(
        &self,
        data: Bytes,
        key: &CacheKey,
        secondary: super::SecondaryAttrs,
        expires: Option<SystemTime>,
    ) -> Result<(), CacheError> {
        let created = SystemTime::now();
        let expires = expires.or_else(|| self.inner.default_expiry(created));
        self.inner.memory.put(
            key.clone(),
            InMemoryItem::new(data.clone(), created, expires, secondary.clone()),
        );
        self.inner
            .write_to_disk(key, data, secondary, expires)
            .await
    }

    /// Moves a task that is still waiting in the slow queue over to the fast queue.
    ///
    /// Returns `false` if there is no such task, or it has already started.
    pub fn move_to_fast_queue(&self, key: &CacheKey) -> bool {
        let mut state = self.inner.lock();
        let State {
            registry,
            scheduler,
        } = &mut *state;

        if !registry.migrate(key, Queue::Slow, Queue::Fast) {
            return false;
        }
        scheduler.remove_pending(key, Queue::Slow);
        scheduler.enqueue(key.clone(), Queue::Fast);
        metric!(counter("caches.tasks.migrated") += 1, "cache" => self.inner.name.as_str());

        let admitted = Inner::admit(&mut state);
        drop(state);
        self.inner.spawn_all(admitted);
        true
    }

    /// Moves a task that is still waiting in the fast queue to the back of the slow queue.
    ///
    /// Returns `false` if there is no such task, or it has already started.
    pub fn move_to_slow_queue(&self, key: &CacheKey) -> bool {
        let mut state = self.inner.lock();
        let State {
            registry,
            scheduler,
        } = &mut *state;

        if !registry.migrate(key, Queue::Fast, Queue::Slow) {
            return false;
        }
        scheduler.remove_pending(key, Queue::Fast);
        scheduler.enqueue(key.clone(), Queue::Slow);
        cache_log!(self.inner, REQUESTS, key = %key, "Moved fetch to the slow queue");

        let admitted = Inner::admit(&mut state);
        drop(state);
        self.inner.spawn_all(admitted);
        true
    }

    /// Cancels the task for `key` if it has not started yet.
    ///
    /// No callback of a cancelled task is invoked, async waiters observe
    /// [`CacheError::Cancelled`]. Running tasks are not affected.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let subscribers = {
            let mut state = self.inner.lock();
            let State {
                registry,
                scheduler,
            } = &mut *state;
            let Some(task) = registry.get(key) else {
                return false;
            };
            if !scheduler.remove_pending(key, task.queue) {
                return false;
            }
            let id = task.id;
            registry.unregister(key, id)
        };
        cache_log!(self.inner, REQUESTS, key = %key, "Cancelled fetch");
        drop(subscribers);
        true
    }

    /// Sweeps expired and orphaned files, and enforces the size budget of the disk tier.
    pub fn cleanup(&self) -> anyhow::Result<()> {
        let Some(disk) = &self.inner.disk else {
            return Ok(());
        };
        let stats = disk.cleanup()?;
        for key in &stats.removed_keys {
            self.inner.memory.remove(&CacheKey::from_index(key));
            cache_log!(self.inner, EVICTION, key = key.as_str(), "Swept cache entry");
        }
        Ok(())
    }

    async fn subscribe_async(
        &self,
        key: CacheKey,
        request: FetchRequest,
        queue: Queue,
        remote_only: bool,
    ) -> Result<Bytes, CacheError> {
        let (sender, receiver) = oneshot::channel();
        let failure_sender = Arc::new(Mutex::new(Some(sender)));
        let complete_sender = Arc::clone(&failure_sender);

        let callbacks = Callbacks::new()
            .on_complete(move |data| {
                if let Some(sender) = take_sender(&complete_sender) {
                    let _ = sender.send(Ok(data));
                }
            })
            .on_failure(move |err, _is_fatal| {
                if let Some(sender) = take_sender(&failure_sender) {
                    let _ = sender.send(Err(err));
                }
            });
        if self
            .inner
            .subscribe(key, request, queue, remote_only, callbacks)
            .is_err()
        {
            return Err(CacheError::NotFound);
        }

        receiver.await.unwrap_or(Err(CacheError::Cancelled))
    }

    #[cfg(test)]
    pub(super) fn task_count(&self) -> usize {
        self.inner.lock().registry.len()
    }
}

fn take_sender<T>(sender: &Mutex<Option<T>>) -> Option<T> {
    sender.lock().unwrap_or_else(PoisonError::into_inner).take()
}

impl Inner {
    pub(super) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn default_expiry(&self, now: SystemTime) -> Option<SystemTime> {
        self.config.max_age.and_then(|age| now.checked_add(age))
    }

    /// Whether a fresh entry for `key` carrying the `wanted` attributes exists in any tier.
    pub(super) fn has(&self, key: &CacheKey, wanted: &super::SecondaryAttrs) -> bool {
        if self.memory.get(key, wanted).is_some() {
            return true;
        }
        self.disk.as_ref().is_some_and(|disk| disk.has(key, wanted))
    }

    /// Looks up `key` in the memory tier and then in the disk tier.
    ///
    /// Disk hits are promoted to the memory tier.
    pub(super) async fn lookup(&self, key: &CacheKey, request: &FetchRequest) -> Option<Bytes> {
        if let Some(item) = self.memory.get(key, request.secondary()) {
            metric!(counter("caches.memory.hit") += 1, "cache" => self.name.as_str());
            cache_log!(self, CACHE, key = %key, "Memory cache hit");
            return Some(item.data);
        }

        let disk = Arc::clone(self.disk.as_ref()?);
        let disk_key = key.clone();
        let wanted = request.secondary().clone();
        let entry = tokio::task::spawn_blocking(move || disk.read(&disk_key, &wanted, None))
            .await
            .ok()
            .flatten();

        let Some(DiskEntry {
            data,
            created,
            expires,
            secondary,
        }) = entry
        else {
            cache_log!(self, CACHE, key = %key, "Cache miss");
            return None;
        };

        metric!(counter("caches.file.hit") += 1, "cache" => self.name.as_str());
        cache_log!(self, CACHE, key = %key, "File cache hit");
        self.memory.put(
            key.clone(),
            InMemoryItem::new(data.clone(), created, expires, secondary),
        );
        Some(data)
    }

    /// Writes `data` to the disk tier, if there is one.
    pub(super) async fn write_to_disk(
        &self,
        key: &CacheKey,
        data: Bytes,
        secondary: super::SecondaryAttrs,
        expires: Option<SystemTime>,
    ) -> Result<(), CacheError> {
        let Some(disk) = self.disk.as_ref().map(Arc::clone) else {
            return Ok(());
        };
        let disk_key = key.clone();
        let evicted = tokio::task::spawn_blocking(move || {
            disk.write(&disk_key, &data, secondary, expires)
        })
        .await
        .map_err(|_| CacheError::InternalError)??;

        for evicted_key in &evicted {
            self.memory.remove(&CacheKey::from_index(evicted_key));
            cache_log!(self, EVICTION, key = evicted_key.as_str(), "Evicted cache entry");
        }
        cache_log!(self, CACHE, key = %key, "Stored cache entry");
        Ok(())
    }

    /// Attaches `callbacks` to the task for `key`, creating the task if there is none.
    ///
    /// A request on the fast queue pulls a task that is still waiting in the slow queue
    /// over, a running task is attached to as is. A request without url never creates a
    /// task, its callbacks are handed back if there is nothing to attach to.
    pub(super) fn subscribe(
        self: &Arc<Self>,
        key: CacheKey,
        request: FetchRequest,
        queue: Queue,
        remote_only: bool,
        callbacks: Callbacks,
    ) -> Result<(), Callbacks> {
        let mut state = self.lock();
        let State {
            registry,
            scheduler,
        } = &mut *state;

        if queue == Queue::Fast && registry.migrate(&key, Queue::Slow, Queue::Fast) {
            scheduler.remove_pending(&key, Queue::Slow);
            scheduler.enqueue(key.clone(), Queue::Fast);
            metric!(counter("caches.tasks.migrated") += 1, "cache" => self.name.as_str());
        }

        match registry.get_mut(&key) {
            Some(task) => {
                task.attach(callbacks);
                metric!(counter("caches.tasks.coalesced") += 1, "cache" => self.name.as_str());
                tracing::trace!(cache = %self.name, key = %key, ?task, "Attached to existing task");
            }
            None if !request.is_fetchable() => return Err(callbacks),
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let mut task = Task::new(id, request, queue, remote_only);
                task.attach(callbacks);
                registry.register(key.clone(), task);
                scheduler.enqueue(key, queue);
            }
        }

        let admitted = Self::admit(&mut state);
        drop(state);
        self.spawn_all(admitted);
        Ok(())
    }

    /// Marks every run the scheduler admits as running.
    pub(super) fn admit(state: &mut State) -> Admitted {
        let mut admitted = vec![];
        while let Some((key, queue)) = state.scheduler.next() {
            match state.registry.get_mut(&key) {
                Some(task) => {
                    task.state = TaskState::Running;
                    task.attempt += 1;
                    admitted.push((key, task.id, queue));
                }
                None => state.scheduler.finished(queue),
            }
        }
        admitted
    }

    pub(super) fn spawn_all(self: &Arc<Self>, admitted: Admitted) {
        for (key, id, queue) in admitted {
            let run = Arc::clone(self).run(key, id, queue);
            tokio::spawn(run.bind_hub(Hub::new_from_top(Hub::current())));
        }
    }
}
