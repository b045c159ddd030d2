use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;

use crate::fetcher::FetchRequest;
use crate::utils::defer::defer;

use super::cacher::{Inner, State, cache_log};
use super::memory::InMemoryItem;
use super::queue::Queue;
use super::registry::TaskState;
use super::{CacheError, CacheKey};

impl Inner {
    /// Executes one admitted run of the task `id` for `key`.
    ///
    /// Whatever happens to the run, including the future being dropped or panicking, the
    /// slot on `queue` is released and the task either finishes or is queued again.
    pub(super) async fn run(self: Arc<Self>, key: CacheKey, id: u64, queue: Queue) {
        let guard = defer({
            let inner = Arc::clone(&self);
            let key = key.clone();
            move || {
                tracing::error!(cache = %inner.name, key = %key, "Fetch task was dropped before finishing");
                inner.finish_err(&key, id, queue, CacheError::InternalError, true);
            }
        });

        let task = {
            let mut state = self.lock();
            state
                .registry
                .get_task_mut(&key, id)
                .map(|task| (task.request.clone(), task.remote_only, task.attempt))
        };
        let Some((request, remote_only, attempt)) = task else {
            guard.disarm();
            self.release(queue);
            return;
        };

        let result = self.execute(&key, &request, queue, remote_only, attempt).await;
        guard.disarm();

        match result {
            Ok(data) => self.finish_ok(&key, id, queue, data),
            Err(err) if err.is_fatal() => self.finish_err(&key, id, queue, err, true),
            Err(err) => self.retry_or_fail(&key, id, queue, err),
        }
    }

    async fn execute(
        &self,
        key: &CacheKey,
        request: &FetchRequest,
        queue: Queue,
        remote_only: bool,
        attempt: u32,
    ) -> Result<Bytes, CacheError> {
        // the resource might have been stored while the task was waiting
        if !remote_only {
            if let Some(data) = self.lookup(key, request).await {
                return Ok(data);
            }
        }
        if !request.is_fetchable() {
            return Err(CacheError::NotFound);
        }

        cache_log!(self, REQUESTS, key = %key, url = request.url(), attempt, "Fetching resource");
        metric!(counter("caches.fetch") += 1, "cache" => self.name.as_str(), "queue" => queue.as_str());
        let start = Instant::now();
        let result = self.fetcher.fetch(request).await;
        metric!(timer("caches.fetch.duration") = start.elapsed(), "cache" => self.name.as_str());

        let data = match result {
            Ok(data) => data,
            Err(err) => {
                cache_log!(
                    self,
                    ERRORS,
                    key = %key,
                    url = request.url(),
                    error = %err,
                    fatal = err.is_fatal(),
                    "Fetch failed"
                );
                metric!(counter("caches.fetch.error") += 1, "cache" => self.name.as_str(), "kind" => err.kind());
                return Err(err);
            }
        };
        cache_log!(self, RESPONSES, key = %key, url = request.url(), size = data.len(), "Fetched resource");

        self.store(key, request, data.clone()).await;
        Ok(data)
    }

    /// Populates both tiers with a fetched resource.
    ///
    /// Failing to write the disk tier is logged, the fetch itself still succeeds.
    async fn store(&self, key: &CacheKey, request: &FetchRequest, data: Bytes) {
        let created = SystemTime::now();
        let expires = request
            .expires()
            .or_else(|| self.default_expiry(created));
        let secondary = request.secondary().clone();

        self.memory.put(
            key.clone(),
            InMemoryItem::new(data.clone(), created, expires, secondary.clone()),
        );

        if let Err(err) = self.write_to_disk(key, data, secondary, expires).await {
            sentry::with_scope(
                |scope| {
                    scope.set_tag("cache", &self.name);
                    scope.set_extra("key", key.to_string().into());
                },
                || tracing::error!("Failed to persist fetched resource: {}", err),
            );
            cache_log!(self, ERRORS, key = %key, error = %err, "Failed to write cache file");
        }
    }

    fn finish_ok(self: &Arc<Self>, key: &CacheKey, id: u64, queue: Queue, data: Bytes) {
        let (subscribers, admitted) = {
            let mut state = self.lock();
            state.scheduler.finished(queue);
            let subscribers = state.registry.unregister(key, id);
            (subscribers, Self::admit(&mut state))
        };
        self.spawn_all(admitted);

        if let Some(subscribers) = subscribers {
            tracing::trace!(cache = %self.name, key = %key, waiters = subscribers.len(), "Fetch task completed");
            subscribers.complete(data);
        }
    }

    fn finish_err(
        self: &Arc<Self>,
        key: &CacheKey,
        id: u64,
        queue: Queue,
        err: CacheError,
        is_fatal: bool,
    ) {
        let (subscribers, admitted) = {
            let mut state = self.lock();
            state.scheduler.finished(queue);
            let subscribers = state.registry.unregister(key, id);
            (subscribers, Self::admit(&mut state))
        };
        self.spawn_all(admitted);

        if let Some(subscribers) = subscribers {
            tracing::trace!(cache = %self.name, key = %key, waiters = subscribers.len(), "Fetch task failed");
            subscribers.fail(err, is_fatal);
        }
    }

    /// Queues the task again if it has attempts left, and fails it otherwise.
    fn retry_or_fail(self: &Arc<Self>, key: &CacheKey, id: u64, queue: Queue, err: CacheError) {
        let max_attempts = self.config.max_attempts.max(1);
        let requeued = {
            let mut state = self.lock();
            let State {
                registry,
                scheduler,
            } = &mut *state;
            match registry.get_task_mut(key, id) {
                Some(task) if task.attempt < max_attempts => {
                    task.state = TaskState::Pending;
                    scheduler.finished(queue);
                    scheduler.enqueue(key.clone(), task.queue);
                    let retries = task.retries();
                    Some((retries, Self::admit(&mut state)))
                }
                _ => None,
            }
        };
        let Some((retries, admitted)) = requeued else {
            return self.finish_err(key, id, queue, err, false);
        };

        cache_log!(self, ERRORS, key = %key, error = %err, "Retrying fetch");
        metric!(counter("caches.fetch.retry") += 1, "cache" => self.name.as_str());
        for f in retries {
            f(&err);
        }
        self.spawn_all(admitted);
    }

    /// Releases the slot of a run whose task is gone.
    fn release(self: &Arc<Self>, queue: Queue) {
        let admitted = {
            let mut state = self.lock();
            state.scheduler.finished(queue);
            Self::admit(&mut state)
        };
        self.spawn_all(admitted);
    }
}
