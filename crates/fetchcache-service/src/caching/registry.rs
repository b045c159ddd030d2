use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::fetcher::FetchRequest;

use super::queue::Queue;
use super::{CacheError, CacheKey};

/// Invoked with the fetched bytes once the task succeeded.
pub type OnComplete = Box<dyn FnOnce(Bytes) + Send + 'static>;
/// Invoked once the task failed for good, with the error and whether it was fatal.
pub type OnFailure = Box<dyn FnOnce(CacheError, bool) + Send + 'static>;
/// Invoked for every transient failure of the task.
pub type OnRetry = Arc<dyn Fn(&CacheError) + Send + Sync + 'static>;

/// The callbacks a single caller attaches to a fetch.
#[derive(Default)]
pub struct Callbacks {
    on_complete: Option<OnComplete>,
    on_failure: Option<OnFailure>,
    on_retry: Option<OnRetry>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_complete(mut self, f: impl FnOnce(Bytes) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(CacheError, bool) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub fn on_retry(mut self, f: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Reports a failure that happened before any task was involved.
    pub(super) fn fail(self, error: CacheError, is_fatal: bool) {
        if let Some(f) = self.on_failure {
            f(error, is_fatal)
        }
    }

    pub(super) fn complete(self, data: Bytes) {
        if let Some(f) = self.on_complete {
            f(data)
        }
    }
}

/// The callbacks of all callers of a task, in attachment order.
#[derive(Default)]
pub(super) struct Subscribers {
    completions: Vec<OnComplete>,
    failures: Vec<OnFailure>,
    retries: Vec<OnRetry>,
}

impl Subscribers {
    fn attach(&mut self, callbacks: Callbacks) {
        let Callbacks {
            on_complete,
            on_failure,
            on_retry,
        } = callbacks;
        self.completions.extend(on_complete);
        self.failures.extend(on_failure);
        self.retries.extend(on_retry);
    }

    pub fn len(&self) -> usize {
        self.completions.len().max(self.failures.len())
    }

    /// Invokes every completion callback exactly once.
    pub fn complete(self, data: Bytes) {
        for f in self.completions {
            f(data.clone());
        }
    }

    /// Invokes the failure callbacks, preceded by the retry callbacks for transient errors.
    pub fn fail(self, error: CacheError, is_fatal: bool) {
        if !is_fatal {
            for f in &self.retries {
                f(&error);
            }
        }
        for f in self.failures {
            f(error.clone(), is_fatal);
        }
    }
}

/// Execution state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TaskState {
    /// Waiting in the lane of its queue.
    Pending,
    /// Admitted by the scheduler, the fetch is in flight.
    Running,
}

/// A fetch of a single cache key, shared by every caller that asked for the key while
/// it was in flight.
pub(super) struct Task {
    /// Unique id, so that a finished run can not drain a newer task of the same key.
    pub id: u64,
    pub request: FetchRequest,
    pub queue: Queue,
    pub state: TaskState,
    /// Number of runs started so far.
    pub attempt: u32,
    /// Skip the cache tiers and always fetch.
    pub remote_only: bool,
    subscribers: Subscribers,
}

impl Task {
    pub fn new(id: u64, request: FetchRequest, queue: Queue, remote_only: bool) -> Self {
        Self {
            id,
            request,
            queue,
            state: TaskState::Pending,
            attempt: 0,
            remote_only,
            subscribers: Subscribers::default(),
        }
    }

    pub fn attach(&mut self, callbacks: Callbacks) {
        self.subscribers.attach(callbacks);
    }

    /// The retry callbacks, to be invoked outside of the registry lock.
    pub fn retries(&self) -> Vec<OnRetry> {
        self.subscribers.retries.clone()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("url", &self.request.url())
            .field("queue", &self.queue)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// All live tasks of a cache instance, at most one per key.
#[derive(Debug, Default)]
pub(super) struct TaskRegistry {
    tasks: HashMap<CacheKey, Task>,
}

impl TaskRegistry {
    /// Returns the live task for `key` if it belongs to `queue`.
    pub fn find_existing(&self, key: &CacheKey, queue: Queue) -> Option<&Task> {
        self.tasks.get(key).filter(|task| task.queue == queue)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    pub fn get_mut(&mut self, key: &CacheKey) -> Option<&mut Task> {
        self.tasks.get_mut(key)
    }

    /// Returns the live task for `key`, only if it is the one with the given `id`.
    pub fn get_task_mut(&mut self, key: &CacheKey, id: u64) -> Option<&mut Task> {
        self.tasks.get_mut(key).filter(|task| task.id == id)
    }

    pub fn register(&mut self, key: CacheKey, task: Task) {
        debug_assert!(!self.tasks.contains_key(&key));
        self.tasks.insert(key, task);
    }

    /// Moves the task for `key` from queue `from` to `to`.
    ///
    /// This only succeeds while the task is still pending in `from`.
    pub fn migrate(&mut self, key: &CacheKey, from: Queue, to: Queue) -> bool {
        let movable = self
            .find_existing(key, from)
            .is_some_and(|task| task.state == TaskState::Pending);
        if !movable {
            return false;
        }
        if let Some(task) = self.tasks.get_mut(key) {
            task.queue = to;
        }
        true
    }

    /// Removes the task with the given `id`, handing out its subscribers.
    ///
    /// The caller is expected to drain the subscribers with [`Subscribers::complete`] or
    /// [`Subscribers::fail`] once the lock guarding the registry has been released.
    /// Dropping them instead cancels all waiters without invoking any callback.
    pub fn unregister(&mut self, key: &CacheKey, id: u64) -> Option<Subscribers> {
        self.get_task_mut(key, id)?;
        self.tasks.remove(key).map(|task| task.subscribers)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
