use std::collections::VecDeque;

use super::CacheKey;

/// The lane a fetch is executed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Bounded concurrency, for fetches somebody is actively waiting for.
    Fast,
    /// Strictly serial, for background fetches.
    Slow,
}

impl Queue {
    pub fn as_str(self) -> &'static str {
        match self {
            Queue::Fast => "fast",
            Queue::Slow => "slow",
        }
    }
}

#[derive(Debug)]
struct Lane {
    pending: VecDeque<CacheKey>,
    running: usize,
    limit: usize,
}

impl Lane {
    fn new(limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            running: 0,
            limit: limit.max(1),
        }
    }

    fn next(&mut self) -> Option<CacheKey> {
        if self.running >= self.limit {
            return None;
        }
        let key = self.pending.pop_front()?;
        self.running += 1;
        Some(key)
    }
}

/// Admission control for the fast and slow lanes.
///
/// The scheduler only tracks keys and slot usage, the tasks themselves live in the
/// task registry.
#[derive(Debug)]
pub(super) struct Scheduler {
    fast: Lane,
    slow: Lane,
}

impl Scheduler {
    pub fn new(fast_concurrency: usize) -> Self {
        Self {
            fast: Lane::new(fast_concurrency),
            slow: Lane::new(1),
        }
    }

    fn lane(&mut self, queue: Queue) -> &mut Lane {
        match queue {
            Queue::Fast => &mut self.fast,
            Queue::Slow => &mut self.slow,
        }
    }

    /// Appends `key` to the back of the lane of `queue`.
    pub fn enqueue(&mut self, key: CacheKey, queue: Queue) {
        self.lane(queue).pending.push_back(key);
    }

    /// Removes `key` from the lane of `queue` if it has not been admitted yet.
    pub fn remove_pending(&mut self, key: &CacheKey, queue: Queue) -> bool {
        let lane = self.lane(queue);
        match lane.pending.iter().position(|k| k == key) {
            Some(pos) => {
                lane.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Admits the next pending key, preferring the fast lane.
    pub fn next(&mut self) -> Option<(CacheKey, Queue)> {
        if let Some(key) = self.fast.next() {
            return Some((key, Queue::Fast));
        }
        self.slow.next().map(|key| (key, Queue::Slow))
    }

    /// Releases the slot of a finished run on `queue`.
    pub fn finished(&mut self, queue: Queue) {
        let lane = self.lane(queue);
        lane.running = lane.running.saturating_sub(1);
    }

    pub fn running(&self, queue: Queue) -> usize {
        match queue {
            Queue::Fast => self.fast.running,
            Queue::Slow => self.slow.running,
        }
    }

    pub fn pending(&self, queue: Queue) -> usize {
        match queue {
            Queue::Fast => self.fast.pending.len(),
            Queue::Slow => self.slow.pending.len(),
        }
    }
}
