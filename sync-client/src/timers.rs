//! Keyed, cancellable one-shot timers.
//!
//! Scheduling a key that already has a timer replaces it: the old task is
//! aborted before it fires.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// One-shot timers keyed by `K`.
#[derive(Debug)]
pub struct TimerRegistry<K> {
    tasks: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K: Eq + Hash> TimerRegistry<K> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `task` after `delay` unless cancelled or replaced first.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|_, h| !h.is_finished());
        if let Some(previous) = tasks.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel the timer for `key`. Returns `true` if one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match handle {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Cancel every timer whose key matches `pred`.
    pub fn cancel_matching(&self, pred: impl Fn(&K) -> bool) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|key, handle| {
            if pred(key) {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    /// Cancel every timer.
    pub fn cancel_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in tasks.into_values() {
            handle.abort();
        }
    }

    /// Number of timers still pending.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }
}

impl<K: Eq + Hash> Default for TimerRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TimerRegistry<K> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timers = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        timers.schedule("a", Duration::from_secs(3), counter_task(&fired));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_previous() {
        let timers = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        timers.schedule("a", Duration::from_secs(3), counter_task(&fired));
        tokio::time::sleep(Duration::from_secs(2)).await;
        timers.schedule("a", Duration::from_secs(3), counter_task(&fired));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let timers = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        timers.schedule("a", Duration::from_secs(1), counter_task(&fired));
        timers.schedule("b", Duration::from_secs(1), counter_task(&fired));

        assert!(timers.cancel(&"a"));
        assert!(!timers.cancel(&"missing"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_matching_is_selective() {
        let timers = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for key in ["typing-a", "typing-b", "other"] {
            timers.schedule(key, Duration::from_secs(1), counter_task(&fired));
        }

        timers.cancel_matching(|key| key.starts_with("typing"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_everything() {
        let timers = TimerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            timers.schedule(key, Duration::from_secs(1), counter_task(&fired));
        }
        assert_eq!(timers.pending(), 3);

        timers.cancel_all();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
