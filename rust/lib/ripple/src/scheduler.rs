use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delayed, coalescing task runner for deferred broadcasts.
///
/// Scheduling a task under a feature key that already has a pending task
/// cancels the pending one, so only the most recent task per feature runs.
/// Must be used from within a tokio runtime.
pub struct Scheduler {
    root: CancellationToken,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    next_generation: Mutex<u64>,
}

struct Pending {
    generation: u64,
    token: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
        }
    }

    /// Run `task` after `delay`, replacing any pending task for `feature`.
    pub fn run_later<F>(&self, feature: String, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.root.is_cancelled() {
            debug!(feature = %feature, "scheduler shut down, dropping task");
            return;
        }

        let generation = {
            let mut next = self.next_generation.lock().unwrap();
            *next += 1;
            *next
        };
        let token = self.root.child_token();
        {
            let mut pending = self.pending.lock().unwrap();
            let replaced = pending.insert(
                feature.clone(),
                Pending {
                    generation,
                    token: token.clone(),
                },
            );
            if let Some(old) = replaced {
                debug!(feature = %feature, "replacing pending broadcast");
                old.token.cancel();
            }
        }

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut pending = pending.lock().unwrap();
                        if pending.get(&feature).is_some_and(|p| p.generation == generation) {
                            pending.remove(&feature);
                        }
                    }
                    task();
                }
            }
        });
    }

    /// Number of tasks still waiting.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Cancel every pending task. Later `run_later` calls are dropped.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.pending.lock().unwrap().clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counter_task(counter: &Arc<AtomicU64>, add: u64) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(add, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.run_later("f".into(), Duration::from_millis(300), counter_task(&counter, 1));

        tokio::time::sleep(Duration::from_millis(299)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_feature_coalesces_to_latest() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.run_later("f".into(), Duration::from_millis(300), counter_task(&counter, 1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.run_later("f".into(), Duration::from_millis(300), counter_task(&counter, 10));
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_features_both_run() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.run_later("a".into(), Duration::from_millis(50), counter_task(&counter, 1));
        scheduler.run_later("b".into(), Duration::from_millis(50), counter_task(&counter, 10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        scheduler.run_later("f".into(), Duration::from_millis(50), counter_task(&counter, 1));
        scheduler.shutdown();
        scheduler.run_later("g".into(), Duration::from_millis(50), counter_task(&counter, 1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }
}
