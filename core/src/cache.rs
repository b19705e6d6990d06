// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Immutable snapshots and the background tasks that republish them.
//!
//! A [`Snapshot`] holds one `Arc<T>` in an atomic pointer. Readers load it
//! without taking a lock and the publisher swaps it in one store, so a reader
//! never waits on a refresh and a refresh never waits on a reader. Loading the
//! next value from storage happens before the swap.
//!
//! A [`PeriodicTask`] drives anything implementing [`Periodic`] on its own
//! interval until [`PeriodicTask::stop`] is called or the handle is dropped.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::constants::REFRESH_SPLAY_PERCENT;
use crate::errors::CoreError;

/// An atomically replaced, never mutated, shared value.
pub struct Snapshot<T> {
    current: ArcSwap<T>,
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Snapshot<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Returns the current value. Callers keep the returned `Arc` for the
    /// duration of a request instead of calling `load` again.
    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Replaces the current value. Readers holding the previous `Arc` keep it.
    pub fn publish(&self, next: T) {
        self.current.store(Arc::new(next));
    }
}

/// Work that runs on a fixed, re-evaluated interval.
#[async_trait]
pub trait Periodic: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Interval before the next run. Read again after every run so a settings
    /// change applies within one cycle.
    fn interval(&self) -> Duration;

    async fn run_once(&self) -> Result<(), CoreError>;
}

/// Handle to a spawned [`Periodic`] loop.
pub struct PeriodicTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawns the loop on the current tokio runtime. The first run happens
    /// immediately.
    pub fn spawn<P: Periodic>(target: Arc<P>) -> Self {
        let name = target.name();
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                match target.run_once().await {
                    Ok(()) => tracing::debug!("[core] {} completed", name),
                    // keep whatever the previous run published
                    Err(e) => tracing::warn!("[core] {} failed: {}", name, e),
                }

                let wait = splay(target.interval());
                tracing::trace!("[core] {} sleeping for {:?}", name, wait);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stopped.changed() => break,
                }
            }
            tracing::debug!("[core] {} stopped", name);
        });

        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!("[core] {} task ended abnormally: {:?}", self.name, e);
        }
    }
}

/// Adds a random delay of up to [`REFRESH_SPLAY_PERCENT`] of `interval`.
pub fn splay(interval: Duration) -> Duration {
    let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    let max = millis / 100 * REFRESH_SPLAY_PERCENT;
    interval.saturating_add(Duration::from_millis(fastrand::u64(0..=max)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Periodic for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(10)
        }

        async fn run_once(&self) -> Result<(), CoreError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::StorageError("unavailable".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_publish_replaces_value() {
        let snapshot = Snapshot::new(1u32);
        let before = snapshot.load();
        snapshot.publish(2);
        assert_eq!(*before, 1);
        assert_eq!(*snapshot.load(), 2);
    }

    #[test]
    fn test_load_during_publish_sees_old_or_new() {
        let snapshot = Arc::new(Snapshot::new(0u64));
        let publisher = {
            let snapshot = snapshot.clone();
            std::thread::spawn(move || {
                for next in 1..=1000 {
                    snapshot.publish(next);
                }
            })
        };

        let mut last = 0;
        while last < 1000 {
            let seen = *snapshot.load();
            assert!(seen >= last);
            last = seen;
        }
        publisher.join().unwrap();
    }

    #[test]
    fn test_splay_bounds() {
        let interval = Duration::from_secs(300);
        for _ in 0..100 {
            let wait = splay(interval);
            assert!(wait >= interval);
            assert!(wait <= Duration::from_secs(330));
        }
    }

    #[test]
    fn test_splay_zero() {
        assert_eq!(splay(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_on_interval() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let task = PeriodicTask::spawn(counter.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        task.stop().await;

        assert_eq!(counter.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_survives_failures() {
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let task = PeriodicTask::spawn(counter.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!task.is_finished());
        task.stop().await;

        assert_eq!(counter.runs.load(Ordering::SeqCst), 3);
    }
}
