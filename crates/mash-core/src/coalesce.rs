//! Build coalescing (singleflight pattern)
//!
//! When several executions need the same keg at the same time, only one of
//! them builds it. The others subscribe to the in-flight build and receive
//! a clone of its result.
//!
//! The leader deregisters its key before broadcasting, so a request that
//! arrives after the broadcast becomes a new leader. Work passed in must
//! therefore be idempotent: the executor re-checks the keg store and the
//! bottle cache before building.
//!
//! A result that only concerns the leader (its own cancellation) can be
//! rejected by waiters with [`Coalescer::run_or_retry`]; they then race
//! for the key again and one of them runs the work itself.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

/// Coalesces concurrent requests for the same key.
#[derive(Debug)]
pub struct Coalescer<T> {
    /// In-flight work (key -> broadcast sender)
    inflight: DashMap<String, broadcast::Sender<T>>,
    /// Count of requests that waited on someone else's work
    coalesced_count: AtomicU64,
}

enum Role<T> {
    Leader(broadcast::Sender<T>),
    Follower(broadcast::Receiver<T>),
}

/// Deregisters the leader's key if its future is dropped mid-flight.
struct InflightGuard<'a, T> {
    inflight: &'a DashMap<String, broadcast::Sender<T>>,
    key: &'a str,
    sender: &'a broadcast::Sender<T>,
}

impl<T> Drop for InflightGuard<'_, T> {
    fn drop(&mut self) {
        self.inflight
            .remove_if(self.key, |_, sender| sender.same_channel(self.sender));
    }
}

impl<T: Clone> Coalescer<T> {
    /// Create an empty coalescer.
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
            coalesced_count: AtomicU64::new(0),
        }
    }

    /// Run `work` for `key`, unless another task is already running it, in
    /// which case wait for and return that task's result.
    ///
    /// If the running task is dropped before producing a result, waiters
    /// retry and one of them takes over.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_or_retry(key, work, |_| false).await
    }

    /// Like [`Coalescer::run`], but a waiter that receives a result for
    /// which `retry` holds goes back to the key instead of returning it.
    pub async fn run_or_retry<F, Fut, R>(&self, key: &str, work: F, retry: R) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        R: Fn(&T) -> bool,
    {
        loop {
            let role = match self.inflight.entry(key.to_string()) {
                Entry::Occupied(entry) => Role::Follower(entry.get().subscribe()),
                Entry::Vacant(entry) => {
                    let (tx, _rx) = broadcast::channel(1);
                    entry.insert(tx.clone());
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Leader(tx) => {
                    let guard = InflightGuard {
                        inflight: &self.inflight,
                        key,
                        sender: &tx,
                    };
                    let value = work().await;
                    drop(guard);
                    // No receivers is fine
                    let _ = tx.send(value.clone());
                    return value;
                }
                Role::Follower(mut rx) => {
                    tracing::debug!(key, "waiting for in-flight build");
                    self.coalesced_count.fetch_add(1, Ordering::Relaxed);
                    match rx.recv().await {
                        Ok(value) if retry(&value) => {
                            tracing::debug!(key, "in-flight build gave up, retrying");
                        }
                        Ok(value) => return value,
                        Err(_) => tracing::debug!(key, "in-flight build vanished, retrying"),
                    }
                }
            }
        }
    }

    /// Number of requests served by someone else's work.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced_count.load(Ordering::Relaxed)
    }

    /// Number of keys currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

impl<T: Clone> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time::sleep;

    #[tokio::test]
    async fn single_request() {
        let coalescer = Coalescer::new();
        let result = coalescer.run("zlib", || async { 7 }).await;
        assert_eq!(result, 7);
        assert_eq!(coalescer.coalesced_count(), 0);
        assert_eq!(coalescer.inflight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_run_once() {
        let coalescer = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                coalescer
                    .run("curl", || async move {
                        sleep(Duration::from_millis(200)).await;
                        calls.fetch_add(1, Ordering::SeqCst);
                        42
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.coalesced_count(), 4);
        assert_eq!(coalescer.inflight_count(), 0);
    }

    #[tokio::test]
    async fn dropped_leader_hands_over() {
        let coalescer = Arc::new(Coalescer::new());

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run("openssl", || async {
                        sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        while coalescer.inflight_count() == 0 {
            tokio::task::yield_now().await;
        }

        let follower = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move { coalescer.run("openssl", || async { 2 }).await })
        };
        while coalescer.coalesced_count() == 0 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        assert_eq!(follower.await.unwrap(), 2);
        assert_eq!(coalescer.inflight_count(), 0);
    }

    #[tokio::test]
    async fn rejected_result_is_recomputed_by_waiter() {
        let coalescer = Arc::new(Coalescer::new());
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run_or_retry(
                        "ncurses",
                        || async {
                            let _ = released.await;
                            None
                        },
                        Option::is_none,
                    )
                    .await
            })
        };
        while coalescer.inflight_count() == 0 {
            tokio::task::yield_now().await;
        }

        let follower = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .run_or_retry("ncurses", || async { Some(6) }, Option::is_none)
                    .await
            })
        };
        while coalescer.coalesced_count() == 0 {
            tokio::task::yield_now().await;
        }

        release.send(()).unwrap();
        assert_eq!(leader.await.unwrap(), None);
        assert_eq!(follower.await.unwrap(), Some(6));
        assert_eq!(coalescer.inflight_count(), 0);
    }
}
