//! Single-flight execution: coalesce concurrent callers of the same
//! expensive operation into one underlying run.
//!
//! For a given key, at most one producer is executing at any moment. The
//! first caller to find the key absent starts the producer; every caller
//! that arrives while it is still running attaches as a waiter and receives
//! the same settled outcome, success or failure, without re-invoking its
//! own producer. Settled outcomes are not cached: the next call after
//! settlement starts a brand-new execution.
//!
//! Typical uses are cache refills and login-attempt checks, where dozens of
//! concurrent misses for `"cache:<id>"` or `"login_<ip>_<email>"` would
//! otherwise stampede the same backend work.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::stats::{CoalescerStats, StatsCounters};

/// One outstanding producer invocation for a key.
struct InFlight<T, E> {
    /// Identifies this window. A producer that settles late, after `clear`
    /// already emptied the registry and a successor window reused the key,
    /// must not evict the successor's entry.
    op_id: u64,
    /// Write-once settlement cell: `None` until the producer settles, then
    /// `Some` exactly once. Waiters hold clones of this receiver and
    /// nothing else.
    settled: watch::Receiver<Option<Result<T, E>>>,
}

struct Inner<K, T, E> {
    registry: DashMap<K, InFlight<T, E>>,
    next_op_id: AtomicU64,
    counters: StatsCounters,
}

/// Coalesces concurrent `execute` calls that share a key into a single
/// producer run.
///
/// `Coalescer` is a cheap handle over shared state: clone it freely and
/// hand a copy to every caller that needs coalescing. Construct one per
/// logical operation family at application start; distinct instances never
/// coalesce with each other.
///
/// Outcomes are replayed to waiters by `Clone`. For large values, make `T`
/// an `Arc<V>` so every waiter shares one allocation.
pub struct Coalescer<K, T, E> {
    inner: Arc<Inner<K, T, E>>,
}

impl<K, T, E> Coalescer<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a new coalescer with an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: DashMap::new(),
                next_op_id: AtomicU64::new(0),
                counters: StatsCounters::default(),
            }),
        }
    }

    /// Run `producer` for `key`, or join an execution already in flight.
    ///
    /// If no operation is in flight for `key`, this call invokes `producer`
    /// once and runs the returned future to completion on a detached task.
    /// Otherwise `producer` is dropped uninvoked and the call waits for the
    /// in-flight run. Either way the call resolves to the outcome of the
    /// one execution that actually ran, errors included, unaltered.
    ///
    /// The producer is owned by the in-flight window, not by any caller:
    /// dropping or timing out an individual `execute` future, the winner's
    /// included, does not cancel the execution other waiters depend on.
    /// A caller that wants a timeout races its own `execute` future against
    /// a timer.
    ///
    /// The settled outcome is not retained. A call that arrives after
    /// settlement, however soon, starts a fresh execution.
    ///
    /// # Panics
    ///
    /// If the producer panics, the panic is propagated to every caller
    /// attached to that window. The registry entry is still removed first,
    /// so the key is immediately free for a fresh attempt.
    pub async fn execute<F, Fut>(&self, key: K, producer: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.inner.counters.calls.fetch_add(1, Ordering::Relaxed);

        // The entry guard spans the membership check and the insert, so two
        // callers can never both observe the key absent. Nothing awaits and
        // no user code runs while the guard is held.
        let (mut settled, launch) = match self.inner.registry.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().settled.clone(), None),
            Entry::Vacant(slot) => {
                let op_id = self.inner.next_op_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(InFlight {
                    op_id,
                    settled: rx.clone(),
                });
                (rx, Some((tx, op_id)))
            }
        };

        match launch {
            Some((tx, op_id)) => {
                self.inner.counters.launched.fetch_add(1, Ordering::Relaxed);
                debug!("starting producer for key {:?} (op {})", key, op_id);

                let fut = producer();
                let inner = Arc::clone(&self.inner);
                let task_key = key.clone();
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(fut).catch_unwind().await;

                    // Remove strictly before delivering: a caller arriving
                    // after settlement must find the key absent and start a
                    // fresh run. The op_id check keeps a straggler that
                    // outlived `clear` from evicting a successor window.
                    inner
                        .registry
                        .remove_if(&task_key, |_, op| op.op_id == op_id);

                    match outcome {
                        Ok(result) => {
                            // Fails only when every waiter has gone away.
                            let _ = tx.send(Some(result));
                        }
                        Err(panic) => {
                            warn!(
                                "producer for key {:?} (op {}) panicked",
                                task_key, op_id
                            );
                            // Dropping the sender without a value is what
                            // waiters interpret as a producer panic.
                            drop(tx);
                            std::panic::resume_unwind(panic);
                        }
                    }
                });
            }
            None => {
                self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                trace!("joining in-flight producer for key {:?}", key);
            }
        }

        let outcome = match settled.wait_for(|slot| slot.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => panic!("producer for key {:?} panicked before settling", key),
        };
        outcome.expect("settlement cell is non-empty once the wait returns")
    }

    /// Whether an operation for `key` is currently in flight.
    ///
    /// Diagnostic read only. Checking this and then calling [`execute`]
    /// based on the answer is itself a race; callers always go straight
    /// through [`execute`].
    ///
    /// [`execute`]: Coalescer::execute
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inner.registry.contains_key(key)
    }

    /// Number of keys currently in flight.
    pub fn count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Forcibly empty the registry bookkeeping. Test and operational reset
    /// only; unsafe for production use.
    ///
    /// Outstanding producers are neither cancelled nor awaited. A producer
    /// still running when this is called settles into a window the registry
    /// no longer tracks: callers that attached before the clear still get
    /// its outcome, but a caller arriving after the clear finds the key
    /// absent and starts a fresh, independent execution. That orphaning is
    /// the documented behavior, not a defect to guard against here.
    pub fn clear(&self) {
        let dropped = self.inner.registry.len();
        self.inner.registry.clear();
        if dropped > 0 {
            warn!("cleared {} in-flight registry entries", dropped);
        }
    }

    /// Snapshot of call counters and current in-flight size.
    pub fn stats(&self) -> CoalescerStats {
        self.inner.counters.snapshot(self.inner.registry.len())
    }
}

impl<K, T, E> Default for Coalescer<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// Hand-written so the handle clones without bounds on T and E.
impl<K, T, E> Clone for Coalescer<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash, T, E> fmt::Debug for Coalescer<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("in_flight", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn single_call_runs_producer_once() {
        let coalescer: Coalescer<String, u32, String> = Coalescer::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        let result = coalescer
            .execute("k".to_string(), move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.count(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_both_execute() {
        let coalescer: Coalescer<&'static str, u32, String> = Coalescer::new();
        let counter = Arc::new(AtomicU32::new(0));

        for expected in 1..=2 {
            let c = Arc::clone(&counter);
            let result = coalescer
                .execute("k", move || async move {
                    Ok(c.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await;
            assert_eq!(result, Ok(expected));
        }
    }

    #[tokio::test]
    async fn error_reaches_the_caller_unaltered() {
        let coalescer: Coalescer<&'static str, u32, String> = Coalescer::new();

        let result = coalescer
            .execute("k", || async { Err("boom".to_string()) })
            .await;

        assert_eq!(result, Err("boom".to_string()));
        assert!(!coalescer.is_in_flight(&"k"));
    }

    #[tokio::test]
    async fn idle_registry_is_empty() {
        let coalescer: Coalescer<String, (), String> = Coalescer::default();
        assert_eq!(coalescer.count(), 0);
        assert!(!coalescer.is_in_flight(&"anything".to_string()));
    }

    #[tokio::test]
    async fn cloned_handles_share_the_registry() {
        let coalescer: Coalescer<&'static str, u32, String> = Coalescer::new();
        let handle = coalescer.clone();

        let pending = tokio::spawn(async move {
            handle
                .execute("k", || async {
                    sleep(Duration::from_millis(100)).await;
                    Ok(7)
                })
                .await
        });

        sleep(Duration::from_millis(20)).await;
        assert!(coalescer.is_in_flight(&"k"));
        assert_eq!(coalescer.count(), 1);

        assert_eq!(pending.await.unwrap(), Ok(7));
        assert_eq!(coalescer.count(), 0);
        assert_eq!(coalescer.stats().launched, 1);
    }
}
