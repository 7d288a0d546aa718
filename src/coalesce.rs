//! Request coalescing: concurrent calls for the same key share one future

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type InFlight<K, T> = Arc<Mutex<HashMap<K, Shared<BoxFuture<'static, T>>>>>;

/// Map of operation key to the pending future currently serving it
pub struct Coalescer<K, T> {
    inflight: InFlight<K, T>,
}

impl<K, T> Default for Coalescer<K, T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> fmt::Debug for Coalescer<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer").finish_non_exhaustive()
    }
}

fn lock<K, T>(inflight: &InFlight<K, T>) -> MutexGuard<'_, HashMap<K, Shared<BoxFuture<'static, T>>>> {
    inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, T> Coalescer<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key`, or join the run already in flight.
    ///
    /// The key is released as soon as the shared future completes, so a later
    /// call always starts fresh work.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut inflight = lock(&self.inflight);

            if let Some(existing) = inflight.get(&key) {
                debug!("Joining in-flight operation {:?}", key);
                existing.clone()
            } else {
                let registry = Arc::clone(&self.inflight);
                let release_key = key.clone();
                let work = make();

                let future = async move {
                    let output = work.await;
                    lock(&registry).remove(&release_key);
                    output
                }
                .boxed()
                .shared();

                inflight.insert(key, future.clone());
                future
            }
        };

        shared.await
    }

    /// Number of keys with work in flight
    pub fn pending(&self) -> usize {
        lock(&self.inflight).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_run() {
        let coalescer: Coalescer<&'static str, u32> = Coalescer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let make = || {
            let runs = Arc::clone(&runs);
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                7
            }
        };

        let (a, b) = tokio::join!(
            coalescer.run("shorten", make()),
            coalescer.run("shorten", make())
        );

        assert_eq!((a, b), (7, 7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.pending(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_interfere() {
        let coalescer: Coalescer<u8, u8> = Coalescer::new();

        let (a, b) = tokio::join!(
            coalescer.run(1, || async { 10 }),
            coalescer.run(2, || async { 20 })
        );

        assert_eq!((a, b), (10, 20));
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let coalescer: Coalescer<u8, usize> = Coalescer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            coalescer
                .run(1, move || async move { runs.fetch_add(1, Ordering::SeqCst) })
                .await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
