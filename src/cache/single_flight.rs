//! Single-flight dedup gate (spec §4.4, P5): concurrent misses for the same
//! key coalesce into one upstream call, all waiters observe the same
//! result.
//!
//! Grounded on the teacher's `tokio::sync::mpsc` fan-out pattern
//! ([`crate::rpc::server`]'s writer task funnels many producers into one
//! consumer); here a [`tokio::sync::broadcast`] channel fans one producer's
//! result out to many waiters instead.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::Error;

/// One entry per key currently being fetched. The first caller to insert
/// one becomes the leader and runs the actual fetch; everyone else just
/// subscribes.
pub struct SingleFlight<K, V> {
    inflight: DashMap<K, broadcast::Sender<Result<V, Error>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        SingleFlight { inflight: DashMap::new() }
    }

    /// Runs `fetch` for `key`, or — if another caller is already fetching
    /// the same key — awaits that caller's result instead (spec P5: exactly
    /// one RPC, all callers see the same value).
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, Error>>,
    {
        loop {
            if let Some(tx) = self.inflight.get(&key) {
                let mut rx = tx.subscribe();
                drop(tx);
                match rx.recv().await {
                    Ok(result) => return result,
                    // Leader dropped the sender without a completion (panic
                    // or slot-acquire race); fall through and retry as
                    // leader ourselves instead of hanging forever.
                    Err(broadcast::error::RecvError::Closed) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            let (tx, _rx) = broadcast::channel(1);
            match self.inflight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(tx.clone());
                }
            }

            let result = fetch().await;
            self.inflight.remove(&key);
            let _ = tx.send(result.clone());
            return result;
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedSingleFlight<K, V> = Arc<SingleFlight<K, V>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let gate: Arc<SingleFlight<String, u64>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                gate.run("/usr/bin/ffmpeg".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok::<u64, Error>(42)
                })
                .await
            }));
        }

        let mut results = Vec::new();
        for t in tasks {
            results.push(t.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&r| r == 42));
    }

    #[tokio::test]
    async fn sequential_misses_each_run_their_own_fetch() {
        let gate: SingleFlight<String, u64> = SingleFlight::new();
        let calls = AtomicUsize::new(0);

        gate.run("/a".to_string(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<u64, Error>(1)
        })
        .await
        .unwrap();
        gate.run("/a".to_string(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<u64, Error>(2)
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
