//! Per-process deduplication of concurrent calls sharing a key.
//!
//! The first caller for a key becomes the leader and runs its future; callers
//! arriving while it runs wait for the leader's result instead of running
//! their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use relaykit_core::error::DomainError;
use tokio::sync::watch;
use tracing::debug;

type Slot<T> = Option<Result<T, DomainError>>;

struct Call<T> {
    generation: u64,
    result: watch::Receiver<Slot<T>>,
}

enum Role<T> {
    Leader(watch::Sender<Slot<T>>, u64),
    Follower(watch::Receiver<Slot<T>>),
}

/// Deduplicates concurrent calls by key.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Call<T>>>,
    generations: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Removes the leader's entry when the leader finishes or is cancelled.
struct LeaderGuard<'a, T> {
    flight: &'a SingleFlight<T>,
    key: &'a str,
    generation: u64,
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        let mut calls = self.flight.lock();
        if calls
            .get(self.key)
            .is_some_and(|call| call.generation == self.generation)
        {
            calls.remove(self.key);
        }
    }
}

impl<T> SingleFlight<T> {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Call<T>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evicts the in-flight entry for `key` so the next caller starts a
    /// fresh call. Callers already waiting keep waiting on the old one.
    pub fn forget(&self, key: &str) {
        if self.lock().remove(key).is_some() {
            debug!(key, "forgot in-flight call");
        }
    }

    /// Number of keys with a call in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

impl<T: Clone> SingleFlight<T> {
    /// Runs `call` unless a call for `key` is already in flight, in which
    /// case waits for that call and returns a clone of its result.
    ///
    /// # Errors
    ///
    /// Returns the leader's error to every caller. Followers of a leader
    /// that was cancelled before finishing get `DomainError::Infrastructure`.
    pub async fn execute<F>(&self, key: &str, call: F) -> Result<T, DomainError>
    where
        F: Future<Output = Result<T, DomainError>>,
    {
        let role = {
            let mut calls = self.lock();
            match calls.get(key) {
                Some(existing) => Role::Follower(existing.result.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    calls.insert(
                        key.to_owned(),
                        Call {
                            generation,
                            result: rx,
                        },
                    );
                    Role::Leader(tx, generation)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!(key, "joining in-flight call");
                match rx.wait_for(Option::is_some).await {
                    Ok(slot) => slot.clone().unwrap_or_else(|| {
                        Err(DomainError::Infrastructure(format!(
                            "in-flight call for {key} finished without a result"
                        )))
                    }),
                    Err(_) => Err(DomainError::Infrastructure(format!(
                        "in-flight call for {key} was abandoned"
                    ))),
                }
            }
            Role::Leader(tx, generation) => {
                let guard = LeaderGuard {
                    flight: self,
                    key,
                    generation,
                };
                let result = call.await;
                drop(guard);
                tx.send_replace(Some(result.clone()));
                result
            }
        }
    }
}
