// src/single_flight.rs
//! Per-key request coalescing.
//!
//! The first caller for a key registers a shared handle to its upstream
//! future; later callers for the same key await that handle instead of
//! starting their own request. The entry is removed when the owning call
//! finishes or is dropped.

use crate::error::{GatewayError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

pub struct SingleFlight<T: Clone> {
    in_flight: Mutex<HashMap<String, (u64, Flight<T>)>>,
    generation: AtomicU64,
    wait_timeout: Duration,
}

/// Removes the leader's entry on every exit path, including cancellation.
struct FlightGuard<'a, T: Clone> {
    owner: &'a SingleFlight<T>,
    key: &'a str,
    generation: u64,
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        let mut map = self
            .owner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(map.get(self.key), Some((g, _)) if *g == self.generation) {
            map.remove(self.key);
        }
    }
}

enum Role<T: Clone, F> {
    Leader { generation: u64, flight: Flight<T> },
    Waiter { flight: Flight<T>, fetch: F },
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            wait_timeout,
        }
    }

    /// Runs `fetch` unless a call for `key` is already in flight, in which
    /// case the existing call's value is returned. A failed shared call is
    /// never handed to waiters; each one runs its own `fetch` instead.
    /// Waiters give up after the configured wait timeout; the leader is
    /// bounded only by `fetch` itself.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let role = {
            let mut map = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match map.get(key) {
                Some((_, flight)) => Role::Waiter {
                    flight: flight.clone(),
                    fetch,
                },
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let flight = fetch().boxed().shared();
                    map.insert(key.to_string(), (generation, flight.clone()));
                    Role::Leader { generation, flight }
                }
            }
        };

        match role {
            Role::Leader { generation, flight } => {
                let _guard = FlightGuard {
                    owner: self,
                    key,
                    generation,
                };
                flight.await
            }
            Role::Waiter { flight, fetch } => {
                debug!("Joining in-flight request for {}", key);
                let shared = tokio::time::timeout(self.wait_timeout, flight)
                    .await
                    .map_err(|_| {
                        GatewayError::Timeout(format!("waiting for in-flight request {}", key))
                    })?;
                match shared {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        debug!("In-flight request for {} failed ({}), fetching again", key, e);
                        fetch().await
                    }
                }
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
