// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Keyed single-flight execution.
//!
//! Concurrent calls under the same key collapse into one execution; every
//! caller receives a clone of its result. A save event and a timer firing
//! together therefore start one sync, not two racing on the same lanes.
//!
//! If the leading call is dropped before finishing, waiting callers elect
//! a new leader among themselves and run again.

use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{watch, Mutex};
use tracing::trace;

/// Collapses concurrent executions per key.
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(watch::Receiver<Option<T>>),
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` under `key`, or join the execution already in flight.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut f = Some(f);
        loop {
            match self.join(key).await {
                Role::Follower(mut rx) => {
                    trace!(key, "Joining in-flight execution");
                    if let Ok(value) = rx.wait_for(Option::is_some).await {
                        if let Some(result) = value.as_ref() {
                            return result.clone();
                        }
                    }
                    // leader dropped without a result
                }
                Role::Leader(tx) => {
                    let Some(f) = f.take() else {
                        continue;
                    };
                    let result = f().await;
                    self.inflight.lock().await.remove(key);
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Whether an execution is currently in flight under `key`.
    pub async fn is_running(&self, key: &str) -> bool {
        self.inflight
            .lock()
            .await
            .get(key)
            .is_some_and(|rx| rx.has_changed().is_ok())
    }

    async fn join(&self, key: &str) -> Role<T> {
        let mut inflight = self.inflight.lock().await;
        if let Some(rx) = inflight.get(key) {
            if rx.has_changed().is_ok() || rx.borrow().is_some() {
                return Role::Follower(rx.clone());
            }
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), rx);
        Role::Leader(tx)
    }
}
