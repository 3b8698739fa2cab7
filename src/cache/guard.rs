//! Fetch concurrency control.
//!
//! Two layers:
//!
//! - a process-wide *freeze gate* (`RwLock<()>`).  Every fetch holds it
//!   shared; the administrative `/lock` route holds it exclusively, which
//!   pauses all cache fills until the operator disconnects.
//! - per-key *coalescing*: a map from [`ContentHash`] to an in-flight token.
//!   Concurrent requests for the same key queue on the token so only one of
//!   them talks to upstream; the others re-check the store afterwards.
//!
//! Unrelated keys never wait on each other unless the gate is frozen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use tokio::time::Instant;
use tracing::debug;

use super::key::ContentHash;

type InflightMap = Mutex<HashMap<ContentHash, Arc<AsyncMutex<()>>>>;

// ---------------------------------------------------------------------------
// FetchGuard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FetchGuard {
    gate: Arc<RwLock<()>>,
    inflight: Arc<InflightMap>,
}

impl FetchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive rights to fetch `key`.
    ///
    /// The per-key token is taken before the gate so that a frozen gate
    /// queues at most one gate reader per key.
    pub async fn acquire(&self, key: &ContentHash) -> FetchPermit {
        let started = Instant::now();
        let (lease, token) = self.lease(key);
        let key_guard = token.lock_owned().await;
        let gate = Arc::clone(&self.gate).read_owned().await;
        FetchPermit {
            _gate: gate,
            _key: key_guard,
            _lease: lease,
            waited: started.elapsed(),
        }
    }

    /// Hold the gate exclusively.  Waits for in-flight fetches to finish;
    /// while the returned guard lives no fetch can start.
    pub async fn freeze(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate).write_owned().await
    }

    /// Acquire and immediately release the gate, returning how long the
    /// acquisition took.
    pub async fn probe(&self) -> Duration {
        let started = Instant::now();
        let _held: OwnedRwLockReadGuard<()> = Arc::clone(&self.gate).read_owned().await;
        started.elapsed()
    }

    /// Number of keys with at least one fetch queued or running.
    pub fn inflight_keys(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Register interest in `key`, returning the lease and a handle to the
    /// key's token.
    fn lease(&self, key: &ContentHash) -> (KeyLease, Arc<AsyncMutex<()>>) {
        let mut map = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let token = Arc::clone(map.entry(key.clone()).or_default());
        let lease = KeyLease {
            key: key.clone(),
            token: Some(Arc::clone(&token)),
            map: Arc::clone(&self.inflight),
        };
        (lease, token)
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// Proof that the holder may fetch one key.  Released on drop.
#[derive(Debug)]
pub struct FetchPermit {
    // Field order is drop order: the key token must be released before the
    // lease inspects the reference count.
    _gate: OwnedRwLockReadGuard<()>,
    _key: OwnedMutexGuard<()>,
    _lease: KeyLease,
    waited: Duration,
}

impl FetchPermit {
    /// Time spent waiting for the per-key token and the gate.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// A reference to a key's in-flight token that removes the map entry once
/// nobody else holds it.
#[derive(Debug)]
struct KeyLease {
    key: ContentHash,
    token: Option<Arc<AsyncMutex<()>>>,
    map: Arc<InflightMap>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Release our reference under the map lock so concurrent leases of
        // the same key see a consistent count.
        drop(self.token.take());
        let unused = map
            .get(&self.key)
            .is_some_and(|token| Arc::strong_count(token) == 1);
        if unused {
            map.remove(&self.key);
            debug!(key = %self.key, "released in-flight token");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
