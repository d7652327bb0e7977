use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeenCacheError {
    #[error("Item key must not be empty")]
    InvalidKey,
    #[error("Seen window must be greater than zero")]
    InvalidWindow,
}

/// Remembers which item keys were reported recently.
///
/// An entry stops counting as seen once it is `window` old (inclusive).
/// Expired entries are purged lazily by the sweep that runs at the start of
/// every `is_new*` and `record*` call, so the map only ever holds keys
/// recorded within roughly the last window. The sweep drops every expired
/// entry, including the one being queried.
#[derive(Debug)]
pub struct SeenItemCache {
    /// Map of item key -> time it was last recorded
    observed: HashMap<String, Instant>,
    window: Duration,
}

impl SeenItemCache {
    pub fn new(window: Duration) -> Result<Self, SeenCacheError> {
        if window.is_zero() {
            return Err(SeenCacheError::InvalidWindow);
        }
        Ok(Self {
            observed: HashMap::new(),
            window,
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true if `key` has no unexpired entry. Does not record it.
    pub fn is_new(&mut self, key: &str) -> Result<bool, SeenCacheError> {
        self.is_new_at(key, Instant::now())
    }

    pub fn is_new_at(&mut self, key: &str, now: Instant) -> Result<bool, SeenCacheError> {
        validate_key(key)?;
        self.sweep(now);
        Ok(!self.observed.contains_key(key))
    }

    pub fn record(&mut self, key: &str) -> Result<(), SeenCacheError> {
        self.record_at(key, Instant::now())
    }

    /// Inserts `key` or refreshes its timestamp to `at`.
    pub fn record_at(&mut self, key: &str, at: Instant) -> Result<(), SeenCacheError> {
        validate_key(key)?;
        self.sweep(at);
        match self.observed.get_mut(key) {
            Some(observed_at) => *observed_at = at,
            None => {
                self.observed.insert(key.to_string(), at);
            }
        }
        Ok(())
    }

    /// Retained entries, which may include expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.observed.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    fn sweep(&mut self, now: Instant) {
        let window = self.window;
        let before = self.observed.len();
        // An entry recorded "in the future" relative to `now` has zero age.
        self.observed
            .retain(|_, observed_at| now.saturating_duration_since(*observed_at) < window);
        let dropped = before - self.observed.len();
        if dropped > 0 {
            trace!(dropped, remaining = self.observed.len(), "Swept expired seen entries");
        }
    }
}

fn validate_key(key: &str) -> Result<(), SeenCacheError> {
    if key.trim().is_empty() {
        Err(SeenCacheError::InvalidKey)
    } else {
        Ok(())
    }
}

/// Cloneable handle that serializes access to one `SeenItemCache` across
/// poll tasks.
#[derive(Clone, Debug)]
pub struct SharedSeenCache {
    inner: Arc<Mutex<SeenItemCache>>,
}

/// Outcome of `SharedSeenCache::claim`.
#[derive(Debug, PartialEq, Eq)]
pub enum Claim<E> {
    /// The key was seen within the window; the action did not run.
    AlreadySeen,
    /// The action ran and succeeded; the key is now recorded.
    Recorded,
    /// The action ran and failed; the key stays unrecorded.
    Failed(E),
}

impl SharedSeenCache {
    pub fn new(cache: SeenItemCache) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    #[allow(dead_code)]
    pub async fn is_new(&self, key: &str) -> Result<bool, SeenCacheError> {
        self.inner.lock().await.is_new(key)
    }

    #[allow(dead_code)]
    pub async fn record(&self, key: &str) -> Result<(), SeenCacheError> {
        self.inner.lock().await.record(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn window(&self) -> Duration {
        self.inner.lock().await.window()
    }

    /// Check, act, record as one step.
    ///
    /// The lock is held while `act` runs, so no other task can claim the same
    /// key in between. The entry is timestamped when `act` finishes.
    pub async fn claim<F, Fut, E>(&self, key: &str, act: F) -> Result<Claim<E>, SeenCacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut cache = self.inner.lock().await;
        if !cache.is_new(key)? {
            return Ok(Claim::AlreadySeen);
        }
        match act().await {
            Ok(()) => {
                cache.record(key)?;
                Ok(Claim::Recorded)
            }
            Err(e) => Ok(Claim::Failed(e)),
        }
    }
}
