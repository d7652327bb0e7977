use crate::seen_cache::{SeenCacheError, SeenItemCache};
use std::time::{Duration, Instant};
use tracing::debug;

/// Keeps a failing watcher from flooding the log with the same error on
/// every tick. Each distinct (watcher, message) pair is let through once per
/// window.
#[derive(Debug)]
pub struct ErrorLogThrottle {
    logged: SeenItemCache,
}

impl ErrorLogThrottle {
    pub fn new(window: Duration) -> Result<Self, SeenCacheError> {
        Ok(Self {
            logged: SeenItemCache::new(window)?,
        })
    }

    /// Returns true if the error should be logged at full level.
    pub fn should_log(&mut self, watcher: &str, message: &str) -> bool {
        self.should_log_at(watcher, message, Instant::now())
    }

    pub fn should_log_at(&mut self, watcher: &str, message: &str, now: Instant) -> bool {
        let key = format!("{}\u{1f}{}", watcher, message);
        match self.logged.is_new_at(&key, now) {
            Ok(true) => match self.logged.record_at(&key, now) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "Could not record error log key");
                    true
                }
            },
            Ok(false) => false,
            Err(_) => true,
        }
    }
}
