//! Title-based duplicate suppression for the live relay.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Remembers recently accepted titles for a fixed window.
///
/// The key is the literal title: two different events that happen to share a
/// title inside the window are treated as one.
pub struct TitleDedup {
    window: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl TitleDedup {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if `title` was accepted within the window. Otherwise the
    /// title is recorded and false is returned.
    pub fn check_and_record(&self, title: &str) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);

        // Sweep expired titles on every call.
        recent.retain(|_, seen| now.duration_since(*seen) <= self.window);

        if recent.contains_key(title) {
            return true;
        }
        recent.insert(title.to_string(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
