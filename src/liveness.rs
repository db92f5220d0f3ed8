//! Connection liveness bookkeeping.
//!
//! Every live chat session owns one key, `conn:<chat_id>`, whose TTL equals
//! the idle threshold. The key is refreshed on every use, so an external
//! observer can tell live sessions from abandoned ones without asking the
//! manager.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Liveness key for a chat session.
pub fn connection_key(chat_id: &str) -> String {
    format!("conn:{}", chat_id)
}

/// Key/value store with per-key expiry.
#[async_trait]
pub trait LivenessStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration);

    /// Extend the TTL of an existing key. Missing keys stay missing.
    async fn touch(&self, key: &str, ttl: Duration);

    async fn remove(&self, key: &str);

    /// Value of an unexpired key.
    async fn get(&self, key: &str) -> Option<String>;
}

/// Process-local [`LivenessStore`]. Expired keys are dropped lazily on read.
#[derive(Debug, Default)]
pub struct InMemoryLivenessStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLivenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LivenessStore for InMemoryLivenessStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        }
    }

    async fn touch(&self, key: &str, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock()
            && let Some((_, expires_at)) = entries.get_mut(key)
        {
            *expires_at = Instant::now() + ttl;
        }
    }

    async fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}
