use std::collections::VecDeque;

use {async_trait::async_trait, dashmap::DashMap};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitStoreError {
    #[error("{store} store unavailable: {message}")]
    Unavailable { store: &'static str, message: String },
    #[error("{store} store error: {message}")]
    Backend { store: &'static str, message: String },
}

/// Counter backend for the sliding window.
///
/// `record` adds one event at `now_ms` under `key`, drops events older than
/// the window and returns the number of events left, including the new one.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn record(&self, key: &str, now_ms: u64, window_ms: u64)
    -> Result<u64, RateLimitStoreError>;

    /// Forget keys with no events left in the window. Returns how many were
    /// dropped. Stores that expire keys themselves keep the default.
    async fn prune(&self, _now_ms: u64, _window_ms: u64) -> usize {
        0
    }

    async fn health(&self) -> Result<(), RateLimitStoreError> {
        Ok(())
    }

    async fn close(&self) {}
}

/// In-process store. Each key holds its own timestamp queue; the map shards
/// locking per key.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, VecDeque<u64>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trim every queue to the window and drop the ones left empty.
    pub fn prune_expired(&self, now_ms: u64, window_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(window_ms);
        let before = self.windows.len();
        self.windows.retain(|_, events| {
            while events.front().is_some_and(|&ts| ts <= cutoff) {
                events.pop_front();
            }
            !events.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, RateLimitStoreError> {
        let cutoff = now_ms.saturating_sub(window_ms);
        let mut events = self.windows.entry(key.to_string()).or_default();
        while events.front().is_some_and(|&ts| ts <= cutoff) {
            events.pop_front();
        }
        events.push_back(now_ms);
        Ok(events.len() as u64)
    }

    async fn prune(&self, now_ms: u64, window_ms: u64) -> usize {
        self.prune_expired(now_ms, window_ms)
    }

    async fn close(&self) {
        self.windows.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_within_window() {
        let store = MemoryRateLimitStore::new();
        assert_eq!(store.record("k", 1_000, 60_000).await.unwrap(), 1);
        assert_eq!(store.record("k", 2_000, 60_000).await.unwrap(), 2);
        assert_eq!(store.record("other", 2_000, 60_000).await.unwrap(), 1);
        // 1_000 has left the window.
        assert_eq!(store.record("k", 61_000, 60_000).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn prune_drops_idle_keys() {
        let store = MemoryRateLimitStore::new();
        store.record("old", 0, 1_000).await.unwrap();
        store.record("fresh", 5_000, 1_000).await.unwrap();
        assert_eq!(store.prune_expired(5_500, 1_000), 1);
        assert_eq!(store.key_count(), 1);
    }
}
