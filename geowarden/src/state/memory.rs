// geowarden/src/state/memory.rs
//
// In-process HistoryStore.
// DashMap = sharded concurrent HashMap — safe across tokio tasks with no mutex.
//
// Used for single-instance deployments without Redis (`--redis memory://`)
// and as the store double in tests. Nothing survives a restart. Expiry runs on
// tokio's clock so tests can drive it with time::pause()/advance().

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{BlockArm, HistoryStore};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Marker {
    value:      String,
    expires_at: Instant,
}

impl Marker {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    sets:    DashMap<String, HashSet<String>>,
    markers: DashMap<String, Marker>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a live marker, if any.
    pub fn marker_value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.markers
            .get(key)
            .filter(|m| m.live(now))
            .map(|m| m.value.clone())
    }

    /// Drop expired markers. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.markers.len();
        self.markers.retain(|_, m| m.live(now));
        before - self.markers.len()
    }

    pub async fn housekeeping_loop(self: Arc<Self>, period: Duration) {
        loop {
            tokio::time::sleep(period).await;
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, "expired block markers removed");
            }
        }
    }
}

impl HistoryStore for MemoryHistoryStore {
    async fn contains(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.sets.get(key).map(|s| s.contains(member)).unwrap_or(false))
    }

    async fn add(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn arm(&self, key: &str, value: &str, ttl: Duration) -> Result<BlockArm> {
        let now = Instant::now();
        let fresh = Marker { value: value.to_string(), expires_at: now + ttl };

        // the shard lock held by the entry makes check-and-set one step
        let outcome = match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut e) if e.get().live(now) => {
                e.get_mut().expires_at = fresh.expires_at;
                BlockArm::Refreshed
            }
            Entry::Occupied(mut e) => {
                e.insert(fresh);
                BlockArm::Armed
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
                BlockArm::Armed
            }
        };
        Ok(outcome)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .sets
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect();
        keys.extend(
            self.markers
                .iter()
                .filter(|e| e.key().starts_with(prefix) && e.value().live(now))
                .map(|e| e.key().clone()),
        );
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn marker_expires_after_ttl() {
        let store = MemoryHistoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.arm("justblock:me", "UA", ttl).await.unwrap(), BlockArm::Armed);
        assert!(store.marker_value("justblock:me").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.marker_value("justblock:me").is_none());
        assert_eq!(store.arm("justblock:me", "RU", ttl).await.unwrap(), BlockArm::Armed);
        assert_eq!(store.marker_value("justblock:me").as_deref(), Some("RU"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_window_and_keeps_first_country() {
        let store = MemoryHistoryStore::new();
        let ttl = Duration::from_secs(60);

        store.arm("justblock:me", "UA", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(store.arm("justblock:me", "RU", ttl).await.unwrap(), BlockArm::Refreshed);

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(store.marker_value("justblock:me").as_deref(), Some("UA"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_markers() {
        let store = MemoryHistoryStore::new();
        store.arm("justblock:a", "UA", Duration::from_secs(10)).await.unwrap();
        store.arm("justblock:b", "UA", Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.keys("justblock:").await.unwrap(), vec!["justblock:b".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_arms_see_exactly_one_armed() {
        let store = Arc::new(MemoryHistoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.arm("justblock:me", "UA", Duration::from_secs(60)).await.unwrap()
            }));
        }

        let mut armed = 0;
        for handle in handles {
            if handle.await.unwrap() == BlockArm::Armed { armed += 1; }
        }
        assert_eq!(armed, 1);
    }
}
