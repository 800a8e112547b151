//! Process-local [`SharedCache`] used by tests and `SKIP_EXTERNALS` deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::cache::SharedCache;
use super::error::{CacheError, CacheResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory cache with per-key expiry.
///
/// `set_available(false)` makes every call fail with a connection error so callers'
/// degraded-mode behaviour can be exercised.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    sorted: Arc<Mutex<HashMap<String, HashMap<String, i64>>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::ConnectionError(
                "in-memory cache marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        entries.get(key).filter(|e| e.expires_at > Instant::now())
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(Self::live(&entries, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let existed = Self::live(&entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn claim(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if Self::live(&entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl: Duration,
    ) -> CacheResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match Self::live(&entries, key) {
            Some(entry) if entry.value == expected => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: new_value.to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> CacheResult<()> {
        self.check_available()?;
        let mut sorted = self.sorted.lock().await;
        sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> CacheResult<()> {
        self.check_available()?;
        let mut sorted = self.sorted.lock().await;
        if let Some(set) = sorted.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sorted.remove(key);
            }
        }
        Ok(())
    }

    async fn sorted_members(&self, key: &str) -> CacheResult<Vec<String>> {
        self.check_available()?;
        let sorted = self.sorted.lock().await;
        let mut members: Vec<(&String, &i64)> = sorted
            .get(key)
            .map(|set| set.iter().collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive_until_expiry() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.claim("k", "a", ttl).await.unwrap());
        assert!(!cache.claim("k", "b", ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_invisible() {
        let cache = InMemoryCache::new();
        cache.set("k", "v", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.claim("k", "w", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_requires_expected_value() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("k", "failed", ttl).await.unwrap();

        assert!(!cache.compare_and_swap("k", "other", "x", ttl).await.unwrap());
        assert!(cache.compare_and_swap("k", "failed", "processing", ttl).await.unwrap());
        assert!(!cache.compare_and_swap("k", "failed", "again", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn sorted_members_follow_score_order() {
        let cache = InMemoryCache::new();
        cache.sorted_add("idx", "late", 30).await.unwrap();
        cache.sorted_add("idx", "early", 10).await.unwrap();
        cache.sorted_add("idx", "middle", 20).await.unwrap();
        cache.sorted_add("idx", "late", 5).await.unwrap();
        assert_eq!(
            cache.sorted_members("idx").await.unwrap(),
            vec!["late", "early", "middle"]
        );

        cache.sorted_remove("idx", "early").await.unwrap();
        assert_eq!(cache.sorted_members("idx").await.unwrap(), vec!["late", "middle"]);
        assert!(cache.sorted_members("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_cache_reports_connection_error() {
        let cache = InMemoryCache::new();
        cache.set_available(false);

        let err = cache.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
