//! In-process implementations of the shared stores.
//!
//! Good for single-instance deployments and tests. Multi-instance deployments
//! plug a networked store in behind the same ports.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    domain::{StoredCredential, Subject, Token},
    ports::{AdmissionState, AdmissionStore, CredentialStore, SharedCache, Versioned},
    Result,
};

/// Every this many writes, a store drops its expired entries.
const SWEEP_EVERY: u64 = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding one of these locks cannot leave the maps
    // half-updated (every critical section is a single insert/remove).
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============== Admission counters ==============

#[derive(Debug)]
struct CounterEntry {
    version: u64,
    state: AdmissionState,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryAdmissionStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
    next_version: AtomicU64,
}

impl MemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired counters; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = lock(&self.entries);
        let before = map.len();
        map.retain(|_, e| e.expires_at > now);
        before - map.len()
    }
}

#[async_trait]
impl AdmissionStore for MemoryAdmissionStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned<AdmissionState>>> {
        let now = Instant::now();
        let map = lock(&self.entries);
        Ok(map
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| Versioned {
                version: e.version,
                value: e.state,
            }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        state: AdmissionState,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut map = lock(&self.entries);

        let current = map
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.version);
        if current != expected {
            return Ok(false);
        }

        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        if version % SWEEP_EVERY == 0 {
            map.retain(|_, e| e.expires_at > now);
        }
        map.insert(
            key.to_string(),
            CounterEntry {
                version,
                state,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }
}

// ============== Token cache ==============

#[derive(Debug)]
struct CacheEntry {
    token: Token,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = lock(&self.entries);
        let before = map.len();
        map.retain(|_, e| e.expires_at > now);
        before - map.len()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Token>> {
        let now = Instant::now();
        let map = lock(&self.entries);
        Ok(map
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.token.clone()))
    }

    async fn set(&self, key: &str, token: Token, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut map = lock(&self.entries);
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            map.retain(|_, e| e.expires_at > now);
        }
        map.insert(
            key.to_string(),
            CacheEntry {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}

// ============== Credentials ==============

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    profiles: Mutex<HashMap<Subject, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, subject: Subject, credential: StoredCredential) {
        lock(&self.profiles).insert(subject, credential);
    }

    pub fn remove(&self, subject: &Subject) -> Option<StoredCredential> {
        lock(&self.profiles).remove(subject)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, subject: &Subject) -> Result<Option<StoredCredential>> {
        Ok(lock(&self.profiles).get(subject).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EncryptedSecret, UserId};

    fn state(level: f64) -> AdmissionState {
        AdmissionState {
            last_update_ms: 0,
            level,
        }
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_versions() {
        let store = MemoryAdmissionStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.compare_and_set("k", None, state(1.0), ttl).await.unwrap());
        // Key exists now, so "absent" is stale.
        assert!(!store.compare_and_set("k", None, state(2.0), ttl).await.unwrap());

        let v = store.load("k").await.unwrap().unwrap();
        assert_eq!(v.value.level, 1.0);
        assert!(store
            .compare_and_set("k", Some(v.version), state(2.0), ttl)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set("k", Some(v.version), state(3.0), ttl)
            .await
            .unwrap());
        assert_eq!(store.load("k").await.unwrap().unwrap().value.level, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_expire_after_ttl() {
        let store = MemoryAdmissionStore::new();
        store
            .compare_and_set("k", None, state(1.0), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.load("k").await.unwrap().is_none());
        assert!(store.is_empty());
        // Expired entries count as absent for CAS.
        assert!(store
            .compare_and_set("k", None, state(1.0), Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("a", Token("t".to_string()), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(Token("t".to_string())));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.purge_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_evict_expired_counters_of_other_users() {
        let store = MemoryAdmissionStore::new();
        let short = Duration::from_secs(5);
        for user in 0..10 {
            let key = format!("cmd_rate_limit:{user}");
            store.compare_and_set(&key, None, state(1.0), short).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(6)).await;

        for n in 0..SWEEP_EVERY {
            let key = format!("active:{}", n % 3);
            let expected = store.load(&key).await.unwrap().map(|v| v.version);
            assert!(store
                .compare_and_set(&key, expected, state(1.0), short)
                .await
                .unwrap());
        }

        assert_eq!(lock(&store.entries).len(), 3);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_writes_evict_expired_tokens() {
        let cache = MemoryCache::new();
        for n in 0..SWEEP_EVERY - 1 {
            cache
                .set(&format!("bot_ltoken:{n}:1"), Token("t".into()), Duration::from_secs(10))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        cache
            .set("bot_ltoken:fresh:1", Token("t".into()), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(lock(&cache.entries).len(), 1);
        assert_eq!(cache.get("bot_ltoken:fresh:1").await.unwrap(), Some(Token("t".into())));
    }

    #[tokio::test]
    async fn credential_store_is_scoped_per_profile() {
        let store = MemoryCredentialStore::new();
        let a = Subject::new(UserId(1), 1);
        store.enroll(
            a,
            StoredCredential {
                account_id: 100,
                secret: EncryptedSecret("x".to_string()),
            },
        );

        assert!(store.get(&a).await.unwrap().is_some());
        assert!(store.get(&Subject::new(UserId(1), 2)).await.unwrap().is_none());
        assert!(store.remove(&a).is_some());
        assert!(store.get(&a).await.unwrap().is_none());
    }
}
