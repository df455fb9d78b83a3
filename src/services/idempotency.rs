/// Idempotency store over the key-value store
///
/// The at-most-once protocol: `claim` is an atomic set-if-absent that
/// marks a key `processing`, `finalize` overwrites it with `processed`,
/// and `release` frees a claim whose delivery failed. The TTLs let
/// crashed workers relinquish their claims and completed records age out.
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Value held while a worker owns the key.
pub const CLAIM_VALUE: &str = "processing";

/// Value held once delivery has succeeded.
pub const PROCESSED_VALUE: &str = "processed";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key-value store error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now owns the key.
    Claimed,
    /// Another worker owns or has completed the key.
    AlreadyPresent,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically set `key = "processing"` with a TTL, only if absent.
    /// One round trip.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, StoreError>;

    /// Unconditionally set `key = "processed"` with a TTL.
    async fn finalize(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete the key, freeing a claim whose delivery failed so the
    /// redelivery can attempt again.
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}

/// Redis-backed store. The `ConnectionManager` handle is multiplexed and
/// safe to use from every worker concurrently.
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
}

impl RedisIdempotencyStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Reachability check; startup is fatal if this fails.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.conn.clone();
        // SET NX EX does the set-if-absent and the TTL in one round trip;
        // a nil reply means the key already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(CLAIM_VALUE)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        let outcome = match reply {
            Some(_) => ClaimOutcome::Claimed,
            None => ClaimOutcome::AlreadyPresent,
        };
        debug!(key, ?outcome, "claim attempted");
        Ok(outcome)
    }

    async fn finalize(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(PROCESSED_VALUE)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-memory store for tests. Mirrors the claim/finalize semantics,
/// including TTL expiry, and counts calls so tests can assert on the
/// number of store round trips.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: tokio::sync::Mutex<HashMap<String, (String, Instant)>>,
    claim_calls: AtomicU64,
    finalize_calls: AtomicU64,
    release_calls: AtomicU64,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim_calls(&self) -> u64 {
        self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> u64 {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> u64 {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Current value of a key, if present and unexpired.
    pub async fn value_of(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if entries
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .is_some()
        {
            return Ok(ClaimOutcome::AlreadyPresent);
        }

        entries.insert(key.to_string(), (CLAIM_VALUE.to_string(), now + ttl));
        Ok(ClaimOutcome::Claimed)
    }

    async fn finalize(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            (PROCESSED_VALUE.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_claim_is_set_if_absent() {
        let store = InMemoryIdempotencyStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.claim("k1", ttl).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.claim("k1", ttl).await.unwrap(),
            ClaimOutcome::AlreadyPresent
        );
        assert_eq!(store.value_of("k1").await.as_deref(), Some(CLAIM_VALUE));
    }

    #[tokio::test]
    async fn test_claim_after_expiry_succeeds() {
        let store = InMemoryIdempotencyStore::new();

        assert_eq!(
            store.claim("k1", Duration::from_millis(20)).await.unwrap(),
            ClaimOutcome::Claimed
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        // the expired claim models a crashed worker; the key is free again
        assert_eq!(
            store.claim("k1", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn test_release_frees_the_key() {
        let store = InMemoryIdempotencyStore::new();
        let ttl = Duration::from_secs(60);

        store.claim("k1", ttl).await.unwrap();
        store.release("k1").await.unwrap();

        assert_eq!(store.value_of("k1").await, None);
        assert_eq!(store.claim("k1", ttl).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(store.release_calls(), 1);
    }

    #[tokio::test]
    async fn test_finalize_overwrites_claim() {
        let store = InMemoryIdempotencyStore::new();
        let ttl = Duration::from_secs(60);

        store.claim("k1", ttl).await.unwrap();
        store.finalize("k1", ttl).await.unwrap();

        assert_eq!(store.value_of("k1").await.as_deref(), Some(PROCESSED_VALUE));
        // the processed record still blocks later claims
        assert_eq!(
            store.claim("k1", ttl).await.unwrap(),
            ClaimOutcome::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_grant_exactly_one() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let ttl = Duration::from_secs(60);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.claim("contended", ttl).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() == ClaimOutcome::Claimed {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(store.claim_calls(), 8);
    }
}
