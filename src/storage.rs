//! Off-chain storage interfaces and implementations.
//!
//! This module provides the traits the core uses to persist and resolve
//! thread files, look up participants' encryption keys, and cache both
//! content pointers and public keys.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::identity::Identity;
use crate::models::{ContentPointer, ThreadFile, ThreadId};
use crate::types::{ChatChainError, Result};

// ============================================================================
// Thread Storage
// ============================================================================

/// Primary off-chain storage service for thread files.
#[async_trait::async_trait]
pub trait ThreadStore: Send + Sync {
    /// Fetch the latest thread file, or `None` if the service has none.
    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<ThreadFile>>;

    /// Store an updated thread file, returning its content pointer.
    async fn put_thread(&self, thread_id: &ThreadId, file: &ThreadFile) -> Result<ContentPointer>;
}

/// Content-addressed storage network, resolved directly by pointer.
#[async_trait::async_trait]
pub trait ContentNetwork: Send + Sync {
    /// Resolve a pointer to the thread file it addresses.
    async fn resolve(&self, pointer: &ContentPointer) -> Result<Option<ThreadFile>>;
}

/// Computes the content pointer of a serialized thread file.
pub fn content_pointer_for(bytes: &[u8]) -> ContentPointer {
    ContentPointer::new(format!("cc1{}", hex::encode(Sha256::digest(bytes))))
}

/// In-memory content network keyed by content hash.
#[derive(Default, Clone)]
pub struct InMemoryContentNetwork {
    blobs: Arc<RwLock<HashMap<ContentPointer, Vec<u8>>>>,
}

impl InMemoryContentNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins a thread file and returns its pointer.
    pub async fn publish(&self, file: &ThreadFile) -> Result<ContentPointer> {
        let bytes = serde_json::to_vec(file)?;
        let pointer = content_pointer_for(&bytes);
        self.blobs.write().await.insert(pointer.clone(), bytes);
        Ok(pointer)
    }

    /// Drops a pinned blob.
    pub async fn unpin(&self, pointer: &ContentPointer) {
        self.blobs.write().await.remove(pointer);
    }
}

#[async_trait::async_trait]
impl ContentNetwork for InMemoryContentNetwork {
    async fn resolve(&self, pointer: &ContentPointer) -> Result<Option<ThreadFile>> {
        let blobs = self.blobs.read().await;
        match blobs.get(pointer) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }
}

/// In-memory primary storage service.
///
/// Every stored file is also pinned on the backing [`InMemoryContentNetwork`],
/// so older versions stay resolvable by pointer after being superseded.
#[derive(Default, Clone)]
pub struct InMemoryThreadStore {
    threads: Arc<RwLock<HashMap<ThreadId, ThreadFile>>>,
    network: InMemoryContentNetwork,
    offline: Arc<RwLock<bool>>,
}

impl InMemoryThreadStore {
    /// Creates a store pinning into `network`.
    pub fn new(network: InMemoryContentNetwork) -> Self {
        Self {
            threads: Arc::default(),
            network,
            offline: Arc::default(),
        }
    }

    /// The backing content network.
    pub fn network(&self) -> &InMemoryContentNetwork {
        &self.network
    }

    /// Simulates an outage of the primary service.
    pub async fn set_offline(&self, offline: bool) {
        *self.offline.write().await = offline;
    }

    /// Forgets a thread on the primary service only.
    pub async fn evict(&self, thread_id: &ThreadId) {
        self.threads.write().await.remove(thread_id);
    }

    /// Replaces a thread file without pinning it.
    pub async fn overwrite(&self, file: ThreadFile) {
        self.threads
            .write()
            .await
            .insert(file.thread_id.clone(), file);
    }

    async fn check_online(&self) -> Result<()> {
        if *self.offline.read().await {
            return Err(ChatChainError::Transport(
                "storage service unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<ThreadFile>> {
        self.check_online().await?;
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn put_thread(&self, thread_id: &ThreadId, file: &ThreadFile) -> Result<ContentPointer> {
        self.check_online().await?;
        if &file.thread_id != thread_id {
            return Err(ChatChainError::ThreadMismatch {
                expected: thread_id.to_string(),
                found: file.thread_id.to_string(),
            });
        }

        let pointer = self.network.publish(file).await?;
        self.threads
            .write()
            .await
            .insert(thread_id.clone(), file.clone());
        Ok(pointer)
    }
}

// ============================================================================
// TTL Caches
// ============================================================================

/// Entry in a TTL cache with expiration.
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// In-memory cache with TTL expiration.
pub struct TtlCache<K, V> {
    cache: Arc<RwLock<HashMap<K, CacheEntry<V>>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a new cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// The configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a value.
    pub async fn store(&self, key: K, value: V) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Retrieve a value (returns None if expired).
    pub async fn retrieve(&self, key: &K) -> Option<V> {
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Invalidate one entry.
    pub async fn invalidate(&self, key: &K) {
        self.cache.write().await.remove(key);
    }

    /// Clear all entries.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    /// Remove all expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
    }
}

/// Cache of participants' X25519 encryption keys, keyed by long-form identity.
pub type PublicKeyCache = TtlCache<String, [u8; 32]>;

/// Cache of the last content pointer seen for each thread.
pub type PointerCache = TtlCache<ThreadId, ContentPointer>;

// ============================================================================
// Key Directory
// ============================================================================

/// Lookup of participants' encryption public keys.
#[async_trait::async_trait]
pub trait KeyDirectory: Send + Sync {
    /// The X25519 encryption key published for `identity`, if any.
    async fn encryption_key(&self, identity: &Identity) -> Result<Option<[u8; 32]>>;
}

/// In-memory key directory.
#[derive(Default, Clone)]
pub struct InMemoryKeyDirectory {
    keys: Arc<RwLock<HashMap<String, [u8; 32]>>>,
}

impl InMemoryKeyDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a key for an identity (either form).
    pub async fn register(&self, identity: &Identity, key: [u8; 32]) {
        self.keys
            .write()
            .await
            .insert(identity.to_public_key_form().to_string(), key);
    }
}

#[async_trait::async_trait]
impl KeyDirectory for InMemoryKeyDirectory {
    async fn encryption_key(&self, identity: &Identity) -> Result<Option<[u8; 32]>> {
        let keys = self.keys.read().await;
        Ok(keys.get(&identity.to_public_key_form().to_string()).copied())
    }
}

/// A [`KeyDirectory`] that remembers answers for a TTL.
pub struct CachedKeyDirectory {
    inner: Arc<dyn KeyDirectory>,
    cache: PublicKeyCache,
}

impl CachedKeyDirectory {
    /// Wraps `inner` with a cache of the given TTL.
    pub fn new(inner: Arc<dyn KeyDirectory>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: PublicKeyCache::new(ttl),
        }
    }

    /// Drops the cached key for an identity.
    pub async fn invalidate(&self, identity: &Identity) {
        self.cache
            .invalidate(&identity.to_public_key_form().to_string())
            .await;
    }
}

#[async_trait::async_trait]
impl KeyDirectory for CachedKeyDirectory {
    async fn encryption_key(&self, identity: &Identity) -> Result<Option<[u8; 32]>> {
        let cache_key = identity.to_public_key_form().to_string();
        if let Some(key) = self.cache.retrieve(&cache_key).await {
            return Ok(Some(key));
        }

        let key = self.inner.encryption_key(identity).await?;
        if let Some(key) = key {
            self.cache.store(cache_key, key).await;
        }
        Ok(key)
    }
}
