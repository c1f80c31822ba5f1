//! Session cache
//!
//! Maps a client public key to a live signing capability. Misses are
//! rebuilt from the account store (decrypting the stored user secret), and
//! concurrent misses for one client share a single rebuild through a
//! per-client `OnceCell`.
//!
//! Entries expire after an idle TTL and the cache holds at most
//! `max_entries` sessions, evicting the least recently used one when full.
//! A slot whose rebuild is still running is never expired or evicted.
//!
//! Uses are recorded in memory and written to the store in one batch by
//! [`SessionCache::flush_touches`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::nostr::Timestamp;
use crate::signer::{LocalSigner, Signer};
use crate::store::{AccountStore, SecretVault};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active session found")]
    NotFound,
    #[error("account store failed: {0}")]
    Store(String),
    #[error("stored secret is unusable: {0}")]
    Secret(String),
}

/// Configuration for the session cache.
#[derive(Debug, Clone)]
pub struct SessionCacheConfig {
    /// Idle time after which a session is dropped from memory
    pub ttl: Duration,

    /// Maximum number of cached sessions
    pub max_entries: usize,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

/// A resolved session: the client it belongs to and the signer acting for
/// the account behind it.
pub struct Session {
    pub client_pubkey: String,
    pub email: String,
    pub connect_secret: String,
    pub signer: Arc<dyn Signer>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_pubkey", &self.client_pubkey)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

struct SessionSlot {
    cell: OnceCell<Arc<Session>>,
    last_used: Mutex<Instant>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Sessions rebuilt from the account store
    pub loads: u64,
    pub evictions: u64,
}

pub struct SessionCache {
    slots: DashMap<String, Arc<SessionSlot>>,
    store: Arc<dyn AccountStore>,
    vault: SecretVault,
    config: SessionCacheConfig,
    stats: CacheStats,
    /// client pubkey -> unix seconds of the latest use not yet in the store
    pending_touches: Mutex<HashMap<String, u64>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn AccountStore>, vault: SecretVault, config: SessionCacheConfig) -> Self {
        Self {
            slots: DashMap::new(),
            store,
            vault,
            config,
            stats: CacheStats::default(),
            pending_touches: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    /// Resolve the session for `client_pubkey`, rebuilding it from the store
    /// on a miss.
    pub async fn resolve(&self, client_pubkey: &str) -> Result<Arc<Session>, SessionError> {
        let slot = self
            .slots
            .entry(client_pubkey.to_string())
            .or_insert_with(|| Arc::new(SessionSlot::new()))
            .clone();

        if let Some(session) = slot.cell.get() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            slot.touch();
            self.record_use(client_pubkey);
            return Ok(session.clone());
        }

        let mut loaded = false;
        let result = slot
            .cell
            .get_or_try_init(|| {
                loaded = true;
                self.load(client_pubkey)
            })
            .await
            .cloned();

        match result {
            Ok(session) => {
                slot.touch();
                self.record_use(client_pubkey);
                if loaded {
                    self.evict_over_capacity(client_pubkey);
                } else {
                    // another task finished the rebuild while we waited
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(session)
            }
            Err(e) => {
                self.slots.remove_if(client_pubkey, |_, existing| {
                    Arc::ptr_eq(existing, &slot) && existing.cell.get().is_none()
                });
                Err(e)
            }
        }
    }

    async fn load(&self, client_pubkey: &str) -> Result<Arc<Session>, SessionError> {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let store = self.store.clone();
        let key = client_pubkey.to_string();
        let record = tokio::task::spawn_blocking(move || store.resolve_account_secret(&key))
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?
            .map_err(|e| SessionError::Store(format!("{e:#}")))?
            .ok_or(SessionError::NotFound)?;

        let secret = self
            .vault
            .unseal_secret(&record.encrypted_secret)
            .map_err(|e| SessionError::Secret(format!("{e:#}")))?;
        let signer = LocalSigner::from_secret_hex(&secret)
            .map_err(|e| SessionError::Secret(format!("{e:#}")))?;

        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client = %client_pubkey, email = %record.email, "session loaded");

        Ok(Arc::new(Session {
            client_pubkey: record.client_pubkey,
            email: record.email,
            connect_secret: record.connect_secret,
            signer: Arc::new(signer),
        }))
    }

    /// Install an already-built session, replacing any cached one.
    pub fn insert(&self, session: Session) -> Arc<Session> {
        let client_pubkey = session.client_pubkey.clone();
        let session = Arc::new(session);
        let slot = SessionSlot::new();
        let _ = slot.cell.set(session.clone());
        self.slots.insert(client_pubkey.clone(), Arc::new(slot));
        self.evict_over_capacity(&client_pubkey);
        session
    }

    pub fn remove(&self, client_pubkey: &str) -> bool {
        self.slots.remove(client_pubkey).is_some()
    }

    pub fn contains(&self, client_pubkey: &str) -> bool {
        self.slots
            .get(client_pubkey)
            .is_some_and(|slot| slot.cell.initialized())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drop sessions idle for longer than the TTL. Returns how many went.
    pub fn sweep(&self) -> usize {
        let ttl = self.config.ttl;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.cell.initialized() || slot.idle() < ttl);
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "expired idle sessions");
        }
        removed
    }

    fn evict_over_capacity(&self, keep: &str) {
        while self.slots.len() > self.config.max_entries {
            let oldest = self
                .slots
                .iter()
                .filter(|entry| entry.key() != keep && entry.value().cell.initialized())
                .max_by_key(|entry| entry.value().idle())
                .map(|entry| entry.key().clone());

            let Some(oldest) = oldest else { break };
            if self.slots.remove(&oldest).is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(client = %oldest, "evicted least recently used session");
            }
        }
    }

    fn record_use(&self, client_pubkey: &str) {
        let now = Timestamp::now().as_u64();
        self.pending_touches
            .lock()
            .insert(client_pubkey.to_string(), now);
    }

    /// Write recorded session uses to the store. Returns how many sessions
    /// were updated; on a store failure the uses are kept for the next
    /// flush.
    pub async fn flush_touches(&self) -> usize {
        let uses: Vec<(String, u64)> = self.pending_touches.lock().drain().collect();
        if uses.is_empty() {
            return 0;
        }

        let store = self.store.clone();
        let batch = uses.clone();
        let result = tokio::task::spawn_blocking(move || store.record_uses(&batch))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result);

        match result {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(sessions = uses.len(), error = %format!("{e:#}"), "failed to record session use");
                let mut pending = self.pending_touches.lock();
                for (client_pubkey, used_at) in uses {
                    let entry = pending.entry(client_pubkey).or_insert(used_at);
                    *entry = (*entry).max(used_at);
                }
                0
            }
        }
    }
}
