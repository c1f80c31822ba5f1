//! Relay shared state
//!
//! One [`Relay`] per process. It owns the relay identity, the subscription
//! registry, the session cache and the dispatcher, and hands out a
//! [`Connection`] per socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::EnvelopeCodec;
use crate::connection::Connection;
use crate::crypto::schnorr;
use crate::crypto::Keys;
use crate::dispatch::{Request, RequestDispatcher};
use crate::outbox::{Outbound, Outbox};
use crate::registry::SubscriptionRegistry;
use crate::session::{Session, SessionCache, SessionCacheConfig};
use crate::store::{AccountStore, SecretVault};

pub const DEFAULT_NAME: &str = "Burrow";
pub const DEFAULT_DESCRIPTION: &str =
    "A relay/bunker combo for adapting email/password login to nostr keys via NIP 46.";
pub const SOFTWARE_URL: &str = "https://github.com/coracle-social/burrow";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub name: String,
    pub description: String,
    pub icon: Option<String>,
    pub sessions: SessionCacheConfig,
    /// How often idle sessions are swept
    pub sweep_interval: Duration,
    /// Per-connection outbound queue length
    pub outbound_queue: usize,
    pub log_relay_messages: bool,
    pub log_nip46_messages: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            icon: None,
            sessions: SessionCacheConfig::default(),
            sweep_interval: Duration::from_secs(60),
            outbound_queue: 256,
            log_relay_messages: false,
            log_nip46_messages: false,
        }
    }
}

/// Unsolicited response announcing a new session to its client.
#[derive(Serialize)]
struct SessionStarted<'a> {
    id: String,
    result: &'a str,
}

pub struct Relay {
    config: RelayConfig,
    keys: Arc<Keys>,
    codec: EnvelopeCodec,
    registry: SubscriptionRegistry,
    sessions: SessionCache,
    dispatcher: RequestDispatcher,
    next_connection_id: AtomicU64,
}

impl Relay {
    pub fn new(keys: Keys, store: Arc<dyn AccountStore>, config: RelayConfig) -> Arc<Self> {
        let keys = Arc::new(keys);
        let vault = SecretVault::new(keys.clone());
        let sessions = SessionCache::new(store, vault, config.sessions.clone());

        tracing::info!(pubkey = %keys.public_key_hex(), "relay identity loaded");

        Arc::new(Self {
            codec: EnvelopeCodec::new(keys.clone()),
            keys,
            registry: SubscriptionRegistry::new(),
            sessions,
            dispatcher: RequestDispatcher::new(),
            next_connection_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn public_key(&self) -> &str {
        self.codec.public_key()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    /// Create the protocol state for a new socket whose writer reads `tx`.
    pub fn connect(self: &Arc<Self>, tx: mpsc::Sender<Outbound>) -> Connection {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Outbox::new(id, tx, self.config.log_relay_messages);
        tracing::debug!(connection = id, "connection opened");
        Connection::new(self.clone(), outbox)
    }

    /// Run one request against its session and fan the sealed response out.
    pub(crate) async fn respond(&self, session: Arc<Session>, request: Request) {
        let response = self.dispatcher.dispatch(&session, request).await;

        if self.config.log_nip46_messages {
            tracing::info!(
                client = %session.client_pubkey,
                id = %response.id,
                result = ?response.result,
                error = ?response.error,
                "nip46 response"
            );
        }

        match self.codec.seal(&session.client_pubkey, &response) {
            Ok(envelope) => {
                let delivered = self.registry.publish(&envelope);
                tracing::debug!(client = %session.client_pubkey, id = %response.id, delivered, "response published");
            }
            Err(e) => {
                tracing::error!(client = %session.client_pubkey, error = %e, "failed to seal response");
            }
        }
    }

    /// Record a session for `client_pubkey` and announce it to the client
    /// with `{id, result: connect_secret}`. Returns how many subscribers
    /// received the announcement.
    pub async fn start_session(
        &self,
        email: &str,
        client_pubkey: &str,
        connect_secret: &str,
    ) -> Result<usize> {
        schnorr::parse_public_key(client_pubkey)?;

        let store = self.sessions.store().clone();
        let (email_owned, client_owned, secret_owned) = (
            email.to_string(),
            client_pubkey.to_string(),
            connect_secret.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            store.create_session(&email_owned, &client_owned, &secret_owned)
        })
        .await??;

        self.sessions.remove(client_pubkey);
        self.sessions.resolve(client_pubkey).await?;

        let announcement = SessionStarted {
            id: hex::encode(rand::random::<[u8; 8]>()),
            result: connect_secret,
        };
        let envelope = self.codec.seal(client_pubkey, &announcement)?;
        let delivered = self.registry.publish(&envelope);

        tracing::info!(client = %client_pubkey, email, delivered, "session started");
        Ok(delivered)
    }

    /// Remove the stored session and evict it from the cache.
    pub async fn delete_session(&self, client_pubkey: &str) -> Result<bool> {
        let store = self.sessions.store().clone();
        let key = client_pubkey.to_string();
        let existed = tokio::task::spawn_blocking(move || store.delete_session(&key)).await??;
        let cached = self.sessions.remove(client_pubkey);

        tracing::info!(client = %client_pubkey, existed, cached, "session deleted");
        Ok(existed)
    }

    /// NIP-11 relay information document.
    pub fn info_document(&self) -> Value {
        let mut doc = json!({
            "name": self.config.name,
            "description": self.config.description,
            "pubkey": self.public_key(),
            "software": SOFTWARE_URL,
            "version": env!("CARGO_PKG_VERSION"),
            "supported_nips": [1, 11, 44, 46],
        });
        if let (Some(icon), Some(map)) = (&self.config.icon, doc.as_object_mut()) {
            map.insert("icon".to_string(), Value::String(icon.clone()));
        }
        doc
    }

    /// Periodically drop idle sessions and write recorded session uses to
    /// the store.
    pub fn spawn_session_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let relay = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(relay) = relay.upgrade() else { break };
                relay.sessions.sweep();
                relay.sessions.flush_touches().await;
            }
        })
    }
}
