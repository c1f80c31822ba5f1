//! Account store
//!
//! Accounts map an email to a user secret key, encrypted at rest to the
//! relay's own key. Sessions map a client public key to the account it signs
//! for, plus the connect secret handed out when the session was started.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::crypto::nip44;
use crate::crypto::Keys;
use crate::nostr::Timestamp;
use crate::storage::Storage;

const ACCOUNTS_KEY: &str = "accounts.json";
const SESSIONS_KEY: &str = "sessions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub email: String,
    pub encrypted_secret: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub email: String,
    pub client_pubkey: String,
    pub connect_secret: String,
    pub created_at: u64,
    pub last_used: u64,
}

/// What the session cache needs to rebuild a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSecret {
    pub email: String,
    pub client_pubkey: String,
    pub connect_secret: String,
    pub encrypted_secret: String,
}

pub trait AccountStore: Send + Sync {
    /// Look up the session for `client_pubkey` joined with its account.
    fn resolve_account_secret(&self, client_pubkey: &str) -> Result<Option<AccountSecret>>;

    /// Record `(client_pubkey, unix seconds)` last-use times in one write.
    /// Unknown sessions are skipped; returns how many were updated.
    fn record_uses(&self, uses: &[(String, u64)]) -> Result<usize>;

    fn create_account(&self, email: &str, encrypted_secret: &str) -> Result<()>;

    fn create_session(&self, email: &str, client_pubkey: &str, connect_secret: &str)
        -> Result<()>;

    fn delete_session(&self, client_pubkey: &str) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<String, AccountRecord>,
    sessions: BTreeMap<String, SessionRecord>,
}

/// An [`AccountStore`] that keeps both tables as JSON documents in a
/// [`Storage`] backend.
pub struct JsonAccountStore<S: Storage> {
    storage: S,
    tables: Mutex<Tables>,
}

impl<S: Storage> JsonAccountStore<S> {
    pub fn open(storage: S) -> Result<Self> {
        let accounts = load_table(&storage, ACCOUNTS_KEY)?;
        let sessions = load_table(&storage, SESSIONS_KEY)?;
        Ok(Self {
            storage,
            tables: Mutex::new(Tables { accounts, sessions }),
        })
    }

    pub fn account(&self, email: &str) -> Option<AccountRecord> {
        self.tables.lock().accounts.get(email).cloned()
    }

    pub fn session(&self, client_pubkey: &str) -> Option<SessionRecord> {
        self.tables.lock().sessions.get(client_pubkey).cloned()
    }

    fn save_accounts(&self, tables: &Tables) -> Result<()> {
        let data = serde_json::to_vec_pretty(&tables.accounts)?;
        self.storage.write(ACCOUNTS_KEY, &data)
    }

    fn save_sessions(&self, tables: &Tables) -> Result<()> {
        let data = serde_json::to_vec_pretty(&tables.sessions)?;
        self.storage.write(SESSIONS_KEY, &data)
    }
}

fn load_table<S: Storage, T: serde::de::DeserializeOwned>(
    storage: &S,
    key: &str,
) -> Result<BTreeMap<String, T>> {
    if !storage.exists(key) {
        return Ok(BTreeMap::new());
    }
    let data = storage.read(key)?;
    serde_json::from_slice(&data).with_context(|| format!("Corrupt table {key}"))
}

impl<S: Storage> AccountStore for JsonAccountStore<S> {
    fn resolve_account_secret(&self, client_pubkey: &str) -> Result<Option<AccountSecret>> {
        let tables = self.tables.lock();
        let Some(session) = tables.sessions.get(client_pubkey) else {
            return Ok(None);
        };
        let Some(account) = tables.accounts.get(&session.email) else {
            return Ok(None);
        };
        Ok(Some(AccountSecret {
            email: session.email.clone(),
            client_pubkey: session.client_pubkey.clone(),
            connect_secret: session.connect_secret.clone(),
            encrypted_secret: account.encrypted_secret.clone(),
        }))
    }

    fn record_uses(&self, uses: &[(String, u64)]) -> Result<usize> {
        let mut tables = self.tables.lock();
        let mut updated = 0;
        for (client_pubkey, used_at) in uses {
            if let Some(session) = tables.sessions.get_mut(client_pubkey) {
                session.last_used = session.last_used.max(*used_at);
                updated += 1;
            }
        }
        if updated > 0 {
            self.save_sessions(&tables)?;
        }
        Ok(updated)
    }

    fn create_account(&self, email: &str, encrypted_secret: &str) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.accounts.contains_key(email) {
            bail!("Account already exists: {email}");
        }
        tables.accounts.insert(
            email.to_string(),
            AccountRecord {
                email: email.to_string(),
                encrypted_secret: encrypted_secret.to_string(),
                created_at: Timestamp::now().as_u64(),
            },
        );
        self.save_accounts(&tables)
    }

    fn create_session(
        &self,
        email: &str,
        client_pubkey: &str,
        connect_secret: &str,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        if !tables.accounts.contains_key(email) {
            bail!("No account for {email}");
        }
        let now = Timestamp::now().as_u64();
        tables.sessions.insert(
            client_pubkey.to_string(),
            SessionRecord {
                email: email.to_string(),
                client_pubkey: client_pubkey.to_string(),
                connect_secret: connect_secret.to_string(),
                created_at: now,
                last_used: now,
            },
        );
        self.save_sessions(&tables)
    }

    fn delete_session(&self, client_pubkey: &str) -> Result<bool> {
        let mut tables = self.tables.lock();
        if tables.sessions.remove(client_pubkey).is_none() {
            return Ok(false);
        }
        self.save_sessions(&tables)?;
        Ok(true)
    }
}

/// Encrypts user secrets to the relay's own key with NIP-44.
#[derive(Clone)]
pub struct SecretVault {
    keys: Arc<Keys>,
}

impl SecretVault {
    pub fn new(keys: Arc<Keys>) -> Self {
        Self { keys }
    }

    pub fn seal_secret(&self, secret_hex: &str) -> Result<String> {
        nip44::encrypt_for_recipient(
            secret_hex.as_bytes(),
            self.keys.secret_bytes(),
            &self.keys.public_key(),
        )
    }

    pub fn unseal_secret(&self, payload: &str) -> Result<Zeroizing<String>> {
        let plaintext = Zeroizing::new(nip44::decrypt_from_sender(
            payload,
            self.keys.secret_bytes(),
            &self.keys.public_key(),
        )?);
        let text = std::str::from_utf8(&plaintext).context("Stored secret is not UTF-8")?;
        Ok(Zeroizing::new(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, MemoryStorage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> JsonAccountStore<MemoryStorage> {
        JsonAccountStore::open(MemoryStorage::new()).unwrap()
    }

    #[test]
    fn test_resolve_joins_account() {
        let store = store();
        store.create_account("a@example.com", "sealed").unwrap();
        store
            .create_session("a@example.com", "client-pk", "connect-secret")
            .unwrap();

        let secret = store.resolve_account_secret("client-pk").unwrap().unwrap();
        assert_eq!(
            secret,
            AccountSecret {
                email: "a@example.com".to_string(),
                client_pubkey: "client-pk".to_string(),
                connect_secret: "connect-secret".to_string(),
                encrypted_secret: "sealed".to_string(),
            }
        );
        assert!(store.resolve_account_secret("unknown").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let store = store();
        store.create_account("a@example.com", "sealed").unwrap();
        assert!(store.create_account("a@example.com", "other").is_err());
    }

    #[test]
    fn test_session_requires_account() {
        let store = store();
        assert!(store.create_session("nobody@example.com", "pk", "s").is_err());
    }

    #[test]
    fn test_delete_session() {
        let store = store();
        store.create_account("a@example.com", "sealed").unwrap();
        store.create_session("a@example.com", "pk", "s").unwrap();

        assert!(store.delete_session("pk").unwrap());
        assert!(!store.delete_session("pk").unwrap());
        assert!(store.resolve_account_secret("pk").unwrap().is_none());
    }

    #[test]
    fn test_tables_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let store = JsonAccountStore::open(FileStorage::new(path).unwrap()).unwrap();
            store.create_account("a@example.com", "sealed").unwrap();
            store.create_session("a@example.com", "pk", "s").unwrap();
            store
                .record_uses(&[("pk".to_string(), 4_000_000_000)])
                .unwrap();
        }

        let store = JsonAccountStore::open(FileStorage::new(path).unwrap()).unwrap();
        assert_eq!(store.account("a@example.com").unwrap().encrypted_secret, "sealed");
        let session = store.session("pk").unwrap();
        assert_eq!(session.connect_secret, "s");
        assert_eq!(session.last_used, 4_000_000_000);
    }

    /// Memory storage that counts writes.
    struct CountingStorage {
        inner: MemoryStorage,
        writes: Arc<AtomicUsize>,
    }

    impl Storage for CountingStorage {
        fn read(&self, key: &str) -> Result<Vec<u8>> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, data: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write(key, data)
        }

        fn exists(&self, key: &str) -> bool {
            self.inner.exists(key)
        }
    }

    #[test]
    fn test_resolve_does_not_write() {
        let writes = Arc::new(AtomicUsize::new(0));
        let store = JsonAccountStore::open(CountingStorage {
            inner: MemoryStorage::new(),
            writes: writes.clone(),
        })
        .unwrap();
        store.create_account("a@example.com", "sealed").unwrap();
        store.create_session("a@example.com", "pk", "s").unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 2);

        for _ in 0..3 {
            assert!(store.resolve_account_secret("pk").unwrap().is_some());
        }
        assert_eq!(writes.load(Ordering::SeqCst), 2);

        store.record_uses(&[("pk".to_string(), 1)]).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_record_uses_batches() {
        let store = store();
        store.create_account("a@example.com", "sealed").unwrap();
        store.create_session("a@example.com", "pk1", "s").unwrap();
        store.create_session("a@example.com", "pk2", "s").unwrap();
        let created = store.session("pk1").unwrap().last_used;

        let uses = [
            ("pk1".to_string(), created + 100),
            ("pk2".to_string(), created + 200),
            ("gone".to_string(), created + 300),
        ];
        assert_eq!(store.record_uses(&uses).unwrap(), 2);
        assert_eq!(store.session("pk1").unwrap().last_used, created + 100);
        assert_eq!(store.session("pk2").unwrap().last_used, created + 200);

        // an older timestamp never moves last_used backwards
        store.record_uses(&[("pk1".to_string(), 1)]).unwrap();
        assert_eq!(store.session("pk1").unwrap().last_used, created + 100);
        assert_eq!(store.record_uses(&[]).unwrap(), 0);
    }

    #[test]
    fn test_vault_round_trip() {
        let vault = SecretVault::new(Arc::new(Keys::generate()));
        let user = Keys::generate();

        let sealed = vault.seal_secret(&user.secret_key_hex()).unwrap();
        assert_ne!(sealed, user.secret_key_hex());
        assert_eq!(*vault.unseal_secret(&sealed).unwrap(), user.secret_key_hex());

        let other = SecretVault::new(Arc::new(Keys::generate()));
        assert!(other.unseal_secret(&sealed).is_err());
    }
}
