//! Signing capabilities
//!
//! A [`Signer`] is what a session hands to the dispatcher: it can report its
//! identity, sign events and encrypt/decrypt NIP-44 payloads. [`LocalSigner`]
//! holds the key in process.

use async_trait::async_trait;

use crate::crypto::schnorr::{self, Keys};
use crate::crypto::nip44;
use crate::nostr::{Event, EventTemplate};

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex x-only public key this signer signs for.
    async fn public_key(&self) -> Result<String, SignerError>;

    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError>;

    async fn nip44_encrypt(&self, recipient: &str, plaintext: &str) -> Result<String, SignerError>;

    async fn nip44_decrypt(&self, sender: &str, payload: &str) -> Result<String, SignerError>;
}

/// A signer backed by an in-memory secret key.
#[derive(Debug)]
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn from_secret_hex(secret_hex: &str) -> anyhow::Result<Self> {
        Ok(Self::new(Keys::parse(secret_hex)?))
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }
}

fn parse_peer(public_key: &str) -> Result<[u8; 32], SignerError> {
    schnorr::parse_public_key(public_key)
        .map_err(|e| SignerError::InvalidPublicKey(format!("{e:#}")))
}

#[async_trait]
impl Signer for LocalSigner {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.keys.public_key_hex())
    }

    async fn sign_event(&self, template: EventTemplate) -> Result<Event, SignerError> {
        template
            .sign(&self.keys)
            .map_err(|e| SignerError::Sign(format!("{e:#}")))
    }

    async fn nip44_encrypt(&self, recipient: &str, plaintext: &str) -> Result<String, SignerError> {
        let recipient = parse_peer(recipient)?;
        nip44::encrypt_for_recipient(plaintext.as_bytes(), self.keys.secret_bytes(), &recipient)
            .map_err(|e| SignerError::Encrypt(format!("{e:#}")))
    }

    async fn nip44_decrypt(&self, sender: &str, payload: &str) -> Result<String, SignerError> {
        let sender = parse_peer(sender)?;
        let plaintext = nip44::decrypt_from_sender(payload, self.keys.secret_bytes(), &sender)
            .map_err(|e| SignerError::Decrypt(format!("{e:#}")))?;
        String::from_utf8(plaintext).map_err(|e| SignerError::Decrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nostr::Kind;

    #[tokio::test]
    async fn test_public_key_matches_keys() {
        let signer = LocalSigner::new(Keys::generate());
        assert_eq!(
            signer.public_key().await.unwrap(),
            signer.keys().public_key_hex()
        );
    }

    #[tokio::test]
    async fn test_sign_event() {
        let signer = LocalSigner::new(Keys::generate());
        let event = signer
            .sign_event(EventTemplate::new(Kind::TextNote, vec![], "hello"))
            .await
            .unwrap();
        assert_eq!(event.pubkey.to_hex(), signer.keys().public_key_hex());
        event.verify().unwrap();
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_between_signers() {
        let alice = LocalSigner::new(Keys::generate());
        let bob = LocalSigner::new(Keys::generate());
        let alice_pk = alice.public_key().await.unwrap();
        let bob_pk = bob.public_key().await.unwrap();

        let payload = alice.nip44_encrypt(&bob_pk, "secret note").await.unwrap();
        let plaintext = bob.nip44_decrypt(&alice_pk, &payload).await.unwrap();
        assert_eq!(plaintext, "secret note");
    }

    #[tokio::test]
    async fn test_errors() {
        let signer = LocalSigner::new(Keys::generate());
        assert!(matches!(
            signer.nip44_encrypt("not-a-key", "x").await,
            Err(SignerError::InvalidPublicKey(_))
        ));

        let other = Keys::generate().public_key_hex();
        assert!(matches!(
            signer.nip44_encrypt(&other, "").await,
            Err(SignerError::Encrypt(_))
        ));
        assert!(matches!(
            signer.nip44_decrypt(&other, "AgAA").await,
            Err(SignerError::Decrypt(_))
        ));
    }

    #[test]
    fn test_from_secret_hex() {
        let keys = Keys::generate();
        let signer = LocalSigner::from_secret_hex(&keys.secret_key_hex()).unwrap();
        assert_eq!(signer.keys().public_key(), keys.public_key());
        assert!(LocalSigner::from_secret_hex("nope").is_err());
    }
}
