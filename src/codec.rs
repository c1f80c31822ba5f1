//! Envelope codec
//!
//! Seals payloads into kind-24133 events encrypted to a recipient and signed
//! by the relay, and opens envelopes addressed to the relay back into
//! payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::crypto::nip44;
use crate::crypto::schnorr::{self, Keys};
use crate::nostr::{is_addressed_to, p_tag, Event, EventTemplate, NOSTR_CONNECT_KIND};

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to encrypt payload: {0:#}")]
    Encrypt(anyhow::Error),
    #[error("failed to sign envelope: {0:#}")]
    Sign(anyhow::Error),
}

/// The three distinguishable ways opening an envelope can fail.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("envelope is not addressed to this relay")]
    NotAddressed,
    #[error("failed to decrypt envelope: {0:#}")]
    Decrypt(anyhow::Error),
    #[error("failed to decode envelope payload: {0}")]
    Decode(String),
}

#[derive(Clone)]
pub struct EnvelopeCodec {
    keys: Arc<Keys>,
    public_key: String,
}

impl EnvelopeCodec {
    pub fn new(keys: Arc<Keys>) -> Self {
        let public_key = keys.public_key_hex();
        Self { keys, public_key }
    }

    /// The relay identity envelopes are sealed by and opened for.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn seal<T: Serialize>(&self, recipient: &str, payload: &T) -> Result<Event, SealError> {
        let plaintext = serde_json::to_string(payload)?;
        let recipient_key = schnorr::parse_public_key(recipient).map_err(SealError::Encrypt)?;
        let content = nip44::encrypt_for_recipient(
            plaintext.as_bytes(),
            self.keys.secret_bytes(),
            &recipient_key,
        )
        .map_err(SealError::Encrypt)?;

        let tag = p_tag(recipient).map_err(SealError::Encrypt)?;
        EventTemplate::new(NOSTR_CONNECT_KIND, vec![tag], content)
            .sign(&self.keys)
            .map_err(SealError::Sign)
    }

    pub fn open<T: DeserializeOwned>(&self, envelope: &Event) -> Result<T, OpenError> {
        if !is_addressed_to(envelope, &self.public_key) {
            return Err(OpenError::NotAddressed);
        }

        let sender =
            schnorr::parse_public_key(&envelope.pubkey.to_hex()).map_err(OpenError::Decrypt)?;
        let plaintext =
            nip44::decrypt_from_sender(&envelope.content, self.keys.secret_bytes(), &sender)
                .map_err(OpenError::Decrypt)?;

        let text = String::from_utf8(plaintext).map_err(|e| OpenError::Decode(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| OpenError::Decode(e.to_string()))
    }
}
