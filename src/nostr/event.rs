//! NIP-01 events
//!
//! The event model is nostr-sdk's. Burrow signs with its own BIP340 keys, so
//! templates are turned into events here: the id comes from
//! [`EventId::new`] and the signature from [`Keys::sign`].

use anyhow::Result;
use nostr_sdk::secp256k1::schnorr::Signature;
use nostr_sdk::{Event, EventId, Kind, PublicKey, Tag, Timestamp};
use serde::Deserialize;

use crate::crypto::Keys;

/// NIP-46 request/response envelope kind
pub const NOSTR_CONNECT_KIND: Kind = Kind::NostrConnect;

/// An event as submitted for signing. Any `pubkey` or `id` on the wire is
/// ignored; a missing `created_at` means now.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventTemplate {
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    pub kind: Kind,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: Kind, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            created_at: None,
            kind,
            tags,
            content: content.into(),
        }
    }

    pub fn created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Sign as `keys`.
    pub fn sign(self, keys: &Keys) -> Result<Event> {
        let public_key = PublicKey::from_hex(&keys.public_key_hex())?;
        let created_at = self.created_at.unwrap_or_else(Timestamp::now);
        let id = EventId::new(&public_key, &created_at, &self.kind, &self.tags, &self.content);
        let sig = Signature::from_slice(&keys.sign(id.as_bytes())?)?;

        Ok(Event::new(
            id,
            public_key,
            created_at,
            self.kind,
            self.tags,
            self.content,
            sig,
        ))
    }
}

/// `["p", <pubkey>]` for a hex public key.
pub fn p_tag(pubkey: &str) -> Result<Tag> {
    Ok(Tag::public_key(PublicKey::from_hex(pubkey)?))
}

/// Whether a `p` tag on `event` names the hex key `pubkey`.
pub fn is_addressed_to(event: &Event, pubkey: &str) -> bool {
    event.tags.iter().any(|tag| {
        matches!(tag.as_slice(), [name, value, ..] if name == "p" && value == pubkey)
    })
}
