//! NIP-44 v2 Encryption
//!
//! Payload encryption used for every delegated-signing envelope and for the
//! account secrets at rest. ECDH over secp256k1, HKDF-SHA256 key derivation,
//! ChaCha20 with an HMAC-SHA256 tag.
//!
//! References:
//! - https://github.com/nostr-protocol/nips/blob/master/44.md

use anyhow::{Context, Result};
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256kfun::prelude::*;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// NIP-44 v2 version byte
const NIP44_VERSION: u8 = 2;

/// Salt for HKDF key derivation
const HKDF_SALT: &[u8] = b"nip44-v2";

const MIN_PLAINTEXT_LEN: usize = 1;
const MAX_PLAINTEXT_LEN: usize = 65535;

/// Smallest valid payload: version(1) + nonce(32) + padded(2 + 32) + mac(32)
const MIN_PAYLOAD_LEN: usize = 99;

/// Derives a shared secret using ECDH
/// Takes a secret scalar and a public key (x-only 32 bytes)
pub fn ecdh_shared_secret(secret: &[u8; 32], pubkey: &[u8; 32]) -> Result<[u8; 32]> {
    let secret_scalar: Scalar<Secret, NonZero> =
        Scalar::from_bytes(*secret).context("Invalid secret scalar")?;

    // x-only keys always lift to the even-y point
    let pubkey_point =
        Point::<EvenY>::from_xonly_bytes(*pubkey).context("Invalid x-only public key")?;

    let shared_point = g!(secret_scalar * pubkey_point);
    Ok(shared_point.normalize().to_xonly_bytes())
}

/// Derives the conversation key: HKDF-extract(salt = "nip44-v2", ikm = shared_x)
pub fn derive_conversation_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(HKDF_SALT), shared_secret);
    prk.into()
}

/// Conversation key between a local secret and a remote x-only public key.
/// Symmetric: both sides of a conversation derive the same key.
pub fn conversation_key(secret: &[u8; 32], pubkey: &[u8; 32]) -> Result<[u8; 32]> {
    let shared = ecdh_shared_secret(secret, pubkey)?;
    Ok(derive_conversation_key(&shared))
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

/// HKDF-expand(prk = conversation_key, info = nonce, L = 76)
fn derive_message_keys(conversation_key: &[u8; 32], nonce: &[u8; 32]) -> Result<MessageKeys> {
    let hk = Hkdf::<Sha256>::from_prk(conversation_key)
        .map_err(|_| anyhow::anyhow!("Invalid conversation key length"))?;

    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|_| anyhow::anyhow!("HKDF expand failed"))?;

    let mut keys = MessageKeys {
        chacha_key: [0u8; 32],
        chacha_nonce: [0u8; 12],
        hmac_key: [0u8; 32],
    };
    keys.chacha_key.copy_from_slice(&okm[..32]);
    keys.chacha_nonce.copy_from_slice(&okm[32..44]);
    keys.hmac_key.copy_from_slice(&okm[44..]);
    Ok(keys)
}

/// Calculate padding length per NIP-44
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

/// Pads plaintext per NIP-44: u16 big-endian length prefix, zero fill
fn pad_plaintext(plaintext: &[u8]) -> Result<Vec<u8>> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        anyhow::bail!("Plaintext length {} out of range", len);
    }
    let padded_len = calc_padded_len(len);

    let mut result = Vec::with_capacity(2 + padded_len);
    result.extend_from_slice(&(len as u16).to_be_bytes());
    result.extend_from_slice(plaintext);
    result.resize(2 + padded_len, 0);
    Ok(result)
}

/// Unpads plaintext per NIP-44
fn unpad_plaintext(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 2 {
        anyhow::bail!("Padded plaintext too short");
    }

    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT_LEN
        || len > padded.len() - 2
        || padded.len() != 2 + calc_padded_len(len)
    {
        anyhow::bail!("Invalid padding");
    }

    Ok(padded[2..2 + len].to_vec())
}

fn mac_for(hmac_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256> {
    let mut mac =
        HmacSha256::new_from_slice(hmac_key).map_err(|_| anyhow::anyhow!("Invalid HMAC key"))?;
    mac.update(nonce);
    mac.update(ciphertext);
    Ok(mac)
}

/// Encrypts a message using NIP-44 v2
/// Returns base64-encoded payload
pub fn encrypt(plaintext: &[u8], conversation_key: &[u8; 32]) -> Result<String> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);

    encrypt_with_nonce(plaintext, conversation_key, &nonce)
}

/// Encrypts a message using NIP-44 v2 with specified nonce (for testing)
pub fn encrypt_with_nonce(
    plaintext: &[u8],
    conversation_key: &[u8; 32],
    nonce: &[u8; 32],
) -> Result<String> {
    let keys = derive_message_keys(conversation_key, nonce)?;

    let mut buffer = pad_plaintext(plaintext)?;
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    let tag = mac_for(&keys.hmac_key, nonce, &buffer)?.finalize().into_bytes();

    // version + nonce + ciphertext + mac
    let mut payload = Vec::with_capacity(1 + 32 + buffer.len() + 32);
    payload.push(NIP44_VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&tag);

    Ok(base64::engine::general_purpose::STANDARD.encode(payload))
}

/// Decrypts a NIP-44 v2 payload
pub fn decrypt(payload_b64: &str, conversation_key: &[u8; 32]) -> Result<Vec<u8>> {
    if payload_b64.starts_with('#') {
        anyhow::bail!("Unknown encryption version");
    }

    let payload = base64::engine::general_purpose::STANDARD
        .decode(payload_b64)
        .context("Invalid base64 encoding")?;

    if payload.len() < MIN_PAYLOAD_LEN {
        anyhow::bail!("Ciphertext too short");
    }

    let version = payload[0];
    if version != NIP44_VERSION {
        anyhow::bail!("Unsupported NIP-44 version: {}", version);
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&payload[1..33]);
    let ciphertext = &payload[33..payload.len() - 32];
    let expected_mac = &payload[payload.len() - 32..];

    let keys = derive_message_keys(conversation_key, &nonce)?;

    mac_for(&keys.hmac_key, &nonce, ciphertext)?
        .verify_slice(expected_mac)
        .map_err(|_| anyhow::anyhow!("HMAC verification failed"))?;

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    unpad_plaintext(&buffer)
}

/// Encrypts a message for a recipient given sender's secret and recipient's pubkey
pub fn encrypt_for_recipient(
    plaintext: &[u8],
    sender_secret: &[u8; 32],
    recipient_pubkey: &[u8; 32],
) -> Result<String> {
    let key = conversation_key(sender_secret, recipient_pubkey)?;
    encrypt(plaintext, &key)
}

/// Decrypts a message from a sender given recipient's secret and sender's pubkey
pub fn decrypt_from_sender(
    payload_b64: &str,
    recipient_secret: &[u8; 32],
    sender_pubkey: &[u8; 32],
) -> Result<Vec<u8>> {
    let key = conversation_key(recipient_secret, sender_pubkey)?;
    decrypt(payload_b64, &key)
}
