//! BIP340 Schnorr keys and signatures
//!
//! Nostr identities are 32-byte x-only secp256k1 public keys and every event
//! carries a BIP340 signature over its id. This module holds the key type used
//! by the relay and by custodial sessions, and signs event ids.
//!
//! References:
//! - BIP340: https://github.com/bitcoin/bips/blob/master/bip-0340.mediawiki

use anyhow::{Context, Result};
use rand::RngCore;
use secp256kfun::prelude::*;
use zeroize::Zeroize;

use super::helpers::tagged_hash;

/// BIP340/challenge tagged hash for signature verification
fn challenge_hash(r_bytes: &[u8; 32], pubkey_bytes: &[u8; 32], message: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 + 32 + message.len());
    data.extend_from_slice(r_bytes);
    data.extend_from_slice(pubkey_bytes);
    data.extend_from_slice(message);
    tagged_hash("BIP0340/challenge", &data)
}

/// BIP340/nonce tagged hash for deterministic nonce generation
fn nonce_hash(masked_secret: &[u8; 32], pubkey_bytes: &[u8; 32], message: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 + 32 + message.len());
    data.extend_from_slice(masked_secret);
    data.extend_from_slice(pubkey_bytes);
    data.extend_from_slice(message);
    tagged_hash("BIP0340/nonce", &data)
}

/// A secp256k1 keypair normalised for BIP340.
///
/// The stored secret always corresponds to the even-Y public point, so the
/// x-only public key and the secret agree without further negation. The
/// secret is zeroized on drop.
pub struct Keys {
    secret: [u8; 32],
    public: [u8; 32],
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if let Ok(keys) = Self::from_secret_bytes(bytes) {
                return keys;
            }
        }
    }

    /// Build a keypair from a 32-byte secret, negating it if the public
    /// point has odd Y.
    pub fn from_secret_bytes(secret_bytes: [u8; 32]) -> Result<Self> {
        let secret_scalar: Scalar<Secret, NonZero> =
            Scalar::from_bytes(secret_bytes).context("Invalid secret key bytes")?;

        let public_point = g!(secret_scalar * G).normalize();

        let (final_secret, final_public) = if public_point.is_y_even() {
            (secret_scalar, public_point)
        } else {
            (-secret_scalar, -public_point)
        };

        Ok(Self {
            secret: final_secret.to_bytes(),
            public: final_public.to_xonly_bytes(),
        })
    }

    /// Parse a hex-encoded 32-byte secret key.
    pub fn parse(secret_hex: &str) -> Result<Self> {
        let mut bytes: [u8; 32] = hex::decode(secret_hex.trim())
            .context("Invalid hex string for secret key")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Secret key must be exactly 32 bytes"))?;
        let keys = Self::from_secret_bytes(bytes);
        bytes.zeroize();
        keys
    }

    /// x-only public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// x-only public key, hex encoded. This is the nostr identity.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public)
    }

    /// Secret key, hex encoded.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret)
    }

    pub(crate) fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Sign a message with fresh auxiliary randomness.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64]> {
        let mut aux = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut aux);
        self.sign_with_aux(message, &aux)
    }

    /// BIP340 signing with caller-provided auxiliary randomness.
    pub fn sign_with_aux(&self, message: &[u8], aux: &[u8; 32]) -> Result<[u8; 64]> {
        let secret_scalar: Scalar<Secret, NonZero> =
            Scalar::from_bytes(self.secret).context("Invalid stored secret key")?;

        // t = secret XOR hash_aux(aux)
        let aux_hashed = tagged_hash("BIP0340/aux", aux);
        let mut masked_secret = self.secret;
        for (byte, mask) in masked_secret.iter_mut().zip(aux_hashed.iter()) {
            *byte ^= mask;
        }

        let k_bytes = nonce_hash(&masked_secret, &self.public, message);
        masked_secret.zeroize();

        let mut k_scalar: Scalar<Secret, NonZero> =
            Scalar::from_bytes(k_bytes).context("Nonce out of range")?;

        let mut r_point = g!(k_scalar * G).normalize();
        if !r_point.is_y_even() {
            k_scalar = -k_scalar;
            r_point = -r_point;
        }
        let r_bytes: [u8; 32] = r_point.to_xonly_bytes();

        let e_bytes = challenge_hash(&r_bytes, &self.public, message);
        let e_scalar: Scalar<Public, Zero> =
            Scalar::from_bytes(e_bytes).context("Invalid challenge bytes")?;

        let s_scalar = s!(k_scalar + e_scalar * secret_scalar);

        let mut signature = [0u8; 64];
        signature[..32].copy_from_slice(&r_bytes);
        signature[32..].copy_from_slice(&s_scalar.to_bytes());
        Ok(signature)
    }
}

impl Drop for Keys {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex x-only public key.
pub fn parse_public_key(public_key_hex: &str) -> Result<[u8; 32]> {
    let bytes: [u8; 32] = hex::decode(public_key_hex)
        .context("Invalid hex string for public key")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("Public key must be exactly 32 bytes"))?;
    Point::<EvenY, Public>::from_xonly_bytes(bytes).context("Public key is not on the curve")?;
    Ok(bytes)
}
