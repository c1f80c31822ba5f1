//! Cryptographic Primitives
//!
//! - **schnorr**: BIP340 keys, signing and verification for nostr identities
//! - **nip44**: NIP-44 v2 payload encryption
//! - **helpers**: tagged hash and sha256

pub mod helpers;
pub mod nip44;
pub mod schnorr;

pub use schnorr::Keys;
