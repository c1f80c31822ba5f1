//! Hash helpers shared by the signature and event code.

use sha2::{Digest, Sha256};

/// Compute BIP340 tagged hash: SHA256(SHA256(tag) || SHA256(tag) || data)
///
/// Used for domain separation of the BIP340 aux, nonce and challenge hashes.
pub fn tagged_hash(tag: &str, data: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_hash_differs_by_tag() {
        assert_ne!(tagged_hash("a", b"data"), tagged_hash("b", b"data"));
        assert_eq!(tagged_hash("a", b"data"), tagged_hash("a", b"data"));
    }
}
