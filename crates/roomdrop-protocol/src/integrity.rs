//! Content checks for fetched payloads.
//!
//! Identifiers of the form `sha256-<hex>` certify their own bytes, so a
//! download can be checked against the identifier it was fetched by.
//! Other identifier schemes are opaque here and pass unchecked.

use sha2::{Digest, Sha256};

/// Prefix of self-certifying content identifiers.
pub const SHA256_ID_PREFIX: &str = "sha256-";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `sha256-<hex>` identifier of `data`.
pub fn sha256_content_id(data: &[u8]) -> String {
    format!("{SHA256_ID_PREFIX}{}", sha256_hex(data))
}

/// Whether `data` is what `content_id` names.
///
/// `None` when the identifier is not self-certifying.
pub fn matches_content_id(content_id: &str, data: &[u8]) -> Option<bool> {
    let expected = content_id.strip_prefix(SHA256_ID_PREFIX)?;
    Some(expected.eq_ignore_ascii_case(&sha256_hex(data)))
}

/// Byte-for-byte identity: sizes first, then SHA-256 digests.
pub fn same_content(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && Sha256::digest(a) == Sha256::digest(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_ids_certify_their_bytes() {
        let id = sha256_content_id(b"hello");
        assert_eq!(matches_content_id(&id, b"hello"), Some(true));
        assert_eq!(matches_content_id(&id, b"hellO"), Some(false));
        let upper = format!("{SHA256_ID_PREFIX}{}", sha256_hex(b"hello").to_uppercase());
        assert_eq!(matches_content_id(&upper, b"hello"), Some(true));
    }

    #[test]
    fn opaque_ids_are_unchecked() {
        assert_eq!(matches_content_id("bafybeigdyrzt", b"anything"), None);
    }

    #[test]
    fn same_content_checks_size_and_digest() {
        assert!(same_content(b"abc", b"abc"));
        assert!(!same_content(b"abc", b"abcd"));
        assert!(!same_content(b"abc", b"abd"));
    }
}
