//! Purpose: Derive deterministic cache keys from a namespace prefix and raw query text.
//! Exports: `Fingerprint`, `fingerprint`.
//! Role: Single source of cache-key derivation for every backend.
//! Invariants: Key is the lowercase hex SHA-256 of `prefix ++ query`, always 64 chars.
//! Invariants: No whitespace or case normalization; textually distinct queries get distinct keys.

use sha2::{Digest, Sha256};
use std::fmt;

pub const FINGERPRINT_LEN: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn fingerprint(prefix: &str, query: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(query.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter() {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    Fingerprint(out)
}

fn hex_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        _ => (b'a' + nibble - 10) as char,
    }
}

#[cfg(test)]
mod tests {
    use super::{FINGERPRINT_LEN, fingerprint};

    #[test]
    fn known_digest_for_empty_input() {
        assert_eq!(
            fingerprint("", "").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn prefix_is_concatenated_before_hashing() {
        assert_eq!(fingerprint("t_", "SELECT 1"), fingerprint("", "t_SELECT 1"));
        assert_eq!(fingerprint("t_", "SELECT 1"), fingerprint("t_SELECT", " 1"));
    }

    #[test]
    fn whitespace_and_case_are_not_normalized() {
        let base = fingerprint("", "SELECT 1");
        assert_ne!(base, fingerprint("", "select 1"));
        assert_ne!(base, fingerprint("", "SELECT  1"));
    }

    #[test]
    fn digest_is_fixed_length_lowercase_hex() {
        let key = fingerprint("app:", "SELECT * FROM users WHERE id = 7");
        assert_eq!(key.as_str().len(), FINGERPRINT_LEN);
        assert!(
            key.as_str()
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        );
    }
}
