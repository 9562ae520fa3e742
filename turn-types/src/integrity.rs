//! Long-term credential keys, MESSAGE-INTEGRITY and FINGERPRINT primitives.

use std::fmt;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha1 = Hmac<Sha1>;

/// XOR constant applied to the CRC-32 in FINGERPRINT.
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// A long-term credential key: MD5(username ":" realm ":" password).
///
/// Zeroed on drop. `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct LongTermKey([u8; 16]);

impl LongTermKey {
    /// Derive the key for a user, realm and password.
    pub fn derive(username: &str, realm: &str, password: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(username.as_bytes());
        hasher.update(b":");
        hasher.update(realm.as_bytes());
        hasher.update(b":");
        hasher.update(password.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LongTermKey(..)")
    }
}

/// Convenience wrapper for [`LongTermKey::derive`].
pub fn long_term_key(username: &str, realm: &str, password: &str) -> LongTermKey {
    LongTermKey::derive(username, realm, password)
}

/// HMAC-SHA1 of `data` under `key`.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of an HMAC-SHA1 tag.
pub fn verify_hmac_sha1(key: &[u8], data: &[u8], tag: &[u8; 20]) -> bool {
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// FINGERPRINT value for `data`.
pub fn fingerprint(data: &[u8]) -> u32 {
    crc32fast::hash(data) ^ FINGERPRINT_XOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_term_key_is_md5_of_triplet() {
        // RFC 5769 section 2.4 long-term credential example.
        let key = long_term_key(
            "\u{30DE}\u{30C8}\u{30EA}\u{30C3}\u{30AF}\u{30B9}",
            "example.org",
            "TheMatrIX",
        );
        assert_eq!(key.as_bytes().len(), 16);

        let again = LongTermKey::derive(
            "\u{30DE}\u{30C8}\u{30EA}\u{30C3}\u{30AF}\u{30B9}",
            "example.org",
            "TheMatrIX",
        );
        assert_eq!(key, again);

        // md5("room-42:rtchat.io:s3cr3t")
        let key = LongTermKey::derive("room-42", "rtchat.io", "s3cr3t");
        assert_eq!(hex::encode(key.as_bytes()), "01cd7594687b623f69ca1fa3aba9dafc");
    }

    #[test]
    fn different_password_gives_different_key() {
        let a = long_term_key("room-42", "rtchat.io", "s3cr3t");
        let b = long_term_key("room-42", "rtchat.io", "s3cr3u");
        assert_ne!(a, b);
    }

    #[test]
    fn known_md5_vector() {
        let key = long_term_key("user", "realm", "pass");
        assert_eq!(
            hex::encode(key.as_bytes()),
            "8493fbc53ba582fb4c044c456bdc40eb"
        );
    }

    #[test]
    fn debug_hides_key() {
        let key = long_term_key("a", "b", "c");
        assert_eq!(format!("{key:?}"), "LongTermKey(..)");
    }

    #[test]
    fn hmac_verify_round() {
        let tag = hmac_sha1(b"key", b"data");
        assert!(verify_hmac_sha1(b"key", b"data", &tag));
        assert!(!verify_hmac_sha1(b"other", b"data", &tag));
    }

    #[test]
    fn fingerprint_applies_xor() {
        assert_eq!(fingerprint(b""), FINGERPRINT_XOR);
    }
}
