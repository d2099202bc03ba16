use rand::{rngs::OsRng, RngCore};
use ring::hmac::{self, Key, Tag, HMAC_SHA256};

/// HMAC-SHA256 key used for signing tunnel state snapshots
/// and resume tokens
pub struct SigningKey(Key);

impl AsRef<Key> for SigningKey {
    fn as_ref(&self) -> &Key {
        &self.0
    }
}

impl SigningKey {
    const KEY_LENGTH: usize = 64;

    /// Creates a signing key from a configured secret string
    ///
    /// Should only be used by the actual app, tests should
    /// generate a new signing key
    pub fn from_secret(secret: &str) -> Self {
        Self(Key::new(HMAC_SHA256, secret.as_bytes()))
    }

    #[inline]
    pub fn sign(&self, data: &[u8]) -> Tag {
        hmac::sign(&self.0, data)
    }

    #[inline]
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        hmac::verify(&self.0, data, tag).is_ok()
    }

    /// Generates a new signing key from random bytes
    pub fn generate() -> (Self, [u8; Self::KEY_LENGTH]) {
        let mut secret = [0; Self::KEY_LENGTH];
        OsRng.fill_bytes(&mut secret);
        (Self(Key::new(HMAC_SHA256, &secret)), secret)
    }
}
