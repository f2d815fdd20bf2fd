//! Bearer token material.
//!
//! A token secret is 64 bytes of cryptographic randomness, base64-encoded and
//! shown exactly once. Only a SHA-256 hash is stored; authenticating a secret
//! is hash-then-lookup so the store never holds plaintext.

use base64::Engine;
use base64::prelude::{BASE64_STANDARD_NO_PAD, BASE64_URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

const SECRET_LEN: usize = 64;

/// Generates a fresh token secret.
pub fn generate_secret() -> SecretString {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);

    SecretString::from(BASE64_URL_SAFE_NO_PAD.encode(bytes))
}

pub fn hash_secret(secret: &SecretString) -> String {
    let mut hasher = Sha256::default();
    hasher.update(secret.expose_secret().as_bytes());

    BASE64_STANDARD_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_unique() {
        let a = generate_secret();
        let b = generate_secret();

        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn hashing_is_deterministic() {
        let secret = generate_secret();

        assert_eq!(hash_secret(&secret), hash_secret(&secret));
    }

    #[test]
    fn secret_is_64_bytes_of_randomness() {
        let secret = generate_secret();
        let decoded = BASE64_URL_SAFE_NO_PAD
            .decode(secret.expose_secret())
            .unwrap();

        assert_eq!(decoded.len(), SECRET_LEN);
    }
}
