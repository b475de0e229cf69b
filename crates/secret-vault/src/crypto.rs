//! Vault cryptography: master-key derivation and authenticated encryption.
//!
//! The master key is derived once at process startup with scrypt from the
//! `MCPROXY_MASTER_SECRET` environment variable, or from fresh random bytes
//! when the variable is unset (vault contents then do not survive the
//! process, which is the intended lifetime anyway). Records are sealed with
//! AES-256-GCM using a fresh 128-bit nonce each; decryption verifies the
//! authentication tag and fails closed.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::RngCore;
use zeroize::Zeroizing;

/// Environment variable holding the process secret for key derivation.
pub const MASTER_SECRET_ENV: &str = "MCPROXY_MASTER_SECRET";

/// Fixed scrypt salt. The key only ever protects in-memory, per-process
/// state, so domain separation is all the salt needs to provide.
const KDF_SALT: &[u8] = b"mcproxy/vault/v1";

/// AES-256-GCM parameterized with a 16-byte nonce.
type VaultAead = AesGcm<Aes256, U16>;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed or ciphertext was tampered with")]
    Decrypt,
}

/// The process-wide vault cipher. Cheap to clone; every connection vault
/// shares the same underlying key. The raw derived bytes are wiped at the
/// end of key setup, and each clone's expanded key schedule is zeroized
/// when it drops (`aes-gcm` is built with its `zeroize` feature).
#[derive(Clone)]
pub struct VaultCipher {
    cipher: VaultAead,
}

impl VaultCipher {
    /// Derive the master key from `MCPROXY_MASTER_SECRET`, or from random
    /// bytes when the variable is unset, and build the cipher.
    ///
    /// A derivation failure is fatal: the proxy refuses to start.
    pub fn from_env() -> Result<Self, CryptoError> {
        match std::env::var(MASTER_SECRET_ENV) {
            Ok(secret) => Self::derive(secret.as_bytes()),
            Err(_) => {
                tracing::info!(
                    env = MASTER_SECRET_ENV,
                    "no master secret configured, generating ephemeral key"
                );
                let mut secret = Zeroizing::new([0u8; 32]);
                rand::rngs::OsRng.fill_bytes(secret.as_mut());
                Self::derive(secret.as_ref())
            }
        }
    }

    /// Derive a 256-bit key from `secret` with scrypt and the fixed salt.
    pub fn derive(secret: &[u8]) -> Result<Self, CryptoError> {
        let params = scrypt::Params::new(15, 8, 1, 32)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut key = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(secret, KDF_SALT, &params, key.as_mut())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let cipher = VaultAead::new(GenericArray::from_slice(key.as_ref()));
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` under a fresh random nonce. The returned
    /// ciphertext includes the authentication tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        Ok((nonce, ciphertext))
    }

    /// Decrypt and verify. Fails closed: any tag mismatch or truncation
    /// yields an error, never partial plaintext.
    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let cipher = VaultCipher::derive(b"test-secret").unwrap();
        let (nonce, ct) = cipher.seal(b"sk-super-secret-value").unwrap();
        let pt = cipher.open(&nonce, &ct).unwrap();
        assert_eq!(pt, b"sk-super-secret-value");
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let cipher = VaultCipher::derive(b"test-secret").unwrap();
        let (n1, c1) = cipher.seal(b"same plaintext").unwrap();
        let (n2, c2) = cipher.seal(b"same plaintext").unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let cipher = VaultCipher::derive(b"test-secret").unwrap();
        let (nonce, mut ct) = cipher.seal(b"payload").unwrap();
        ct[0] ^= 0x01;
        assert!(cipher.open(&nonce, &ct).is_err());
    }

    #[test]
    fn wrong_nonce_fails_closed() {
        let cipher = VaultCipher::derive(b"test-secret").unwrap();
        let (_, ct) = cipher.seal(b"payload").unwrap();
        let wrong = [0u8; NONCE_LEN];
        assert!(cipher.open(&wrong, &ct).is_err());
    }

    #[test]
    fn different_secrets_produce_incompatible_keys() {
        let a = VaultCipher::derive(b"secret-a").unwrap();
        let b = VaultCipher::derive(b"secret-b").unwrap();
        let (nonce, ct) = a.seal(b"payload").unwrap();
        assert!(b.open(&nonce, &ct).is_err());
    }
}
