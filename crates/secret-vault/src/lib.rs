//! # secret-vault
//!
//! Credential detection and connection-scoped secret storage for the mcproxy
//! project.
//!
//! The crate is organised around three layers:
//!
//! 1. **[`detector`]** -- a fixed catalogue of credential-shaped patterns
//!    with entropy-based false-positive suppression.
//! 2. **[`crypto`]** -- the process-wide AEAD cipher (AES-256-GCM, 128-bit
//!    nonces) keyed via scrypt from a process secret.
//! 3. **[`vault`]** -- placeholder minting, per-connection scoping, TTL
//!    expiry, and teardown cleanup.
//!
//! ## Quick start
//!
//! ```rust
//! use secret_vault::{DetectorConfig, SecretDetector, SecretVault, VaultCipher, VaultConfig};
//! use event_log::EventSink;
//!
//! let detector = SecretDetector::new(DetectorConfig::default()).unwrap();
//! let cipher = VaultCipher::derive(b"example-secret").unwrap();
//! let vault = SecretVault::new(VaultConfig::default(), Some(cipher), EventSink::disabled());
//!
//! let text = "key: sk-aBc123XyZ456DefGhi789JklMno012PqrStu345VwxYz678";
//! let replaced = detector.replace(text, |value, kind| {
//!     vault.store(value, "conn-1", Some(kind)).ok()
//! });
//! assert!(replaced.contains("MCPROXY_KEY_"));
//! ```

pub mod crypto;
pub mod detector;
pub mod vault;

// Re-export the primary public types at the crate root.
pub use crypto::{CryptoError, VaultCipher, MASTER_SECRET_ENV, NONCE_LEN};
pub use detector::{
    shannon_entropy, CustomSecretPattern, Detection, DetectorConfig, DetectorError, SecretDetector,
};
pub use vault::{
    is_placeholder, placeholder_regex, SecretVault, VaultConfig, VaultError, PLACEHOLDER_PREFIX,
};
