//! Connection-scoped secret storage.
//!
//! Detected credentials are swapped for opaque placeholders on the way in
//! and stored under authenticated encryption. Each record belongs to exactly
//! one connection: a placeholder minted for connection A never decrypts for
//! connection B. Records expire after a TTL (checked lazily on access and by
//! a periodic sweep) and are removed wholesale on connection teardown.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use event_log::{EventSink, SecurityEvent, SecurityEventKind};

use crate::crypto::{CryptoError, VaultCipher, NONCE_LEN};

/// Wire-format prefix for placeholders. Part of the proxy's external
/// contract; anything observing proxy output may see these.
pub const PLACEHOLDER_PREFIX: &str = "MCPROXY_KEY_";

/// Interval of the background expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The regex used to find placeholders embedded inside larger strings.
pub fn placeholder_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"MCPROXY_KEY_[A-F0-9]{32}").expect("placeholder regex"))
}

/// Structural test: is `s` exactly one placeholder?
pub fn is_placeholder(s: &str) -> bool {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re =
        RE.get_or_init(|| Regex::new(r"^MCPROXY_KEY_[A-F0-9]{32}$").expect("placeholder regex"));
    re.is_match(s)
}

/// Configuration for the [`SecretVault`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// AEAD-encrypt stored secrets. Disabling keeps plaintext in memory and
    /// is only meant for debugging.
    #[serde(default = "default_true")]
    pub encryption: bool,
    /// Record time-to-live in seconds.
    #[serde(default = "default_ttl_secs", alias = "ttl")]
    pub ttl_secs: u64,
    /// Maximum distinct placeholders per connection.
    #[serde(default = "default_max_keys")]
    pub max_keys_per_connection: usize,
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_keys() -> usize {
    100
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            encryption: default_true(),
            ttl_secs: default_ttl_secs(),
            max_keys_per_connection: default_max_keys(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("connection '{connection_id}' exceeded its vault capacity ({limit})")]
    CapacityExceeded {
        connection_id: String,
        limit: usize,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One encrypted record.
struct StoredSecret {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
    connection_id: String,
    secret_type: Option<String>,
    created_at: Instant,
    last_accessed: Instant,
}

impl Drop for StoredSecret {
    fn drop(&mut self) {
        self.ciphertext.zeroize();
        self.nonce.zeroize();
    }
}

struct VaultInner {
    config: VaultConfig,
    cipher: Option<VaultCipher>,
    /// placeholder -> record
    records: HashMap<String, StoredSecret>,
    /// (connection, plaintext fingerprint) -> placeholder
    fingerprints: HashMap<(String, String), String>,
    /// connection -> its placeholders
    by_connection: HashMap<String, HashSet<String>>,
}

/// Connection-scoped secret store. Cloneable handle; all clones share state.
#[derive(Clone)]
pub struct SecretVault {
    inner: Arc<Mutex<VaultInner>>,
    events: EventSink,
}

impl SecretVault {
    /// Build a vault around the process-wide cipher. Pass `None` as the
    /// cipher only when `config.encryption` is false.
    pub fn new(config: VaultConfig, cipher: Option<VaultCipher>, events: EventSink) -> Self {
        let cipher = if config.encryption { cipher } else { None };
        Self {
            inner: Arc::new(Mutex::new(VaultInner {
                config,
                cipher,
                records: HashMap::new(),
                fingerprints: HashMap::new(),
                by_connection: HashMap::new(),
            })),
            events,
        }
    }

    /// Store `secret` for `connection_id`, returning its placeholder.
    ///
    /// Storing the same secret twice under one connection returns the
    /// existing placeholder, so a client observing its own traffic sees a
    /// stable substitution.
    pub fn store(
        &self,
        secret: &str,
        connection_id: &str,
        secret_type: Option<&str>,
    ) -> Result<String, VaultError> {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        let ttl = Duration::from_secs(inner.config.ttl_secs);

        let fingerprint_key = (connection_id.to_string(), fingerprint(secret));
        if let Some(placeholder) = inner.fingerprints.get(&fingerprint_key).cloned() {
            // Reuse only if the record is still live.
            let live = match inner.records.get_mut(&placeholder) {
                Some(record) if record.created_at.elapsed() <= ttl => {
                    record.last_accessed = Instant::now();
                    true
                }
                _ => false,
            };
            if live {
                return Ok(placeholder);
            }
            remove_record(&mut inner, &placeholder);
        }

        let owned = inner
            .by_connection
            .get(connection_id)
            .map_or(0, HashSet::len);
        if owned >= inner.config.max_keys_per_connection {
            return Err(VaultError::CapacityExceeded {
                connection_id: connection_id.to_string(),
                limit: inner.config.max_keys_per_connection,
            });
        }

        let (nonce, ciphertext) = match &inner.cipher {
            Some(cipher) => cipher.seal(secret.as_bytes())?,
            None => ([0u8; NONCE_LEN], secret.as_bytes().to_vec()),
        };

        let placeholder = loop {
            let candidate = mint_placeholder();
            if !inner.records.contains_key(&candidate) {
                break candidate;
            }
        };

        let now = Instant::now();
        inner.records.insert(
            placeholder.clone(),
            StoredSecret {
                nonce,
                ciphertext,
                connection_id: connection_id.to_string(),
                secret_type: secret_type.map(str::to_string),
                created_at: now,
                last_accessed: now,
            },
        );
        inner.fingerprints.insert(fingerprint_key, placeholder.clone());
        inner
            .by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(placeholder.clone());

        tracing::debug!(
            connection = connection_id,
            secret_type = secret_type.unwrap_or("unknown"),
            "secret stored in vault"
        );

        Ok(placeholder)
    }

    /// Look up `placeholder` on behalf of `connection_id`.
    ///
    /// Returns `None` for unknown placeholders, expired records, records
    /// owned by a different connection (reported as a security event), and
    /// decryption failures. Callers must treat `None` as "leave the
    /// placeholder as literal text", never as a secret.
    pub fn retrieve(&self, placeholder: &str, connection_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        let ttl = Duration::from_secs(inner.config.ttl_secs);

        let owner = inner.records.get(placeholder)?.connection_id.clone();
        if owner != connection_id {
            tracing::warn!(
                requester = connection_id,
                owner = %owner,
                "cross-connection vault access denied"
            );
            self.events.try_log(
                SecurityEvent::new(
                    SecurityEventKind::UnauthorizedVaultAccess,
                    serde_json::json!({
                        "placeholder": placeholder,
                        "owner": owner,
                    }),
                )
                .with_connection(connection_id),
            );
            return None;
        }

        let expired = inner
            .records
            .get(placeholder)
            .is_some_and(|record| record.created_at.elapsed() > ttl);
        if expired {
            remove_record(&mut inner, placeholder);
            return None;
        }

        let record = inner.records.get_mut(placeholder)?;
        record.last_accessed = Instant::now();
        let nonce = record.nonce;
        let ciphertext = record.ciphertext.clone();
        let plaintext = match &inner.cipher {
            Some(cipher) => match cipher.open(&nonce, &ciphertext) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(%err, "vault record failed authentication");
                    return None;
                }
            },
            None => ciphertext,
        };

        String::from_utf8(plaintext).ok()
    }

    /// Remove one record.
    pub fn remove(&self, placeholder: &str) {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        remove_record(&mut inner, placeholder);
    }

    /// Remove every record owned by `connection_id`. Called on teardown.
    pub fn remove_all(&self, connection_id: &str) {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        let placeholders: Vec<String> = inner
            .by_connection
            .get(connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for placeholder in &placeholders {
            remove_record(&mut inner, placeholder);
        }
        inner.by_connection.remove(connection_id);

        if !placeholders.is_empty() {
            tracing::debug!(
                connection = connection_id,
                removed = placeholders.len(),
                "vault records cleared for connection"
            );
        }
    }

    /// Remove every expired record. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("vault lock poisoned");
        let ttl = Duration::from_secs(inner.config.ttl_secs);

        let expired: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, record)| record.created_at.elapsed() > ttl)
            .map(|(placeholder, _)| placeholder.clone())
            .collect();

        for placeholder in &expired {
            remove_record(&mut inner, placeholder);
        }

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "expired vault records swept");
        }
        expired.len()
    }

    /// Spawn the periodic expiry sweep. The task holds only a weak handle
    /// and exits when the vault is dropped.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Mutex<VaultInner>> = Arc::downgrade(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let vault = SecretVault {
                    inner,
                    events: events.clone(),
                };
                vault.sweep_expired();
            }
        })
    }

    /// Number of live placeholders owned by `connection_id`.
    pub fn count_for(&self, connection_id: &str) -> usize {
        let inner = self.inner.lock().expect("vault lock poisoned");
        inner
            .by_connection
            .get(connection_id)
            .map_or(0, HashSet::len)
    }

    /// The classifier tag a placeholder was stored with, if any.
    pub fn secret_type_of(&self, placeholder: &str) -> Option<String> {
        let inner = self.inner.lock().expect("vault lock poisoned");
        inner.records.get(placeholder)?.secret_type.clone()
    }
}

fn remove_record(inner: &mut VaultInner, placeholder: &str) {
    if let Some(record) = inner.records.remove(placeholder) {
        if let Some(set) = inner.by_connection.get_mut(&record.connection_id) {
            set.remove(placeholder);
        }
        inner
            .fingerprints
            .retain(|_, stored| stored.as_str() != placeholder);
    }
}

/// Sixteen random bytes rendered as 32 uppercase hex characters behind the
/// fixed prefix.
fn mint_placeholder() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    let mut out = String::with_capacity(PLACEHOLDER_PREFIX.len() + 32);
    out.push_str(PLACEHOLDER_PREFIX);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

/// SHA-256 fingerprint used only for the dedup index; the plaintext itself
/// is never kept outside the AEAD envelope.
fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> SecretVault {
        let cipher = VaultCipher::derive(b"vault-test-secret").unwrap();
        SecretVault::new(VaultConfig::default(), Some(cipher), EventSink::disabled())
    }

    fn vault_with(config: VaultConfig) -> SecretVault {
        let cipher = VaultCipher::derive(b"vault-test-secret").unwrap();
        SecretVault::new(config, Some(cipher), EventSink::disabled())
    }

    #[test]
    fn placeholder_has_wire_format() {
        let vault = test_vault();
        let placeholder = vault.store("sk-secret-value-abc", "conn-1", None).unwrap();
        assert!(is_placeholder(&placeholder));
        assert!(placeholder_regex().is_match(&placeholder));
    }

    #[test]
    fn store_then_retrieve_round_trips() {
        let vault = test_vault();
        let placeholder = vault
            .store("sk-secret-value-abc", "conn-1", Some("openai_api_key"))
            .unwrap();
        let secret = vault.retrieve(&placeholder, "conn-1").unwrap();
        assert_eq!(secret, "sk-secret-value-abc");
        assert_eq!(
            vault.secret_type_of(&placeholder).as_deref(),
            Some("openai_api_key")
        );
    }

    #[test]
    fn same_secret_same_connection_reuses_placeholder() {
        let vault = test_vault();
        let first = vault.store("sk-stable", "conn-1", None).unwrap();
        let second = vault.store("sk-stable", "conn-1", None).unwrap();
        assert_eq!(first, second);
        assert_eq!(vault.count_for("conn-1"), 1);
    }

    #[test]
    fn distinct_secrets_get_distinct_placeholders() {
        let vault = test_vault();
        let a = vault.store("sk-first", "conn-1", None).unwrap();
        let b = vault.store("sk-second", "conn-1", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn same_secret_different_connections_are_isolated() {
        let vault = test_vault();
        let a = vault.store("sk-shared", "conn-1", None).unwrap();
        let b = vault.store("sk-shared", "conn-2", None).unwrap();
        assert_ne!(a, b, "connections must not share placeholders");
    }

    #[test]
    fn cross_connection_retrieval_is_denied() {
        let vault = test_vault();
        let placeholder = vault.store("sk-private", "conn-1", None).unwrap();
        assert!(vault.retrieve(&placeholder, "conn-2").is_none());
        // The rightful owner still gets it.
        assert_eq!(
            vault.retrieve(&placeholder, "conn-1").as_deref(),
            Some("sk-private")
        );
    }

    #[test]
    fn unknown_placeholder_returns_none() {
        let vault = test_vault();
        assert!(vault
            .retrieve("MCPROXY_KEY_0123456789ABCDEF0123456789ABCDEF", "conn-1")
            .is_none());
    }

    #[test]
    fn capacity_is_enforced_per_connection() {
        let vault = vault_with(VaultConfig {
            max_keys_per_connection: 2,
            ..VaultConfig::default()
        });
        vault.store("sk-one", "conn-1", None).unwrap();
        vault.store("sk-two", "conn-1", None).unwrap();

        let err = vault.store("sk-three", "conn-1", None).unwrap_err();
        assert!(matches!(err, VaultError::CapacityExceeded { limit: 2, .. }));

        // A different connection is unaffected.
        assert!(vault.store("sk-three", "conn-2", None).is_ok());
    }

    #[test]
    fn storing_known_secret_at_capacity_still_succeeds() {
        let vault = vault_with(VaultConfig {
            max_keys_per_connection: 1,
            ..VaultConfig::default()
        });
        let first = vault.store("sk-only", "conn-1", None).unwrap();
        let again = vault.store("sk-only", "conn-1", None).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn remove_all_clears_a_connection() {
        let vault = test_vault();
        let a = vault.store("sk-a", "conn-1", None).unwrap();
        let b = vault.store("sk-b", "conn-1", None).unwrap();
        let other = vault.store("sk-c", "conn-2", None).unwrap();

        vault.remove_all("conn-1");

        assert!(vault.retrieve(&a, "conn-1").is_none());
        assert!(vault.retrieve(&b, "conn-1").is_none());
        assert_eq!(vault.count_for("conn-1"), 0);
        // conn-2 untouched.
        assert_eq!(vault.retrieve(&other, "conn-2").as_deref(), Some("sk-c"));
    }

    #[test]
    fn removed_secret_can_be_stored_again() {
        let vault = test_vault();
        let first = vault.store("sk-re", "conn-1", None).unwrap();
        vault.remove(&first);
        let second = vault.store("sk-re", "conn-1", None).unwrap();
        assert_ne!(first, second);
        assert_eq!(vault.retrieve(&second, "conn-1").as_deref(), Some("sk-re"));
    }

    #[test]
    fn expired_records_are_lazily_removed() {
        let vault = vault_with(VaultConfig {
            ttl_secs: 0,
            ..VaultConfig::default()
        });
        let placeholder = vault.store("sk-gone", "conn-1", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(vault.retrieve(&placeholder, "conn-1").is_none());
        assert_eq!(vault.count_for("conn-1"), 0);
    }

    #[test]
    fn sweep_removes_expired_records() {
        let vault = vault_with(VaultConfig {
            ttl_secs: 0,
            ..VaultConfig::default()
        });
        vault.store("sk-x", "conn-1", None).unwrap();
        vault.store("sk-y", "conn-2", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(vault.sweep_expired(), 2);
        assert_eq!(vault.count_for("conn-1"), 0);
        assert_eq!(vault.count_for("conn-2"), 0);
    }

    #[test]
    fn plaintext_mode_round_trips() {
        let vault = SecretVault::new(
            VaultConfig {
                encryption: false,
                ..VaultConfig::default()
            },
            None,
            EventSink::disabled(),
        );
        let placeholder = vault.store("sk-plain", "conn-1", None).unwrap();
        assert_eq!(vault.retrieve(&placeholder, "conn-1").as_deref(), Some("sk-plain"));
    }

    #[test]
    fn is_placeholder_rejects_near_misses() {
        assert!(is_placeholder(
            "MCPROXY_KEY_0123456789ABCDEF0123456789ABCDEF"
        ));
        assert!(!is_placeholder(
            "MCPROXY_KEY_0123456789abcdef0123456789abcdef"
        ));
        assert!(!is_placeholder("MCPROXY_KEY_SHORT"));
        assert!(!is_placeholder(
            "xMCPROXY_KEY_0123456789ABCDEF0123456789ABCDEF"
        ));
        assert!(!is_placeholder(""));
    }
}
