//! # message-sanitizer
//!
//! The per-connection sanitization pipeline of the mcproxy project: walks
//! arbitrary JSON-RPC message trees and neutralises hostile content before
//! it crosses the trust boundary in either direction.
//!
//! The crate is organised around the filter chain applied to every string
//! leaf (and object key) of a message:
//!
//! 1. **[`ansi`]** -- terminal escape-sequence detection and removal.
//! 2. **[`whitelist`]** -- Unicode code-point whitelist enforcement.
//! 3. **[`patterns`]** -- configurable regex rules with reject/strip/log
//!    actions.
//! 4. **[`validation`]** -- structural field limits (tool names, parameter
//!    sizes, script/HTML stripping).
//! 5. **[`pipeline`]** -- the [`Sanitizer`](pipeline::Sanitizer)
//!    orchestrator that runs the chain, drives secret substitution through
//!    the vault, and re-substitutes placeholders on egress.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use message_sanitizer::{Direction, FilterSet, SanitizationConfig, Sanitizer};
//! use secret_vault::{DetectorConfig, SecretVault, VaultCipher, VaultConfig};
//! use event_log::EventSink;
//!
//! let filters = Arc::new(
//!     FilterSet::build(&SanitizationConfig::default(), DetectorConfig::default()).unwrap(),
//! );
//! let cipher = VaultCipher::derive(b"example").unwrap();
//! let vault = SecretVault::new(VaultConfig::default(), Some(cipher), EventSink::disabled());
//! let sanitizer = Sanitizer::new(filters, vault, EventSink::disabled(), "conn-1", false, true);
//!
//! let msg = serde_json::json!({"params": {"t": "\u{1b}[31mRED\u{1b}[0m"}});
//! let outcome = sanitizer.sanitize_message(&msg, Direction::ClientToServer).unwrap();
//! assert_eq!(outcome.message["params"]["t"], "RED");
//! ```

pub mod ansi;
pub mod patterns;
pub mod pipeline;
pub mod validation;
pub mod whitelist;

// Re-export the most commonly used types at the crate root.
pub use ansi::{AnsiAction, AnsiConfig, AnsiFilter, AnsiOutcome};
pub use patterns::{
    default_rules, PatternConfig, PatternError, PatternMatcher, PatternRule, RuleAction, RuleMatch,
    Severity,
};
pub use pipeline::{
    Direction, FilterSet, FilterSetError, ResubstituteOutcome, SanitizationConfig, SanitizeError,
    SanitizeOutcome, Sanitizer, MAX_DEPTH,
};
pub use validation::{FieldValidator, ValidationConfig, ValidationError};
pub use whitelist::{CharacterWhitelist, ViolationTag, WhitelistConfig, WhitelistOutcome};
