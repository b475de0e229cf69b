//! The per-connection sanitization pipeline.
//!
//! A [`Sanitizer`] walks arbitrary JSON-RPC message trees and applies, in
//! order: secret substitution (client-to-server only), then the string
//! filter chain (ANSI -> whitelist -> pattern rules -> field validation) to
//! every string leaf and object key. The outbound leg calls
//! [`Sanitizer::resubstitute`] immediately before transmitting downstream,
//! restoring vault placeholders to their original values so that plaintext
//! secrets bypass the filters and never reach any log.

use std::sync::Arc;

use serde_json::Value;

use event_log::{EventSink, SecurityEvent, SecurityEventKind};
use secret_vault::{
    is_placeholder, placeholder_regex, DetectorConfig, DetectorError, SecretDetector, SecretVault,
};
use serde::{Deserialize, Serialize};

use crate::ansi::{AnsiConfig, AnsiFilter};
use crate::patterns::{PatternConfig, PatternError, PatternMatcher, RuleAction};
use crate::validation::{FieldValidator, ValidationConfig, ValidationError};
use crate::whitelist::{CharacterWhitelist, WhitelistConfig};

/// Maximum nesting depth accepted in a message tree. Deeper input is
/// treated as an invalid message rather than walked.
pub const MAX_DEPTH: usize = 128;

/// Which trust boundary a message is crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the untrusted client toward the downstream server.
    ClientToServer,
    /// From the trusted downstream server back to the client.
    ServerToClient,
}

/// The `sanitization` configuration subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SanitizationConfig {
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub ansi_escapes: AnsiConfig,
    #[serde(default)]
    pub character_whitelist: WhitelistConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Errors from building the shared filter set.
#[derive(Debug, thiserror::Error)]
pub enum FilterSetError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// Errors during sanitization.
#[derive(Debug, thiserror::Error)]
pub enum SanitizeError {
    #[error("message nesting exceeds the depth limit ({MAX_DEPTH})")]
    DepthExceeded,
}

/// The read-only filters, compiled once and shared across every connection.
pub struct FilterSet {
    pub ansi: AnsiFilter,
    pub whitelist: CharacterWhitelist,
    pub matcher: PatternMatcher,
    pub validator: FieldValidator,
    pub detector: SecretDetector,
}

impl FilterSet {
    pub fn build(
        sanitization: &SanitizationConfig,
        detector: DetectorConfig,
    ) -> Result<Self, FilterSetError> {
        Ok(Self {
            ansi: AnsiFilter::new(sanitization.ansi_escapes.clone()),
            whitelist: CharacterWhitelist::new(sanitization.character_whitelist.clone()),
            matcher: PatternMatcher::new(sanitization.patterns.clone())?,
            validator: FieldValidator::new(sanitization.validation.clone())?,
            detector: SecretDetector::new(detector)?,
        })
    }
}

/// The outcome of one [`Sanitizer::sanitize_message`] call.
#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    /// `false` only when violations were recorded and strict mode is on.
    pub safe: bool,
    pub modified: bool,
    pub message: Value,
    /// Violation tags: whitelist tags, `ansi_sequences_removed`, names of
    /// matched reject-rules, `invalid_tool_name`.
    pub violations: Vec<String>,
    /// What was changed: filter tags, stripped rule names, truncations.
    pub modifications: Vec<String>,
    pub had_secrets: bool,
}

/// The outcome of one [`Sanitizer::resubstitute`] call.
#[derive(Debug, Clone)]
pub struct ResubstituteOutcome {
    pub message: Value,
    pub modified: bool,
}

/// Per-connection sanitization orchestrator. Owns the connection's vault
/// handle; the filters themselves are shared and read-only.
pub struct Sanitizer {
    connection_id: String,
    strict_mode: bool,
    secret_protection: bool,
    filters: Arc<FilterSet>,
    vault: SecretVault,
    events: EventSink,
}

struct WalkState {
    violations: Vec<String>,
    modifications: Vec<String>,
    context: Option<String>,
}

impl WalkState {
    fn record_violation(&mut self, tag: &str) {
        if !self.violations.iter().any(|v| v == tag) {
            self.violations.push(tag.to_string());
        }
    }

    fn record_modification(&mut self, tag: &str) {
        if !self.modifications.iter().any(|m| m == tag) {
            self.modifications.push(tag.to_string());
        }
    }
}

impl Sanitizer {
    pub fn new(
        filters: Arc<FilterSet>,
        vault: SecretVault,
        events: EventSink,
        connection_id: impl Into<String>,
        strict_mode: bool,
        secret_protection: bool,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            strict_mode,
            secret_protection,
            filters,
            vault,
            events,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    /// Run the full pipeline over `msg` in the given direction.
    pub fn sanitize_message(
        &self,
        msg: &Value,
        direction: Direction,
    ) -> Result<SanitizeOutcome, SanitizeError> {
        check_depth(msg, 0)?;

        let mut message = msg.clone();
        let mut had_secrets = false;

        // Step 1: secret substitution, ingress only. Server output is never
        // mined for new secrets.
        if direction == Direction::ClientToServer && self.secret_protection {
            self.substitute_secrets(&mut message, &mut had_secrets);
        }

        let mut state = WalkState {
            violations: Vec::new(),
            modifications: Vec::new(),
            context: message
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        // Step 1.5: structural field checks on tool calls.
        self.validate_tool_name(&message, &mut state);

        // Step 2: deep sanitize every string leaf and object key.
        let message = self.sanitize_value(&message, false, None, &mut state);

        // Step 3: safety decision.
        let safe = state.violations.is_empty() || !self.strict_mode;
        let modified = had_secrets || !state.modifications.is_empty();

        Ok(SanitizeOutcome {
            safe,
            modified,
            message,
            violations: state.violations,
            modifications: state.modifications,
            had_secrets,
        })
    }

    /// Restore vault placeholders to their original secrets. Called by the
    /// outbound leg immediately before sending downstream. Unknown, expired,
    /// and foreign placeholders are left as literal text.
    pub fn resubstitute(&self, msg: &Value) -> ResubstituteOutcome {
        let mut message = msg.clone();
        let mut modified = false;
        self.resubstitute_value(&mut message, &mut modified);
        ResubstituteOutcome { message, modified }
    }

    /// Drop this connection's vault records. Called on teardown.
    pub fn cleanup(&self) {
        self.vault.remove_all(&self.connection_id);
    }

    fn substitute_secrets(&self, value: &mut Value, had_secrets: &mut bool) {
        match value {
            Value::String(s) => {
                let replaced = self.filters.detector.replace(s, |secret, kind| {
                    match self.vault.store(secret, &self.connection_id, Some(kind)) {
                        Ok(placeholder) => {
                            *had_secrets = true;
                            self.events.try_log(
                                SecurityEvent::new(
                                    SecurityEventKind::SecretSubstituted,
                                    serde_json::json!({
                                        "secret_type": kind,
                                        "placeholder": placeholder.clone(),
                                    }),
                                )
                                .with_connection(&self.connection_id),
                            );
                            Some(placeholder)
                        }
                        Err(err) => {
                            // Fail closed: refuse the substitution and keep
                            // the plaintext moving toward the filters only.
                            tracing::warn!(
                                connection = %self.connection_id,
                                %err,
                                "secret substitution refused"
                            );
                            None
                        }
                    }
                });
                if replaced != *s {
                    *s = replaced;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.substitute_secrets(item, had_secrets);
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.substitute_secrets(item, had_secrets);
                }
            }
            _ => {}
        }
    }

    fn validate_tool_name(&self, message: &Value, state: &mut WalkState) {
        let is_tool_call = message
            .get("method")
            .and_then(Value::as_str)
            .is_some_and(|m| m.starts_with("tools/"));
        if !is_tool_call {
            return;
        }
        if let Some(name) = message
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        {
            if !self.filters.validator.tool_name_ok(name) {
                state.record_violation("invalid_tool_name");
            }
        }
    }

    fn sanitize_value(
        &self,
        value: &Value,
        in_params: bool,
        key: Option<&str>,
        state: &mut WalkState,
    ) -> Value {
        match value {
            Value::String(s) => {
                Value::String(self.sanitize_string(s, in_params, key, state))
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_value(item, in_params, key, state))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    let clean_key = self.sanitize_string(k, false, None, state);
                    if clean_key.is_empty() && !k.is_empty() {
                        // A key reduced to nothing by filtering takes its
                        // entry with it.
                        state.record_modification("empty_key_dropped");
                        continue;
                    }
                    let child_in_params = in_params || k == "params";
                    out.insert(
                        clean_key,
                        self.sanitize_value(v, child_in_params, Some(k.as_str()), state),
                    );
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    fn sanitize_string(
        &self,
        s: &str,
        in_params: bool,
        key: Option<&str>,
        state: &mut WalkState,
    ) -> String {
        let ansi = self.filters.ansi.filter(s);
        if ansi.removed {
            state.record_violation("ansi_sequences_removed");
            state.record_modification("ansi_sequences_removed");
        }

        let whitelist = self.filters.whitelist.filter(&ansi.out);
        for tag in &whitelist.violations {
            state.record_violation(tag.as_str());
            state.record_modification(tag.as_str());
        }

        let check = self
            .filters
            .matcher
            .check(&whitelist.out, state.context.as_deref());
        let mut out = check.sanitized;

        for rule_match in &check.matches {
            self.events.try_log(
                SecurityEvent::new(
                    SecurityEventKind::PatternMatch,
                    serde_json::json!({
                        "rule": rule_match.name.clone(),
                        "severity": rule_match.severity,
                        "action": rule_match.action,
                        "method": state.context.clone(),
                    }),
                )
                .with_connection(&self.connection_id),
            );
            match rule_match.action {
                RuleAction::Reject => state.record_violation(&rule_match.name),
                RuleAction::Strip => state.record_modification(&rule_match.name),
                RuleAction::Log => {}
            }
        }

        if in_params {
            let prompt_like = matches!(key, Some("prompt") | Some("text") | Some("content"));
            let checked = self.filters.validator.check_param_value(&out, prompt_like);
            for tag in &checked.modifications {
                state.record_modification(tag);
            }
            out = checked.out;
        }

        out
    }

    fn resubstitute_value(&self, value: &mut Value, modified: &mut bool) {
        match value {
            Value::String(s) => {
                if is_placeholder(s) {
                    if let Some(secret) = self.vault.retrieve(s, &self.connection_id) {
                        *s = secret;
                        *modified = true;
                    }
                } else if placeholder_regex().is_match(s) {
                    let replaced = placeholder_regex().replace_all(s, |caps: &regex::Captures| {
                        let candidate = caps.get(0).map_or("", |m| m.as_str());
                        self.vault
                            .retrieve(candidate, &self.connection_id)
                            .unwrap_or_else(|| candidate.to_string())
                    });
                    if replaced != *s {
                        *s = replaced.into_owned();
                        *modified = true;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.resubstitute_value(item, modified);
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.resubstitute_value(item, modified);
                }
            }
            _ => {}
        }
    }
}

fn check_depth(value: &Value, depth: usize) -> Result<(), SanitizeError> {
    if depth > MAX_DEPTH {
        return Err(SanitizeError::DepthExceeded);
    }
    match value {
        Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, item) in map {
                check_depth(item, depth + 1)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secret_vault::{VaultCipher, VaultConfig};
    use serde_json::json;

    const OPENAI_KEY: &str = "sk-aBc123XyZ456DefGhi789JklMno012PqrStu345VwxYz678";

    fn filters() -> Arc<FilterSet> {
        Arc::new(
            FilterSet::build(&SanitizationConfig::default(), DetectorConfig::default()).unwrap(),
        )
    }

    fn sanitizer_on(connection_id: &str, strict: bool) -> Sanitizer {
        let cipher = VaultCipher::derive(b"pipeline-test-secret").unwrap();
        let vault = SecretVault::new(VaultConfig::default(), Some(cipher), EventSink::disabled());
        Sanitizer::new(
            filters(),
            vault,
            EventSink::disabled(),
            connection_id,
            strict,
            true,
        )
    }

    #[test]
    fn ansi_is_stripped_from_params() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "echo",
            "params": {"t": "\u{1b}[31mRED\u{1b}[0m"},
            "id": 1
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();

        assert_eq!(outcome.message["params"]["t"], json!("RED"));
        assert_eq!(outcome.message["method"], json!("echo"));
        assert_eq!(outcome.message["id"], json!(1));
        assert!(outcome.modified);
        assert!(outcome.safe, "strict mode off never blocks");
        assert_eq!(outcome.violations, vec!["ansi_sequences_removed"]);
    }

    #[test]
    fn command_injection_blocks_under_strict_mode() {
        let s = sanitizer_on("conn-1", true);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "tools/execute",
            "params": {"input": "ls; cat /etc/passwd"},
            "id": 7
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();

        assert!(!outcome.safe);
        assert!(outcome
            .violations
            .iter()
            .any(|v| v == "command_injection"));
    }

    #[test]
    fn command_injection_is_recorded_but_forwarded_without_strict_mode() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "tools/execute",
            "params": {"input": "ls; cat /etc/passwd"},
            "id": 7
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();

        assert!(outcome.safe);
        assert!(outcome
            .violations
            .iter()
            .any(|v| v == "command_injection"));
    }

    #[test]
    fn secrets_are_substituted_on_ingress() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {"k": OPENAI_KEY},
            "id": 2
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();

        assert!(outcome.had_secrets);
        assert!(outcome.modified);
        let substituted = outcome.message["params"]["k"].as_str().unwrap();
        assert!(secret_vault::is_placeholder(substituted));
    }

    #[test]
    fn sanitize_then_resubstitute_round_trips_secrets() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({"jsonrpc": "2.0", "method": "call", "params": {"k": OPENAI_KEY}, "id": 2});

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let restored = s.resubstitute(&outcome.message);

        assert!(restored.modified);
        assert_eq!(restored.message, msg);
    }

    #[test]
    fn embedded_placeholders_are_resubstituted_within_strings() {
        let s = sanitizer_on("conn-1", false);
        let placeholder = s.vault().store("sk-embedded", "conn-1", None).unwrap();

        let msg = json!({"note": format!("use {placeholder} for auth")});
        let restored = s.resubstitute(&msg);

        assert_eq!(
            restored.message["note"],
            json!("use sk-embedded for auth")
        );
    }

    #[test]
    fn foreign_placeholders_stay_literal() {
        let a = sanitizer_on("conn-a", false);
        let b = Sanitizer::new(
            filters(),
            a.vault().clone(),
            EventSink::disabled(),
            "conn-b",
            false,
            true,
        );

        let placeholder = a.vault().store("sk-owned-by-a", "conn-a", None).unwrap();
        let msg = json!({"k": placeholder.clone()});

        let restored = b.resubstitute(&msg);
        assert_eq!(restored.message["k"], json!(placeholder));
        assert!(!restored.modified);
    }

    #[test]
    fn server_to_client_never_stores_secrets() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({"jsonrpc": "2.0", "id": 1, "result": {"text": OPENAI_KEY}});

        let outcome = s.sanitize_message(&msg, Direction::ServerToClient).unwrap();

        assert!(!outcome.had_secrets);
        assert_eq!(outcome.message["result"]["text"], json!(OPENAI_KEY));
        assert_eq!(s.vault().count_for("conn-1"), 0);
    }

    #[test]
    fn server_output_still_runs_the_filter_chain() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({"jsonrpc": "2.0", "id": 1, "result": {"text": "\u{1b}[2Jcleared"}});

        let outcome = s.sanitize_message(&msg, Direction::ServerToClient).unwrap();

        assert_eq!(outcome.message["result"]["text"], json!("cleared"));
        assert!(outcome.modified);
    }

    #[test]
    fn sanitization_is_idempotent() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "echo",
            "params": {
                "t": "\u{1b}[31mRED\u{1b}[0m",
                "k": OPENAI_KEY,
                "u": "caf\u{E9}\u{200B}"
            },
            "id": 1
        });

        let once = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let twice = s
            .sanitize_message(&once.message, Direction::ClientToServer)
            .unwrap();

        assert_eq!(once.message, twice.message);
        assert!(!twice.modified, "second pass must be a no-op");
    }

    #[test]
    fn object_keys_are_sanitized_and_empty_keys_dropped() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({
            "params": {
                "ke\u{1b}[31my": 1,
                "\u{200B}": "ghost value",
                "plain": 2
            }
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let params = outcome.message["params"].as_object().unwrap();

        assert!(params.contains_key("key"));
        assert!(params.contains_key("plain"));
        assert_eq!(params.len(), 2, "emptied key should drop its entry");
        assert!(outcome
            .modifications
            .iter()
            .any(|m| m == "empty_key_dropped"));
    }

    #[test]
    fn invalid_tool_names_are_violations() {
        let s = sanitizer_on("conn-1", true);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "rm -rf; evil", "arguments": {}},
            "id": 3
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert!(!outcome.safe);
        assert!(outcome.violations.iter().any(|v| v == "invalid_tool_name"));
    }

    #[test]
    fn script_tags_in_params_are_stripped() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"arguments": {"html": "hi <script>alert(1)</script>"}},
            "id": 4
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        let html = outcome.message["params"]["arguments"]["html"].as_str().unwrap();
        assert!(!html.contains("script"));
        assert!(outcome
            .modifications
            .iter()
            .any(|m| m == "scripts_stripped"));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let s = sanitizer_on("conn-1", false);

        let mut value = json!("leaf");
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!([value]);
        }

        let err = s
            .sanitize_message(&value, Direction::ClientToServer)
            .unwrap_err();
        assert!(matches!(err, SanitizeError::DepthExceeded));
    }

    #[test]
    fn cleanup_clears_the_connection_vault() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({"params": {"k": OPENAI_KEY}});
        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert_eq!(s.vault().count_for("conn-1"), 1);

        s.cleanup();
        assert_eq!(s.vault().count_for("conn-1"), 0);

        // Placeholders left in flight now stay literal.
        let restored = s.resubstitute(&outcome.message);
        assert!(!restored.modified);
    }

    #[test]
    fn non_string_leaves_pass_through_unchanged() {
        let s = sanitizer_on("conn-1", false);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "m",
            "params": {"n": 42, "f": 1.5, "b": true, "z": null, "a": [1, 2]},
            "id": null
        });

        let outcome = s.sanitize_message(&msg, Direction::ClientToServer).unwrap();
        assert_eq!(outcome.message, msg);
        assert!(!outcome.modified);
        assert!(outcome.violations.is_empty());
    }
}
