//! Configurable regex rule matching.
//!
//! Rules are evaluated in order against every string leaf of a message.
//! Each rule carries an action: `reject` marks the message unsafe, `strip`
//! removes the matched text, and `log` records the match while preserving
//! the text. A rule whose regex fails to compile is a fatal configuration
//! error; at runtime a rule either matches or it does not.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// What to do when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Mark the message as disallowed.
    Reject,
    /// Remove every match from the sanitized output.
    Strip,
    /// Record the match and preserve the text.
    Log,
}

/// Rule severity, carried through to findings and security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single configured rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    /// Short, snake_case identifier used in violations and events.
    pub name: String,
    /// Regex source; compiled case-insensitively at construction.
    pub pattern: String,
    pub action: RuleAction,
    pub severity: Severity,
}

/// Configuration for the [`PatternMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered rule list. Defaults to the built-in catalogue.
    #[serde(default = "default_rules")]
    pub rules: Vec<PatternRule>,
}

fn default_true() -> bool {
    true
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            rules: default_rules(),
        }
    }
}

/// The built-in rule catalogue applied when no rules are configured.
pub fn default_rules() -> Vec<PatternRule> {
    let rule = |name: &str, pattern: &str, action, severity| PatternRule {
        name: name.to_string(),
        pattern: pattern.to_string(),
        action,
        severity,
    };

    vec![
        rule(
            "command_injection",
            r"[;&|`$]\s*(?:cat|ls|rm|cp|mv|curl|wget|bash|sh|zsh|nc|chmod|chown|python|perl|ruby|eval|exec)\b",
            RuleAction::Reject,
            Severity::High,
        ),
        rule(
            "path_traversal",
            r"\.\./|\.\.\\",
            RuleAction::Reject,
            Severity::High,
        ),
        rule(
            "sql_injection",
            r"\b(?:union\s+select|drop\s+table|insert\s+into|delete\s+from|exec\s+xp_)\b",
            RuleAction::Reject,
            Severity::High,
        ),
        rule(
            "template_injection",
            r"\{\{[^}]*\}\}|\$\{[^}]*\}",
            RuleAction::Log,
            Severity::Medium,
        ),
    ]
}

/// Errors from matcher construction.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("rule '{name}' has an invalid regex: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// One rule match, reported back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatch {
    pub name: String,
    pub severity: Severity,
    pub action: RuleAction,
}

/// The outcome of checking one string.
#[derive(Debug, Clone)]
pub struct PatternCheck {
    /// `false` when any `reject` rule matched.
    pub allowed: bool,
    /// One entry per rule that matched, in rule order.
    pub matches: Vec<RuleMatch>,
    /// The input with all `strip`-rule matches removed.
    pub sanitized: String,
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    regex: Regex,
    action: RuleAction,
    severity: Severity,
}

/// Evaluates the configured rule list against strings.
///
/// Read-only after construction; freely shared across connections.
#[derive(Debug)]
pub struct PatternMatcher {
    enabled: bool,
    rules: Vec<CompiledRule>,
}

impl PatternMatcher {
    /// Compile every rule. An invalid regex is fatal: the proxy must refuse
    /// to start rather than run with a silently missing rule.
    pub fn new(config: PatternConfig) -> Result<Self, PatternError> {
        let mut rules = Vec::with_capacity(config.rules.len());

        for rule in config.rules {
            let regex = RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| PatternError::InvalidRegex {
                    name: rule.name.clone(),
                    source,
                })?;

            rules.push(CompiledRule {
                name: rule.name,
                regex,
                action: rule.action,
                severity: rule.severity,
            });
        }

        Ok(Self {
            enabled: config.enabled,
            rules,
        })
    }

    /// Evaluate every rule against `s`. `context` is a free-form label (a
    /// method name, a JSON path) carried into log lines for `log` rules.
    pub fn check(&self, s: &str, context: Option<&str>) -> PatternCheck {
        let mut allowed = true;
        let mut matches = Vec::new();
        let mut sanitized = s.to_string();

        if !self.enabled {
            return PatternCheck {
                allowed,
                matches,
                sanitized,
            };
        }

        for rule in &self.rules {
            if !rule.regex.is_match(&sanitized) {
                continue;
            }

            matches.push(RuleMatch {
                name: rule.name.clone(),
                severity: rule.severity,
                action: rule.action,
            });

            match rule.action {
                RuleAction::Reject => {
                    allowed = false;
                }
                RuleAction::Strip => {
                    sanitized = rule.regex.replace_all(&sanitized, "").into_owned();
                }
                RuleAction::Log => {
                    tracing::info!(
                        rule = %rule.name,
                        severity = ?rule.severity,
                        context = context.unwrap_or("-"),
                        "pattern rule matched"
                    );
                }
            }
        }

        PatternCheck {
            allowed,
            matches,
            sanitized,
        }
    }

    /// Number of compiled rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
