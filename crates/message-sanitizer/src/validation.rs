//! Structural field validation for JSON-RPC messages.
//!
//! Enforces the `sanitization.validation` limits: raw frame size, tool-name
//! shape, and parameter-value hygiene (length caps, script/HTML stripping).

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Rules applied to the `name` field of `tools/call`-shaped requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolNameRule {
    #[serde(default = "default_tool_name_pattern")]
    pub pattern: String,
}

fn default_tool_name_pattern() -> String {
    "^[a-zA-Z0-9_-]+$".to_string()
}

impl Default for ToolNameRule {
    fn default() -> Self {
        Self {
            pattern: default_tool_name_pattern(),
        }
    }
}

/// Rules applied to string values inside `params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParamRules {
    #[serde(default = "default_true")]
    pub strip_html: bool,
    #[serde(default = "default_true")]
    pub strip_scripts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ToolParamRules {
    fn default() -> Self {
        Self {
            strip_html: default_true(),
            strip_scripts: default_true(),
        }
    }
}

/// Per-field rule container, mirroring the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldRules {
    #[serde(default)]
    pub tool_name: ToolNameRule,
    #[serde(default)]
    pub tool_params: ToolParamRules,
}

/// Configuration for the [`FieldValidator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum raw frame size in bytes, checked before JSON parsing.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Cap on prompt-like string values (`prompt`, `text`, `content`).
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
    #[serde(default = "default_max_tool_name_length")]
    pub max_tool_name_length: usize,
    /// Cap on any other string value inside `params`.
    #[serde(default = "default_max_param_value_length")]
    pub max_param_value_length: usize,
    #[serde(default)]
    pub fields: FieldRules,
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_max_prompt_length() -> usize {
    50_000
}

fn default_max_tool_name_length() -> usize {
    128
}

fn default_max_param_value_length() -> usize {
    10_000
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_prompt_length: default_max_prompt_length(),
            max_tool_name_length: default_max_tool_name_length(),
            max_param_value_length: default_max_param_value_length(),
            fields: FieldRules::default(),
        }
    }
}

/// Errors from validator construction.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid tool-name pattern: {0}")]
    InvalidToolNamePattern(#[from] regex::Error),
}

/// The result of validating one string value.
#[derive(Debug, Clone)]
pub struct ValueCheck {
    pub out: String,
    /// `param_truncated`, `scripts_stripped`, `html_stripped` as applicable.
    pub modifications: Vec<&'static str>,
}

/// Compiled field validator.
///
/// Read-only after construction; freely shared across connections.
pub struct FieldValidator {
    config: ValidationConfig,
    tool_name_re: Regex,
    script_re: Regex,
    tag_re: Regex,
}

impl FieldValidator {
    pub fn new(config: ValidationConfig) -> Result<Self, ValidationError> {
        let tool_name_re = Regex::new(&config.fields.tool_name.pattern)?;

        let script_re = RegexBuilder::new(r"<script\b[^>]*>[\s\S]*?</script\s*>|javascript:")
            .case_insensitive(true)
            .build()
            .expect("built-in script pattern must compile");
        let tag_re = Regex::new(r"<[^>]+>").expect("built-in tag pattern must compile");

        Ok(Self {
            config,
            tool_name_re,
            script_re,
            tag_re,
        })
    }

    /// Raw frame gate, applied before JSON parsing.
    pub fn frame_size_ok(&self, len: usize) -> bool {
        len <= self.config.max_message_size
    }

    /// Validate a tool name. Returns `false` when the name is too long or
    /// does not match the configured pattern.
    pub fn tool_name_ok(&self, name: &str) -> bool {
        name.len() <= self.config.max_tool_name_length && self.tool_name_re.is_match(name)
    }

    /// Apply the value-level rules to one string found under `params`.
    /// `prompt_like` widens the length cap to `max_prompt_length` for
    /// free-text fields.
    pub fn check_param_value(&self, value: &str, prompt_like: bool) -> ValueCheck {
        let mut out = value.to_string();
        let mut modifications = Vec::new();

        if self.config.fields.tool_params.strip_scripts && self.script_re.is_match(&out) {
            out = self.script_re.replace_all(&out, "").into_owned();
            modifications.push("scripts_stripped");
        }
        if self.config.fields.tool_params.strip_html && self.tag_re.is_match(&out) {
            out = self.tag_re.replace_all(&out, "").into_owned();
            modifications.push("html_stripped");
        }

        let cap = if prompt_like {
            self.config.max_prompt_length
        } else {
            self.config.max_param_value_length
        };
        if out.chars().count() > cap {
            out = out.chars().take(cap).collect();
            modifications.push("param_truncated");
        }

        ValueCheck { out, modifications }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> FieldValidator {
        FieldValidator::new(ValidationConfig::default()).unwrap()
    }

    #[test]
    fn frame_size_gate() {
        let v = validator();
        assert!(v.frame_size_ok(1024));
        assert!(!v.frame_size_ok(2 * 1024 * 1024));
    }

    #[test]
    fn tool_names_accept_word_characters() {
        let v = validator();
        assert!(v.tool_name_ok("read_file"));
        assert!(v.tool_name_ok("tools-v2"));
        assert!(!v.tool_name_ok("rm -rf /"));
        assert!(!v.tool_name_ok("name;injection"));
    }

    #[test]
    fn overlong_tool_names_rejected() {
        let v = validator();
        let long = "a".repeat(200);
        assert!(!v.tool_name_ok(&long));
    }

    #[test]
    fn script_blocks_are_stripped() {
        let v = validator();
        let check = v.check_param_value("hi <script>alert(1)</script> there", false);
        assert_eq!(check.out, "hi  there");
        assert!(check.modifications.contains(&"scripts_stripped"));
    }

    #[test]
    fn javascript_urls_are_stripped() {
        let v = validator();
        let check = v.check_param_value("click javascript:doEvil()", false);
        assert!(!check.out.contains("javascript:"));
    }

    #[test]
    fn html_tags_are_stripped() {
        let v = validator();
        let check = v.check_param_value("<b>bold</b> move", false);
        assert_eq!(check.out, "bold move");
        assert!(check.modifications.contains(&"html_stripped"));
    }

    #[test]
    fn long_values_are_truncated() {
        let config = ValidationConfig {
            max_param_value_length: 8,
            ..ValidationConfig::default()
        };
        let v = FieldValidator::new(config).unwrap();
        let check = v.check_param_value("0123456789abcdef", false);
        assert_eq!(check.out, "01234567");
        assert!(check.modifications.contains(&"param_truncated"));
    }

    #[test]
    fn prompt_like_values_use_the_wider_cap() {
        let config = ValidationConfig {
            max_param_value_length: 4,
            max_prompt_length: 100,
            ..ValidationConfig::default()
        };
        let v = FieldValidator::new(config).unwrap();
        let check = v.check_param_value("a longer prompt value", true);
        assert_eq!(check.out, "a longer prompt value");
        assert!(check.modifications.is_empty());
    }

    #[test]
    fn clean_values_pass_unmodified() {
        let v = validator();
        let check = v.check_param_value("just ordinary text", false);
        assert_eq!(check.out, "just ordinary text");
        assert!(check.modifications.is_empty());
    }

    #[test]
    fn invalid_configured_pattern_fails_construction() {
        let config = ValidationConfig {
            fields: FieldRules {
                tool_name: ToolNameRule {
                    pattern: "([".to_string(),
                },
                tool_params: ToolParamRules::default(),
            },
            ..ValidationConfig::default()
        };
        assert!(FieldValidator::new(config).is_err());
    }
}
