//! Unicode code-point whitelist enforcement.
//!
//! Zero-width characters and C0/C1 controls are stripped unconditionally;
//! everything else must fall inside the configured inclusive ranges (minus
//! the explicit blacklist) to survive. Iteration is by Unicode scalar value,
//! so surrogate pairs are handled as one code point by construction.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Why a code point was removed. Closed enumeration; these tags appear in
/// sanitization outcomes and security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationTag {
    ZeroWidthRemoved,
    ControlRemoved,
    UnicodeRemoved,
    NonWhitelistedRemoved,
}

impl ViolationTag {
    /// The snake_case wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ZeroWidthRemoved => "zero_width_removed",
            Self::ControlRemoved => "control_removed",
            Self::UnicodeRemoved => "unicode_removed",
            Self::NonWhitelistedRemoved => "non_whitelisted_removed",
        }
    }
}

impl std::fmt::Display for ViolationTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the [`CharacterWhitelist`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Inclusive code-point ranges that make up the allow set.
    /// Tab/LF/CR are not in the default range; list them here to pass them
    /// through.
    #[serde(default = "default_ranges")]
    pub allowed_ranges: Vec<(u32, u32)>,
    /// Code points removed even when a range would allow them.
    #[serde(default = "default_blacklist")]
    pub blacklist: Vec<u32>,
}

fn default_true() -> bool {
    true
}

fn default_ranges() -> Vec<(u32, u32)> {
    vec![(0x20, 0x7E)]
}

fn default_blacklist() -> Vec<u32> {
    vec![0x1B, 0x7F]
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            allowed_ranges: default_ranges(),
            blacklist: default_blacklist(),
        }
    }
}

/// The outcome of filtering one string.
#[derive(Debug, Clone)]
pub struct WhitelistOutcome {
    pub out: String,
    pub violations: BTreeSet<ViolationTag>,
}

/// Enforces the configured code-point allow set.
///
/// Read-only after construction; freely shared across connections.
#[derive(Debug, Clone)]
pub struct CharacterWhitelist {
    enabled: bool,
    ranges: Vec<(u32, u32)>,
    blacklist: Vec<u32>,
}

impl CharacterWhitelist {
    pub fn new(config: WhitelistConfig) -> Self {
        Self {
            enabled: config.enabled,
            ranges: config.allowed_ranges,
            blacklist: config.blacklist,
        }
    }

    /// Strip disallowed code points from `s`, reporting one tag per removal
    /// class encountered.
    pub fn filter(&self, s: &str) -> WhitelistOutcome {
        if !self.enabled {
            return WhitelistOutcome {
                out: s.to_string(),
                violations: BTreeSet::new(),
            };
        }

        let mut out = String::with_capacity(s.len());
        let mut violations = BTreeSet::new();

        for c in s.chars() {
            // Zero-width and control classes are detected regardless of the
            // configured ranges so the specific tag is always emitted.
            if is_zero_width(c) {
                violations.insert(ViolationTag::ZeroWidthRemoved);
                continue;
            }
            if is_disallowed_control(c) {
                violations.insert(ViolationTag::ControlRemoved);
                continue;
            }
            if self.is_allowed(c) {
                out.push(c);
            } else if (c as u32) > 0x7F {
                violations.insert(ViolationTag::UnicodeRemoved);
            } else {
                violations.insert(ViolationTag::NonWhitelistedRemoved);
            }
        }

        WhitelistOutcome { out, violations }
    }

    /// Membership in the effective allow set: (union of ranges) minus
    /// blacklist.
    pub fn is_allowed(&self, c: char) -> bool {
        let cp = c as u32;
        if self.blacklist.contains(&cp) {
            return false;
        }
        self.ranges.iter().any(|&(lo, hi)| cp >= lo && cp <= hi)
    }
}

/// Zero-width and invisible formatting characters.
fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200D}' | '\u{FEFF}' | '\u{2060}' | '\u{180E}' | '\u{2000}'..='\u{200A}'
    )
}

/// C0/C1 controls excluding tab, line feed, and carriage return.
fn is_disallowed_control(c: char) -> bool {
    if matches!(c, '\t' | '\n' | '\r') {
        return false;
    }
    matches!(c, '\u{0000}'..='\u{001F}' | '\u{007F}'..='\u{009F}')
}
