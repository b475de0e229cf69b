//! ANSI and C1 control-sequence filtering.
//!
//! Terminal escape sequences in proxied text can redraw the operator's
//! screen, hide content, or smuggle instructions past a human reviewer.
//! This module detects the structured forms (CSI, OSC, DCS/SOS/PM/APC,
//! save/restore cursor, the 8-bit CSI introducer) and, depending on the
//! configured action, strips them, rejects the whole string, or encodes the
//! escape bytes into their visible textual form.

use serde::{Deserialize, Serialize};

/// The escape character (0x1B) that introduces 7-bit sequences.
const ESC: char = '\u{1b}';

/// The 8-bit CSI introducer (0x9B), equivalent to `ESC [`.
const CSI_8BIT: char = '\u{9b}';

/// What to do when an escape sequence is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnsiAction {
    /// Remove the sequences and keep the surrounding text. Default.
    Strip,
    /// Replace the entire string with an empty one.
    Reject,
    /// Replace each escape byte with its visible form (`\x1b`), leaving the
    /// rest of the sequence as ordinary printable text.
    Encode,
}

/// Configuration for the [`AnsiFilter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnsiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_action")]
    pub action: AnsiAction,
}

fn default_true() -> bool {
    true
}

fn default_action() -> AnsiAction {
    AnsiAction::Strip
}

impl Default for AnsiConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            action: default_action(),
        }
    }
}

/// The outcome of filtering one string.
#[derive(Debug, Clone)]
pub struct AnsiOutcome {
    pub out: String,
    /// `true` when at least one escape byte was removed, encoded, or caused
    /// a rejection.
    pub removed: bool,
}

/// Detects and neutralises ANSI escape sequences.
///
/// The filter is read-only after construction and may be shared across
/// connections. The same input always produces the same output.
#[derive(Debug, Clone)]
pub struct AnsiFilter {
    config: AnsiConfig,
}

impl AnsiFilter {
    pub fn new(config: AnsiConfig) -> Self {
        Self { config }
    }

    /// Apply the configured action to `s`.
    pub fn filter(&self, s: &str) -> AnsiOutcome {
        if !self.config.enabled {
            return AnsiOutcome {
                out: s.to_string(),
                removed: false,
            };
        }

        match self.config.action {
            AnsiAction::Strip => strip_sequences(s),
            AnsiAction::Reject => {
                if contains_escape(s) {
                    AnsiOutcome {
                        out: String::new(),
                        removed: true,
                    }
                } else {
                    AnsiOutcome {
                        out: s.to_string(),
                        removed: false,
                    }
                }
            }
            AnsiAction::Encode => encode_escapes(s),
        }
    }
}

fn contains_escape(s: &str) -> bool {
    s.chars().any(|c| c == ESC || c == CSI_8BIT)
}

/// Replace each escape byte with its visible textual form, leaving the
/// remainder of the sequence as plain text.
fn encode_escapes(s: &str) -> AnsiOutcome {
    let mut out = String::with_capacity(s.len());
    let mut removed = false;

    for c in s.chars() {
        match c {
            ESC => {
                out.push_str("\\x1b");
                removed = true;
            }
            CSI_8BIT => {
                out.push_str("\\x9b");
                removed = true;
            }
            other => out.push(other),
        }
    }

    AnsiOutcome { out, removed }
}

/// Structurally consume escape sequences, then drop any residual escape
/// bytes that were not part of a recognised sequence.
fn strip_sequences(s: &str) -> AnsiOutcome {
    let mut out = String::with_capacity(s.len());
    let mut removed = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ESC => {
                removed = true;
                match chars.peek() {
                    // CSI: parameters and intermediates in 0x20..=0x3F, one
                    // final byte in 0x40..=0x7E. Covers SGR and DEC private
                    // modes (`?` is a parameter byte).
                    Some('[') => {
                        chars.next();
                        consume_csi_body(&mut chars);
                    }
                    // OSC: terminated by BEL or ST (ESC \).
                    Some(']') => {
                        chars.next();
                        consume_until_st_or_bel(&mut chars);
                    }
                    // DCS / SOS / PM / APC: terminated by ST (ESC \).
                    Some('P') | Some('X') | Some('^') | Some('_') => {
                        chars.next();
                        consume_until_st(&mut chars);
                    }
                    // Save / restore cursor.
                    Some('7') | Some('8') => {
                        chars.next();
                    }
                    // Bare or unrecognised escape: drop the ESC byte only.
                    _ => {}
                }
            }
            CSI_8BIT => {
                removed = true;
                consume_csi_body(&mut chars);
            }
            other => out.push(other),
        }
    }

    AnsiOutcome { out, removed }
}

fn consume_csi_body(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while let Some(&next) = chars.peek() {
        if next.is_ascii() && (0x20..=0x3F).contains(&(next as u8)) {
            chars.next();
        } else {
            break;
        }
    }
    if let Some(&next) = chars.peek() {
        if next.is_ascii() && (0x40..=0x7E).contains(&(next as u8)) {
            chars.next();
        }
    }
}

fn consume_until_st_or_bel(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while let Some(c) = chars.next() {
        if c == '\u{07}' {
            break;
        }
        if c == ESC && chars.peek() == Some(&'\\') {
            chars.next();
            break;
        }
    }
}

fn consume_until_st(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while let Some(c) = chars.next() {
        if c == ESC && chars.peek() == Some(&'\\') {
            chars.next();
            break;
        }
    }
}
