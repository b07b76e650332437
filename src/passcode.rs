//! Passcode extraction from message bodies.
//!
//! Bodies are reduced to their visible text first: comments (including
//! Outlook conditional blocks) and `<head>`, `<script>` and `<style>`
//! elements are dropped, remaining tags are stripped, a handful of
//! entities are decoded and whitespace is collapsed. Plain-text bodies go
//! through the same path unchanged apart from whitespace.

use log::debug;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::LazyLock;

pub const PASSCODE_LEN: usize = 6;

static HIDDEN_ELEMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<(head|script|style)\b[^>]*>.*?</(head|script|style)\s*>")
        .expect("hidden element pattern is valid")
});

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

static DIGIT_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+").expect("digit pattern is valid"));

/// How strictly the visible text must look like a passcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// First run of exactly six digits anywhere in the text.
    #[default]
    Anywhere,
    /// The whole visible text is the six digits and nothing else.
    Exact,
}

/// A six-digit one-time passcode.
///
/// Only `Display` yields the digits; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Passcode(String);

impl fmt::Debug for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passcode(******)")
    }
}

impl fmt::Display for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts the passcode from a raw HTML or plain-text body.
pub fn extract(body: &str, policy: MatchPolicy) -> Option<Passcode> {
    let text = visible_text(body);

    let found = match policy {
        MatchPolicy::Anywhere => DIGIT_RUNS
            .find_iter(&text)
            .map(|run| run.as_str())
            .find(|run| run.len() == PASSCODE_LEN),
        MatchPolicy::Exact => Some(text.as_str())
            .filter(|t| t.len() == PASSCODE_LEN && t.bytes().all(|b| b.is_ascii_digit())),
    };

    match found {
        Some(code) => {
            debug!("Passcode found in message body");
            Some(Passcode(code.to_string()))
        }
        None => {
            debug!("No passcode found in message body ({:?} policy)", policy);
            None
        }
    }
}

/// Collapses an HTML or plain-text body to the text a reader would see.
pub fn visible_text(body: &str) -> String {
    let without_hidden = HIDDEN_ELEMENTS.replace_all(body, " ");
    let without_tags = TAGS.replace_all(&without_hidden, " ");
    let decoded = decode_entities(&without_tags);

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
