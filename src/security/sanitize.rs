// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Free-text sanitizer.
//!
//! Removes tag delimiters (`<`, `>`), `javascript:` URL schemes, and inline
//! `on<name>=` handler prefixes, then trims. Inner text is kept, so
//! `Harvest <script>alert(1)</script> Wood` becomes
//! `Harvest scriptalert(1)/script Wood`.
//!
//! Each pattern is stripped in a single left-to-right pass. Text that only
//! forms a pattern once another match is removed survives, so
//! `javajavascript:script:` comes out as `javascript:`.
//!
//! This is delimiter stripping, not an HTML-context escaper. It does not
//! neutralize attribute-context or CSS injection and must not be treated
//! as a complete XSS control by anything rendering these strings.

use serde_json::Value;

const SCHEME: &[char] = &['j', 'a', 'v', 'a', 's', 'c', 'r', 'i', 'p', 't', ':'];

fn is_word(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Length of an `on\w+=` match starting at `i`, if any.
fn handler_len(chars: &[char], i: usize) -> Option<usize> {
    if i + 1 >= chars.len()
        || !chars[i].eq_ignore_ascii_case(&'o')
        || !chars[i + 1].eq_ignore_ascii_case(&'n')
    {
        return None;
    }
    let mut j = i + 2;
    while j < chars.len() && is_word(chars[j]) {
        j += 1;
    }
    (j > i + 2 && j < chars.len() && chars[j] == '=').then(|| j + 1 - i)
}

fn scheme_at(chars: &[char], i: usize) -> bool {
    chars.len() >= i + SCHEME.len()
        && chars[i..i + SCHEME.len()]
            .iter()
            .zip(SCHEME)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

/// Strip each pattern once, left to right.
fn strip_once(chars: &[char]) -> Vec<char> {
    let mut out = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '<' || chars[i] == '>' {
            i += 1;
        } else if scheme_at(chars, i) {
            i += SCHEME.len();
        } else if let Some(len) = handler_len(chars, i) {
            i += len;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// Sanitize one free-text value.
#[must_use]
pub fn sanitize_text(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    strip_once(&chars).into_iter().collect::<String>().trim().to_string()
}

/// Sanitize a string field in place. Non-string values are left alone.
pub fn sanitize_field(value: &mut Value) {
    if let Value::String(s) = value {
        *s = sanitize_text(s);
    }
}
