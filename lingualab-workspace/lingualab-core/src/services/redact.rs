//! services/redact.rs
//! Real-name scrubbing for anything that leaves the segregated intake artifact.
//!
//! Matching is case-insensitive and ignores zero-width characters, so
//! "J\u{200b}ane DOE" is still recognized as "Jane Doe".

use serde_json::Value;

/// Per-character normalization: lowercase, with control and zero-width chars removed.
fn norm_char(ch: char) -> String {
    if ch.is_control() {
        return String::new();
    }
    ch.to_lowercase()
        .filter(|lc| !matches!(lc, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}'))
        .collect()
}

/// Build a normalized character view of `s` along with original byte spans.
/// Each produced normalized char corresponds to an original (start,end) byte span.
/// Characters removed by normalization emit no span entries.
fn normalized_chars_with_spans(s: &str) -> (Vec<char>, Vec<(usize, usize)>) {
    let mut chars = Vec::new();
    let mut spans = Vec::new();
    for (orig_start, ch) in s.char_indices() {
        let orig_end = orig_start + ch.len_utf8();
        for nc in norm_char(ch).chars() {
            chars.push(nc);
            spans.push((orig_start, orig_end));
        }
    }
    (chars, spans)
}

/// Replace every case-insensitive occurrence of `pattern` in `text` with `replacement`.
pub fn replace_ci(text: &str, pattern: &str, replacement: &str) -> String {
    let pat_chars: Vec<char> = pattern.chars().flat_map(|c| norm_char(c).chars().collect::<Vec<_>>()).collect();
    if pat_chars.is_empty() {
        return text.to_string();
    }
    let (norm_chars, spans) = normalized_chars_with_spans(text);
    if pat_chars.len() > norm_chars.len() {
        return text.to_string();
    }

    let plen = pat_chars.len();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;
    while i + plen <= norm_chars.len() {
        if norm_chars[i..i + plen] == pat_chars[..] {
            let (s, _) = spans[i];
            let (_, e) = spans[i + plen - 1];
            ranges.push((s, e));
            i += plen;
        } else {
            i += 1;
        }
    }
    if ranges.is_empty() {
        return text.to_string();
    }

    // Merge overlapping/adjacent ranges then replace from the end to keep indices stable.
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (s, e) in ranges {
        if let Some(last) = merged.last_mut() {
            if s <= last.1 {
                last.1 = last.1.max(e);
                continue;
            }
        }
        merged.push((s, e));
    }
    let mut out = text.to_string();
    for (s, e) in merged.into_iter().rev() {
        out.replace_range(s..e, replacement);
    }
    out
}

/// Scrub every string (and object key) inside a JSON value.
pub fn scrub_value(value: &mut Value, pattern: &str, replacement: &str) {
    match value {
        Value::String(s) => {
            let scrubbed = replace_ci(s, pattern, replacement);
            if scrubbed != *s {
                *s = scrubbed;
            }
        }
        Value::Array(items) => {
            for v in items {
                scrub_value(v, pattern, replacement);
            }
        }
        Value::Object(map) => {
            let old = std::mem::take(map);
            for (k, mut v) in old {
                scrub_value(&mut v, pattern, replacement);
                map.insert(replace_ci(&k, pattern, replacement), v);
            }
        }
        _ => {}
    }
}

/// Stands in for a match until every pattern has run. Control characters are
/// invisible to matching, so a replacement can never be re-matched by a later part.
const HOLE: &str = "\u{1}";

/// Scrub the full name and, when it has several parts, each part of at least
/// three characters. Shorter parts are left alone to avoid mangling ordinary words.
pub fn scrub_name(text: &str, real_name: &str, replacement: &str) -> String {
    let mut out = replace_ci(text, real_name.trim(), HOLE);
    for part in name_parts(real_name) {
        out = replace_ci(&out, part, HOLE);
    }
    out.replace(HOLE, replacement)
}

pub fn scrub_name_value(value: &mut Value, real_name: &str, replacement: &str) {
    scrub_value(value, real_name.trim(), HOLE);
    for part in name_parts(real_name) {
        scrub_value(value, part, HOLE);
    }
    fill_holes(value, replacement);
}

fn fill_holes(value: &mut Value, replacement: &str) {
    match value {
        Value::String(s) if s.contains(HOLE) => *s = s.replace(HOLE, replacement),
        Value::Array(items) => items.iter_mut().for_each(|v| fill_holes(v, replacement)),
        Value::Object(map) => {
            let old = std::mem::take(map);
            for (k, mut v) in old {
                fill_holes(&mut v, replacement);
                map.insert(k.replace(HOLE, replacement), v);
            }
        }
        _ => {}
    }
}

fn name_parts(real_name: &str) -> Vec<&str> {
    let parts: Vec<&str> = real_name.split_whitespace().collect();
    if parts.len() < 2 {
        return Vec::new();
    }
    parts.into_iter().filter(|p| p.chars().count() >= 3).collect()
}
