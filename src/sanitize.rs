//! Display names derived from source URLs.

use std::sync::OnceLock;

use regex::Regex;

use crate::fs_util::percent_decode;

pub const MAX_NAME_LEN: usize = 200;

fn disallowed() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{Alphabetic}\p{Nd} \-]").expect("static regex"))
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Final path segment of a URL, without query string or fragment.
pub fn url_basename(url: &str) -> &str {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
}

/// Strips the last extension, treating `.tar.gz` as one.
pub fn strip_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") {
        return &name[..name.len() - ".tar.gz".len()];
    }
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Clean, title-cased name for a URL. Never fails; the same URL always yields
/// the same name.
pub fn sanitize(url: &str) -> String {
    match try_sanitize(url) {
        Some(name) => name,
        None => fallback(url),
    }
}

fn try_sanitize(url: &str) -> Option<String> {
    let decoded = percent_decode(url_basename(url));
    let stem = strip_extension(&decoded);
    let spaced: String = stem
        .chars()
        .map(|ch| match ch {
            '_' | '-' | '+' => ' ',
            other => other,
        })
        .collect();
    let cleaned = disallowed().replace_all(&spaced, "");
    let collapsed = whitespace().replace_all(cleaned.trim(), " ");
    let titled = collapsed
        .split(' ')
        .filter(|word| !word.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ");
    if titled.is_empty() {
        return None;
    }
    Some(truncate(&titled))
}

fn fallback(url: &str) -> String {
    let decoded = percent_decode(url_basename(url));
    let name = strip_extension(&decoded).replace(['_', '-'], " ");
    truncate(name.trim())
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|ch| ch.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

fn truncate(name: &str) -> String {
    name.chars()
        .take(MAX_NAME_LEN)
        .collect::<String>()
        .trim_end()
        .to_string()
}
