//! Deterministic query variants for lexical retrieval: spacing and
//! punctuation normalization, quoted spans, claim-token aliases, and
//! CID-like token extraction.

use regex::Regex;

const DEFAULT_VARIANT_LIMIT: usize = 8;

pub fn build_query_variants(query_text: &str, limit: usize) -> Vec<String> {
    let raw = query_text.trim();
    if raw.is_empty() {
        return Vec::new();
    }

    let mut variants: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut add = |s: &str, variants: &mut Vec<String>, seen: &mut Vec<String>| {
        let v = s.split_whitespace().collect::<Vec<_>>().join(" ");
        if v.is_empty() {
            return;
        }
        let key = v.to_lowercase();
        if seen.contains(&key) {
            return;
        }
        seen.push(key);
        variants.push(v);
    };

    add(raw, &mut variants, &mut seen);
    let lower = raw.to_lowercase();
    add(&lower, &mut variants, &mut seen);

    if raw.contains('_') {
        add(&raw.replace('_', " "), &mut variants, &mut seen);
    }
    if raw.contains('-') {
        add(&raw.replace('-', " "), &mut variants, &mut seen);
    }

    // Quoted spans can be high-signal entities.
    if let Ok(quoted_re) = Regex::new(r#""([^"]+)""#) {
        for captures in quoted_re.captures_iter(raw) {
            if let Some(quoted) = captures.get(1) {
                let quoted = quoted.as_str();
                add(quoted, &mut variants, &mut seen);
                if quoted.contains('_') {
                    add(&quoted.replace('_', " "), &mut variants, &mut seen);
                }
                if quoted.contains('-') {
                    add(&quoted.replace('-', " "), &mut variants, &mut seen);
                }
            }
        }
    }

    // Punctuation-normalized phrase.
    let normalized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();
    add(normalized.trim(), &mut variants, &mut seen);

    // Claim-token aliases.
    let alias_map = [
        ("identity ratification", "identity_ratify"),
        ("identity ratify", "identity_ratify"),
        ("identity proposal", "identity_proposal"),
        ("commitment close", "commitment_close"),
        ("commitment open", "commitment_open"),
    ];
    let low_norm = normalized.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    for (phrase, alias) in alias_map {
        if lower.contains(phrase) || low_norm.contains(phrase) {
            add(alias, &mut variants, &mut seen);
        }
    }

    // CID-ish tokens (mc_000123 or hex ids).
    if let Ok(cid_re) = Regex::new(r"\b(mc_[0-9]{3,12}|[a-f0-9]{8,64})\b") {
        for captures in cid_re.captures_iter(&lower) {
            if let Some(token) = captures.get(1) {
                add(token.as_str(), &mut variants, &mut seen);
            }
        }
    }

    variants.truncate(limit.max(1));
    variants
}

pub fn default_query_variants(query_text: &str) -> Vec<String> {
    build_query_variants(query_text, DEFAULT_VARIANT_LIMIT)
}
