//! Blocklist rule normalization.
//!
//! Sources mix plain domain lists, hosts files, wildcard patterns, and
//! AdBlock-style rules. Everything is reduced at load time to a bare apex
//! domain; subdomain coverage comes from the suffix walk at query time.

/// Normalize one source line to a lowercased apex domain, or None for
/// comments, element-hiding rules, and anything else that cannot block a
/// whole domain.
pub fn normalize_rule(line: &str) -> Option<String> {
    let mut rule = line.trim();
    if rule.is_empty() || rule.starts_with('#') || rule.starts_with('!') {
        return None;
    }

    // Cosmetic/element rules ("##", "#@#") never name a blockable domain.
    if rule.contains("##") || rule.contains("#@#") {
        return None;
    }

    // AdBlock option suffix: "||ads.test^$important", "$script", ...
    if let Some(idx) = rule.find('$') {
        rule = rule[..idx].trim_end();
        if rule.is_empty() {
            return None;
        }
    }

    // "||ads.test^" — domain anchor.
    if let Some(stripped) = rule.strip_prefix("||") {
        rule = stripped;
    } else if let Some(stripped) = rule.strip_prefix('|') {
        // "|https://ads.test^" — address anchor; extract the host.
        rule = stripped;
    }

    // URL-ish rules: strip scheme, path, and the AdBlock separator.
    if let Some(idx) = rule.find("://") {
        rule = &rule[idx + 3..];
    }
    for sep in ['^', '/', '?'] {
        if let Some(idx) = rule.find(sep) {
            rule = &rule[..idx];
        }
    }

    // Hosts-file lines: "0.0.0.0 ads.test" (comment tail already gone).
    let mut parts = rule.split_whitespace();
    let first = parts.next()?;
    let candidate = match parts.next() {
        Some(second) if is_unspecified_host(first) => second,
        Some(_) => return None,
        None => first,
    };

    // Wildcard sources: "*.ads.test" blocks the apex and everything below.
    let candidate = candidate.strip_prefix("*.").unwrap_or(candidate);
    let candidate = candidate.trim_end_matches('.').to_ascii_lowercase();

    if !is_plausible_domain(&candidate) {
        return None;
    }
    Some(candidate)
}

fn is_unspecified_host(s: &str) -> bool {
    matches!(s, "0.0.0.0" | "127.0.0.1" | "::" | "::1")
}

fn is_plausible_domain(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 || !s.contains('.') {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}
