use regex::Regex;
use std::sync::LazyLock;

static LABEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?$").expect("label pattern compiles")
});

/// Maximum length of a full domain name in presentation form.
const MAX_DOMAIN_LEN: usize = 253;

pub fn has_valid_tld(domain: &str) -> bool {
    if domain.is_empty() || domain.len() < 3 || !domain.contains('.') {
        return false;
    }

    match domain.rfind('.') {
        Some(last_dot) if last_dot < domain.len() - 1 => {
            let tld = &domain[last_dot + 1..];
            // Punycode TLDs (xn--p1ai) carry digits, bare numbers mean an address
            tld.len() >= 2 && !tld.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Trims, lower-cases and strips the root dot. Returns `None` for blank input.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

pub fn is_valid_domain(domain: &str) -> bool {
    if domain.len() > MAX_DOMAIN_LEN || !has_valid_tld(domain) {
        return false;
    }
    domain.split('.').all(|label| LABEL_PATTERN.is_match(label))
}
