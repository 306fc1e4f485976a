//! Network domain whitelist matching.
//!
//! Entries are either exact hostnames (`api.example.com`) or wildcard
//! suffixes (`*.example.com`). A wildcard matches any subdomain at any depth
//! but not the bare apex. Matching is ASCII case-insensitive and ignores a
//! trailing dot on the candidate.

/// Check whether `domain` is permitted by `whitelist`.
///
/// An empty whitelist permits every domain.
pub fn is_allowed(whitelist: &[String], domain: &str) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let domain = normalize(domain);
    if domain.is_empty() {
        return false;
    }
    whitelist.iter().any(|pattern| matches(pattern, &domain))
}

/// Match a single whitelist entry against a normalized domain.
pub fn matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) if !suffix.is_empty() => domain
            .strip_suffix(suffix)
            .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
        Some(_) => false,
        None => pattern == domain,
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> Vec<String> {
        vec!["allowed.com".into(), "*.example.com".into()]
    }

    #[test]
    fn empty_whitelist_allows_everything() {
        assert!(is_allowed(&[], "anything.org"));
    }

    #[test]
    fn exact_and_wildcard_matches() {
        let wl = whitelist();
        assert!(is_allowed(&wl, "allowed.com"));
        assert!(is_allowed(&wl, "api.example.com"));
        assert!(is_allowed(&wl, "sub.api.example.com"));
        assert!(!is_allowed(&wl, "blocked.com"));
    }

    #[test]
    fn wildcard_does_not_match_apex_or_lookalikes() {
        let wl = whitelist();
        assert!(!is_allowed(&wl, "example.com"));
        assert!(!is_allowed(&wl, "evilexample.com"));
        assert!(!is_allowed(&wl, ".example.com"));
        assert!(!is_allowed(&wl, "sub.allowed.com"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let wl = whitelist();
        assert!(is_allowed(&wl, "API.Example.COM"));
        assert!(is_allowed(&wl, "allowed.com."));
    }

    #[test]
    fn empty_domain_is_never_allowed_under_a_whitelist() {
        assert!(!is_allowed(&whitelist(), ""));
    }
}
