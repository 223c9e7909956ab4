//! Sensitive-key/header redaction (spec §4.1, §6), applied on read only.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

static SENSITIVE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)token|key|secret|password|auth|credential|api.?key").expect("valid redaction regex")
});

pub fn is_sensitive_name(name: &str) -> bool {
    SENSITIVE_PATTERN.is_match(name)
}

pub fn redact_variables(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    vars.iter()
        .map(|(k, v)| {
            if is_sensitive_name(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            if is_sensitive_name(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_common_sensitive_names() {
        for name in ["Authorization", "X-Api-Key", "password", "secretToken", "Credential-Id"] {
            assert!(is_sensitive_name(name), "{name} should be sensitive");
        }
    }

    #[test]
    fn leaves_ordinary_names_alone() {
        for name in ["Content-Type", "X-Request-Id", "foo"] {
            assert!(!is_sensitive_name(name), "{name} should not be sensitive");
        }
    }

    #[test]
    fn redacts_only_matching_variables() {
        let mut vars = BTreeMap::new();
        vars.insert("api_key".to_string(), "sk-123".to_string());
        vars.insert("base_url".to_string(), "https://example.com".to_string());
        let redacted = redact_variables(&vars);
        assert_eq!(redacted["api_key"], REDACTED);
        assert_eq!(redacted["base_url"], "https://example.com");
    }
}
