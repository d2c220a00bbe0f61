//! Method and topic name grammar.
//!
//! Method names are `namespace:action` (at least two segments); topic
//! names are one or more colon-separated segments. Both are capped at
//! [`MAX_NAME_LENGTH`](crate::MAX_NAME_LENGTH) characters. Registration
//! additionally rejects the reserved namespaces.

use std::sync::LazyLock;

use regex::Regex;

use crate::limits::{MAX_NAME_LENGTH, RESERVED_NAMESPACES};
use crate::validate::Validation;

static METHOD_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*(?::[a-zA-Z][a-zA-Z0-9_]*)+$").unwrap()
});

static TOPIC_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*(?::[a-zA-Z][a-zA-Z0-9_]*)*$").unwrap()
});

/// The namespace (first segment) of a method name, if it has one.
pub fn method_namespace(name: &str) -> Option<&str> {
    name.split(':').next().filter(|ns| !ns.is_empty())
}

/// Whether a method name's namespace is reserved for kernel use.
pub fn is_reserved_namespace(name: &str) -> bool {
    method_namespace(name)
        .map(|ns| RESERVED_NAMESPACES.contains(&ns))
        .unwrap_or(false)
}

/// Grammar-only check of a method name (length + shape).
///
/// This is the check applied to inbound frames: a peer's kernel may
/// legitimately address reserved namespaces of its counterpart.
pub fn validate_method_grammar(name: &str) -> Validation {
    let mut v = Validation::ok();
    if name.len() > MAX_NAME_LENGTH {
        v.push(format!(
            "method: name exceeds {} characters",
            MAX_NAME_LENGTH
        ));
    }
    if !METHOD_NAME_RE.is_match(name) {
        v.push(format!(
            "method: '{}' does not match namespace:action grammar",
            name
        ));
    }
    v
}

/// Full method-name check used at registration time: grammar plus the
/// reserved-namespace rejection.
pub fn validate_method_name(name: &str) -> Validation {
    let mut v = validate_method_grammar(name);
    if is_reserved_namespace(name) {
        v.push(format!(
            "method: namespace '{}' is reserved",
            method_namespace(name).unwrap_or_default()
        ));
    }
    v
}

/// Check a topic name (length + shape).
pub fn validate_topic_name(name: &str) -> Validation {
    let mut v = Validation::ok();
    if name.len() > MAX_NAME_LENGTH {
        v.push(format!("topic: name exceeds {} characters", MAX_NAME_LENGTH));
    }
    if !TOPIC_NAME_RE.is_match(name) {
        v.push(format!("topic: '{}' is not a valid topic name", name));
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_need_two_segments() {
        assert!(validate_method_name("users:getProfile").is_valid());
        assert!(validate_method_name("a:b:c").is_valid());
        assert!(!validate_method_name("users").is_valid());
        assert!(!validate_method_name("").is_valid());
    }

    #[test]
    fn method_segments_start_with_letter() {
        assert!(!validate_method_name("1users:get").is_valid());
        assert!(!validate_method_name("users:1get").is_valid());
        assert!(validate_method_name("users:get_profile").is_valid());
        assert!(!validate_method_name("users:get-profile").is_valid());
        assert!(!validate_method_name("users:").is_valid());
        assert!(!validate_method_name(":get").is_valid());
    }

    #[test]
    fn reserved_namespaces_rejected_for_registration() {
        for ns in ["system", "internal", "stream", "helios"] {
            let name = format!("{}:anything", ns);
            assert!(!validate_method_name(&name).is_valid(), "{}", name);
            // Grammar alone accepts them; only registration refuses.
            assert!(validate_method_grammar(&name).is_valid(), "{}", name);
        }
        assert!(validate_method_name("systems:anything").is_valid());
    }

    #[test]
    fn length_cap_applies() {
        let long = format!("ns:{}", "a".repeat(MAX_NAME_LENGTH));
        assert!(!validate_method_name(&long).is_valid());
        assert!(!validate_topic_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_valid());
    }

    #[test]
    fn topic_names_allow_single_segment() {
        assert!(validate_topic_name("user").is_valid());
        assert!(validate_topic_name("user:presence").is_valid());
        assert!(validate_topic_name("data:sync:end").is_valid());
        assert!(!validate_topic_name("user:").is_valid());
        assert!(!validate_topic_name("user:*").is_valid());
        assert!(!validate_topic_name("9live").is_valid());
    }
}
