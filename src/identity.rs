//! Stable alert identity derivation.
//!
//! Every piece of per-alert state (the durable trigger flag and the volatile
//! hysteresis counters) is keyed by an [`AlertIdentity`]: a SHA-256 hash of
//! the rule's directory name and the optional per-match key. The hash is
//! deterministic across restarts, so state persisted under an identity is
//! found again as long as the rule directory is not renamed.

use sha2::{Digest, Sha256};

/// Stable, collision-resistant identifier for one logical alert.
///
/// Two different rules, or the same rule with two different match keys,
/// never collide short of a SHA-256 collision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertIdentity(String);

impl AlertIdentity {
    /// Derive the identity for a rule and an optional match key.
    ///
    /// An absent match key is treated identically to the empty string, so a
    /// rule that never sets a key and a hypothetical empty-key match share
    /// one identity space. That is deliberate.
    pub fn derive(rule_dir: &str, match_key: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(rule_dir.as_bytes());
        // NUL separator so ("ab", "c") and ("a", "bc") cannot collide.
        hasher.update([0u8]);
        hasher.update(match_key.unwrap_or("").as_bytes());
        AlertIdentity(hex::encode(hasher.finalize()))
    }

    /// Reconstruct an identity from its persisted string form.
    pub fn from_stored(s: String) -> Self {
        AlertIdentity(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AlertIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_identity() {
        let a = AlertIdentity::derive("cpu_high", Some("host-a"));
        let b = AlertIdentity::derive("cpu_high", Some("host-a"));
        assert_eq!(a, b);
    }

    #[test]
    fn different_match_keys_differ() {
        let a = AlertIdentity::derive("cpu_high", Some("host-a"));
        let b = AlertIdentity::derive("cpu_high", Some("host-b"));
        assert_ne!(a, b);
    }

    #[test]
    fn different_rules_differ() {
        let a = AlertIdentity::derive("cpu_high", Some("host-a"));
        let b = AlertIdentity::derive("disk_full", Some("host-a"));
        assert_ne!(a, b);
    }

    #[test]
    fn absent_key_equals_empty_key() {
        let a = AlertIdentity::derive("cpu_high", None);
        let b = AlertIdentity::derive("cpu_high", Some(""));
        assert_eq!(a, b);
    }

    #[test]
    fn separator_prevents_concatenation_collision() {
        let a = AlertIdentity::derive("ab", Some("c"));
        let b = AlertIdentity::derive("a", Some("bc"));
        assert_ne!(a, b);
    }

    #[test]
    fn identity_is_hex_sha256() {
        let id = AlertIdentity::derive("cpu_high", None);
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
