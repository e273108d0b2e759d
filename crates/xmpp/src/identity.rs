//! Identifier generation for sessions and outbound stanzas.

use rand::Rng;
use rand::distr::Alphanumeric;
use uuid::Uuid;

/// Client version tag embedded in generated resources.
pub const CLIENT_VERSION: &str = "0.1";

/// Length of the random resource suffix.
const RESOURCE_SUFFIX_LEN: usize = 8;

/// Mints the identifiers a session needs: the full-JID resource and
/// correlation ids for outbound stanzas. Each engine owns exactly one
/// generator; the random base is fixed for the generator's lifetime
/// and the counter only moves forward.
#[derive(Debug)]
pub struct IdentityGenerator {
    random_base: String,
    counter: u64,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self {
            random_base: Uuid::new_v4().to_string(),
            counter: 0,
        }
    }

    /// Builds a full JID from a bare JID by appending a generated
    /// resource of the form `node_{version}_{8 random alphanumerics}`.
    pub fn full_jid(&self, bare_jid: &str) -> String {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(RESOURCE_SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!("{bare_jid}/node_{CLIENT_VERSION}_{suffix}")
    }

    /// Returns the next correlation id, `node_{base}{counter}`. Ids
    /// from one generator never repeat and their counters strictly
    /// increase.
    pub fn correlation_id(&mut self) -> String {
        let id = format!("node_{}{}", self.random_base, self.counter);
        self.counter += 1;
        id
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jid_appends_versioned_resource() {
        let generator = IdentityGenerator::new();
        let full = generator.full_jid("alice@example.com");
        let (bare, resource) = full.split_once('/').expect("resource separator");
        assert_eq!(bare, "alice@example.com");
        let suffix = resource.strip_prefix("node_0.1_").expect("resource prefix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn resource_suffixes_vary_between_calls() {
        let generator = IdentityGenerator::new();
        assert_ne!(
            generator.full_jid("alice@example.com"),
            generator.full_jid("alice@example.com")
        );
    }

    #[test]
    fn correlation_ids_count_up_from_zero() {
        let mut generator = IdentityGenerator::new();
        let base = generator.random_base.clone();
        assert_eq!(generator.correlation_id(), format!("node_{base}0"));
        assert_eq!(generator.correlation_id(), format!("node_{base}1"));
        assert_eq!(generator.correlation_id(), format!("node_{base}2"));
    }

    #[test]
    fn correlation_ids_never_repeat() {
        let mut generator = IdentityGenerator::new();
        let ids: Vec<String> = (0..100).map(|_| generator.correlation_id()).collect();
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
    }
}
