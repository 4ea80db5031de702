//! Mapping between logical certificate paths and store keys.
//!
//! Logical keys are slash-delimited paths such as
//! `acme/acme-v02.api.letsencrypt.org-directory/sites/example.com/example.com.crt`.
//! Physical keys are the same path under the configured namespace prefix.
//! Surrounding slashes are not significant: `/a/b/` and `a/b` name the same
//! key.
//!
//! Lock keys live in a sibling namespace, `<prefix>.locks/<logical>`. No
//! logical key maps into it, so a lock never shares a physical key with data
//! and never shows up in a listing.

use std::collections::BTreeSet;

/// Path separator for logical and physical keys.
pub const SEPARATOR: char = '/';

/// Suffix appended to the namespace prefix to form the lock namespace.
pub const LOCK_NAMESPACE_SUFFIX: &str = ".locks";

/// Strips surrounding separators from a logical key.
#[must_use]
pub fn normalize(logical: &str) -> &str {
    logical.trim_matches(SEPARATOR)
}

/// Returns `true` if `key` is `prefix` or lies below it.
///
/// Matching is by whole segments: `a/b` contains `a/b/c` but not `a/bc`.
/// The empty prefix contains every key.
#[must_use]
pub fn is_within(prefix: &str, key: &str) -> bool {
    let prefix = normalize(prefix);
    let key = normalize(key);
    if prefix.is_empty() {
        return true;
    }
    key.strip_prefix(prefix).is_some_and(|rest| rest.is_empty() || rest.starts_with(SEPARATOR))
}

/// Reduces logical keys below `prefix` to the distinct immediate children of
/// `prefix`, each as `prefix/child`.
///
/// Directory-like entries are synthesized here from the flat key set; no
/// directory marker is ever stored. Keys equal to `prefix` are skipped.
#[must_use]
pub fn immediate_children<'a>(prefix: &str, keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let prefix = normalize(prefix);
    let children: BTreeSet<String> = keys
        .into_iter()
        .filter(|key| is_within(prefix, key))
        .filter_map(|key| {
            let rest = normalize(&normalize(key)[prefix.len()..]);
            let child = rest.split(SEPARATOR).next().filter(|c| !c.is_empty())?;
            Some(if prefix.is_empty() { child.to_owned() } else { format!("{prefix}{SEPARATOR}{child}") })
        })
        .collect();
    children.into_iter().collect()
}

/// Maps logical keys into one namespace of the store.
///
/// # Example
///
/// ```
/// use certkv::KeySpace;
///
/// let keys = KeySpace::new("caddytls");
/// let physical = keys.to_physical("acme/example.com/sites/example.com/example.com.crt");
/// assert_eq!(physical, "caddytls/acme/example.com/sites/example.com/example.com.crt");
/// assert_eq!(
///     keys.to_logical(&physical),
///     Some("acme/example.com/sites/example.com/example.com.crt")
/// );
/// assert_eq!(keys.to_logical("other/acme"), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Creates a key space under `prefix`; surrounding separators are ignored.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self { prefix: normalize(&prefix).to_owned() }
    }

    /// Returns the namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Maps a logical key to its physical key.
    ///
    /// The empty logical key maps to the bare prefix.
    #[must_use]
    pub fn to_physical(&self, logical: &str) -> String {
        let logical = normalize(logical);
        if logical.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{SEPARATOR}{logical}", self.prefix)
        }
    }

    /// Maps a physical key back to its logical key.
    ///
    /// Returns `None` for keys outside this namespace.
    #[must_use]
    pub fn to_logical<'a>(&self, physical: &'a str) -> Option<&'a str> {
        let rest = physical.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            return Some(rest);
        }
        rest.strip_prefix(SEPARATOR)
    }

    /// Returns the physical lock key guarding a logical key.
    #[must_use]
    pub fn lock_key(&self, logical: &str) -> String {
        let logical = normalize(logical);
        let mut key = format!("{}{LOCK_NAMESPACE_SUFFIX}", self.prefix);
        if !logical.is_empty() {
            key.push(SEPARATOR);
            key.push_str(logical);
        }
        key
    }

    /// Returns `true` if a physical key lies in this key space's lock
    /// namespace.
    #[must_use]
    pub fn is_lock_key(&self, physical: &str) -> bool {
        physical
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(LOCK_NAMESPACE_SUFFIX))
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(SEPARATOR))
    }

    /// Translates physical keys from a raw store listing into the logical
    /// keys within `logical_prefix`, dropping keys outside the namespace
    /// (lock keys among them) and raw prefix matches that do not fall on a
    /// segment boundary.
    pub fn logical_keys_within<'a>(
        &self,
        logical_prefix: &'a str,
        physical: &'a [String],
    ) -> impl Iterator<Item = &'a str> + 'a {
        let namespace = self.clone();
        physical
            .iter()
            .filter_map(move |key| namespace.to_logical(key))
            .filter(move |key| is_within(logical_prefix, key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::plain("a/b", "caddytls/a/b")]
    #[case::leading_slash("/a/b", "caddytls/a/b")]
    #[case::trailing_slash("a/b/", "caddytls/a/b")]
    #[case::empty("", "caddytls")]
    fn to_physical_cases(#[case] logical: &str, #[case] physical: &str) {
        assert_eq!(KeySpace::new("caddytls").to_physical(logical), physical);
    }

    #[test]
    fn prefix_slashes_are_ignored() {
        assert_eq!(KeySpace::new("/tenant/certs/"), KeySpace::new("tenant/certs"));
    }

    #[rstest]
    #[case::inside("caddytls/a", Some("a"))]
    #[case::bare_prefix("caddytls", Some(""))]
    #[case::sibling_namespace("caddytlsx/a", None)]
    #[case::foreign("other/a", None)]
    fn to_logical_cases(#[case] physical: &str, #[case] logical: Option<&str>) {
        assert_eq!(KeySpace::new("caddytls").to_logical(physical), logical);
    }

    #[test]
    fn lock_key_lives_in_lock_namespace() {
        let keys = KeySpace::new("caddytls");
        let lock = keys.lock_key("/acme/example.com/sites/example.com/");
        assert_eq!(lock, "caddytls.locks/acme/example.com/sites/example.com");
        assert!(keys.is_lock_key(&lock));
        assert_eq!(keys.to_logical(&lock), None);
    }

    #[test]
    fn data_key_ending_in_lock_is_not_a_lock_key() {
        let keys = KeySpace::new("caddytls");
        let data = keys.to_physical("acme/site.lock");

        assert!(!keys.is_lock_key(&data));
        assert_ne!(data, keys.lock_key("acme/site"));
        assert!(!keys.is_lock_key("caddytls.lockstep/a"));
    }

    #[rstest]
    #[case::equal("a/b", "a/b", true)]
    #[case::child("a/b", "a/b/c", true)]
    #[case::sibling_with_common_text("a/b", "a/bc", false)]
    #[case::parent("a/b", "a", false)]
    #[case::empty_prefix("", "x/y", true)]
    #[case::slashes_ignored("/a/b/", "a/b/c", true)]
    fn is_within_cases(#[case] prefix: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(is_within(prefix, key), expected);
    }

    #[test]
    fn immediate_children_deduplicates() {
        let keys = ["a/b/x", "a/b/y/z", "a/b/y/w", "a/bc/q", "a/b"];
        assert_eq!(immediate_children("a/b", keys), vec!["a/b/x", "a/b/y"]);
        assert_eq!(immediate_children("a", keys), vec!["a/b", "a/bc"]);
        assert_eq!(immediate_children("", keys), vec!["a"]);
    }

    #[test]
    fn logical_keys_within_filters_locks_and_boundaries() {
        let keys = KeySpace::new("caddytls");
        let physical: Vec<String> = [
            "caddytls/a/b/one.crt",
            "caddytls.locks/a/b/one.crt",
            "caddytls/a/bc/two.crt",
            "caddytlsx/a/b/three.crt",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        let logical: Vec<&str> = keys.logical_keys_within("a/b", &physical).collect();
        assert_eq!(logical, vec!["a/b/one.crt"]);
    }

    fn arb_logical_key() -> impl Strategy<Value = String> {
        "[a-z0-9.-]{1,8}(/[a-z0-9.-]{1,8}){0,4}"
    }

    proptest! {
        /// Mapping a normalized logical key to physical and back recovers it exactly.
        #[test]
        fn physical_logical_round_trip(key in arb_logical_key(), prefix in "[a-z]{1,6}(/[a-z]{1,6}){0,2}") {
            let keys = KeySpace::new(prefix);
            let physical = keys.to_physical(&key);
            prop_assert_eq!(keys.to_logical(&physical), Some(key.as_str()));
        }

        /// No lock key coincides with any data key.
        #[test]
        fn lock_keys_never_collide_with_data(a in arb_logical_key(), b in arb_logical_key()) {
            let keys = KeySpace::new("caddytls");
            let lock = keys.lock_key(&a);
            prop_assert_ne!(&lock, &keys.to_physical(&b));
            prop_assert_eq!(keys.to_logical(&lock), None);
        }

        /// Distinct normalized logical keys map to distinct physical keys.
        #[test]
        fn mapping_is_injective(a in arb_logical_key(), b in arb_logical_key()) {
            let keys = KeySpace::new("caddytls");
            prop_assert_eq!(a == b, keys.to_physical(&a) == keys.to_physical(&b));
        }

        /// Every synthesized child is exactly one segment below the prefix and
        /// is a prefix of at least one input key.
        #[test]
        fn children_are_one_level_deep(
            keys in proptest::collection::vec(arb_logical_key(), 0..30),
            prefix in "[a-z0-9.-]{0,3}",
        ) {
            let children = immediate_children(&prefix, keys.iter().map(String::as_str));
            let depth = if prefix.is_empty() { 0 } else { prefix.split('/').count() };
            for child in &children {
                prop_assert_eq!(child.split('/').count(), depth + 1);
                prop_assert!(keys.iter().any(|k| is_within(child, k)));
            }
        }
    }
}
