//! Deterministic names for governor-managed objects
//!
//! Every name produced here is a pure function of its inputs. Independent
//! processes (the quota evaluator, the usage tracker that materialises
//! buckets, a restarted controller) must all arrive at the same name, so the
//! hashing and encoding rules are fixed and must not change.

use std::collections::BTreeMap;
use std::fmt::Write;

use aws_lc_rs::digest;

use crate::crd::RoleReference;
use crate::Result;

/// Prefix of every AllowanceBucket name
pub const BUCKET_PREFIX: &str = "bucket-";

/// Total length of an AllowanceBucket name
pub const BUCKET_NAME_LEN: usize = 19;

/// Prefix of the namespace that holds an organization's memberships
pub const ORGANIZATION_NAMESPACE_PREFIX: &str = "organization-";

/// Prefix of the binding that lets a user delete their own membership
pub const SELF_DELETE_BINDING_PREFIX: &str = "usermembership-self-delete-";

/// Lowercase hex SHA-256 of `input`
pub fn sha256_hex(input: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Compact JSON for a dimension map with sorted keys.
///
/// The output matches what the bucket producers emit: `<`, `>`, `&`, U+2028
/// and U+2029 are written as `\u` escapes. Absent dimensions are `null`,
/// while an explicitly empty map is `{}`, so the two name different buckets.
pub fn canonical_dimensions_json(dimensions: Option<&BTreeMap<String, String>>) -> Result<String> {
    let Some(dimensions) = dimensions else {
        return Ok("null".to_string());
    };
    let json = serde_json::to_string(dimensions)?;
    // These characters never appear in JSON structure, only inside strings
    Ok(json
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029"))
}

/// Name of the AllowanceBucket tracking `(namespace, resource_type, dimensions)`
pub fn bucket_name(
    namespace: &str,
    resource_type: &str,
    dimensions: Option<&BTreeMap<String, String>>,
) -> Result<String> {
    let dimensions_json = canonical_dimensions_json(dimensions)?;
    let input = format!("{namespace}{resource_type}{dimensions_json}");
    let mut name = format!("{BUCKET_PREFIX}{}", sha256_hex(input.as_bytes()));
    name.truncate(BUCKET_NAME_LEN);
    Ok(name)
}

/// `namespace/name` key identifying a role, with the namespace defaulted
pub fn role_key(role: &RoleReference, default_namespace: &str) -> String {
    format!("{}/{}", role.resolved_namespace(default_namespace), role.name)
}

/// Name of the managed PolicyBinding granting `role_key` through `membership`
pub fn binding_name(membership: &str, role_key: &str) -> String {
    format!("{membership}-{}", sha256_hex(role_key.as_bytes()))
}

/// Namespace holding the memberships of `organization`
pub fn organization_namespace(organization: &str) -> String {
    format!("{ORGANIZATION_NAMESPACE_PREFIX}{organization}")
}

/// Organization owning `namespace`, if it is an organization namespace
pub fn organization_for_namespace(namespace: &str) -> Option<&str> {
    namespace
        .strip_prefix(ORGANIZATION_NAMESPACE_PREFIX)
        .filter(|org| !org.is_empty())
}

/// Name of the self-delete binding for `user`
pub fn self_delete_binding_name(user: &str) -> String {
    format!("{SELF_DELETE_BINDING_PREFIX}{user}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ==========================================================================
    // Story Tests: Bucket naming is shared with the usage tracker
    // ==========================================================================

    /// Story: The evaluator and the usage tracker agree on bucket names
    ///
    /// Both sides compute the name from the same tuple, so the evaluator can
    /// read a bucket it never created.
    #[test]
    fn story_bucket_name_is_deterministic() {
        let d = dims(&[("env", "prod"), ("region", "us-east")]);
        let first = bucket_name("organization-acme", "compute_cpu", Some(&d)).unwrap();
        let second = bucket_name("organization-acme", "compute_cpu", Some(&d)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), BUCKET_NAME_LEN);
        assert!(first.starts_with(BUCKET_PREFIX));
        assert!(first[BUCKET_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// Story: Insertion order of dimensions does not leak into the name
    #[test]
    fn story_bucket_name_ignores_key_order() {
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), "1".to_string());
        forward.insert("b".to_string(), "2".to_string());
        let mut reverse = BTreeMap::new();
        reverse.insert("b".to_string(), "2".to_string());
        reverse.insert("a".to_string(), "1".to_string());

        assert_eq!(
            bucket_name("ns", "t", Some(&forward)).unwrap(),
            bucket_name("ns", "t", Some(&reverse)).unwrap()
        );
    }

    /// Story: Any change to the tuple yields a different bucket
    #[test]
    fn story_bucket_name_distinguishes_tuples() {
        let prod = dims(&[("env", "prod")]);
        let staging = dims(&[("env", "staging")]);
        let base = bucket_name("ns", "t", Some(&prod)).unwrap();

        assert_ne!(base, bucket_name("ns", "t", Some(&staging)).unwrap());
        assert_ne!(base, bucket_name("other", "t", Some(&prod)).unwrap());
        assert_ne!(base, bucket_name("ns", "u", Some(&prod)).unwrap());
        assert_ne!(base, bucket_name("ns", "t", None).unwrap());
    }

    #[test]
    fn bucket_name_hashes_namespace_type_and_json() {
        let d = dims(&[("env", "prod")]);
        let expected_hash = sha256_hex(br#"nscompute_cpu{"env":"prod"}"#);
        let expected = format!("bucket-{}", &expected_hash[..12]);
        assert_eq!(bucket_name("ns", "compute_cpu", Some(&d)).unwrap(), expected);
    }

    #[test]
    fn absent_dimensions_encode_as_null() {
        assert_eq!(canonical_dimensions_json(None).unwrap(), "null");
        let expected = format!("bucket-{}", &sha256_hex(b"nstnull")[..12]);
        assert_eq!(bucket_name("ns", "t", None).unwrap(), expected);
    }

    /// Story: A claim sent with `dimensions: {}` lands in the `{}` bucket
    ///
    /// Producers hash an explicitly empty map as `{}` and a missing one as
    /// `null`; reading a claim must keep that distinction or usage is looked
    /// up in the wrong bucket.
    #[test]
    fn story_empty_dimensions_differ_from_absent() {
        let empty = BTreeMap::new();
        assert_eq!(canonical_dimensions_json(Some(&empty)).unwrap(), "{}");

        let expected = format!("bucket-{}", &sha256_hex(b"nst{}")[..12]);
        assert_eq!(bucket_name("ns", "t", Some(&empty)).unwrap(), expected);
        assert_ne!(
            bucket_name("ns", "t", Some(&empty)).unwrap(),
            bucket_name("ns", "t", None).unwrap()
        );
    }

    #[test]
    fn canonical_json_sorts_keys_and_is_compact() {
        let d = dims(&[("zone", "b"), ("env", "prod")]);
        assert_eq!(
            canonical_dimensions_json(Some(&d)).unwrap(),
            r#"{"env":"prod","zone":"b"}"#
        );
    }

    #[test]
    fn canonical_json_escapes_html_sensitive_characters() {
        let d = dims(&[("expr", "a<b>&c\u{2028}d\u{2029}")]);
        assert_eq!(
            canonical_dimensions_json(Some(&d)).unwrap(),
            r#"{"expr":"a\u003cb\u003e\u0026c\u2028d\u2029"}"#
        );
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    // ==========================================================================
    // Membership naming
    // ==========================================================================

    #[test]
    fn role_key_defaults_namespace() {
        let explicit = RoleReference::new("owner", Some("milo-system"));
        let implicit = RoleReference::new("viewer", None);
        assert_eq!(role_key(&explicit, "organization-acme"), "milo-system/owner");
        assert_eq!(role_key(&implicit, "organization-acme"), "organization-acme/viewer");
    }

    #[test]
    fn binding_name_embeds_membership_and_full_hash() {
        let name = binding_name("alice", "milo-system/owner");
        assert!(name.starts_with("alice-"));
        assert_eq!(name.len(), "alice-".len() + 64);
        assert_eq!(name, binding_name("alice", "milo-system/owner"));
        assert_ne!(name, binding_name("alice", "milo-system/viewer"));
    }

    #[test]
    fn organization_namespace_round_trips() {
        let ns = organization_namespace("acme");
        assert_eq!(ns, "organization-acme");
        assert_eq!(organization_for_namespace(&ns), Some("acme"));
        assert_eq!(organization_for_namespace("default"), None);
        assert_eq!(organization_for_namespace("organization-"), None);
    }

    #[test]
    fn self_delete_binding_is_per_user() {
        assert_eq!(
            self_delete_binding_name("alice"),
            "usermembership-self-delete-alice"
        );
    }
}
