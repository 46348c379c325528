//! SF-014: BLAKE3 hashing of canonical resource inputs.
//!
//! Hashes are `"blake3:{hex}"`. Inputs hash over their canonical JSON form:
//! map keys are sorted (every map is a `BTreeMap`), so two equal property
//! sets always hash the same regardless of declaration order.

use crate::core::types::{Properties, Value};

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Canonical JSON encoding of a property set.
pub fn canonical(props: &Properties) -> String {
    Value::Map(props.clone()).to_string()
}

/// Hash a resource's resolved inputs together with its type, so that a type
/// change never compares equal.
pub fn hash_properties(resource_type: &str, props: &Properties) -> String {
    composite_hash(&[resource_type, &canonical(props)])
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}
