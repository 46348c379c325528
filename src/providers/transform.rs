//! SF-007: Manifest transforms.
//!
//! A transform is a pure `Value -> Value` rewrite applied to a resource's
//! resolved inputs before they are submitted to its provider. Transforms run
//! in declared order; a failing transform fails the operation.

use crate::core::error::ProviderError;
use crate::core::types::{Properties, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A named manifest rewrite.
pub type Transform = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Key under which a chart-like resource carries its rendered objects.
pub const MANIFESTS_KEY: &str = "manifests";

/// Built-in transforms, by name.
pub fn builtin() -> BTreeMap<String, Transform> {
    let mut table: BTreeMap<String, Transform> = BTreeMap::new();
    table.insert(
        "strip-crd-status".to_string(),
        Arc::new(|v: Value| -> Result<Value, String> {
            Ok(for_each_object(v, &strip_crd_status))
        }),
    );
    table
}

/// Remove `status` from a `CustomResourceDefinition` object.
pub fn strip_crd_status(object: Value) -> Value {
    match object {
        Value::Map(mut map) => {
            if map.get("kind").and_then(Value::as_str) == Some("CustomResourceDefinition") {
                map.remove("status");
            }
            Value::Map(map)
        }
        other => other,
    }
}

/// Apply `f` to the manifest itself and to every object in its
/// `manifests` list.
fn for_each_object(manifest: Value, f: &dyn Fn(Value) -> Value) -> Value {
    match f(manifest) {
        Value::Map(mut map) => {
            if let Some(Value::List(objects)) = map.remove(MANIFESTS_KEY) {
                map.insert(
                    MANIFESTS_KEY.to_string(),
                    Value::List(objects.into_iter().map(f).collect()),
                );
            }
            Value::Map(map)
        }
        other => other,
    }
}

/// Run `names` in order over `inputs`.
pub fn apply_all(
    table: &BTreeMap<String, Transform>,
    names: &[String],
    inputs: Properties,
) -> Result<Properties, ProviderError> {
    let mut manifest = Value::Map(inputs);
    for name in names {
        let transform = table
            .get(name)
            .ok_or_else(|| ProviderError::UnknownTransform { name: name.clone() })?;
        manifest = transform(manifest)
            .map_err(|message| ProviderError::operation(format!("transform '{}'", name), message))?;
    }
    match manifest {
        Value::Map(map) => Ok(map),
        other => Err(ProviderError::operation(
            "transform",
            format!("manifest must remain a mapping, got {}", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(kind: &str, with_status: bool) -> Value {
        let mut m = BTreeMap::new();
        m.insert("kind".to_string(), Value::from(kind));
        if with_status {
            m.insert("status".to_string(), Value::from("Established"));
        }
        Value::Map(m)
    }

    #[test]
    fn test_sf007_strip_crd_status() {
        let out = strip_crd_status(obj("CustomResourceDefinition", true));
        assert!(out.as_map().unwrap().get("status").is_none());
    }

    #[test]
    fn test_sf007_strip_leaves_other_kinds() {
        let out = strip_crd_status(obj("Deployment", true));
        assert!(out.as_map().unwrap().contains_key("status"));
    }

    #[test]
    fn test_sf007_strip_without_status_is_noop() {
        let input = obj("CustomResourceDefinition", false);
        assert_eq!(strip_crd_status(input.clone()), input);
    }

    #[test]
    fn test_sf007_builtin_reaches_chart_manifests() {
        let mut inputs = Properties::new();
        inputs.insert("chart".to_string(), Value::from("aws-load-balancer-controller"));
        inputs.insert(
            MANIFESTS_KEY.to_string(),
            Value::List(vec![
                obj("CustomResourceDefinition", true),
                obj("Service", true),
            ]),
        );
        let out = apply_all(&builtin(), &["strip-crd-status".to_string()], inputs).unwrap();
        let Some(Value::List(objects)) = out.get(MANIFESTS_KEY) else {
            panic!("manifests lost");
        };
        assert!(!objects[0].as_map().unwrap().contains_key("status"));
        assert!(objects[1].as_map().unwrap().contains_key("status"));
        assert_eq!(out["chart"], Value::from("aws-load-balancer-controller"));
    }

    #[test]
    fn test_sf007_transforms_run_in_order() {
        let mut table = builtin();
        table.insert(
            "set-a".to_string(),
            Arc::new(|v: Value| -> Result<Value, String> {
                let mut m = match v {
                    Value::Map(m) => m,
                    other => return Ok(other),
                };
                m.insert("a".to_string(), Value::from("first"));
                Ok(Value::Map(m))
            }),
        );
        table.insert(
            "upper-a".to_string(),
            Arc::new(|v: Value| -> Result<Value, String> {
                let mut m = match v {
                    Value::Map(m) => m,
                    other => return Ok(other),
                };
                let upper = m
                    .get("a")
                    .and_then(Value::as_str)
                    .ok_or("no a")?
                    .to_uppercase();
                m.insert("a".to_string(), Value::from(upper));
                Ok(Value::Map(m))
            }),
        );

        let names = ["set-a".to_string(), "upper-a".to_string()];
        let out = apply_all(&table, &names, Properties::new()).unwrap();
        assert_eq!(out["a"], Value::from("FIRST"));

        let reversed = ["upper-a".to_string(), "set-a".to_string()];
        assert!(apply_all(&table, &reversed, Properties::new()).is_err());
    }

    #[test]
    fn test_sf007_unknown_transform() {
        let err = apply_all(&builtin(), &["nope".to_string()], Properties::new()).unwrap_err();
        assert_eq!(err, ProviderError::UnknownTransform { name: "nope".into() });
    }
}
