//! SF-002: Stack file parsing, validation and graph construction.
//!
//! Validation collects every structural problem at once:
//! - Version must be "1.0"
//! - Stack and resource names must be usable as path segments
//! - depends_on, parent and `${res.key}` references must exist
//! - A `provider` must name a declared `providers:<package>` resource
//! - Resource types need a provider, transforms must be registered
//!
//! Strings are expanded in two passes. `{{config.key}}` is substituted at
//! parse time; `${res.key}` becomes a reference when it is the whole string
//! and an interpolated derived output otherwise. `$${` escapes a literal `${`.

use super::error::ParseError;
use super::graph::{Graph, GraphBuilder};
use super::output::{Output, OutputResolver};
use super::types::{
    yaml_key_to_string, Input, OutputRef, ResourceDecl, ResourceOptions, ResourceSpec, StackFile,
    Value,
};
use crate::providers::{provider_package, ProviderRegistry};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\$?)\$\{([A-Za-z0-9_][A-Za-z0-9_-]*)\.([A-Za-z0-9_][A-Za-z0-9_./-]*)\}")
        .unwrap_or_else(|e| unreachable!("reference pattern: {}", e))
});

/// Parse a stack file from disk.
pub fn parse_stack_file(path: &Path) -> Result<StackFile, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_stack(&content)
}

/// Parse a stack file from a string.
pub fn parse_stack(yaml: &str) -> Result<StackFile, ParseError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Apply `key=value` overrides to the config section. Values are read as
/// YAML scalars, so `replicas=3` is a number.
pub fn apply_config_overrides(stack: &mut StackFile, overrides: &[(String, String)]) {
    for (key, raw) in overrides {
        let value = serde_yaml_ng::from_str(raw)
            .unwrap_or_else(|_| serde_yaml_ng::Value::String(raw.clone()));
        stack.config.insert(key.clone(), value);
    }
}

/// Parse a `key=value` CLI argument.
pub fn parse_override(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", arg)),
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a parsed stack. Returns a list of errors (empty = valid).
pub fn validate_stack(stack: &StackFile, providers: &ProviderRegistry) -> Vec<String> {
    let mut errors = Vec::new();

    if stack.version != "1.0" {
        errors.push(format!("version must be \"1.0\", got \"{}\"", stack.version));
    }
    if !valid_name(&stack.name) {
        errors.push(format!(
            "stack name '{}' must be non-empty and use only [A-Za-z0-9_-]",
            stack.name
        ));
    }
    if stack.policy.parallelism == 0 {
        errors.push("policy.parallelism must be at least 1".to_string());
    }

    for (position, (id, resource)) in stack.resources.iter().enumerate() {
        if !valid_name(id) {
            errors.push(format!("resource name '{}' must use only [A-Za-z0-9_-]", id));
        }
        if let Err(e) = providers.provider_for(&resource.resource_type) {
            errors.push(format!("resource '{}': {}", id, e));
        }

        for dep in &resource.depends_on {
            if dep == id {
                errors.push(format!("resource '{}' depends on itself", id));
            } else if !stack.resources.contains_key(dep) {
                errors.push(format!("resource '{}' depends on unknown resource '{}'", id, dep));
            }
        }

        if let Some(parent) = &resource.parent {
            match stack.resources.get_index_of(parent) {
                None => errors.push(format!("resource '{}' has unknown parent '{}'", id, parent)),
                Some(p) if p >= position => errors.push(format!(
                    "resource '{}': parent '{}' must be declared before it",
                    id, parent
                )),
                Some(_) => {}
            }
        }

        if let Some(provider) = &resource.provider {
            let is_instance = stack
                .resources
                .get(provider)
                .is_some_and(|p| provider_package(&p.resource_type).is_some());
            if !is_instance {
                errors.push(format!(
                    "resource '{}': provider '{}' must be a declared providers:<package> resource",
                    id, provider
                ));
            }
        }

        for name in &resource.transforms {
            if !providers.has_transform(name) {
                errors.push(format!("resource '{}' uses unknown transform '{}'", id, name));
            }
        }

        for value in resource.inputs.values() {
            for r in references_in(value) {
                if !stack.resources.contains_key(&r.resource) {
                    errors.push(format!(
                        "resource '{}' references unknown resource '{}'",
                        id, r.resource
                    ));
                }
            }
        }
    }

    for (name, value) in &stack.outputs {
        for r in references_in(value) {
            if !stack.resources.contains_key(&r.resource) {
                errors.push(format!(
                    "output '{}' references unknown resource '{}'",
                    name, r.resource
                ));
            }
        }
    }

    errors
}

/// Every unescaped `${res.key}` in a YAML value.
fn references_in(value: &serde_yaml_ng::Value) -> Vec<OutputRef> {
    match value {
        serde_yaml_ng::Value::String(s) => REFERENCE
            .captures_iter(s)
            .filter(|c| c[1].is_empty())
            .map(|c| OutputRef {
                resource: c[2].to_string(),
                key: c[3].to_string(),
            })
            .collect(),
        serde_yaml_ng::Value::Sequence(items) => items.iter().flat_map(references_in).collect(),
        serde_yaml_ng::Value::Mapping(map) => map.values().flat_map(references_in).collect(),
        serde_yaml_ng::Value::Tagged(tagged) => references_in(&tagged.value),
        _ => Vec::new(),
    }
}

/// Substitute `{{config.key}}` templates in a string.
pub fn resolve_config_template(
    template: &str,
    config: &BTreeMap<String, Value>,
) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let path = key
            .strip_prefix("config.")
            .ok_or_else(|| format!("unknown template variable: {}", key))?;
        let value = lookup_config(config, path)
            .map(Value::render)
            .ok_or_else(|| format!("unknown config key: {}", path))?;

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

fn lookup_config<'a>(config: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = config.get(path) {
        return Some(v);
    }
    let (head, rest) = path.split_once('.')?;
    config.get(head)?.lookup_path(rest)
}

/// Turns stack-file values into declaration inputs.
struct Expander<'a> {
    config: BTreeMap<String, Value>,
    resolver: &'a OutputResolver,
}

impl Expander<'_> {
    fn input(&self, location: &str, value: &serde_yaml_ng::Value) -> Result<Input, ParseError> {
        match value {
            serde_yaml_ng::Value::String(s) => self.string(location, s),
            serde_yaml_ng::Value::Sequence(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| self.input(&format!("{}[{}]", location, i), v))
                .collect::<Result<Vec<_>, _>>()
                .map(Input::List),
            serde_yaml_ng::Value::Mapping(map) => map
                .iter()
                .map(|(k, v)| {
                    let key = yaml_key_to_string(k);
                    let input = self.input(&format!("{}.{}", location, key), v)?;
                    Ok((key, input))
                })
                .collect::<Result<BTreeMap<_, _>, ParseError>>()
                .map(Input::Map),
            serde_yaml_ng::Value::Tagged(tagged) => self.input(location, &tagged.value),
            scalar => Ok(Input::Literal(Value::from(scalar.clone()))),
        }
    }

    fn string(&self, location: &str, raw: &str) -> Result<Input, ParseError> {
        let text = resolve_config_template(raw, &self.config).map_err(|message| {
            ParseError::Template {
                location: location.to_string(),
                message,
            }
        })?;

        // Whole-string reference keeps the referenced value's type.
        if let Some(c) = REFERENCE.captures(&text) {
            if c[1].is_empty() && c[0].len() == text.len() {
                return Ok(Input::reference(&c[2], &c[3]));
            }
        }

        let mut literals: Vec<String> = Vec::new();
        let mut sources: Vec<Output> = Vec::new();
        let mut current = String::new();
        let mut last = 0;
        for c in REFERENCE.captures_iter(&text) {
            let whole = c.get(0).map_or(0..0, |m| m.range());
            current.push_str(&text[last..whole.start]);
            last = whole.end;
            if !c[1].is_empty() {
                current.push_str(&c[0][1..]);
                continue;
            }
            literals.push(std::mem::take(&mut current));
            sources.push(self.resolver.source(&c[2], &c[3]));
        }
        current.push_str(&text[last..]);

        if sources.is_empty() {
            return Ok(Input::Literal(Value::from(current)));
        }
        literals.push(current);
        let combined = self.resolver.all(&sources);
        Ok(Input::Output(self.resolver.apply(combined, move |v| {
            interpolate(&literals, v)
        })))
    }
}

/// Interleave literal segments with rendered values: `l0 v0 l1 v1 ... ln`.
fn interpolate(literals: &[String], values: &Value) -> Result<Value, String> {
    let Value::List(values) = values else {
        return Err("interpolation expects a list of values".to_string());
    };
    let mut out = String::new();
    for (i, literal) in literals.iter().enumerate() {
        out.push_str(literal);
        if let Some(v) = values.get(i) {
            out.push_str(&v.render());
        }
    }
    Ok(Value::from(out))
}

fn declaration(
    expander: &Expander<'_>,
    name: &str,
    spec: &ResourceSpec,
) -> Result<ResourceDecl, ParseError> {
    let inputs = spec
        .inputs
        .iter()
        .map(|(key, value)| {
            let input = expander.input(&format!("{}.{}", name, key), value)?;
            Ok((key.clone(), input))
        })
        .collect::<Result<BTreeMap<_, _>, ParseError>>()?;
    Ok(ResourceDecl {
        resource_type: spec.resource_type.clone(),
        name: name.to_string(),
        inputs,
        options: ResourceOptions {
            depends_on: spec.depends_on.clone(),
            parent: spec.parent.clone(),
            provider: spec.provider.clone(),
            replace_on_changes: spec.replace_on_changes.clone(),
            delete_before_replace: spec.delete_before_replace,
            transforms: spec.transforms.clone(),
            ensure: spec.ensure,
        },
    })
}

/// Build the resource graph declared by a stack file, minting derived
/// outputs on `resolver`.
pub fn build_graph(stack: &StackFile, resolver: &OutputResolver) -> Result<Graph, ParseError> {
    let expander = Expander {
        config: stack
            .config
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect(),
        resolver,
    };

    let mut builder = GraphBuilder::new(resolver.clone());
    for (name, spec) in &stack.resources {
        builder.add_resource(declaration(&expander, name, spec)?)?;
    }
    for (name, value) in &stack.outputs {
        builder.export(name, expander.input(&format!("outputs.{}", name), value)?);
    }
    Ok(builder.finalize()?)
}
