//! SF-008: `command` provider: resources managed by local shell scripts.
//!
//! Inputs `create`, `update` and `delete` hold bash scripts. Every other
//! scalar input is exported as `INPUT_<KEY>` and the full input map is piped
//! to the script as JSON on stdin. Outputs are `stdout` (trimmed) plus, when
//! stdout is a JSON object, each of its fields.

use super::{Provider, ResourceRequest};
use crate::core::error::ProviderError;
use crate::core::types::{Properties, ResourceState, Value};
use crate::transport::{self, Script};
use async_trait::async_trait;

const SCRIPT_KEYS: [&str; 3] = ["create", "update", "delete"];

#[derive(Debug, Default)]
pub struct CommandProvider;

/// Environment variable name for an input key: `metadata.name` → `INPUT_METADATA_NAME`.
fn env_name(prefix: &str, key: &str) -> String {
    let mut name = String::from(prefix);
    name.extend(key.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}

fn build_script(body: &str, inputs: &Properties, outputs: Option<&Properties>) -> Script {
    let mut script = Script::new(body);
    let data: Properties = inputs
        .iter()
        .filter(|(k, _)| !SCRIPT_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in &data {
        script
            .env
            .insert(env_name("INPUT_", key), value.render());
    }
    for (key, value) in outputs.into_iter().flatten() {
        script
            .env
            .insert(env_name("OUTPUT_", key), value.render());
    }
    script.stdin = Some(Value::Map(data).to_string());
    script
}

async fn run(operation: &str, script: Script) -> Result<Properties, ProviderError> {
    let out = transport::exec_script(&script)
        .await
        .map_err(|e| ProviderError::operation(operation, e.to_string()))?;

    if !out.success() {
        return Err(ProviderError::operation(
            operation,
            format!("exit code {}: {}", out.exit_code, out.stderr_summary()),
        ));
    }
    Ok(parse_outputs(&out.stdout))
}

fn parse_outputs(stdout: &str) -> Properties {
    let trimmed = stdout.trim();
    let mut outputs = Properties::new();
    if let Ok(Value::Map(fields)) = serde_json::from_str::<Value>(trimmed) {
        outputs.extend(fields);
    }
    outputs.insert("stdout".to_string(), Value::from(trimmed));
    outputs
}

fn script_input<'a>(inputs: &'a Properties, key: &str) -> Option<&'a str> {
    inputs.get(key).and_then(Value::as_str)
}

#[async_trait]
impl Provider for CommandProvider {
    async fn create(&self, req: &ResourceRequest) -> Result<Properties, ProviderError> {
        let body = script_input(&req.inputs, "create").ok_or_else(|| ProviderError::MissingInput {
            key: "create".to_string(),
        })?;
        run("create", build_script(body, &req.inputs, None)).await
    }

    /// Runs `update`, or re-runs `create` when no update script is given.
    async fn update(
        &self,
        req: &ResourceRequest,
        old: &ResourceState,
    ) -> Result<Properties, ProviderError> {
        let body = script_input(&req.inputs, "update")
            .or_else(|| script_input(&req.inputs, "create"))
            .ok_or_else(|| ProviderError::MissingInput {
                key: "update".to_string(),
            })?;
        run("update", build_script(body, &req.inputs, Some(&old.outputs))).await
    }

    async fn delete(&self, _name: &str, old: &ResourceState) -> Result<(), ProviderError> {
        match script_input(&old.inputs, "delete") {
            Some(body) => run("delete", build_script(body, &old.inputs, Some(&old.outputs)))
                .await
                .map(|_| ()),
            None => Ok(()),
        }
    }

    fn replace_triggers(&self) -> Vec<String> {
        vec!["create".to_string()]
    }
}
