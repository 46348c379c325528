//! SF-006: Provider interface: the boundary to real backends.
//!
//! The core only talks to [`Provider`] trait objects looked up through a
//! [`ProviderRegistry`] by resource type. The registry also owns the named
//! manifest transforms and the per-call timeout, so every backend gets the
//! same submission pipeline.

pub mod command;
pub mod instance;
pub mod memory;
pub mod stack_reference;
pub mod transform;

use crate::core::error::ProviderError;
use crate::core::state::StateStore;
use crate::core::types::{Planned, Properties, ResourceState};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use transform::Transform;

/// What a provider is asked to act on.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub name: String,
    pub resource_type: String,
    /// Resolved inputs with manifest transforms already applied
    pub inputs: Properties,
    /// Explicit provider instance, when the resource declares one
    pub provider: Option<ProviderBinding>,
}

impl ResourceRequest {
    /// Package of the bound provider instance.
    pub fn package(&self) -> Option<&str> {
        self.provider.as_ref().map(|b| b.package.as_str())
    }
}

/// A `providers:<package>` resource that a request is routed through.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderBinding {
    /// Logical name of the provider resource
    pub name: String,
    pub package: String,
    /// The provider resource's applied outputs
    pub config: Properties,
}

/// Type prefix of explicit provider instances.
pub const PROVIDER_TYPE_PREFIX: &str = "providers:";

/// Package named by a provider resource type, `providers:kubernetes` -> `kubernetes`.
pub fn provider_package(resource_type: &str) -> Option<&str> {
    resource_type
        .strip_prefix(PROVIDER_TYPE_PREFIX)
        .filter(|p| !p.is_empty())
}

/// Kind of change between the last-applied and the desired inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    None,
    Update,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffResult {
    pub kind: DiffKind,
    /// Top-level properties that differ, sorted
    pub changed: Vec<String>,
}

/// A backend able to create, update and delete resources of some types.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create the resource; returns its outputs.
    async fn create(&self, req: &ResourceRequest) -> Result<Properties, ProviderError>;

    /// Update in place; returns the new outputs.
    async fn update(
        &self,
        req: &ResourceRequest,
        old: &ResourceState,
    ) -> Result<Properties, ProviderError>;

    /// Delete the resource described by its last-applied state.
    async fn delete(&self, name: &str, old: &ResourceState) -> Result<(), ProviderError>;

    /// Classify the change from `old` to `new`. `triggers` are the
    /// properties whose change forces a replacement.
    fn diff(
        &self,
        old: &Properties,
        new: &BTreeMap<String, Planned>,
        triggers: &[String],
    ) -> DiffResult {
        default_diff(old, new, triggers)
    }

    /// Properties that can never be updated in place.
    fn replace_triggers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether replacements must delete the old instance first.
    fn delete_before_replace(&self) -> bool {
        false
    }
}

/// Properties whose planned value differs from `old`. Unknown values count
/// as changed.
pub fn changed_properties(old: &Properties, new: &BTreeMap<String, Planned>) -> Vec<String> {
    let mut changed: Vec<String> = new
        .iter()
        .filter(|(key, planned)| match planned {
            Planned::Known(v) => old.get(*key) != Some(v),
            Planned::Unknown => true,
        })
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(old.keys().filter(|k| !new.contains_key(*k)).cloned());
    changed.sort();
    changed
}

/// Whether a change to top-level `property` hits `trigger` (which may name a
/// nested path such as `metadata.name`).
fn triggers_replace(property: &str, trigger: &str) -> bool {
    trigger == property
        || trigger
            .strip_prefix(property)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Update unless a changed property is replace-triggering.
pub fn default_diff(
    old: &Properties,
    new: &BTreeMap<String, Planned>,
    triggers: &[String],
) -> DiffResult {
    let changed = changed_properties(old, new);
    let kind = if changed.is_empty() {
        DiffKind::None
    } else if changed
        .iter()
        .any(|p| triggers.iter().any(|t| triggers_replace(p, t)))
    {
        DiffKind::Replace
    } else {
        DiffKind::Update
    };
    DiffResult { kind, changed }
}

/// Maps resource types to providers.
///
/// Patterns are either an exact type (`aws:iam/Role`) or a prefix ending in
/// `*` (`kubernetes:*`); the longest matching prefix wins. A resource bound
/// to an explicit provider instance goes to the provider registered for that
/// instance's package first.
#[derive(Default)]
pub struct ProviderRegistry {
    exact: BTreeMap<String, Arc<dyn Provider>>,
    packages: BTreeMap<String, Arc<dyn Provider>>,
    prefixes: Vec<(String, Arc<dyn Provider>)>,
    fallback: Option<Arc<dyn Provider>>,
    transforms: BTreeMap<String, Transform>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field("packages", &self.packages.keys().collect::<Vec<_>>())
            .field(
                "prefixes",
                &self.prefixes.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.is_some())
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProviderRegistry {
    /// Registry with the built-in transforms and provider instances only.
    pub fn new() -> Self {
        let mut registry = Self {
            transforms: transform::builtin(),
            ..Self::default()
        };
        registry.register(
            &format!("{}*", PROVIDER_TYPE_PREFIX),
            Arc::new(instance::ProviderInstance),
        );
        registry
    }

    /// Registry with the built-in `command` and `stack-reference` providers.
    pub fn standard(store: Arc<dyn StateStore>) -> Self {
        let mut registry = Self::new();
        registry.register("command", Arc::new(command::CommandProvider));
        registry.register(
            "stack-reference",
            Arc::new(stack_reference::StackReferenceProvider::new(store)),
        );
        registry
    }

    pub fn register(&mut self, pattern: &str, provider: Arc<dyn Provider>) {
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                self.prefixes.retain(|(p, _)| p != prefix);
                self.prefixes.push((prefix.to_string(), provider));
                self.prefixes
                    .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            }
            None => {
                self.exact.insert(pattern.to_string(), provider);
            }
        }
    }

    /// Provider serving resources bound to a `providers:<package>` instance.
    pub fn register_package(&mut self, package: &str, provider: Arc<dyn Provider>) {
        self.packages.insert(package.to_string(), provider);
    }

    /// Provider used for types nothing else matches.
    pub fn set_fallback(&mut self, provider: Arc<dyn Provider>) {
        self.fallback = Some(provider);
    }

    pub fn register_transform(&mut self, name: &str, transform: Transform) {
        self.transforms.insert(name.to_string(), transform);
    }

    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Per-call timeout; `None` disables it.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn provider_for(&self, resource_type: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.exact
            .get(resource_type)
            .or_else(|| {
                self.prefixes
                    .iter()
                    .find(|(p, _)| resource_type.starts_with(p.as_str()))
                    .map(|(_, provider)| provider)
            })
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ProviderError::UnknownType {
                resource_type: resource_type.to_string(),
            })
    }

    /// Provider for `resource_type`, preferring the one registered for
    /// `package` when the resource is bound to a provider instance.
    pub fn route(
        &self,
        resource_type: &str,
        package: Option<&str>,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        match package.and_then(|p| self.packages.get(p)) {
            Some(provider) => Ok(Arc::clone(provider)),
            None => self.provider_for(resource_type),
        }
    }

    /// Apply the named transforms, in order, to resolved inputs.
    pub fn prepare(&self, transforms: &[String], inputs: Properties) -> Result<Properties, ProviderError> {
        transform::apply_all(&self.transforms, transforms, inputs)
    }

    pub async fn create(&self, req: &ResourceRequest) -> Result<Properties, ProviderError> {
        let provider = self.route(&req.resource_type, req.package())?;
        self.with_timeout("create", provider.create(req)).await
    }

    pub async fn update(
        &self,
        req: &ResourceRequest,
        old: &ResourceState,
    ) -> Result<Properties, ProviderError> {
        let provider = self.route(&req.resource_type, req.package())?;
        self.with_timeout("update", provider.update(req, old)).await
    }

    /// Delete through the provider that created the resource; `package` is
    /// that of the instance recorded in `old.provider`, if any.
    pub async fn delete(
        &self,
        name: &str,
        old: &ResourceState,
        package: Option<&str>,
    ) -> Result<(), ProviderError> {
        let provider = self.route(&old.resource_type, package)?;
        self.with_timeout("delete", provider.delete(name, old)).await
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match self.timeout {
            None => call.await,
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| ProviderError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })?,
        }
    }
}
