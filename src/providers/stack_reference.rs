//! SF-009: `stack-reference` provider: read another stack's exports.
//!
//! A `stack-reference` resource takes a `stack` input naming another stack
//! in the same state store; its outputs are that stack's exported outputs.
//! Nothing is ever created or deleted remotely.

use super::{Provider, ResourceRequest};
use crate::core::error::ProviderError;
use crate::core::state::StateStore;
use crate::core::types::{Properties, ResourceState, Value};
use async_trait::async_trait;
use std::sync::Arc;

pub struct StackReferenceProvider {
    store: Arc<dyn StateStore>,
}

impl StackReferenceProvider {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn read(&self, operation: &str, req: &ResourceRequest) -> Result<Properties, ProviderError> {
        let stack = req
            .inputs
            .get("stack")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::MissingInput {
                key: "stack".to_string(),
            })?;
        let snapshot = self
            .store
            .load(stack)
            .map_err(|e| ProviderError::operation(operation, e.to_string()))?
            .ok_or_else(|| {
                ProviderError::operation(operation, format!("stack '{}' has no state", stack))
            })?;

        let mut outputs = snapshot.outputs;
        outputs.insert("stack".to_string(), Value::from(stack));
        Ok(outputs)
    }
}

#[async_trait]
impl Provider for StackReferenceProvider {
    async fn create(&self, req: &ResourceRequest) -> Result<Properties, ProviderError> {
        self.read("read", req)
    }

    async fn update(
        &self,
        req: &ResourceRequest,
        _old: &ResourceState,
    ) -> Result<Properties, ProviderError> {
        self.read("refresh", req)
    }

    async fn delete(&self, _name: &str, _old: &ResourceState) -> Result<(), ProviderError> {
        Ok(())
    }
}
