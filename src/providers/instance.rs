//! SF-006: Explicit provider instances (`providers:<package>` resources).
//!
//! A provider resource holds the configuration (kubeconfig, region, ...)
//! for one backend package. Its outputs are its inputs; resources that name
//! it through the `provider` option receive those outputs as a
//! [`ProviderBinding`](super::ProviderBinding) and are routed to the
//! provider registered for the package.

use super::{Provider, ResourceRequest};
use crate::core::error::ProviderError;
use crate::core::types::{Properties, ResourceState};
use async_trait::async_trait;

pub struct ProviderInstance;

#[async_trait]
impl Provider for ProviderInstance {
    async fn create(&self, req: &ResourceRequest) -> Result<Properties, ProviderError> {
        Ok(req.inputs.clone())
    }

    async fn update(
        &self,
        req: &ResourceRequest,
        _old: &ResourceState,
    ) -> Result<Properties, ProviderError> {
        Ok(req.inputs.clone())
    }

    async fn delete(&self, _name: &str, _old: &ResourceState) -> Result<(), ProviderError> {
        Ok(())
    }
}
