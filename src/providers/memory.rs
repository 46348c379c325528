//! SF-011: In-memory provider.
//!
//! Keeps "live" resources in a map and records every call, with failure,
//! hang and latency injection. Enough to drive planning and apply end to end
//! without any real backend; also backs `stackform up --simulate`.

use super::{Provider, ResourceRequest};
use crate::core::error::ProviderError;
use crate::core::types::{Properties, ResourceState, Value};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MemoryProvider {
    live: Mutex<BTreeMap<String, Properties>>,
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<BTreeSet<String>>,
    hang_on: BTreeSet<String>,
    delay: Option<Duration>,
    triggers: Vec<String>,
    delete_first: bool,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when the call is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation on `name` fails.
    pub fn fail_on(self, name: &str) -> Self {
        self.set_failing(name, true);
        self
    }

    /// Every operation on `name` never completes.
    pub fn hang_on(mut self, name: &str) -> Self {
        self.hang_on.insert(name.to_string());
        self
    }

    /// Simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_replace_triggers(mut self, triggers: &[&str]) -> Self {
        self.triggers = triggers.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_delete_before_replace(mut self) -> Self {
        self.delete_first = true;
        self
    }

    /// Toggle failure injection for `name` after construction.
    pub fn set_failing(&self, name: &str, failing: bool) {
        let mut fail_on = self.fail_on.lock().unwrap_or_else(|e| e.into_inner());
        if failing {
            fail_on.insert(name.to_string());
        } else {
            fail_on.remove(name);
        }
    }

    /// Calls so far, as `"<op> <name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Resources that currently exist, with their outputs.
    pub fn live(&self) -> BTreeMap<String, Properties> {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn enter(&self, operation: &str, name: &str) -> Result<InFlight<'_>, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{} {}", operation, name));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.hang_on.contains(name) {
            std::future::pending::<()>().await;
        }
        if self
            .fail_on
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
        {
            return Err(ProviderError::operation(
                operation,
                format!("injected failure for '{}'", name),
            ));
        }
        Ok(guard)
    }

    fn outputs(&self, req: &ResourceRequest, id: Value) -> Properties {
        let mut outputs = req.inputs.clone();
        outputs.insert("id".to_string(), id);
        outputs
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create(&self, req: &ResourceRequest) -> Result<Properties, ProviderError> {
        let _guard = self.enter("create", &req.name).await?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let outputs = self.outputs(req, Value::from(format!("{}-{}", req.name, n)));
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(req.name.clone(), outputs.clone());
        Ok(outputs)
    }

    async fn update(
        &self,
        req: &ResourceRequest,
        old: &ResourceState,
    ) -> Result<Properties, ProviderError> {
        let _guard = self.enter("update", &req.name).await?;
        let id = old.outputs.get("id").cloned().unwrap_or_default();
        let outputs = self.outputs(req, id);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(req.name.clone(), outputs.clone());
        Ok(outputs)
    }

    async fn delete(&self, name: &str, old: &ResourceState) -> Result<(), ProviderError> {
        let _guard = self.enter("delete", name).await?;
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        // A replaced resource's new instance shares the name; only drop the
        // entry if it is still the old instance.
        if live.get(name).map(|o| o.get("id")) == Some(old.outputs.get("id")) {
            live.remove(name);
        }
        Ok(())
    }

    fn replace_triggers(&self) -> Vec<String> {
        self.triggers.clone()
    }

    fn delete_before_replace(&self) -> bool {
        self.delete_first
    }
}
