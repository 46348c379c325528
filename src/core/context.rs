//! SF-016: Run context: everything one engine run needs, passed explicitly.

use super::output::OutputResolver;
use super::state::StateStore;
use super::types::Policy;
use crate::providers::ProviderRegistry;
use crate::tripwire::eventlog::EventLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation flag. Cancelling stops new operations from being
/// scheduled; in-flight operations run to completion and are persisted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared state of a single engine run.
#[derive(Clone)]
pub struct RunContext {
    pub stack: String,
    pub resolver: OutputResolver,
    pub providers: Arc<ProviderRegistry>,
    pub store: Arc<dyn StateStore>,
    pub policy: Policy,
    pub cancel: CancelToken,
    pub events: Option<EventLog>,
    /// Bounds in-flight provider calls. Contexts built with the same
    /// limiter share the bound across concurrent runs.
    pub limiter: Arc<Semaphore>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("stack", &self.stack)
            .field("providers", &self.providers)
            .field("policy", &self.policy)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("events", &self.events)
            .field("available_permits", &self.limiter.available_permits())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub fn builder(
        stack: &str,
        providers: ProviderRegistry,
        store: Arc<dyn StateStore>,
    ) -> RunContextBuilder {
        RunContextBuilder {
            stack: stack.to_string(),
            providers,
            store,
            policy: Policy::default(),
            resolver: OutputResolver::new(),
            cancel: CancelToken::new(),
            events: None,
            limiter: None,
        }
    }
}

pub struct RunContextBuilder {
    stack: String,
    providers: ProviderRegistry,
    store: Arc<dyn StateStore>,
    policy: Policy,
    resolver: OutputResolver,
    cancel: CancelToken,
    events: Option<EventLog>,
    limiter: Option<Arc<Semaphore>>,
}

impl RunContextBuilder {
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Share an existing resolver (the one the graph was declared with).
    pub fn resolver(mut self, resolver: OutputResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Log provenance events; ignored unless `policy.tripwire` is set.
    pub fn events(mut self, log: EventLog) -> Self {
        self.events = Some(log);
        self
    }

    /// Share a concurrency limit with other contexts. Without one, the
    /// context gets its own, sized from `policy.parallelism`.
    pub fn limiter(mut self, limiter: Arc<Semaphore>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> RunContext {
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(Semaphore::new(self.policy.parallelism.max(1))));
        let mut providers = self.providers;
        providers.set_timeout(self.policy.operation_timeout());
        let events = self.events.filter(|_| self.policy.tripwire);
        RunContext {
            stack: self.stack,
            resolver: self.resolver,
            providers: Arc::new(providers),
            store: self.store,
            policy: self.policy,
            cancel: self.cancel,
            events,
            limiter,
        }
    }
}
