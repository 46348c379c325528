//! SF-012: Executor: concurrent apply of a plan.
//!
//! The coordinator loop owns the snapshot and is its only writer. Provider
//! calls run on a `JoinSet`. A step is spawned only once the coordinator
//! holds a permit from the context's limiter for it, so steps waiting on
//! the concurrency limit are still queued (and can be cancelled or stopped)
//! rather than parked inside tasks. Each step starts once every step it
//! depends on has succeeded; a failure marks all of its descendants skipped
//! while unrelated branches keep going.

use super::context::RunContext;
use super::error::{ApplyError, ProviderError};
use super::graph::Graph;
use super::planner;
use super::types::{
    FailurePolicy, Operation, Plan, PlanStep, Properties, ProvenanceEvent, ResourceState,
    ResourceStatus, SkipReason, Snapshot, StepId, StepResult,
};
use crate::providers::{provider_package, ProviderBinding, ProviderRegistry, ResourceRequest};
use crate::tripwire::eventlog;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinSet};

/// Outcome of an apply run.
#[derive(Debug)]
pub struct ApplyReport {
    /// Snapshot as committed at the end of the run
    pub snapshot: Snapshot,
    /// One result per plan step, in step order
    pub results: Vec<StepResult>,
    /// Failures, by resource name
    pub errors: Vec<(String, ApplyError)>,
    pub duration: Duration,
}

impl ApplyReport {
    /// Status of a resource. For resources with two steps (replacements)
    /// the first unsuccessful one wins.
    pub fn status(&self, resource: &str) -> Option<&ResourceStatus> {
        let mut steps = self.results.iter().filter(|r| r.resource == resource);
        let first = steps.next()?;
        std::iter::once(first)
            .chain(steps)
            .map(|r| &r.status)
            .find(|s| !matches!(s, ResourceStatus::Applied | ResourceStatus::Unchanged))
            .or(Some(&first.status))
    }

    fn count(&self, pred: impl Fn(&ResourceStatus) -> bool) -> u32 {
        self.results.iter().filter(|r| pred(&r.status)).count() as u32
    }

    pub fn applied(&self) -> u32 {
        self.count(|s| *s == ResourceStatus::Applied)
    }

    pub fn unchanged(&self) -> u32 {
        self.count(|s| *s == ResourceStatus::Unchanged)
    }

    pub fn failed(&self) -> u32 {
        self.count(|s| matches!(s, ResourceStatus::Failed(_)))
    }

    pub fn skipped(&self) -> u32 {
        self.count(|s| matches!(s, ResourceStatus::Skipped(_)))
    }

    pub fn cancelled(&self) -> u32 {
        self.count(|s| *s == ResourceStatus::Cancelled)
    }

    /// Every step applied or unchanged.
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
            && self
                .results
                .iter()
                .all(|r| matches!(r.status, ResourceStatus::Applied | ResourceStatus::Unchanged))
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in self.results.iter().filter(|r| r.status != ResourceStatus::Unchanged) {
            writeln!(f, "  {} {}: {}", r.operation, r.resource, r.status)?;
        }
        write!(
            f,
            "Apply: {} applied, {} unchanged, {} failed, {} skipped, {} cancelled ({:.1}s)",
            self.applied(),
            self.unchanged(),
            self.failed(),
            self.skipped(),
            self.cancelled(),
            self.duration.as_secs_f64()
        )
    }
}

/// A provider call, owned so it can move onto a task.
enum Call {
    Create(ResourceRequest),
    Update(ResourceRequest, ResourceState),
    /// Name, last-applied state and the package of its provider instance
    Delete(String, ResourceState, Option<String>),
}

impl Call {
    async fn run(self, providers: &ProviderRegistry) -> Result<Properties, ProviderError> {
        match self {
            Self::Create(req) => providers.create(&req).await,
            Self::Update(req, old) => providers.update(&req, &old).await,
            Self::Delete(name, old, package) => providers
                .delete(&name, &old, package.as_deref())
                .await
                .map(|()| Properties::new()),
        }
    }
}

/// The permit travels back with the result and is released only after the
/// coordinator has recorded the outcome.
type TaskOutput = (
    StepId,
    Result<Properties, ProviderError>,
    Duration,
    Option<OwnedSemaphorePermit>,
);

struct Coordinator<'a> {
    plan: &'a Plan,
    graph: &'a Graph,
    ctx: &'a RunContext,
    /// Snapshot as loaded; old instances are deleted from what it records
    prior: Snapshot,
    snapshot: Snapshot,
    status: Vec<Option<ResourceStatus>>,
    durations: Vec<Duration>,
    remaining: Vec<usize>,
    dependents: Vec<Vec<StepId>>,
    ready: BTreeSet<StepId>,
    /// State to commit once a create/update call returns outputs
    pending: BTreeMap<StepId, ResourceState>,
    errors: Vec<(String, ApplyError)>,
    stop: bool,
}

/// Apply `plan` to the infrastructure and persist each success.
pub async fn apply(plan: &Plan, graph: &Graph, snapshot: Snapshot, ctx: &RunContext) -> ApplyReport {
    let started = Instant::now();
    let run_id = eventlog::generate_run_id();
    ctx.resolver.reset();

    tracing::info!(stack = %ctx.stack, run_id = %run_id, steps = plan.steps.len(), "apply started");
    log_event(
        ctx,
        ProvenanceEvent::ApplyStarted {
            stack: ctx.stack.clone(),
            run_id: run_id.clone(),
            stackform_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );

    let mut coordinator = Coordinator::new(plan, graph, snapshot, ctx);
    coordinator.run().await;
    coordinator.commit_exports();
    let report = coordinator.into_report(started.elapsed());

    log_event(
        ctx,
        ProvenanceEvent::ApplyCompleted {
            stack: ctx.stack.clone(),
            run_id,
            applied: report.applied(),
            unchanged: report.unchanged(),
            failed: report.failed(),
            skipped: report.skipped(),
            total_seconds: report.duration.as_secs_f64(),
        },
    );
    tracing::info!(
        stack = %ctx.stack,
        applied = report.applied(),
        failed = report.failed(),
        skipped = report.skipped(),
        cancelled = report.cancelled(),
        "apply completed"
    );
    report
}

/// Append to the event log when tripwire is on. Log failures never fail a run.
fn log_event(ctx: &RunContext, event: ProvenanceEvent) {
    if let Some(log) = &ctx.events {
        if let Err(e) = log.append(event) {
            tracing::warn!(path = %log.path().display(), error = %e, "event log append failed");
        }
    }
}

impl<'a> Coordinator<'a> {
    fn new(plan: &'a Plan, graph: &'a Graph, snapshot: Snapshot, ctx: &'a RunContext) -> Self {
        let n = plan.steps.len();
        let mut dependents = vec![Vec::new(); n];
        for step in &plan.steps {
            for &dep in &step.depends_on {
                dependents[dep].push(step.id);
            }
        }
        let remaining: Vec<usize> = plan.steps.iter().map(|s| s.depends_on.len()).collect();
        let ready = (0..n).filter(|&i| remaining[i] == 0).collect();
        Self {
            plan,
            graph,
            ctx,
            prior: snapshot.clone(),
            snapshot,
            status: vec![None; n],
            durations: vec![Duration::ZERO; n],
            remaining,
            dependents,
            ready,
            pending: BTreeMap::new(),
            errors: Vec::new(),
            stop: false,
        }
    }

    async fn run(&mut self) {
        let ctx = self.ctx;
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut reserved: Option<OwnedSemaphorePermit> = None;

        loop {
            self.launch_ready(&mut tasks, &mut reserved);
            let waiting = !self.stop && !self.ready.is_empty();
            if tasks.is_empty() && !waiting {
                break;
            }

            tokio::select! {
                biased;
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => self.joined(joined),
                permit = Arc::clone(&ctx.limiter).acquire_owned(), if waiting => match permit {
                    Ok(permit) => reserved = Some(permit),
                    Err(_) => {
                        tracing::error!("concurrency limiter closed; stopping");
                        self.stop = true;
                    }
                },
                () = ctx.cancel.cancelled(), if waiting => {}
                else => break,
            }
        }

        for status in self.status.iter_mut().filter(|s| s.is_none()) {
            *status = Some(ResourceStatus::Cancelled);
        }
    }

    fn joined(&mut self, joined: Result<TaskOutput, JoinError>) {
        match joined {
            Ok((id, result, elapsed, _permit)) => self.complete(id, result, elapsed),
            Err(e) => match e.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(e) => tracing::error!(error = %e, "apply task aborted"),
            },
        }
    }

    /// Start ready steps until the limiter runs out of permits. Steps that
    /// make no provider call never wait for one.
    fn launch_ready(
        &mut self,
        tasks: &mut JoinSet<TaskOutput>,
        reserved: &mut Option<OwnedSemaphorePermit>,
    ) {
        while !self.stop {
            if self.ctx.cancel.is_cancelled() {
                tracing::info!(in_flight = tasks.len(), "cancelled; waiting for in-flight steps");
                self.stop = true;
                break;
            }
            let inline = self.ready.iter().copied().find(|&id| !self.calls_provider(id));
            let (id, permit) = match inline {
                Some(id) => (id, None),
                None => {
                    let Some(&id) = self.ready.first() else {
                        break;
                    };
                    let permit = reserved
                        .take()
                        .or_else(|| Arc::clone(&self.ctx.limiter).try_acquire_owned().ok());
                    match permit {
                        Some(permit) => (id, Some(permit)),
                        None => break,
                    }
                }
            };
            self.ready.remove(&id);
            self.launch(id, tasks, permit);
        }
    }

    fn calls_provider(&self, id: StepId) -> bool {
        let step = &self.plan.steps[id];
        match step.operation {
            Operation::NoOp => false,
            Operation::Delete => self.prior.resources.contains_key(&step.resource),
            Operation::Create | Operation::Update => true,
        }
    }

    /// Start a step: NoOps finish inline, everything else becomes a task
    /// holding `permit`.
    fn launch(
        &mut self,
        id: StepId,
        tasks: &mut JoinSet<TaskOutput>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let plan = self.plan;
        let step = &plan.steps[id];
        let call = match step.operation {
            Operation::NoOp => {
                let outputs = self
                    .prior
                    .resources
                    .get(&step.resource)
                    .map(|s| s.outputs.clone())
                    .unwrap_or_default();
                self.ctx.resolver.fulfill(&step.resource, outputs);
                self.finish(id, ResourceStatus::Unchanged);
                return;
            }
            Operation::Delete => match self.prior.resources.get(&step.resource) {
                Some(old) => {
                    let package = self.instance_package(old.provider.as_deref());
                    Call::Delete(step.resource.clone(), old.clone(), package)
                }
                None => {
                    tracing::debug!(resource = %step.resource, "nothing recorded to delete");
                    self.finish(id, ResourceStatus::Applied);
                    return;
                }
            },
            Operation::Create | Operation::Update => match self.prepare(step) {
                Ok(call) => call,
                Err(e) => {
                    self.fail(id, e);
                    return;
                }
            },
        };

        tracing::debug!(step = id, resource = %step.resource, operation = %step.operation, "scheduling");
        log_event(
            self.ctx,
            ProvenanceEvent::StepStarted {
                stack: self.ctx.stack.clone(),
                resource: step.resource.clone(),
                operation: step.operation.to_string(),
            },
        );
        let providers = Arc::clone(&self.ctx.providers);
        tasks.spawn(async move {
            let started = Instant::now();
            let result = call.run(&providers).await;
            (id, result, started.elapsed(), permit)
        });
    }

    /// Package of a recorded provider instance.
    fn instance_package(&self, instance: Option<&str>) -> Option<String> {
        let state = self.prior.resources.get(instance?)?;
        provider_package(&state.resource_type).map(String::from)
    }

    /// Binding for a declared `provider` option, from the instance's
    /// committed outputs. The instance is a dependency, so it has applied.
    fn binding(&self, instance: &str) -> Result<ProviderBinding, ApplyError> {
        let state = self.snapshot.resources.get(instance).ok_or_else(|| {
            ProviderError::operation(
                "resolve",
                format!("provider instance '{}' has not been applied", instance),
            )
        })?;
        let package = provider_package(&state.resource_type).ok_or_else(|| {
            ProviderError::operation(
                "resolve",
                format!("'{}' is not a provider instance", instance),
            )
        })?;
        Ok(ProviderBinding {
            name: instance.to_string(),
            package: package.to_string(),
            config: state.outputs.clone(),
        })
    }

    /// Resolve inputs now that every producer has completed, and build the
    /// request with transforms applied.
    fn prepare(&mut self, step: &PlanStep) -> Result<Call, ApplyError> {
        let decl = self.graph.get(&step.resource).ok_or_else(|| {
            ProviderError::operation("resolve", format!("'{}' is not declared", step.resource))
        })?;
        let inputs = self.ctx.resolver.resolve_inputs(&decl.inputs)?;
        let binding = decl
            .options
            .provider
            .as_deref()
            .map(|instance| self.binding(instance))
            .transpose()?;
        let submitted = self
            .ctx
            .providers
            .prepare(&decl.options.transforms, inputs.clone())?;

        self.pending.insert(
            step.id,
            ResourceState {
                resource_type: decl.resource_type.clone(),
                hash: planner::input_hash(decl, &inputs),
                inputs,
                outputs: Properties::new(),
                dependencies: self
                    .graph
                    .dependencies(&decl.name)
                    .into_iter()
                    .map(String::from)
                    .collect(),
                parent: decl.options.parent.clone(),
                provider: decl.options.provider.clone(),
            },
        );

        let req = ResourceRequest {
            name: decl.name.clone(),
            resource_type: decl.resource_type.clone(),
            inputs: submitted,
            provider: binding,
        };
        match (step.operation, self.prior.resources.get(&decl.name)) {
            // Replacements create a fresh instance.
            (Operation::Update, Some(old)) if step.replace.is_none() => {
                Ok(Call::Update(req, old.clone()))
            }
            _ => Ok(Call::Create(req)),
        }
    }

    fn complete(&mut self, id: StepId, result: Result<Properties, ProviderError>, elapsed: Duration) {
        self.durations[id] = elapsed;
        let plan = self.plan;
        let step = &plan.steps[id];
        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => {
                self.pending.remove(&id);
                self.fail(id, e.into());
                return;
            }
        };

        let hash = match step.operation {
            Operation::Delete => {
                // The old half of a create-before-delete replacement leaves
                // the new instance's record alone.
                let superseded = step.replace.is_some()
                    && self
                        .snapshot
                        .resources
                        .get(&step.resource)
                        .zip(self.prior.resources.get(&step.resource))
                        .is_some_and(|(now, before)| now != before);
                if !superseded {
                    self.snapshot.resources.remove(&step.resource);
                }
                String::new()
            }
            _ => {
                let Some(mut state) = self.pending.remove(&id) else {
                    return self.fail(
                        id,
                        ProviderError::operation("commit", "no prepared state").into(),
                    );
                };
                state.outputs = outputs.clone();
                let hash = state.hash.clone();
                self.snapshot.resources.insert(step.resource.clone(), state);
                hash
            }
        };

        if let Err(e) = self.ctx.store.save(&self.snapshot) {
            tracing::error!(resource = %step.resource, error = %e, "state save failed; stopping");
            self.stop = true;
            self.fail(id, e.into());
            return;
        }
        if step.operation != Operation::Delete {
            self.ctx.resolver.fulfill(&step.resource, outputs);
        }

        tracing::info!(
            resource = %step.resource,
            operation = %step.operation,
            seconds = elapsed.as_secs_f64(),
            "applied"
        );
        log_event(
            self.ctx,
            ProvenanceEvent::StepApplied {
                stack: self.ctx.stack.clone(),
                resource: step.resource.clone(),
                operation: step.operation.to_string(),
                duration_seconds: elapsed.as_secs_f64(),
                hash,
            },
        );
        self.finish(id, ResourceStatus::Applied);
    }

    /// Record a successful step and release its dependents.
    fn finish(&mut self, id: StepId, status: ResourceStatus) {
        self.status[id] = Some(status);
        for &next in &self.dependents[id] {
            self.remaining[next] -= 1;
            if self.remaining[next] == 0 && self.status[next].is_none() {
                self.ready.insert(next);
            }
        }
    }

    /// Record a failure and skip every step downstream of it.
    fn fail(&mut self, id: StepId, error: ApplyError) {
        let plan = self.plan;
        let step = &plan.steps[id];
        let reason = error.to_string();
        tracing::warn!(resource = %step.resource, operation = %step.operation, error = %reason, "step failed");
        log_event(
            self.ctx,
            ProvenanceEvent::StepFailed {
                stack: self.ctx.stack.clone(),
                resource: step.resource.clone(),
                error: reason.clone(),
            },
        );
        self.status[id] = Some(ResourceStatus::Failed(reason));
        self.errors.push((step.resource.clone(), error));
        if step.operation != Operation::Delete {
            self.ctx.resolver.abandon(&step.resource);
        }

        let mut queue: VecDeque<StepId> = self.dependents[id].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if self.status[next].is_some() {
                continue;
            }
            let skipped = &plan.steps[next];
            tracing::info!(resource = %skipped.resource, dependency = %step.resource, "skipped");
            log_event(
                self.ctx,
                ProvenanceEvent::StepSkipped {
                    stack: self.ctx.stack.clone(),
                    resource: skipped.resource.clone(),
                    dependency: step.resource.clone(),
                },
            );
            self.status[next] = Some(ResourceStatus::Skipped(SkipReason::DependencyFailed {
                dependency: step.resource.clone(),
            }));
            if skipped.operation != Operation::Delete {
                self.ctx.resolver.abandon(&skipped.resource);
            }
            queue.extend(self.dependents[next].iter().copied());
        }

        if self.ctx.policy.failure == FailurePolicy::StopOnFirst && !self.stop {
            tracing::warn!(resource = %step.resource, "stop_on_first: no further steps will start");
            self.stop = true;
        }
    }

    /// Resolve stack exports. An export whose producers did not apply keeps
    /// its previous value.
    fn commit_exports(&mut self) {
        let mut outputs = BTreeMap::new();
        for (name, input) in self.graph.exports() {
            match self.ctx.resolver.resolve_input(input) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(e) => {
                    tracing::debug!(export = %name, error = %e, "export not resolved");
                    if let Some(old) = self.snapshot.outputs.get(name) {
                        outputs.insert(name.clone(), old.clone());
                    }
                }
            }
        }
        if outputs == self.snapshot.outputs {
            return;
        }
        self.snapshot.outputs = outputs;
        if let Err(e) = self.ctx.store.save(&self.snapshot) {
            tracing::error!(error = %e, "saving stack outputs failed");
            self.errors.push(("<stack outputs>".to_string(), e.into()));
        }
    }

    fn into_report(self, duration: Duration) -> ApplyReport {
        let results = self
            .plan
            .steps
            .iter()
            .zip(self.status)
            .zip(self.durations)
            .map(|((step, status), duration)| StepResult {
                step: step.id,
                resource: step.resource.clone(),
                operation: step.operation,
                status: status.unwrap_or(ResourceStatus::Cancelled),
                duration,
            })
            .collect();
        ApplyReport {
            snapshot: self.snapshot,
            results,
            errors: self.errors,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::CancelToken;
    use crate::core::graph::GraphBuilder;
    use crate::core::state::{new_snapshot, MemoryStateStore, StateStore};
    use crate::core::types::{Input, Policy, ResourceDecl, Value};
    use crate::providers::memory::MemoryProvider;
    use crate::tripwire::eventlog::EventLog;

    struct Fixture {
        ctx: RunContext,
        provider: Arc<MemoryProvider>,
        store: Arc<MemoryStateStore>,
    }

    fn fixture_with(provider: MemoryProvider, policy: Policy) -> Fixture {
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStateStore::new());
        let mut reg = ProviderRegistry::new();
        reg.register("t", provider.clone());
        let ctx = RunContext::builder("test", reg, store.clone())
            .policy(policy)
            .build();
        Fixture { ctx, provider, store }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryProvider::new(), Policy::default())
    }

    fn graph(ctx: &RunContext, decls: Vec<ResourceDecl>) -> Graph {
        let mut b = GraphBuilder::new(ctx.resolver.clone());
        for d in decls {
            b.add_resource(d).unwrap();
        }
        b.finalize().unwrap()
    }

    async fn up(f: &Fixture, g: &Graph) -> ApplyReport {
        let snap = f
            .store
            .load("test")
            .unwrap()
            .unwrap_or_else(|| new_snapshot("test"));
        let plan = planner::plan(g, &snap, &f.ctx).unwrap();
        apply(&plan, g, snap, &f.ctx).await
    }

    fn chain(ctx: &RunContext) -> Graph {
        graph(
            ctx,
            vec![
                ResourceDecl::new("t", "a").input("v", "1"),
                ResourceDecl::new("t", "b").input("up", Input::reference("a", "id")),
                ResourceDecl::new("t", "c").input("up", Input::reference("b", "id")),
                ResourceDecl::new("t", "d").input("v", "1"),
            ],
        )
    }

    #[tokio::test]
    async fn test_sf012_creates_resolve_outputs_and_persist() {
        let f = fixture();
        let g = chain(&f.ctx);
        let report = up(&f, &g).await;

        assert!(report.succeeded(), "{}", report);
        assert_eq!(report.applied(), 4);
        assert_eq!(f.store.save_count(), 4);
        let b = &report.snapshot.resources["b"];
        assert_eq!(b.inputs["up"], report.snapshot.resources["a"].outputs["id"]);
        assert_eq!(b.dependencies, vec!["a"]);
        assert_eq!(f.store.load("test").unwrap().unwrap(), report.snapshot);
    }

    #[tokio::test]
    async fn test_sf012_failure_skips_descendants_only() {
        let f = fixture_with(MemoryProvider::new().fail_on("b"), Policy::default());
        let g = chain(&f.ctx);
        let report = up(&f, &g).await;

        assert_eq!(report.status("a"), Some(&ResourceStatus::Applied));
        assert!(matches!(report.status("b"), Some(ResourceStatus::Failed(_))));
        assert_eq!(
            report.status("c"),
            Some(&ResourceStatus::Skipped(SkipReason::DependencyFailed {
                dependency: "b".into()
            }))
        );
        assert_eq!(report.status("d"), Some(&ResourceStatus::Applied));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "b");
        let recorded: Vec<&String> = report.snapshot.resources.keys().collect();
        assert_eq!(recorded, vec!["a", "d"]);
        assert!(!f.provider.calls().contains(&"create c".to_string()));
    }

    #[tokio::test]
    async fn test_sf012_rerun_is_all_noop() {
        let f = fixture();
        let g = chain(&f.ctx);
        up(&f, &g).await;
        let calls = f.provider.calls().len();
        let saves = f.store.save_count();

        let report = up(&f, &g).await;
        assert_eq!(report.unchanged(), 4);
        assert_eq!(f.provider.calls().len(), calls);
        assert_eq!(f.store.save_count(), saves);
    }

    #[tokio::test]
    async fn test_sf012_noop_publishes_snapshot_outputs() {
        let f = fixture();
        up(&f, &chain(&f.ctx)).await;
        let a_id = f.store.load("test").unwrap().unwrap().resources["a"].outputs["id"].clone();

        let g = graph(
            &f.ctx,
            vec![
                ResourceDecl::new("t", "a").input("v", "1"),
                ResourceDecl::new("t", "e").input("up", Input::reference("a", "id")),
            ],
        );
        let report = up(&f, &g).await;
        assert_eq!(report.status("a"), Some(&ResourceStatus::Unchanged));
        assert_eq!(report.snapshot.resources["e"].inputs["up"], a_id);
        assert!(!report.snapshot.resources.contains_key("d"));
    }

    #[tokio::test]
    async fn test_sf012_parallelism_bounds_in_flight_calls() {
        let policy = Policy {
            parallelism: 2,
            ..Policy::default()
        };
        let f = fixture_with(
            MemoryProvider::new().with_delay(Duration::from_millis(20)),
            policy,
        );
        let decls = (0..6)
            .map(|i| ResourceDecl::new("t", &format!("r{}", i)))
            .collect();
        let g = graph(&f.ctx, decls);
        let report = up(&f, &g).await;
        assert_eq!(report.applied(), 6);
        assert!(f.provider.max_concurrency() <= 2);
        assert!(f.provider.max_concurrency() >= 1);
    }

    #[tokio::test]
    async fn test_sf012_cancelled_before_start_schedules_nothing() {
        let f = fixture();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = RunContext {
            cancel,
            ..f.ctx.clone()
        };
        let g = chain(&ctx);
        let snap = new_snapshot("test");
        let plan = planner::plan(&g, &snap, &ctx).unwrap();
        let report = apply(&plan, &g, snap, &ctx).await;
        assert_eq!(report.cancelled(), 4);
        assert!(f.provider.calls().is_empty());
        assert!(!report.succeeded());
    }

    #[tokio::test]
    async fn test_sf012_stop_on_first_lets_in_flight_finish() {
        let slow = Arc::new(MemoryProvider::new().with_delay(Duration::from_millis(100)));
        let fast = Arc::new(MemoryProvider::new().fail_on("bad"));
        let mut reg = ProviderRegistry::new();
        reg.register("slow", slow.clone());
        reg.register("fast", fast);
        let store = Arc::new(MemoryStateStore::new());
        let ctx = RunContext::builder("test", reg, store)
            .policy(Policy {
                failure: FailurePolicy::StopOnFirst,
                ..Policy::default()
            })
            .build();
        let g = graph(
            &ctx,
            vec![
                ResourceDecl::new("fast", "bad"),
                ResourceDecl::new("slow", "ok"),
                ResourceDecl::new("slow", "after").input("up", Input::reference("ok", "id")),
            ],
        );
        let snap = new_snapshot("test");
        let plan = planner::plan(&g, &snap, &ctx).unwrap();
        let report = apply(&plan, &g, snap, &ctx).await;

        assert!(matches!(report.status("bad"), Some(ResourceStatus::Failed(_))));
        assert_eq!(report.status("ok"), Some(&ResourceStatus::Applied));
        assert_eq!(report.status("after"), Some(&ResourceStatus::Cancelled));
        assert!(report.snapshot.resources.contains_key("ok"));
        assert_eq!(slow.calls(), vec!["create ok"]);
    }

    fn independent(ctx: &RunContext, prefix: &str, n: usize) -> Graph {
        let decls = (0..n)
            .map(|i| ResourceDecl::new("t", &format!("{}{}", prefix, i)))
            .collect();
        graph(ctx, decls)
    }

    #[tokio::test]
    async fn test_sf012_cancel_leaves_queued_steps_unstarted() {
        let policy = Policy {
            parallelism: 1,
            ..Policy::default()
        };
        let f = fixture_with(
            MemoryProvider::new().with_delay(Duration::from_millis(100)),
            policy,
        );
        let cancel = CancelToken::new();
        let ctx = RunContext {
            cancel: cancel.clone(),
            ..f.ctx.clone()
        };
        let g = independent(&ctx, "n", 5);
        let snap = new_snapshot("test");
        let plan = planner::plan(&g, &snap, &ctx).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let report = apply(&plan, &g, snap, &ctx).await;
        canceller.await.unwrap();

        assert_eq!(f.provider.calls(), vec!["create n0"]);
        assert_eq!(report.applied(), 1);
        assert_eq!(report.cancelled(), 4);
        assert_eq!(report.snapshot.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_sf012_stop_on_first_leaves_queued_steps_unstarted() {
        let policy = Policy {
            parallelism: 1,
            failure: FailurePolicy::StopOnFirst,
            ..Policy::default()
        };
        let f = fixture_with(MemoryProvider::new().fail_on("n0"), policy);
        let g = independent(&f.ctx, "n", 5);
        let report = up(&f, &g).await;

        assert_eq!(f.provider.calls(), vec!["create n0"]);
        assert!(matches!(report.status("n0"), Some(ResourceStatus::Failed(_))));
        for i in 1..5 {
            assert_eq!(
                report.status(&format!("n{}", i)),
                Some(&ResourceStatus::Cancelled)
            );
        }
    }

    #[tokio::test]
    async fn test_sf012_shared_limiter_bounds_concurrent_runs() {
        let provider = Arc::new(MemoryProvider::new().with_delay(Duration::from_millis(20)));
        let limiter = Arc::new(tokio::sync::Semaphore::new(1));
        let context = |stack: &str| {
            let mut reg = ProviderRegistry::new();
            reg.register("t", provider.clone());
            RunContext::builder(stack, reg, Arc::new(MemoryStateStore::new()))
                .policy(Policy {
                    parallelism: 4,
                    ..Policy::default()
                })
                .limiter(limiter.clone())
                .build()
        };
        let (a, b) = (context("a"), context("b"));
        let (ga, gb) = (independent(&a, "a", 3), independent(&b, "b", 3));
        let (sa, sb) = (new_snapshot("a"), new_snapshot("b"));
        let pa = planner::plan(&ga, &sa, &a).unwrap();
        let pb = planner::plan(&gb, &sb, &b).unwrap();

        let (ra, rb) = tokio::join!(apply(&pa, &ga, sa, &a), apply(&pb, &gb, sb, &b));
        assert!(ra.succeeded() && rb.succeeded());
        assert_eq!(provider.calls().len(), 6);
        assert_eq!(provider.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_sf012_provider_instance_binds_requests() {
        let f = fixture();
        let k8s = Arc::new(MemoryProvider::new());
        let mut reg = ProviderRegistry::new();
        reg.register("t", f.provider.clone());
        reg.register_package("kubernetes", k8s.clone());
        let ctx = RunContext::builder("test", reg, f.store.clone()).build();
        let g = graph(
            &ctx,
            vec![
                ResourceDecl::new("providers:kubernetes", "cluster").input("kubeconfig", "cfg"),
                ResourceDecl::new("t", "ns").input("name", "lb").provider("cluster"),
                ResourceDecl::new("t", "plain"),
            ],
        );
        let snap = new_snapshot("test");
        let plan = planner::plan(&g, &snap, &ctx).unwrap();
        let report = apply(&plan, &g, snap, &ctx).await;

        assert!(report.succeeded(), "{}", report);
        assert_eq!(k8s.calls(), vec!["create ns"]);
        assert_eq!(f.provider.calls(), vec!["create plain"]);
        let ns = &report.snapshot.resources["ns"];
        assert_eq!(ns.provider.as_deref(), Some("cluster"));
        assert_eq!(ns.dependencies, vec!["cluster"]);
        assert_eq!(
            report.snapshot.resources["cluster"].outputs["kubeconfig"],
            Value::from("cfg")
        );

        // Removing the resource deletes it through the same instance.
        let g = graph(
            &ctx,
            vec![ResourceDecl::new("providers:kubernetes", "cluster").input("kubeconfig", "cfg")],
        );
        let snap = f.store.load("test").unwrap().unwrap();
        let plan = planner::plan(&g, &snap, &ctx).unwrap();
        let report = apply(&plan, &g, snap, &ctx).await;
        assert!(report.succeeded(), "{}", report);
        assert_eq!(k8s.calls(), vec!["create ns", "delete ns"]);
    }

    #[tokio::test]
    async fn test_sf012_timeout_is_a_failure() {
        let policy = Policy {
            operation_timeout_secs: 1,
            ..Policy::default()
        };
        let f = fixture_with(MemoryProvider::new().hang_on("stuck"), policy);
        let g = graph(
            &f.ctx,
            vec![ResourceDecl::new("t", "stuck"), ResourceDecl::new("t", "fine")],
        );
        let report = up(&f, &g).await;
        assert_eq!(report.status("fine"), Some(&ResourceStatus::Applied));
        assert!(matches!(
            &report.errors[0].1,
            ApplyError::Provider(ProviderError::Timeout { .. })
        ));
        assert!(!report.snapshot.resources.contains_key("stuck"));
    }

    #[tokio::test]
    async fn test_sf012_save_failure_stops_run() {
        let policy = Policy {
            parallelism: 1,
            ..Policy::default()
        };
        let f = fixture_with(MemoryProvider::new(), policy);
        f.store.fail_saves(true);
        let g = graph(
            &f.ctx,
            vec![
                ResourceDecl::new("t", "a"),
                ResourceDecl::new("t", "b").input("up", Input::reference("a", "id")),
            ],
        );
        let report = up(&f, &g).await;
        assert!(matches!(report.errors[0].1, ApplyError::State(_)));
        assert!(matches!(report.status("a"), Some(ResourceStatus::Failed(_))));
        assert!(matches!(
            report.status("b"),
            Some(ResourceStatus::Skipped(_))
        ));
    }

    #[tokio::test]
    async fn test_sf012_replacement_creates_then_deletes_old() {
        let f = fixture_with(
            MemoryProvider::new().with_replace_triggers(&["name"]),
            Policy::default(),
        );
        let decls = |name: &str| {
            vec![
                ResourceDecl::new("t", "ns").input("name", name),
                ResourceDecl::new("t", "sa").input("ns", Input::reference("ns", "id")),
            ]
        };
        up(&f, &graph(&f.ctx, decls("one"))).await;
        let old_id = f.provider.live()["ns"]["id"].clone();

        let report = up(&f, &graph(&f.ctx, decls("two"))).await;
        assert!(report.succeeded(), "{}", report);
        let calls = f.provider.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &["create ns", "update sa", "delete ns"]
        );
        let new_id = &report.snapshot.resources["ns"].outputs["id"];
        assert_ne!(*new_id, old_id);
        assert_eq!(&f.provider.live()["ns"]["id"], new_id);
        assert_eq!(report.snapshot.resources["sa"].inputs["ns"], *new_id);
    }

    #[tokio::test]
    async fn test_sf012_delete_before_replace_order() {
        let f = fixture_with(
            MemoryProvider::new()
                .with_replace_triggers(&["name"])
                .with_delete_before_replace(),
            Policy::default(),
        );
        up(&f, &graph(&f.ctx, vec![ResourceDecl::new("t", "ns").input("name", "one")])).await;
        let report = up(&f, &graph(&f.ctx, vec![ResourceDecl::new("t", "ns").input("name", "two")])).await;
        assert!(report.succeeded());
        let calls = f.provider.calls();
        assert_eq!(&calls[calls.len() - 2..], &["delete ns", "create ns"]);
        assert_eq!(report.snapshot.resources["ns"].inputs["name"], Value::from("two"));
    }

    #[tokio::test]
    async fn test_sf012_exports_saved() {
        let f = fixture();
        let mut b = GraphBuilder::new(f.ctx.resolver.clone());
        let role = b
            .add_resource(ResourceDecl::new("t", "role").input("name", "lb"))
            .unwrap();
        b.export("roleId", role.reference("id"));
        let g = b.finalize().unwrap();

        let report = up(&f, &g).await;
        assert_eq!(
            report.snapshot.outputs["roleId"],
            report.snapshot.resources["role"].outputs["id"]
        );
    }

    #[tokio::test]
    async fn test_sf012_events_logged() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MemoryProvider::new().fail_on("b"));
        let mut reg = ProviderRegistry::new();
        reg.register("t", provider);
        let ctx = RunContext::builder("test", reg, Arc::new(MemoryStateStore::new()))
            .events(EventLog::new(dir.path(), "test"))
            .build();
        let g = chain(&ctx);
        let snap = new_snapshot("test");
        let plan = planner::plan(&g, &snap, &ctx).unwrap();
        apply(&plan, &g, snap, &ctx).await;

        let events = EventLog::new(dir.path(), "test").read_all().unwrap();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match &e.event {
                ProvenanceEvent::ApplyStarted { .. } => "started",
                ProvenanceEvent::StepStarted { .. } => "step",
                ProvenanceEvent::StepApplied { .. } => "applied",
                ProvenanceEvent::StepFailed { .. } => "failed",
                ProvenanceEvent::StepSkipped { .. } => "skipped",
                ProvenanceEvent::ApplyCompleted { .. } => "completed",
            })
            .collect();
        assert_eq!(kinds.first(), Some(&"started"));
        assert_eq!(kinds.last(), Some(&"completed"));
        assert_eq!(kinds.iter().filter(|k| **k == "failed").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "skipped").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "applied").count(), 2);
    }
}
