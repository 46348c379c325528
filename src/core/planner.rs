//! SF-004: Plan generation: diff the desired graph against the snapshot.
//!
//! Every declared resource gets a step (NoOp included) so the executor can
//! publish snapshot outputs for unchanged resources. Steps form a partial
//! order; `Plan::steps` is a deterministic linearization of it in which no
//! step precedes a step it depends on.

use super::context::RunContext;
use super::error::PlanError;
use super::graph::Graph;
use super::types::{
    Ensure, Operation, Plan, PlanStep, Planned, Properties, ReplaceMode, ResourceDecl, Snapshot,
    StepId,
};
use crate::providers::{provider_package, DiffKind};
use crate::tripwire::hasher;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

/// Hash stored for a resource: its type, its resolved inputs, the
/// transforms applied to them and the provider instance it goes through.
pub fn input_hash(decl: &ResourceDecl, inputs: &Properties) -> String {
    let base = hasher::hash_properties(&decl.resource_type, inputs);
    let base = if decl.options.transforms.is_empty() {
        base
    } else {
        hasher::composite_hash(&[&base, &decl.options.transforms.join(",")])
    };
    match &decl.options.provider {
        None => base,
        Some(instance) => hasher::composite_hash(&[&base, &format!("provider={}", instance)]),
    }
}

/// Outcome of diffing one declared resource.
enum Decision {
    NoOp,
    Create,
    Update(Vec<String>),
    Replace(Vec<String>, ReplaceMode),
}

/// Steps as they are drafted; `deps` index into the draft list.
struct Draft {
    operation: Operation,
    resource: String,
    resource_type: String,
    changed: Vec<String>,
    replace: Option<ReplaceMode>,
    inputs: BTreeMap<String, Planned>,
    deps: BTreeSet<usize>,
}

impl Draft {
    fn new(operation: Operation, resource: &str, resource_type: &str) -> Self {
        Self {
            operation,
            resource: resource.to_string(),
            resource_type: resource_type.to_string(),
            changed: Vec::new(),
            replace: None,
            inputs: BTreeMap::new(),
            deps: BTreeSet::new(),
        }
    }
}

/// Generate a plan by comparing the graph to the snapshot.
pub fn plan(graph: &Graph, snapshot: &Snapshot, ctx: &RunContext) -> Result<Plan, PlanError> {
    check_deleted_dependencies(graph)?;

    let mut drafts: Vec<Draft> = Vec::new();
    // Step that stands for a resource's desired instance.
    let mut primary: BTreeMap<String, usize> = BTreeMap::new();
    let mut unchanged: BTreeSet<String> = BTreeSet::new();
    let mut create_before_delete: Vec<String> = Vec::new();

    for decl in graph.ordered() {
        if decl.options.ensure == Ensure::Absent {
            continue;
        }
        let inputs = preview_inputs(decl, snapshot, &unchanged, ctx);
        let decision = decide(graph, decl, &inputs, snapshot, ctx)?;

        let deps: BTreeSet<usize> = graph
            .dependencies(&decl.name)
            .iter()
            .filter_map(|d| primary.get(*d).copied())
            .collect();

        let mut draft = Draft::new(Operation::NoOp, &decl.name, &decl.resource_type);
        draft.inputs = inputs;
        draft.deps = deps;
        match decision {
            Decision::NoOp => {
                unchanged.insert(decl.name.clone());
            }
            Decision::Create => draft.operation = Operation::Create,
            Decision::Update(changed) => {
                draft.operation = Operation::Update;
                draft.changed = changed;
            }
            Decision::Replace(changed, mode) => {
                draft.operation = Operation::Create;
                draft.changed = changed.clone();
                draft.replace = Some(mode);
                match mode {
                    ReplaceMode::CreateBeforeDelete => create_before_delete.push(decl.name.clone()),
                    ReplaceMode::DeleteBeforeCreate => {
                        let old_type = snapshot
                            .resources
                            .get(&decl.name)
                            .map_or(decl.resource_type.as_str(), |s| s.resource_type.as_str());
                        let mut delete = Draft::new(Operation::Delete, &decl.name, old_type);
                        delete.changed = changed;
                        delete.replace = Some(mode);
                        drafts.push(delete);
                        draft.deps.insert(drafts.len() - 1);
                    }
                }
            }
        }
        drafts.push(draft);
        primary.insert(decl.name.clone(), drafts.len() - 1);
    }

    // Old halves of create-before-delete replacements: after the new
    // instance exists and every dependent has moved over to it.
    let mut old_deletes: BTreeMap<String, usize> = BTreeMap::new();
    for name in &create_before_delete {
        let Some(&create) = primary.get(name) else {
            continue;
        };
        let mut delete = Draft::new(
            Operation::Delete,
            name,
            snapshot
                .resources
                .get(name)
                .map_or(drafts[create].resource_type.as_str(), |s| s.resource_type.as_str()),
        );
        delete.changed = drafts[create].changed.clone();
        delete.replace = Some(ReplaceMode::CreateBeforeDelete);
        delete.deps.insert(create);
        delete.deps.extend(
            graph
                .dependents(name)
                .iter()
                .filter_map(|d| primary.get(*d).copied()),
        );
        drafts.push(delete);
        old_deletes.insert(name.clone(), drafts.len() - 1);
    }

    // Resources to remove: gone from the graph, or declared absent.
    let removed: Vec<&String> = snapshot
        .resources
        .keys()
        .filter(|name| !graph.contains(name) || graph.is_absent(name))
        .collect();
    let mut deletes: BTreeMap<&str, usize> = BTreeMap::new();
    for name in &removed {
        let state = &snapshot.resources[*name];
        let mut delete = Draft::new(Operation::Delete, name, &state.resource_type);
        delete.inputs = state
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), Planned::Known(v.clone())))
            .collect();
        drafts.push(delete);
        deletes.insert(name.as_str(), drafts.len() - 1);
    }
    for name in &removed {
        let idx = deletes[name.as_str()];
        for (other, state) in &snapshot.resources {
            let depended = state.dependencies.iter().any(|d| d == *name);
            let child = state.parent.as_deref() == Some(name.as_str());
            if !depended && !child {
                continue;
            }
            if let Some(&d) = deletes.get(other.as_str()) {
                drafts[idx].deps.insert(d);
            } else if depended {
                // A surviving former dependent must drop the reference first,
                // and so must its old instance if it is being replaced.
                if let Some(&p) = primary.get(other) {
                    drafts[idx].deps.insert(p);
                }
                if let Some(&old) = old_deletes.get(other) {
                    drafts[idx].deps.insert(old);
                }
            }
        }
        // The old instance of a replaced resource may still use the removed
        // one only if it depended on it; handled above. Conversely a removed
        // resource that depended on a replaced one goes before its old half.
        for dep in &snapshot.resources[*name].dependencies {
            if let Some(&old) = old_deletes.get(dep) {
                drafts[old].deps.insert(idx);
            }
        }
    }

    let steps = linearize(drafts);
    let count = |op: Operation| steps.iter().filter(|s| s.operation == op).count() as u32;
    let plan = Plan {
        stack: ctx.stack.clone(),
        to_create: count(Operation::Create),
        to_update: count(Operation::Update),
        to_delete: count(Operation::Delete),
        unchanged: count(Operation::NoOp),
        steps,
    };
    tracing::debug!(
        stack = %plan.stack,
        create = plan.to_create,
        update = plan.to_update,
        delete = plan.to_delete,
        unchanged = plan.unchanged,
        "plan computed"
    );
    Ok(plan)
}

/// A present resource may not depend on one declared absent.
fn check_deleted_dependencies(graph: &Graph) -> Result<(), PlanError> {
    for decl in graph.resources() {
        if decl.options.ensure == Ensure::Absent {
            continue;
        }
        if let Some(dep) = graph
            .dependencies(&decl.name)
            .into_iter()
            .find(|d| graph.is_absent(d))
        {
            return Err(PlanError::DeletedDependency {
                resource: decl.name.clone(),
                dependency: dep.to_string(),
            });
        }
    }
    Ok(())
}

/// Inputs as known before apply. References resolve only through resources
/// whose own step is NoOp, using their snapshot outputs.
fn preview_inputs(
    decl: &ResourceDecl,
    snapshot: &Snapshot,
    unchanged: &BTreeSet<String>,
    ctx: &RunContext,
) -> BTreeMap<String, Planned> {
    let known = |name: &str| {
        if unchanged.contains(name) {
            snapshot.resources.get(name).map(|s| &s.outputs)
        } else {
            None
        }
    };
    decl.inputs
        .iter()
        .map(|(key, input)| {
            let planned = ctx
                .resolver
                .preview_input(input, &known)
                .map_or(Planned::Unknown, Planned::Known);
            (key.clone(), planned)
        })
        .collect()
}

fn decide(
    graph: &Graph,
    decl: &ResourceDecl,
    inputs: &BTreeMap<String, Planned>,
    snapshot: &Snapshot,
    ctx: &RunContext,
) -> Result<Decision, PlanError> {
    let Some(old) = snapshot.resources.get(&decl.name) else {
        return Ok(Decision::Create);
    };
    if old.resource_type == decl.resource_type {
        let resolved: Option<Properties> = inputs
            .iter()
            .map(|(k, p)| match p {
                Planned::Known(v) => Some((k.clone(), v.clone())),
                Planned::Unknown => None,
            })
            .collect();
        if resolved.is_some_and(|props| input_hash(decl, &props) == old.hash) {
            return Ok(Decision::NoOp);
        }
    }

    let provider_error = |source| PlanError::Provider {
        resource: decl.name.clone(),
        source,
    };
    let package = decl
        .options
        .provider
        .as_deref()
        .and_then(|instance| graph.get(instance))
        .and_then(|instance| provider_package(&instance.resource_type));
    let provider = ctx
        .providers
        .route(&decl.resource_type, package)
        .map_err(provider_error)?;
    let mode = if decl.options.delete_before_replace || provider.delete_before_replace() {
        ReplaceMode::DeleteBeforeCreate
    } else {
        ReplaceMode::CreateBeforeDelete
    };
    if old.resource_type != decl.resource_type {
        return Ok(Decision::Replace(vec!["type".to_string()], mode));
    }
    if old.provider != decl.options.provider {
        return Ok(Decision::Replace(vec!["provider".to_string()], mode));
    }

    // Diff what the provider would be sent: both sides pass through the
    // declared transforms. Unknown inputs are left out of the rewrite.
    let transforms = &decl.options.transforms;
    let (old_inputs, new_inputs) = if transforms.is_empty() {
        (old.inputs.clone(), inputs.clone())
    } else {
        let known: Properties = inputs
            .iter()
            .filter_map(|(k, p)| match p {
                Planned::Known(v) => Some((k.clone(), v.clone())),
                Planned::Unknown => None,
            })
            .collect();
        let mut new_inputs: BTreeMap<String, Planned> = ctx
            .providers
            .prepare(transforms, known)
            .map_err(provider_error)?
            .into_iter()
            .map(|(k, v)| (k, Planned::Known(v)))
            .collect();
        new_inputs.extend(
            inputs
                .iter()
                .filter(|(_, p)| matches!(p, Planned::Unknown))
                .map(|(k, p)| (k.clone(), p.clone())),
        );
        let old_inputs = ctx
            .providers
            .prepare(transforms, old.inputs.clone())
            .map_err(provider_error)?;
        (old_inputs, new_inputs)
    };

    let mut triggers = provider.replace_triggers();
    triggers.extend(decl.options.replace_on_changes.iter().cloned());
    let diff = provider.diff(&old_inputs, &new_inputs, &triggers);
    Ok(match diff.kind {
        DiffKind::Replace => Decision::Replace(diff.changed, mode),
        DiffKind::Update => Decision::Update(diff.changed),
        // Submitted inputs equal, but the transform list changed.
        DiffKind::None if old.hash != input_hash(decl, &old.inputs) => {
            Decision::Update(vec!["transforms".to_string()])
        }
        // Only properties the transforms remove changed.
        DiffKind::None => Decision::NoOp,
    })
}

/// Kahn's algorithm over drafts, ties broken by draft order; assigns ids.
fn linearize(drafts: Vec<Draft>) -> Vec<PlanStep> {
    let n = drafts.len();
    let mut in_degree: Vec<usize> = drafts.iter().map(|d| d.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, d) in drafts.iter().enumerate() {
        for &dep in &d.deps {
            dependents[dep].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    if order.len() < n {
        // Only reachable with an inconsistent snapshot; keep every step.
        tracing::warn!(stuck = n - order.len(), "cyclic step dependencies in plan");
        let placed: BTreeSet<usize> = order.iter().copied().collect();
        order.extend((0..n).filter(|i| !placed.contains(i)));
    }

    let mut position = vec![0; n];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }
    let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
    order
        .iter()
        .enumerate()
        .filter_map(|(id, &i)| {
            let d = slots[i].take()?;
            let mut depends_on: Vec<StepId> = d.deps.iter().map(|&dep| position[dep]).collect();
            depends_on.sort_unstable();
            Some(PlanStep {
                id,
                operation: d.operation,
                resource: d.resource,
                resource_type: d.resource_type,
                changed: d.changed,
                replace: d.replace,
                inputs: d.inputs,
                depends_on,
            })
        })
        .collect()
}

impl Plan {
    /// True when applying would change nothing.
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.operation == Operation::NoOp)
    }

    /// Steps that change something.
    pub fn changes(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.operation != Operation::NoOp)
    }

    /// Number of resources being replaced.
    pub fn replacements(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.replace.is_some() && s.operation == Operation::Create)
            .count()
    }

    /// Steps touching `resource`, in plan order.
    pub fn steps_for<'a>(&'a self, resource: &'a str) -> impl Iterator<Item = &'a PlanStep> {
        self.steps.iter().filter(move |s| s.resource == resource)
    }
}

impl PlanStep {
    fn symbol(&self) -> char {
        match (self.operation, self.replace) {
            (_, Some(_)) => '±',
            (Operation::Create, None) => '+',
            (Operation::Update, None) => '~',
            (Operation::Delete, None) => '-',
            (Operation::NoOp, None) => ' ',
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) {}",
            self.symbol(),
            self.resource,
            self.resource_type,
            self.operation
        )?;
        match self.replace {
            Some(ReplaceMode::CreateBeforeDelete) if self.operation == Operation::Delete => {
                write!(f, " [replaced, old instance]")?
            }
            Some(ReplaceMode::CreateBeforeDelete) => write!(f, " [replace]")?,
            Some(ReplaceMode::DeleteBeforeCreate) => write!(f, " [replace, delete first]")?,
            None => {}
        }
        if !self.changed.is_empty() {
            write!(f, ": {}", self.changed.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Planning: {} ({} steps)", self.stack, self.steps.len())?;
        for step in self.changes() {
            writeln!(f, "  {}", step)?;
            if step.operation != Operation::Delete {
                for key in &step.changed {
                    if let Some(value) = step.inputs.get(key) {
                        writeln!(f, "      {} = {}", key, value)?;
                    }
                }
            }
        }
        if self.is_empty() {
            writeln!(f, "  No changes.")?;
        }
        write!(
            f,
            "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
            self.to_create, self.to_update, self.to_delete, self.unchanged
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::GraphBuilder;
    use crate::core::output::OutputResolver;
    use crate::core::state::{new_snapshot, MemoryStateStore};
    use crate::core::types::{Input, ResourceState, Value};
    use crate::providers::memory::MemoryProvider;
    use crate::providers::ProviderRegistry;
    use std::sync::Arc;

    fn context_with(provider: MemoryProvider) -> RunContext {
        let mut reg = ProviderRegistry::new();
        reg.register("t", Arc::new(provider));
        RunContext::builder("test", reg, Arc::new(MemoryStateStore::new())).build()
    }

    fn ctx() -> RunContext {
        context_with(MemoryProvider::new())
    }

    fn graph(ctx: &RunContext, decls: Vec<ResourceDecl>) -> Graph {
        let mut b = GraphBuilder::new(ctx.resolver.clone());
        for d in decls {
            b.add_resource(d).unwrap();
        }
        b.finalize().unwrap()
    }

    /// Snapshot entry as the executor would record it.
    fn applied(snap: &mut Snapshot, decl: &ResourceDecl, inputs: &[(&str, &str)], deps: &[&str]) {
        let props: Properties = inputs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect();
        let mut outputs = props.clone();
        outputs.insert("id".to_string(), Value::from(format!("{}-id", decl.name)));
        snap.resources.insert(
            decl.name.clone(),
            ResourceState {
                resource_type: decl.resource_type.clone(),
                hash: input_hash(decl, &props),
                inputs: props,
                outputs,
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                parent: decl.options.parent.clone(),
                provider: decl.options.provider.clone(),
            },
        );
    }

    fn ops(plan: &Plan) -> Vec<(Operation, &str)> {
        plan.steps
            .iter()
            .map(|s| (s.operation, s.resource.as_str()))
            .collect()
    }

    fn assert_ordered(plan: &Plan) {
        for step in &plan.steps {
            for &dep in &step.depends_on {
                assert!(dep < step.id, "step {} depends on later step {}", step.id, dep);
            }
        }
    }

    #[test]
    fn test_sf004_empty_snapshot_creates_everything() {
        let ctx = ctx();
        let g = graph(
            &ctx,
            vec![
                ResourceDecl::new("t", "b").input("x", Input::reference("a", "id")),
                ResourceDecl::new("t", "a").input("v", "1"),
            ],
        );
        let plan = plan(&g, &new_snapshot("test"), &ctx).unwrap();
        assert_eq!(ops(&plan), vec![(Operation::Create, "a"), (Operation::Create, "b")]);
        assert_eq!(plan.steps[1].depends_on, vec![0]);
        assert_eq!(plan.steps[1].inputs["x"], Planned::Unknown);
        assert_eq!(plan.to_create, 2);
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_sf004_identical_inputs_are_noop() {
        let ctx = ctx();
        let a = ResourceDecl::new("t", "a").input("v", "1");
        let b = ResourceDecl::new("t", "b").input("x", Input::reference("a", "v"));
        let mut snap = new_snapshot("test");
        applied(&mut snap, &a, &[("v", "1")], &[]);
        applied(&mut snap, &b, &[("x", "1")], &["a"]);

        let g = graph(&ctx, vec![a, b]);
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 2);
    }

    #[test]
    fn test_sf004_update_x_delete_y_unconstrained() {
        let ctx = ctx();
        let x_old = ResourceDecl::new("t", "x").input("v", "1");
        let y = ResourceDecl::new("t", "y").input("v", "1");
        let mut snap = new_snapshot("test");
        applied(&mut snap, &x_old, &[("v", "1")], &[]);
        applied(&mut snap, &y, &[("v", "1")], &[]);

        let g = graph(&ctx, vec![ResourceDecl::new("t", "x").input("v", "2")]);
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(ops(&plan), vec![(Operation::Update, "x"), (Operation::Delete, "y")]);
        assert!(plan.steps.iter().all(|s| s.depends_on.is_empty()));
        assert_eq!(plan.steps[0].changed, vec!["v"]);
    }

    #[test]
    fn test_sf004_removed_resource_deleted_after_former_dependent() {
        let ctx = ctx();
        let y = ResourceDecl::new("t", "y").input("v", "1");
        let x_old = ResourceDecl::new("t", "x").input("ref", Input::reference("y", "id"));
        let mut snap = new_snapshot("test");
        applied(&mut snap, &y, &[("v", "1")], &[]);
        applied(&mut snap, &x_old, &[("ref", "y-id")], &["y"]);

        let g = graph(&ctx, vec![ResourceDecl::new("t", "x").input("ref", "static")]);
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(ops(&plan), vec![(Operation::Update, "x"), (Operation::Delete, "y")]);
        assert_eq!(plan.steps[1].depends_on, vec![0]);
    }

    #[test]
    fn test_sf004_removed_chain_deletes_in_reverse_dependency_order() {
        let ctx = ctx();
        let a = ResourceDecl::new("t", "a");
        let b = ResourceDecl::new("t", "b");
        let c = ResourceDecl::new("t", "c").parent("a");
        let mut snap = new_snapshot("test");
        applied(&mut snap, &a, &[], &[]);
        applied(&mut snap, &b, &[], &["a"]);
        applied(&mut snap, &c, &[], &[]);

        let plan = plan(&Graph::empty(), &snap, &ctx).unwrap();
        let order: Vec<&str> = plan.steps.iter().map(|s| s.resource.as_str()).collect();
        let pos = |n: &str| order.iter().position(|o| *o == n).unwrap();
        assert!(pos("b") < pos("a"));
        assert!(pos("c") < pos("a"));
        assert_eq!(plan.to_delete, 3);
        assert_ordered(&plan);
    }

    #[test]
    fn test_sf004_unchanged_upstream_resolves_from_snapshot() {
        let ctx = ctx();
        let role = ResourceDecl::new("t", "role").input("name", "lb");
        let mut snap = new_snapshot("test");
        applied(&mut snap, &role, &[("name", "lb")], &[]);
        let arn = ctx.resolver.source("role", "id");
        let annotated = ctx
            .resolver
            .apply(arn, |v| Ok(Value::from(format!("arn={}", v.render()))));
        let sa = ResourceDecl::new("t", "sa").input("annotation", annotated);

        let g = graph(&ctx, vec![role, sa]);
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(ops(&plan), vec![(Operation::NoOp, "role"), (Operation::Create, "sa")]);
        assert_eq!(
            plan.steps[1].inputs["annotation"],
            Planned::Known(Value::from("arn=role-id"))
        );
    }

    #[test]
    fn test_sf004_changed_upstream_makes_reference_unknown() {
        let ctx = ctx();
        let a_old = ResourceDecl::new("t", "a").input("v", "1");
        let b = ResourceDecl::new("t", "b").input("x", Input::reference("a", "v"));
        let mut snap = new_snapshot("test");
        applied(&mut snap, &a_old, &[("v", "1")], &[]);
        applied(&mut snap, &b, &[("x", "1")], &["a"]);

        let g = graph(&ctx, vec![ResourceDecl::new("t", "a").input("v", "2"), b]);
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(ops(&plan), vec![(Operation::Update, "a"), (Operation::Update, "b")]);
        assert_eq!(plan.steps[1].inputs["x"], Planned::Unknown);
        assert_eq!(plan.steps[1].depends_on, vec![0]);
    }

    #[test]
    fn test_sf004_replace_create_before_delete() {
        let ctx = context_with(MemoryProvider::new().with_replace_triggers(&["name"]));
        let ns_old = ResourceDecl::new("t", "ns").input("name", "old");
        let sa = ResourceDecl::new("t", "sa").input("ns", Input::reference("ns", "name"));
        let mut snap = new_snapshot("test");
        applied(&mut snap, &ns_old, &[("name", "old")], &[]);
        applied(&mut snap, &sa, &[("ns", "old")], &["ns"]);

        let g = graph(&ctx, vec![ResourceDecl::new("t", "ns").input("name", "new"), sa]);
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(
            ops(&plan),
            vec![
                (Operation::Create, "ns"),
                (Operation::Update, "sa"),
                (Operation::Delete, "ns"),
            ]
        );
        assert_eq!(plan.steps[2].depends_on, vec![0, 1]);
        assert_eq!(plan.replacements(), 1);
        assert_ordered(&plan);
    }

    #[test]
    fn test_sf004_replace_on_changes_option() {
        let ctx = ctx();
        let old = ResourceDecl::new("t", "bucket").input("region", "us-east-1");
        let mut snap = new_snapshot("test");
        applied(&mut snap, &old, &[("region", "us-east-1")], &[]);

        let g = graph(
            &ctx,
            vec![ResourceDecl::new("t", "bucket")
                .input("region", "us-west-1")
                .replace_on_changes("region")
                .delete_before_replace()],
        );
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(
            ops(&plan),
            vec![(Operation::Delete, "bucket"), (Operation::Create, "bucket")]
        );
        assert_eq!(plan.steps[1].depends_on, vec![0]);
        assert_eq!(plan.steps[0].replace, Some(ReplaceMode::DeleteBeforeCreate));
    }

    #[test]
    fn test_sf004_type_change_replaces() {
        let ctx = ctx();
        let mut snap = new_snapshot("test");
        let old = ResourceDecl::new("t", "thing");
        applied(&mut snap, &old, &[], &[]);
        snap.resources.get_mut("thing").unwrap().resource_type = "legacy".to_string();

        let g = graph(&ctx, vec![ResourceDecl::new("t", "thing")]);
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(plan.steps[0].changed, vec!["type"]);
        assert_eq!(plan.steps[1].resource_type, "legacy");
    }

    #[test]
    fn test_sf004_absent_resource_deleted() {
        let ctx = ctx();
        let mut snap = new_snapshot("test");
        let old = ResourceDecl::new("t", "legacy");
        applied(&mut snap, &old, &[], &[]);

        let g = graph(
            &ctx,
            vec![
                ResourceDecl::new("t", "legacy").absent(),
                ResourceDecl::new("t", "never").absent(),
            ],
        );
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(ops(&plan), vec![(Operation::Delete, "legacy")]);
    }

    #[test]
    fn test_sf004_reference_to_deleted_resource_is_error() {
        let ctx = ctx();
        let g = graph(
            &ctx,
            vec![
                ResourceDecl::new("t", "role").absent(),
                ResourceDecl::new("t", "sa").input("arn", Input::reference("role", "arn")),
            ],
        );
        let err = plan(&g, &new_snapshot("test"), &ctx).unwrap_err();
        assert_eq!(
            err,
            PlanError::DeletedDependency {
                resource: "sa".into(),
                dependency: "role".into()
            }
        );
    }

    #[test]
    fn test_sf004_unknown_provider_is_plan_error() {
        let ctx = ctx();
        let decl = ResourceDecl::new("gcp:Bucket", "b");
        let mut snap = new_snapshot("test");
        applied(&mut snap, &decl, &[], &[]);
        let g = graph(&ctx, vec![ResourceDecl::new("gcp:Bucket", "b").input("v", "1")]);
        assert!(matches!(
            plan(&g, &snap, &ctx),
            Err(PlanError::Provider { .. })
        ));
    }

    #[test]
    fn test_sf004_transform_list_change_updates() {
        let ctx = ctx();
        let old = ResourceDecl::new("t", "chart").input("v", "1");
        let mut snap = new_snapshot("test");
        applied(&mut snap, &old, &[("v", "1")], &[]);
        let g = graph(
            &ctx,
            vec![ResourceDecl::new("t", "chart")
                .input("v", "1")
                .transform("strip-crd-status")],
        );
        let plan = plan(&g, &snap, &ctx).unwrap();
        assert_eq!(plan.steps[0].operation, Operation::Update);
        assert_eq!(plan.steps[0].changed, vec!["transforms"]);
    }

    #[test]
    fn test_sf004_diff_sees_transformed_inputs() {
        let ctx = ctx();
        let crd = |status: &str, spec: &str| {
            ResourceDecl::new("t", "crd")
                .input("kind", "CustomResourceDefinition")
                .input("status", status)
                .input("spec", spec)
                .transform("strip-crd-status")
        };
        let mut snap = new_snapshot("test");
        applied(
            &mut snap,
            &crd("old", "v1"),
            &[("kind", "CustomResourceDefinition"), ("status", "old"), ("spec", "v1")],
            &[],
        );

        let status_only = plan(&graph(&ctx, vec![crd("new", "v1")]), &snap, &ctx).unwrap();
        assert_eq!(status_only.steps[0].operation, Operation::NoOp);

        let spec_changed = plan(&graph(&ctx, vec![crd("new", "v2")]), &snap, &ctx).unwrap();
        assert_eq!(spec_changed.steps[0].operation, Operation::Update);
        assert_eq!(spec_changed.steps[0].changed, vec!["spec"]);
    }

    #[test]
    fn test_sf004_provider_instance_routes_diff() {
        let mut reg = ProviderRegistry::new();
        reg.register("t", Arc::new(MemoryProvider::new()));
        reg.register_package(
            "kubernetes",
            Arc::new(MemoryProvider::new().with_replace_triggers(&["name"])),
        );
        let ctx = RunContext::builder("test", reg, Arc::new(MemoryStateStore::new())).build();
        let k8s = ResourceDecl::new("providers:kubernetes", "k8s").input("kubeconfig", "a");
        let other = ResourceDecl::new("providers:kubernetes", "other").input("kubeconfig", "b");
        let ns = |name: &str, instance: &str| {
            ResourceDecl::new("t", "ns")
                .input("name", name)
                .provider(instance)
        };
        let mut snap = new_snapshot("test");
        applied(&mut snap, &k8s, &[("kubeconfig", "a")], &[]);
        applied(&mut snap, &other, &[("kubeconfig", "b")], &[]);
        applied(&mut snap, &ns("one", "k8s"), &[("name", "one")], &["k8s"]);

        let same = plan(
            &graph(&ctx, vec![k8s.clone(), other.clone(), ns("one", "k8s")]),
            &snap,
            &ctx,
        )
        .unwrap();
        assert!(same.is_empty());

        // The package provider's replace triggers apply, not the type's.
        let renamed = plan(
            &graph(&ctx, vec![k8s.clone(), other.clone(), ns("two", "k8s")]),
            &snap,
            &ctx,
        )
        .unwrap();
        let create = |p: &Plan| {
            p.steps_for("ns")
                .find(|s| s.operation == Operation::Create)
                .cloned()
                .unwrap()
        };
        let step = create(&renamed);
        assert!(step.replace.is_some());
        assert_eq!(step.changed, vec!["name"]);

        let moved = plan(&graph(&ctx, vec![k8s, other, ns("one", "other")]), &snap, &ctx).unwrap();
        let step = create(&moved);
        assert!(step.replace.is_some());
        assert_eq!(step.changed, vec!["provider"]);
    }

    #[test]
    fn test_sf004_deterministic_declaration_order() {
        let ctx = ctx();
        let decls = || {
            vec![
                ResourceDecl::new("t", "zeta"),
                ResourceDecl::new("t", "alpha"),
                ResourceDecl::new("t", "mid"),
            ]
        };
        let first = plan(&graph(&ctx, decls()), &new_snapshot("test"), &ctx).unwrap();
        let second = plan(&graph(&ctx, decls()), &new_snapshot("test"), &ctx).unwrap();
        let names = |p: &Plan| p.steps.iter().map(|s| s.resource.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), vec!["zeta", "alpha", "mid"]);
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_sf004_display() {
        let ctx = ctx();
        let mut snap = new_snapshot("test");
        let gone = ResourceDecl::new("t", "gone");
        applied(&mut snap, &gone, &[], &[]);
        let g = graph(&ctx, vec![ResourceDecl::new("t", "role").input("name", "lb")]);
        let text = plan(&g, &snap, &ctx).unwrap().to_string();
        assert!(text.contains("+ role (t) CREATE"));
        assert!(text.contains("- gone (t) DELETE"));
        assert!(text.contains("Plan: 1 to add, 0 to change, 1 to destroy, 0 unchanged."));
    }
}
