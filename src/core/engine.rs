//! SF-019: Engine entry points: preview, up and destroy for one stack.

use super::context::RunContext;
use super::error::{EngineError, StateError};
use super::executor::{self, ApplyReport};
use super::graph::Graph;
use super::planner;
use super::state::new_snapshot;
use super::types::{Plan, Snapshot};

/// Load the stack's snapshot, or an empty one for a new stack.
pub fn load_snapshot(ctx: &RunContext) -> Result<Snapshot, StateError> {
    Ok(ctx
        .store
        .load(&ctx.stack)?
        .unwrap_or_else(|| new_snapshot(&ctx.stack)))
}

/// Plan without applying.
pub fn preview(graph: &Graph, ctx: &RunContext) -> Result<Plan, EngineError> {
    let snapshot = load_snapshot(ctx)?;
    Ok(planner::plan(graph, &snapshot, ctx)?)
}

/// Plan and apply.
pub async fn up(graph: &Graph, ctx: &RunContext) -> Result<(Plan, ApplyReport), EngineError> {
    let snapshot = load_snapshot(ctx)?;
    let plan = planner::plan(graph, &snapshot, ctx)?;
    let report = executor::apply(&plan, graph, snapshot, ctx).await;
    Ok((plan, report))
}

/// Delete every resource recorded for the stack, dependents first.
pub async fn destroy(ctx: &RunContext) -> Result<(Plan, ApplyReport), EngineError> {
    up(&Graph::empty(), ctx).await
}

/// Plan of what `destroy` would do.
pub fn preview_destroy(ctx: &RunContext) -> Result<Plan, EngineError> {
    preview(&Graph::empty(), ctx)
}
