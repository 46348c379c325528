//! SF-005: Deferred output resolution.
//!
//! Outputs form a lazy value graph. Leaves are resource outputs (known only
//! after the producing resource is applied) or literals; inner nodes are
//! `apply` transformations and `all` combinations. Inner nodes are evaluated
//! at most once, under the arena lock, and memoized.

use super::error::OutputError;
use super::types::{lookup_output, Input, Properties, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Pure transformation applied to a resolved value.
pub type ApplyFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Handle to a node in an [`OutputResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Output(usize);

enum Node {
    Literal(Value),
    Source { resource: String, key: String },
    Apply {
        input: Output,
        f: ApplyFn,
        cache: Option<Value>,
    },
    All {
        inputs: Vec<Output>,
        cache: Option<Value>,
    },
}

enum Completion {
    Applied(Properties),
    Failed,
}

#[derive(Default)]
struct Arena {
    nodes: Vec<Node>,
    sources: HashMap<(String, String), Output>,
    completed: HashMap<String, Completion>,
}

/// Shared, cheaply cloneable output graph.
#[derive(Clone, Default)]
pub struct OutputResolver {
    arena: Arc<Mutex<Arena>>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for OutputResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.lock();
        f.debug_struct("OutputResolver")
            .field("nodes", &arena.nodes.len())
            .field("completed", &arena.completed.len())
            .finish()
    }
}

impl OutputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, node: Node) -> Output {
        let mut arena = self.lock();
        arena.nodes.push(node);
        Output(arena.nodes.len() - 1)
    }

    /// Output `key` of `resource`. Repeated calls return the same handle.
    pub fn source(&self, resource: &str, key: &str) -> Output {
        let mut arena = self.lock();
        let id = (resource.to_string(), key.to_string());
        if let Some(existing) = arena.sources.get(&id) {
            return *existing;
        }
        arena.nodes.push(Node::Source {
            resource: resource.to_string(),
            key: key.to_string(),
        });
        let out = Output(arena.nodes.len() - 1);
        arena.sources.insert(id, out);
        out
    }

    /// An output that is already known.
    pub fn literal(&self, value: Value) -> Output {
        self.push(Node::Literal(value))
    }

    /// Lazily derive a new output from `input`.
    pub fn apply<F>(&self, input: Output, f: F) -> Output
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.push(Node::Apply {
            input,
            f: Arc::new(f),
            cache: None,
        })
    }

    /// Combine outputs into one list output, order-preserving.
    pub fn all(&self, inputs: &[Output]) -> Output {
        self.push(Node::All {
            inputs: inputs.to_vec(),
            cache: None,
        })
    }

    /// Record that `resource` was applied and produced `outputs`.
    pub fn fulfill(&self, resource: &str, outputs: Properties) {
        self.lock()
            .completed
            .insert(resource.to_string(), Completion::Applied(outputs));
        self.notify.notify_waiters();
    }

    /// Record that `resource` failed or was skipped; its outputs never resolve.
    pub fn abandon(&self, resource: &str) {
        self.lock()
            .completed
            .insert(resource.to_string(), Completion::Failed);
        self.notify.notify_waiters();
    }

    /// Forget completions and memoized values before a new apply run.
    pub fn reset(&self) {
        let mut arena = self.lock();
        arena.completed.clear();
        for node in arena.nodes.iter_mut() {
            match node {
                Node::Apply { cache, .. } | Node::All { cache, .. } => *cache = None,
                Node::Literal(_) | Node::Source { .. } => {}
            }
        }
    }

    pub fn is_complete(&self, resource: &str) -> bool {
        matches!(
            self.lock().completed.get(resource),
            Some(Completion::Applied(_))
        )
    }

    /// Resolve an output. Fails with `NotYetAvailable` if a producing
    /// resource has not completed.
    pub fn resolve(&self, output: Output) -> Result<Value, OutputError> {
        let mut arena = self.lock();
        eval(&mut arena, output)
    }

    /// Resolve an input expression to a concrete value.
    pub fn resolve_input(&self, input: &Input) -> Result<Value, OutputError> {
        let mut arena = self.lock();
        eval_input(&mut arena, input)
    }

    /// Resolve every input of a declaration.
    pub fn resolve_inputs(
        &self,
        inputs: &BTreeMap<String, Input>,
    ) -> Result<Properties, OutputError> {
        let mut arena = self.lock();
        inputs
            .iter()
            .map(|(k, v)| Ok((k.clone(), eval_input(&mut arena, v)?)))
            .collect()
    }

    /// Resolve, suspending until the producing resources complete.
    pub async fn wait(&self, output: Output) -> Result<Value, OutputError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.resolve(output) {
                Err(OutputError::NotYetAvailable { .. }) => notified.await,
                other => return other,
            }
        }
    }

    /// Resources whose outputs `output` transitively depends on.
    pub fn sources(&self, output: Output) -> BTreeSet<String> {
        let arena = self.lock();
        let mut found = BTreeSet::new();
        let mut stack = vec![output];
        while let Some(Output(id)) = stack.pop() {
            match arena.nodes.get(id) {
                Some(Node::Source { resource, .. }) => {
                    found.insert(resource.clone());
                }
                Some(Node::Apply { input, .. }) => stack.push(*input),
                Some(Node::All { inputs, .. }) => stack.extend(inputs.iter().copied()),
                Some(Node::Literal(_)) | None => {}
            }
        }
        found
    }

    /// Evaluate an input against externally known outputs without touching
    /// the memo. Returns `None` when any needed value is unknown.
    pub fn preview_input<'k>(
        &self,
        input: &Input,
        known: &dyn Fn(&str) -> Option<&'k Properties>,
    ) -> Option<Value> {
        let arena = self.lock();
        preview_input(&arena, input, known)
    }
}

fn eval(arena: &mut Arena, output: Output) -> Result<Value, OutputError> {
    let Output(id) = output;
    let pending = match arena.nodes.get(id) {
        Some(Node::Literal(v)) => return Ok(v.clone()),
        Some(Node::Source { resource, key }) => return lookup_source(arena, resource, key),
        Some(Node::Apply {
            cache: Some(v), ..
        })
        | Some(Node::All {
            cache: Some(v), ..
        }) => return Ok(v.clone()),
        Some(Node::Apply { input, f, .. }) => Pending::Apply(*input, Arc::clone(f)),
        Some(Node::All { inputs, .. }) => Pending::All(inputs.clone()),
        None => {
            return Err(OutputError::Transform {
                message: format!("dangling output handle {}", id),
            })
        }
    };

    let value = match pending {
        Pending::Apply(input, f) => {
            let upstream = eval(arena, input)?;
            f(&upstream).map_err(|message| OutputError::Transform { message })?
        }
        Pending::All(inputs) => Value::List(
            inputs
                .into_iter()
                .map(|o| eval(arena, o))
                .collect::<Result<_, _>>()?,
        ),
    };

    match arena.nodes.get_mut(id) {
        Some(Node::Apply { cache, .. }) | Some(Node::All { cache, .. }) => {
            *cache = Some(value.clone());
        }
        _ => {}
    }
    Ok(value)
}

enum Pending {
    Apply(Output, ApplyFn),
    All(Vec<Output>),
}

fn lookup_source(arena: &Arena, resource: &str, key: &str) -> Result<Value, OutputError> {
    match arena.completed.get(resource) {
        None => Err(OutputError::NotYetAvailable {
            resource: resource.to_string(),
        }),
        Some(Completion::Failed) => Err(OutputError::ProducerFailed {
            resource: resource.to_string(),
        }),
        Some(Completion::Applied(outputs)) => lookup_output(outputs, key)
            .cloned()
            .ok_or_else(|| OutputError::MissingOutput {
                resource: resource.to_string(),
                key: key.to_string(),
            }),
    }
}

fn eval_input(arena: &mut Arena, input: &Input) -> Result<Value, OutputError> {
    match input {
        Input::Literal(v) => Ok(v.clone()),
        Input::Ref(r) => lookup_source(arena, &r.resource, &r.key),
        Input::Output(o) => eval(arena, *o),
        Input::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|i| eval_input(arena, i))
                .collect::<Result<_, _>>()?,
        )),
        Input::Map(map) => Ok(Value::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), eval_input(arena, v)?)))
                .collect::<Result<_, OutputError>>()?,
        )),
    }
}

fn preview<'k>(
    arena: &Arena,
    output: Output,
    known: &dyn Fn(&str) -> Option<&'k Properties>,
) -> Option<Value> {
    match arena.nodes.get(output.0)? {
        Node::Literal(v) => Some(v.clone()),
        Node::Source { resource, key } => lookup_output(known(resource)?, key).cloned(),
        // Caches are ignored: they hold values from the live run, which may
        // be newer than what `known` describes.
        Node::Apply { input, f, .. } => f(&preview(arena, *input, known)?).ok(),
        Node::All { inputs, .. } => inputs
            .iter()
            .map(|o| preview(arena, *o, known))
            .collect::<Option<Vec<_>>>()
            .map(Value::List),
    }
}

fn preview_input<'k>(
    arena: &Arena,
    input: &Input,
    known: &dyn Fn(&str) -> Option<&'k Properties>,
) -> Option<Value> {
    match input {
        Input::Literal(v) => Some(v.clone()),
        Input::Ref(r) => lookup_output(known(&r.resource)?, &r.key).cloned(),
        Input::Output(o) => preview(arena, *o, known),
        Input::List(items) => items
            .iter()
            .map(|i| preview_input(arena, i, known))
            .collect::<Option<Vec<_>>>()
            .map(Value::List),
        Input::Map(map) => map
            .iter()
            .map(|(k, v)| Some((k.clone(), preview_input(arena, v, known)?)))
            .collect::<Option<BTreeMap<_, _>>>()
            .map(Value::Map),
    }
}
