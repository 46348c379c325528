//! SF-001: Core data model: values, inputs, declarations, snapshots, plans,
//! apply results and provenance events.
//!
//! Concrete data is a [`Value`]; declared data is an [`Input`], which may
//! still contain references to outputs that only exist after provisioning.
//! Maps are `BTreeMap`s so that serialized snapshots are diff-stable.

use super::output::Output;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Values
// ============================================================================

/// A fully resolved value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Named values: resource inputs and outputs.
pub type Properties = BTreeMap<String, Value>;

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Render for string interpolation: strings verbatim, everything else as
    /// canonical JSON.
    pub fn render(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Walk a dotted path (`metadata.name`) through nested maps.
    pub fn lookup_path(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(self, |current, segment| current.as_map()?.get(segment))
    }
}

impl fmt::Display for Value {
    /// Canonical JSON. Map keys are sorted, so equal values render equally.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<serde_yaml_ng::Value> for Value {
    fn from(v: serde_yaml_ng::Value) -> Self {
        match v {
            serde_yaml_ng::Value::Null => Self::Null,
            serde_yaml_ng::Value::Bool(b) => Self::Bool(b),
            serde_yaml_ng::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            serde_yaml_ng::Value::String(s) => Self::String(s),
            serde_yaml_ng::Value::Sequence(seq) => {
                Self::List(seq.into_iter().map(Self::from).collect())
            }
            serde_yaml_ng::Value::Mapping(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (yaml_key_to_string(&k), Self::from(v)))
                    .collect(),
            ),
            serde_yaml_ng::Value::Tagged(tagged) => Self::from(tagged.value),
        }
    }
}

/// Convert a YAML mapping key to a string key.
pub fn yaml_key_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// Look up an output key, falling back to a dotted path into nested maps.
pub fn lookup_output<'a>(outputs: &'a Properties, key: &str) -> Option<&'a Value> {
    if let Some(v) = outputs.get(key) {
        return Some(v);
    }
    let (head, rest) = key.split_once('.')?;
    outputs.get(head)?.lookup_path(rest)
}

// ============================================================================
// Inputs
// ============================================================================

/// Reference to an output of another resource: `${resource.key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub resource: String,
    pub key: String,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.key)
    }
}

/// A declared input: a literal, a reference, a derived output, or a
/// composite of inputs.
#[derive(Debug, Clone)]
pub enum Input {
    Literal(Value),
    Ref(OutputRef),
    Output(Output),
    List(Vec<Input>),
    Map(BTreeMap<String, Input>),
}

impl Input {
    pub fn reference(resource: &str, key: &str) -> Self {
        Self::Ref(OutputRef {
            resource: resource.to_string(),
            key: key.to_string(),
        })
    }

    /// Visit every direct reference and derived output in this input.
    pub fn walk(&self, visit: &mut dyn FnMut(InputLeaf<'_>)) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => visit(InputLeaf::Ref(r)),
            Self::Output(o) => visit(InputLeaf::Output(*o)),
            Self::List(items) => items.iter().for_each(|i| i.walk(visit)),
            Self::Map(map) => map.values().for_each(|i| i.walk(visit)),
        }
    }
}

/// A non-literal leaf of an [`Input`].
#[derive(Debug, Clone, Copy)]
pub enum InputLeaf<'a> {
    Ref(&'a OutputRef),
    Output(Output),
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Self::Literal(v)
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Self::Literal(Value::from(s))
    }
}

impl From<Output> for Input {
    fn from(o: Output) -> Self {
        Self::Output(o)
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// Whether a declared resource should exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ensure {
    #[default]
    Present,
    Absent,
}

/// Lifecycle options of a declared resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    /// Explicit ordering constraints
    pub depends_on: Vec<String>,
    /// Ownership grouping; not an ordering edge
    pub parent: Option<String>,
    /// Explicit provider instance: a `providers:<package>` resource whose
    /// outputs configure the backend this resource is submitted to
    pub provider: Option<String>,
    /// Extra properties whose change forces replacement
    pub replace_on_changes: Vec<String>,
    /// Delete the old instance before creating its replacement
    pub delete_before_replace: bool,
    /// Named manifest transforms, applied in order before submission
    pub transforms: Vec<String>,
    pub ensure: Ensure,
}

/// A single resource declaration.
#[derive(Debug, Clone)]
pub struct ResourceDecl {
    pub resource_type: String,
    pub name: String,
    pub inputs: BTreeMap<String, Input>,
    pub options: ResourceOptions,
}

impl ResourceDecl {
    pub fn new(resource_type: &str, name: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            inputs: BTreeMap::new(),
            options: ResourceOptions::default(),
        }
    }

    pub fn input(mut self, key: &str, value: impl Into<Input>) -> Self {
        self.inputs.insert(key.to_string(), value.into());
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.options.depends_on.push(name.to_string());
        self
    }

    pub fn parent(mut self, name: &str) -> Self {
        self.options.parent = Some(name.to_string());
        self
    }

    pub fn provider(mut self, name: &str) -> Self {
        self.options.provider = Some(name.to_string());
        self
    }

    pub fn replace_on_changes(mut self, property: &str) -> Self {
        self.options.replace_on_changes.push(property.to_string());
        self
    }

    pub fn delete_before_replace(mut self) -> Self {
        self.options.delete_before_replace = true;
        self
    }

    pub fn transform(mut self, name: &str) -> Self {
        self.options.transforms.push(name.to_string());
        self
    }

    pub fn absent(mut self) -> Self {
        self.options.ensure = Ensure::Absent;
        self
    }
}

// ============================================================================
// Stack file
// ============================================================================

/// Root of a stack file: the desired state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFile {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Stack name; also names the snapshot
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Configuration values substituted into `{{config.key}}` templates
    #[serde(default)]
    pub config: IndexMap<String, serde_yaml_ng::Value>,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: IndexMap<String, ResourceSpec>,

    /// Stack exports
    #[serde(default)]
    pub outputs: IndexMap<String, serde_yaml_ng::Value>,

    #[serde(default)]
    pub policy: Policy,
}

/// A resource as written in a stack file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default)]
    pub inputs: IndexMap<String, serde_yaml_ng::Value>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub parent: Option<String>,

    /// Name of a `providers:<package>` resource to route through
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub replace_on_changes: Vec<String>,

    #[serde(default)]
    pub delete_before_replace: bool,

    #[serde(default)]
    pub transforms: Vec<String>,

    #[serde(default)]
    pub ensure: Ensure,
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum number of in-flight provider calls
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Per-call provider timeout; 0 disables it
    #[serde(default = "default_timeout")]
    pub operation_timeout_secs: u64,

    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Append provenance events to the stack's event log
    #[serde(default = "default_true")]
    pub tripwire: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            operation_timeout_secs: default_timeout(),
            failure: FailurePolicy::default(),
            tripwire: true,
        }
    }
}

impl Policy {
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_secs > 0).then(|| Duration::from_secs(self.operation_timeout_secs))
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep applying branches unrelated to the failure
    #[default]
    ContinueIndependent,
    /// Stop scheduling new operations after the first failure
    StopOnFirst,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Last-known applied state of a stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema: String,
    pub stack: String,
    pub generator: String,

    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,

    /// Resolved stack exports
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Last-applied state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    #[serde(rename = "type")]
    pub resource_type: String,

    /// BLAKE3 hash of the canonical inputs
    pub hash: String,

    #[serde(default)]
    pub inputs: Properties,

    #[serde(default)]
    pub outputs: Properties,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Provider instance the resource was created through; deletes are
    /// routed back through it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

// ============================================================================
// Plan
// ============================================================================

/// Operation to perform on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// How a replacement is sequenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    CreateBeforeDelete,
    DeleteBeforeCreate,
}

/// An input value as known at plan time.
#[derive(Debug, Clone, PartialEq)]
pub enum Planned {
    Known(Value),
    /// Depends on an output that will only exist after apply
    Unknown,
}

impl fmt::Display for Planned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{}", v),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

/// Index of a step within [`Plan::steps`].
pub type StepId = usize;

/// A single planned operation.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub id: StepId,
    pub operation: Operation,
    pub resource: String,
    pub resource_type: String,
    /// Properties that differ from the snapshot
    pub changed: Vec<String>,
    /// Set on both halves of a replacement
    pub replace: Option<ReplaceMode>,
    /// Inputs as known at plan time
    pub inputs: BTreeMap<String, Planned>,
    /// Steps that must succeed before this one starts
    pub depends_on: Vec<StepId>,
}

/// Ordered, partially-ordered set of operations.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub stack: String,
    pub steps: Vec<PlanStep>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

// ============================================================================
// Apply results
// ============================================================================

/// Why a step was not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DependencyFailed { dependency: String },
}

/// Final status of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Applied,
    Unchanged,
    Failed(String),
    Skipped(SkipReason),
    /// Never scheduled because the run was cancelled or stopped
    Cancelled,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "APPLIED"),
            Self::Unchanged => write!(f, "UNCHANGED"),
            Self::Failed(reason) => write!(f, "FAILED ({})", reason),
            Self::Skipped(SkipReason::DependencyFailed { dependency }) => {
                write!(f, "SKIPPED (dependency '{}' failed)", dependency)
            }
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Result of one plan step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step: StepId,
    pub resource: String,
    pub operation: Operation,
    pub status: ResourceStatus,
    pub duration: Duration,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        stack: String,
        run_id: String,
        stackform_version: String,
    },
    StepStarted {
        stack: String,
        resource: String,
        operation: String,
    },
    StepApplied {
        stack: String,
        resource: String,
        operation: String,
        duration_seconds: f64,
        hash: String,
    },
    StepFailed {
        stack: String,
        resource: String,
        error: String,
    },
    StepSkipped {
        stack: String,
        resource: String,
        dependency: String,
    },
    ApplyCompleted {
        stack: String,
        run_id: String,
        applied: u32,
        unchanged: u32,
        failed: u32,
        skipped: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Tests
// ============================================================================
