//! SF-003: Resource graph construction.
//!
//! Builds a DAG from explicit `depends_on` edges, `provider` instance edges
//! and implicit edges discovered by scanning inputs for output references,
//! then computes a
//! topological order using Kahn's algorithm with declaration-order
//! tie-breaking.

use super::error::GraphError;
use super::output::{Output, OutputResolver};
use super::types::{Ensure, Input, InputLeaf, ResourceDecl};
use crate::providers::provider_package;
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Handle to a declared resource; mints outputs and references to it.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    name: String,
    resolver: OutputResolver,
}

impl ResourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lazy output `key` of this resource.
    pub fn output(&self, key: &str) -> Output {
        self.resolver.source(&self.name, key)
    }

    /// Direct reference to output `key`, usable as an input.
    pub fn reference(&self, key: &str) -> Input {
        Input::reference(&self.name, key)
    }
}

/// Accumulates declarations until [`GraphBuilder::finalize`].
#[derive(Debug)]
pub struct GraphBuilder {
    resolver: OutputResolver,
    decls: IndexMap<String, ResourceDecl>,
    exports: BTreeMap<String, Input>,
}

impl GraphBuilder {
    pub fn new(resolver: OutputResolver) -> Self {
        Self {
            resolver,
            decls: IndexMap::new(),
            exports: BTreeMap::new(),
        }
    }

    pub fn resolver(&self) -> &OutputResolver {
        &self.resolver
    }

    /// Declare a resource. Parents must be declared before their children.
    pub fn add_resource(&mut self, decl: ResourceDecl) -> Result<ResourceHandle, GraphError> {
        if self.decls.contains_key(&decl.name) {
            return Err(GraphError::DuplicateName { name: decl.name });
        }
        if let Some(parent) = &decl.options.parent {
            if !self.decls.contains_key(parent) {
                return Err(GraphError::InvalidParent {
                    resource: decl.name.clone(),
                    parent: parent.clone(),
                });
            }
        }
        let handle = ResourceHandle {
            name: decl.name.clone(),
            resolver: self.resolver.clone(),
        };
        self.decls.insert(decl.name.clone(), decl);
        Ok(handle)
    }

    /// Declare a stack export.
    pub fn export(&mut self, name: &str, value: impl Into<Input>) {
        self.exports.insert(name.to_string(), value.into());
    }

    /// Validate references, derive edges and order the graph.
    pub fn finalize(self) -> Result<Graph, GraphError> {
        let names: Vec<String> = self.decls.keys().cloned().collect();
        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); names.len()];

        for (idx, decl) in self.decls.values().enumerate() {
            for dep in &decl.options.depends_on {
                dependencies[idx].insert(self.index_of(&decl.name, dep)?);
            }
            for referenced in referenced_resources(&self.resolver, decl.inputs.values()) {
                dependencies[idx].insert(self.index_of(&decl.name, &referenced)?);
            }
            if let Some(provider) = &decl.options.provider {
                dependencies[idx].insert(self.provider_index(decl, provider)?);
            }
        }
        for referenced in referenced_resources(&self.resolver, self.exports.values()) {
            if !self.decls.contains_key(&referenced) {
                return Err(GraphError::UnknownDependency {
                    resource: "<stack outputs>".to_string(),
                    dependency: referenced,
                });
            }
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
        for (idx, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(idx);
            }
        }

        let order = topological_order(&dependencies, &dependents)
            .map_err(|remaining| GraphError::CycleDetected {
                cycle: find_cycle(&dependencies, &remaining)
                    .into_iter()
                    .map(|i| names[i].clone())
                    .collect(),
            })?;

        let nodes = self
            .decls
            .into_values()
            .zip(dependencies)
            .zip(dependents)
            .map(|((decl, deps), dependents)| GraphNode {
                decl,
                dependencies: deps.into_iter().collect(),
                dependents,
            })
            .collect();

        Ok(Graph {
            index: names.iter().cloned().enumerate().map(|(i, n)| (n, i)).collect(),
            nodes,
            order,
            exports: self.exports,
        })
    }

    fn provider_index(&self, decl: &ResourceDecl, provider: &str) -> Result<usize, GraphError> {
        match self.decls.get_full(provider) {
            Some((idx, _, instance)) if provider_package(&instance.resource_type).is_some() => Ok(idx),
            _ => Err(GraphError::InvalidProvider {
                resource: decl.name.clone(),
                provider: provider.to_string(),
            }),
        }
    }

    fn index_of(&self, resource: &str, dependency: &str) -> Result<usize, GraphError> {
        self.decls
            .get_index_of(dependency)
            .ok_or_else(|| GraphError::UnknownDependency {
                resource: resource.to_string(),
                dependency: dependency.to_string(),
            })
    }
}

/// Resources referenced (directly or through derived outputs) by `inputs`.
fn referenced_resources<'a>(
    resolver: &OutputResolver,
    inputs: impl Iterator<Item = &'a Input>,
) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    for input in inputs {
        input.walk(&mut |leaf| match leaf {
            InputLeaf::Ref(r) => {
                found.insert(r.resource.clone());
            }
            InputLeaf::Output(o) => found.extend(resolver.sources(o)),
        });
    }
    found
}

/// Kahn's algorithm; ties broken by declaration index. On a cycle, returns
/// the indices that could not be ordered.
fn topological_order(
    dependencies: &[BTreeSet<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == dependencies.len() {
        Ok(order)
    } else {
        Err((0..dependencies.len())
            .filter(|&i| in_degree[i] > 0)
            .collect())
    }
}

/// Extract one concrete cycle among `remaining` nodes (first node repeated
/// at the end).
fn find_cycle(dependencies: &[BTreeSet<usize>], remaining: &[usize]) -> Vec<usize> {
    let candidates: BTreeSet<usize> = remaining.iter().copied().collect();
    // Every unordered node sits on or downstream of a cycle, so following
    // unordered dependencies from any of them must revisit a node.
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut position: BTreeMap<usize, usize> = BTreeMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current]
            .iter()
            .find(|d| candidates.contains(d))
        else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle: Vec<usize> = path[at..].iter().rev().copied().collect();
            cycle.push(cycle[0]);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[derive(Debug)]
struct GraphNode {
    decl: ResourceDecl,
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
}

/// A finalized, acyclic resource graph.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    index: BTreeMap<String, usize>,
    order: Vec<usize>,
    exports: BTreeMap<String, Input>,
}

impl Graph {
    /// An empty graph; planning against it deletes everything.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            index: BTreeMap::new(),
            order: Vec::new(),
            exports: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDecl> {
        self.index.get(name).map(|&i| &self.nodes[i].decl)
    }

    /// Declaration index, used for deterministic tie-breaking.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Declarations in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceDecl> {
        self.nodes.iter().map(|n| &n.decl)
    }

    /// Declarations in topological order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceDecl> {
        self.order.iter().map(|&i| &self.nodes[i].decl)
    }

    /// Names in topological order.
    pub fn order(&self) -> Vec<&str> {
        self.ordered().map(|d| d.name.as_str()).collect()
    }

    /// Direct dependencies of `name`, in declaration order.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, |n| &n.dependencies)
    }

    /// Direct dependents of `name`, in declaration order.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, |n| &n.dependents)
    }

    fn neighbours<'a>(&'a self, name: &str, edges: fn(&GraphNode) -> &Vec<usize>) -> Vec<&'a str> {
        self.index
            .get(name)
            .map(|&i| {
                edges(&self.nodes[i])
                    .iter()
                    .map(|&j| self.nodes[j].decl.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All strict descendants of `name`.
    pub fn descendants(&self, name: &str) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self.index.get(name).into_iter().copied().collect();
        while let Some(i) = stack.pop() {
            for &j in &self.nodes[i].dependents {
                if seen.insert(self.nodes[j].decl.name.as_str()) {
                    stack.push(j);
                }
            }
        }
        seen
    }

    /// Whether `name` is declared `ensure: absent`.
    pub fn is_absent(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|d| d.options.ensure == Ensure::Absent)
    }

    pub fn exports(&self) -> &BTreeMap<String, Input> {
        &self.exports
    }
}
