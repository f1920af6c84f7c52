//! Dependency resolution for a batch of requested tool invocations.
//!
//! Instead of a flat topological order, invocations are grouped into
//! batches: batch *k* holds every invocation whose declared dependencies
//! are all satisfied by batches `0..k-1`. Invocations within a batch have
//! no dependency relationship and may run concurrently.

use std::collections::HashMap;

use serde_json::Value;

// === Types ===

/// A requested tool call. Immutable once created.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Caller-visible identity (model-supplied id or generated).
    pub id: String,
    pub name: String,
    pub params: Value,
    /// Names of other tools in the same batch that must complete first.
    pub depends_on: Vec<String>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            id: format!("call_{}", &uuid::Uuid::new_v4().to_string()[..8]),
            name: name.into(),
            params,
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Fatal scheduling errors for a batch of invocations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("tool '{tool}' depends on '{dependency}', which is not in this request")]
    UnknownDependency { tool: String, dependency: String },
}

// === Resolution ===

/// Group invocations into dependency-ordered batches.
///
/// Within a batch, invocations keep the insertion order of the request
/// list, so scheduling is deterministic. An empty request resolves to
/// zero batches.
pub fn resolve(invocations: &[ToolInvocation]) -> Result<Vec<Vec<ToolInvocation>>, ResolveError> {
    if invocations.is_empty() {
        return Ok(Vec::new());
    }

    // Dependencies are declared by tool name; collapse duplicate
    // invocations of one tool onto a single graph node.
    let mut deps_by_name: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut insertion: Vec<&str> = Vec::new();
    for inv in invocations {
        let entry = deps_by_name.entry(inv.name.as_str()).or_insert_with(|| {
            insertion.push(inv.name.as_str());
            Vec::new()
        });
        for dep in &inv.depends_on {
            if !entry.contains(&dep.as_str()) {
                entry.push(dep.as_str());
            }
        }
    }

    for inv in invocations {
        for dep in &inv.depends_on {
            if !deps_by_name.contains_key(dep.as_str()) {
                return Err(ResolveError::UnknownDependency {
                    tool: inv.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    detect_cycles(&deps_by_name, &insertion)?;

    // Cycle-free: every node has a finite depth.
    let mut depth: HashMap<&str, usize> = HashMap::new();
    for name in &insertion {
        node_depth(name, &deps_by_name, &mut depth);
    }

    let batch_count = depth.values().copied().max().map_or(0, |d| d + 1);
    let mut batches: Vec<Vec<ToolInvocation>> = vec![Vec::new(); batch_count];
    for inv in invocations {
        let level = depth[inv.name.as_str()];
        batches[level].push(inv.clone());
    }
    Ok(batches)
}

fn node_depth<'a>(
    name: &'a str,
    deps: &HashMap<&'a str, Vec<&'a str>>,
    memo: &mut HashMap<&'a str, usize>,
) -> usize {
    if let Some(&d) = memo.get(name) {
        return d;
    }
    let d = deps[name]
        .iter()
        .map(|&dep| node_depth(dep, deps, memo) + 1)
        .max()
        .unwrap_or(0);
    memo.insert(name, d);
    d
}

/// Gray/black depth-first traversal. Reaching a gray node means the walk
/// re-entered a node still in progress; the stack slice from that node to
/// the top is the cycle.
fn detect_cycles<'a>(
    deps: &HashMap<&'a str, Vec<&'a str>>,
    insertion: &[&'a str],
) -> Result<(), ResolveError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Gray,
        Black,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        name: &'a str,
        deps: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), ResolveError> {
        match marks.get(name) {
            Some(Mark::Black) => return Ok(()),
            Some(Mark::Gray) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(ToString::to_string).collect();
                path.push(name.to_string());
                return Err(ResolveError::Cycle { path });
            }
            None => {}
        }
        marks.insert(name, Mark::Gray);
        stack.push(name);
        for &dep in &deps[name] {
            visit(dep, deps, marks, stack)?;
        }
        stack.pop();
        marks.insert(name, Mark::Black);
        Ok(())
    }

    for &name in insertion {
        visit(name, deps, &mut marks, &mut stack)?;
    }
    Ok(())
}
