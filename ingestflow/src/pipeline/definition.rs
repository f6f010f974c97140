//! The pipeline definition graph and its readiness computation.

use super::RetryPolicy;
use crate::errors::GraphError;
use crate::ledger::LedgerEntry;
use std::collections::{BTreeSet, HashMap, HashSet};

/// One node in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageNode {
    /// Unique id of the stage within the definition.
    pub stage_id: String,
    /// Registered stage type resolving to a [`crate::stages::Stage`]
    /// implementation.
    pub stage_type: String,
    /// Ids of stages that must reach a satisfying terminal state first.
    pub depends_on: BTreeSet<String>,
    /// Retry behavior for transient failures.
    pub retry: RetryPolicy,
}

impl StageNode {
    /// Creates a node with no dependencies and the default retry policy.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, stage_type: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            stage_type: stage_type.into(),
            depends_on: BTreeSet::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Adds a dependency edge.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    /// Adds several dependency edges.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A directed acyclic graph of stage nodes.
///
/// Declaration order is preserved only for deterministic iteration; ordering
/// semantics come exclusively from the explicit dependency edges.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    id: String,
    nodes: Vec<StageNode>,
    index: HashMap<String, usize>,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Appends a stage node. Duplicate ids are caught by [`Self::validate`].
    #[must_use]
    pub fn with_stage(mut self, node: StageNode) -> Self {
        self.index
            .entry(node.stage_id.clone())
            .or_insert(self.nodes.len());
        self.nodes.push(node);
        self
    }

    /// The definition id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of stage nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the definition has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, stage_id: &str) -> Option<&StageNode> {
        self.index.get(stage_id).map(|&i| &self.nodes[i])
    }

    /// Iterates nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes.iter()
    }

    /// Iterates stage ids in declaration order.
    pub fn stage_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.stage_id.as_str())
    }

    /// Validates the definition before any execution starts.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::EmptyDefinition`], [`GraphError::DuplicateStage`],
    /// [`GraphError::UnknownDependency`], or [`GraphError::CyclicGraph`] with
    /// the offending cycle path.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyDefinition);
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.stage_id.as_str()) {
                return Err(GraphError::DuplicateStage {
                    stage_id: node.stage_id.clone(),
                });
            }
        }

        for node in &self.nodes {
            for dep in &node.depends_on {
                if !self.index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        stage_id: node.stage_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Depth-first traversal with a recursion-stack marker.
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();
        for node in &self.nodes {
            if let Some(path) =
                self.find_cycle(&node.stage_id, &mut visited, &mut stack, &mut on_stack)
            {
                return Err(GraphError::CyclicGraph { path });
            }
        }

        Ok(())
    }

    fn find_cycle(
        &self,
        stage_id: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        on_stack: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if on_stack.contains(stage_id) {
            let start = stack.iter().position(|s| s == stage_id).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].to_vec();
            path.push(stage_id.to_string());
            return Some(path);
        }
        if visited.contains(stage_id) {
            return None;
        }

        visited.insert(stage_id.to_string());
        on_stack.insert(stage_id.to_string());
        stack.push(stage_id.to_string());

        if let Some(node) = self.node(stage_id) {
            for dep in &node.depends_on {
                if let Some(path) = self.find_cycle(dep, visited, stack, on_stack) {
                    return Some(path);
                }
            }
        }

        stack.pop();
        on_stack.remove(stage_id);
        None
    }

    /// Computes the set of stages eligible for dispatch given the current
    /// ledger entries.
    ///
    /// A stage is ready when its state is `NotStarted` or `FailedRetryable`
    /// and every dependency is `Succeeded` or `Skipped`. Recomputed after
    /// every stage completion rather than precomputed once, so dynamically
    /// skipped branches correctly unblock or permanently block dependents.
    #[must_use]
    pub fn ready_set(&self, states: &HashMap<String, LedgerEntry>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| {
                let dispatchable = states
                    .get(&node.stage_id)
                    .is_some_and(|e| e.state.is_dispatchable());
                dispatchable
                    && node.depends_on.iter().all(|dep| {
                        states
                            .get(dep)
                            .is_some_and(|e| e.state.satisfies_dependency())
                    })
            })
            .map(|node| node.stage_id.clone())
            .collect()
    }

    /// All stages reachable by following `depends_on` edges upward.
    #[must_use]
    pub fn ancestors(&self, stage_id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut frontier: Vec<&str> = self
            .node(stage_id)
            .map(|n| n.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();

        while let Some(current) = frontier.pop() {
            if result.insert(current.to_string()) {
                if let Some(node) = self.node(current) {
                    frontier.extend(node.depends_on.iter().map(String::as_str));
                }
            }
        }
        result
    }

    /// All stages that transitively depend on `stage_id`.
    #[must_use]
    pub fn transitive_dependents(&self, stage_id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut frontier = vec![stage_id.to_string()];

        while let Some(current) = frontier.pop() {
            for node in &self.nodes {
                if node.depends_on.contains(&current) && result.insert(node.stage_id.clone()) {
                    frontier.push(node.stage_id.clone());
                }
            }
        }
        result
    }
}
