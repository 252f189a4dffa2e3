use anyhow::{anyhow, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use std::collections::HashMap;
use std::sync::Arc;

use crate::step::Step;
use crate::types::ScenarioId;

/// A step and its graph-level markers.
#[derive(Clone)]
pub struct StepNode {
    pub step: Arc<dyn Step>,
    /// Error-processing steps still receive exhausted contexts.
    pub error_handler: bool,
}

impl StepNode {
    pub fn name(&self) -> &str {
        self.step.name()
    }
}

/// Runtime view of one sub-graph: an acyclic graph of steps with ordered
/// outgoing edges. The engine only reads it.
pub struct StepGraph {
    scenario_id: ScenarioId,
    graph: DiGraph<StepNode, usize>,
    indices: HashMap<String, NodeIndex>,
    root: NodeIndex,
}

impl std::fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraph")
            .field("scenario_id", &self.scenario_id)
            .field("steps", &self.indices.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StepGraph {
    pub fn builder(scenario_id: ScenarioId) -> StepGraphBuilder {
        StepGraphBuilder {
            scenario_id,
            graph: DiGraph::new(),
            indices: HashMap::new(),
            edge_seq: HashMap::new(),
        }
    }

    pub fn scenario_id(&self) -> &ScenarioId {
        &self.scenario_id
    }

    pub fn root(&self) -> &StepNode {
        &self.graph[self.root]
    }

    pub fn node(&self, name: &str) -> Option<&StepNode> {
        self.indices.get(name).map(|idx| &self.graph[*idx])
    }

    /// Outgoing successors of a step, in edge declaration order.
    pub fn successors(&self, name: &str) -> Vec<StepNode> {
        let Some(idx) = self.indices.get(name) else {
            return Vec::new();
        };
        let mut edges: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(*idx, petgraph::Direction::Outgoing)
            .map(|edge| (*edge.weight(), edge.target()))
            .collect();
        edges.sort_by_key(|(order, _)| *order);
        edges
            .into_iter()
            .map(|(_, target)| self.graph[target].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder used by the (external) compilation layer and by tests.
pub struct StepGraphBuilder {
    scenario_id: ScenarioId,
    graph: DiGraph<StepNode, usize>,
    indices: HashMap<String, NodeIndex>,
    edge_seq: HashMap<NodeIndex, usize>,
}

impl StepGraphBuilder {
    pub fn add_step(&mut self, step: Arc<dyn Step>) -> Result<&mut Self> {
        self.insert(step, false)
    }

    /// Add a step marked as an error processor.
    pub fn add_error_handler(&mut self, step: Arc<dyn Step>) -> Result<&mut Self> {
        self.insert(step, true)
    }

    fn insert(&mut self, step: Arc<dyn Step>, error_handler: bool) -> Result<&mut Self> {
        let name = step.name().to_string();
        if self.indices.contains_key(&name) {
            return Err(anyhow!("step '{}' already defined in graph", name));
        }
        let idx = self.graph.add_node(StepNode {
            step,
            error_handler,
        });
        self.indices.insert(name, idx);
        Ok(self)
    }

    /// Add an edge from `from` to `to`. Edges keep their declaration order
    /// per source step.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<&mut Self> {
        let from_idx = *self
            .indices
            .get(from)
            .ok_or_else(|| anyhow!("edge source '{}' not defined", from))?;
        let to_idx = *self
            .indices
            .get(to)
            .ok_or_else(|| anyhow!("edge target '{}' not defined", to))?;

        let order = self.edge_seq.entry(from_idx).or_insert(0);
        self.graph.add_edge(from_idx, to_idx, *order);
        *order += 1;
        Ok(self)
    }

    pub fn build(self, root: &str) -> Result<StepGraph> {
        let root_idx = *self
            .indices
            .get(root)
            .ok_or_else(|| anyhow!("root step '{}' not defined", root))?;

        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(anyhow!("step graph contains a cycle"));
        }

        // Every step must be reachable from the root, or it would never
        // receive a context.
        let mut reachable = vec![false; self.graph.node_count()];
        let mut dfs = Dfs::new(&self.graph, root_idx);
        while let Some(idx) = dfs.next(&self.graph) {
            reachable[idx.index()] = true;
        }
        if let Some(idx) = self.graph.node_indices().find(|idx| !reachable[idx.index()]) {
            return Err(anyhow!(
                "step '{}' is not reachable from root '{}'",
                self.graph[idx].name(),
                root
            ));
        }

        Ok(StepGraph {
            scenario_id: self.scenario_id,
            graph: self.graph,
            indices: self.indices,
            root: root_idx,
        })
    }
}
