//! Read-only traversal adapter over a [`Graph`].
//!
//! Nodes own their ordered predecessor lists, but the passes walk the graph
//! forward. The adapter materializes the successor relation once (as a
//! `petgraph` digraph keyed directly by node id) together with the input and
//! output node sets, so the passes can enqueue successors without re-scanning
//! the node map. Predecessor ORDER is always taken from
//! [`Node::predecessors`]; the adapter's edge sets are only used for visits.
//!
//! [`Node::predecessors`]: crate::graph::Node::predecessors

use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use crate::graph::{Graph, GraphError, GraphResult, NodeId, OpKind};

#[derive(Debug, Clone)]
pub struct GraphAdapter {
    edges: DiGraphMap<NodeId, ()>,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl GraphAdapter {
    /// Builds the successor relation for `graph`.
    ///
    /// Fails with [`GraphError::MalformedGraph`] if a non-input node has no
    /// predecessors: such a node would never be reached by a forward walk
    /// seeded at the inputs.
    pub fn build(graph: &Graph) -> GraphResult<Self> {
        let mut ids: Vec<NodeId> = graph.nodes.keys().copied().collect();
        ids.sort_unstable();

        let mut edges = DiGraphMap::new();
        for &id in &ids {
            edges.add_node(id);
        }
        for &id in &ids {
            let node = graph.get_node(id)?;
            if node.predecessors.is_empty() && node.op != OpKind::Input {
                return Err(GraphError::MalformedGraph { node: id });
            }
            for &prev in &node.predecessors {
                if !graph.nodes.contains_key(&prev) {
                    return Err(GraphError::NodeNotFound(prev));
                }
                edges.add_edge(prev, id, ());
            }
        }

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for &id in &ids {
            if graph.get_node(id)?.predecessors.is_empty() {
                inputs.push(id);
            }
            if edges.neighbors_directed(id, Direction::Outgoing).next().is_none() {
                outputs.push(id);
            }
        }

        Ok(Self { edges, inputs, outputs })
    }

    /// Nodes with no predecessors (network inputs), ordered by id.
    pub fn input_nodes(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Nodes with no successors (network outputs), ordered by id.
    pub fn output_nodes(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn successors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.neighbors_directed(id, Direction::Outgoing)
    }

    pub fn predecessors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.neighbors_directed(id, Direction::Incoming)
    }
}
