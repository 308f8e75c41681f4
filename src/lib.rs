//! # featgraph: Feature-Channel Propagation for NN Computation Graphs
//!
//! **featgraph** is an attribute-propagation engine over a DAG describing a
//! neural network's forward pass. Differentiable architecture-search methods
//! use it to determine, for every operation node, how many active feature
//! channels flow in and out, so pruning and quantization-aware layers can
//! size their learnable masks correctly.
//!
//! The engine classifies every node, attaches a per-node feature calculator,
//! and records which upstream node(s) own each node's input channel count.
//! Shape inference itself is a collaborator: node shapes must be populated
//! before the passes run.
//!
//! ## Usage Example
//!
//! ```
//! use featgraph::analysis::annotation::{annotate_graph, PropagationError};
//! use featgraph::analysis::inspection::ClassifierConfig;
//! use featgraph::graph::{Graph, LayerKind, ModuleRegistry, OpKind};
//!
//! # fn main() -> Result<(), PropagationError> {
//! // 1. Describe the traced forward graph
//! let mut graph = Graph::new();
//! let input = graph.add_node("x", OpKind::Input, vec![]);
//! let conv = graph.add_node("conv1", OpKind::CallModule("conv1".into()), vec![input]);
//! let out = graph.add_node("output", OpKind::Output, vec![conv]);
//!
//! // 2. Shapes come from the shape-inference collaborator
//! graph.set_shape(input, vec![1, 3, 32, 32])?;
//! graph.set_shape(conv, vec![1, 16, 32, 32])?;
//!
//! // 3. Resolve call targets to concrete layer types
//! let mut registry = ModuleRegistry::new();
//! registry.register("conv1", LayerKind::Conv2d);
//!
//! // 4. Run the three passes
//! annotate_graph(&mut graph, &registry, &ClassifierConfig::default(), &[])?;
//! assert_eq!(graph.input_features(out)?, Some(16));
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod graph;
