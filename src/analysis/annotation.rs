//! Annotation passes over the computation graph.
//!
//! Three passes, run in strict order:
//!
//! 1. [`add_node_properties`] — classify every reachable node and store its
//!    [`ClassFlags`].
//! 2. [`add_features_calculator`] — attach a [`FeaturesCalculator`] to every
//!    reachable node, resolving each node only after all of its predecessors.
//! 3. [`associate_input_features`] — record, per node, the upstream node(s)
//!    that authoritatively set its input channel count.
//!
//! Running them out of order is an unchecked precondition violation. All
//! three are single-threaded worklist walks seeded at the input nodes; on a
//! cyclic graph they do not terminate (the graph contract requires a DAG).
//!
//! The two later passes handle a not-yet-ready node differently, and the
//! difference is load-bearing: the calculator pass re-enqueues the blocked
//! node itself and does not visit its successors, while the back-reference
//! pass skips the node silently and still enqueues its successors, relying
//! on a later visit of the missing predecessor to re-enqueue it.

use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;
use thiserror::Error;

use crate::analysis::features_calculation::FeaturesCalculator;
use crate::analysis::inspection::{self, ClassifierConfig};
use crate::graph::adapter::GraphAdapter;
use crate::graph::{
    ClassFlags, Graph, GraphError, InputFeaturesSetBy, ModuleRegistry, Node, NodeId, OpKind,
};

pub type PropagationResult<T> = std::result::Result<T, PropagationError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropagationError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("unsupported node '{name}' (id: {node}, op: {op:?}): no classification matches and no extension rule produced a calculator")]
    UnsupportedNode {
        node: NodeId,
        name: String,
        op: OpKind,
    },

    #[error("invalid reshape on node {node}: {reason}")]
    InvalidReshape { node: NodeId, reason: String },

    #[error("shape information missing for node {0}; the shape-inference collaborator must run before propagation")]
    MissingShape(NodeId),

    #[error("features calculator missing for node {0}; passes ran out of order or the graph is not acyclic")]
    MissingCalculator(NodeId),
}

/// Ordered extension rule, consulted before the built-in classification
/// branches when building a node's calculator. The first rule to return
/// `Some` wins.
pub type FeaturesRule = Box<dyn Fn(&Node, &ModuleRegistry) -> Option<Rc<FeaturesCalculator>>>;

/// Runs the three passes in their required order.
pub fn annotate_graph(
    graph: &mut Graph,
    registry: &ModuleRegistry,
    config: &ClassifierConfig,
    extra_rules: &[FeaturesRule],
) -> PropagationResult<()> {
    add_node_properties(graph, registry, config)?;
    add_features_calculator(graph, registry, extra_rules)?;
    associate_input_features(graph)
}

/// Classification pass: evaluates all eight predicates for every reachable
/// node and stores the result in the node's metadata.
///
/// Repeat visits of a node are harmless (the predicates are pure), so the
/// worklist simply enqueues every successor on every visit. A non-input node
/// matching none of the six semantic categories is rejected here, before any
/// calculator is built from a wrong guess.
pub fn add_node_properties(
    graph: &mut Graph,
    registry: &ModuleRegistry,
    config: &ClassifierConfig,
) -> PropagationResult<()> {
    let adapter = GraphAdapter::build(graph)?;
    let mut queue: VecDeque<NodeId> = adapter.input_nodes().iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        let node = graph.get_node(id)?;
        let flags = ClassFlags {
            features_propagating: inspection::is_features_propagating(node, registry, config),
            features_defining: inspection::is_features_defining(node, registry, config),
            shared_input_features: inspection::is_shared_input_features_op(node, registry, config),
            flatten: inspection::is_flatten(node),
            squeeze: inspection::is_squeeze(node),
            features_concatenate: inspection::is_features_concatenate(node),
            untouchable: inspection::is_untouchable(node),
            zero_or_one_input: inspection::is_zero_or_one_input(node),
        };

        let classified = flags.features_propagating
            || flags.features_defining
            || flags.shared_input_features
            || flags.flatten
            || flags.squeeze
            || flags.features_concatenate;
        if !classified {
            return Err(unsupported(node));
        }

        graph.get_node_mut(id)?.meta.flags = Some(flags);
        queue.extend(adapter.successors(id));
    }

    debug!("annotation: classified {} nodes", graph.nodes.len());
    Ok(())
}

/// Calculator pass: attaches a [`FeaturesCalculator`] to every reachable
/// node, in an order where every predecessor resolves first.
///
/// This is a topological evaluation without a precomputed order: a node
/// popped before its predecessors are ready is re-enqueued at the tail.
/// The graph is finite and acyclic, so a deferred node always unblocks.
pub fn add_features_calculator(
    graph: &mut Graph,
    registry: &ModuleRegistry,
    extra_rules: &[FeaturesRule],
) -> PropagationResult<()> {
    let adapter = GraphAdapter::build(graph)?;
    let mut queue: VecDeque<NodeId> = adapter.input_nodes().iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if !predecessors_resolved(graph, id)? {
            queue.push_back(id);
            continue;
        }

        let fc = build_calculator(graph, registry, extra_rules, id)?;
        graph.get_node_mut(id)?.meta.features_calculator = Some(fc);
        queue.extend(adapter.successors(id));
    }

    debug!(
        "propagation: attached feature calculators to {} nodes",
        graph.nodes.len()
    );
    Ok(())
}

/// Back-reference pass: records, per node, the upstream node(s) that set its
/// input channel count, looking through passthrough chains.
///
/// A node whose predecessor back-references are not resolved yet is skipped
/// silently this round; its successors are still enqueued, and a later visit
/// of the missing predecessor re-enqueues it.
pub fn associate_input_features(graph: &mut Graph) -> PropagationResult<()> {
    let adapter = GraphAdapter::build(graph)?;
    let mut queue: VecDeque<NodeId> = adapter.input_nodes().iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if let Some(set_by) = compute_set_by(graph, id)? {
            graph.get_node_mut(id)?.meta.input_features_set_by = Some(set_by);
        }
        queue.extend(adapter.successors(id));
    }

    debug!(
        "association: back-references recorded for {} nodes",
        graph.nodes.len()
    );
    Ok(())
}

fn unsupported(node: &Node) -> PropagationError {
    PropagationError::UnsupportedNode {
        node: node.id,
        name: node.name.clone(),
        op: node.op.clone(),
    }
}

fn invalid_reshape(node: NodeId, reason: &str) -> PropagationError {
    PropagationError::InvalidReshape {
        node,
        reason: reason.to_string(),
    }
}

/// Negative dims count from the back, as in tensor indexing.
fn normalize_dim(dim: i64, rank: i64) -> i64 {
    if dim < 0 {
        rank + dim
    } else {
        dim
    }
}

fn predecessors_resolved(graph: &Graph, id: NodeId) -> PropagationResult<bool> {
    let node = graph.get_node(id)?;
    for &prev in &node.predecessors {
        if graph.get_node(prev)?.meta.features_calculator.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn first_predecessor<'a>(graph: &'a Graph, node: &Node) -> PropagationResult<&'a Node> {
    let prev = node
        .predecessors
        .first()
        .copied()
        .ok_or(GraphError::MalformedGraph { node: node.id })?;
    Ok(graph.get_node(prev)?)
}

fn resolved_calculator(node: &Node) -> PropagationResult<Rc<FeaturesCalculator>> {
    node.meta
        .features_calculator
        .clone()
        .ok_or(PropagationError::MissingCalculator(node.id))
}

/// Builds the calculator for one node by first-match precedence: extension
/// rules, then flatten, squeeze, concatenate, shared-input, features-defining
/// and features-propagating. No fall-through default: a wrong guess would
/// silently corrupt every downstream count.
fn build_calculator(
    graph: &Graph,
    registry: &ModuleRegistry,
    extra_rules: &[FeaturesRule],
    id: NodeId,
) -> PropagationResult<Rc<FeaturesCalculator>> {
    let node = graph.get_node(id)?;

    for rule in extra_rules {
        if let Some(fc) = rule(node, registry) {
            return Ok(fc);
        }
    }

    let flags = node.meta.flags.unwrap_or_default();

    if flags.flatten {
        // Output features are input_features * merged spatial size. This is
        // NOT simply the static output shape: upstream search layers may
        // have deactivated some channels.
        let prev = first_predecessor(graph, node)?;
        let input_shape = prev
            .shape
            .as_ref()
            .ok_or(PropagationError::MissingShape(prev.id))?;
        let rank = input_shape.len() as i64;
        let start_dim = normalize_dim(node.int_arg(0, "start_dim").unwrap_or(0), rank);
        let end_dim = node.int_arg(1, "end_dim").unwrap_or(-1);
        if start_dim == 0 {
            return Err(invalid_reshape(id, "flattening the batch dimension is not supported"));
        }

        let upstream = resolved_calculator(prev)?;
        if start_dim == 1 {
            // The merge range includes the channel axis.
            let end = if end_dim == -1 {
                input_shape.len()
            } else {
                normalize_dim(end_dim, rank).max(0) as usize
            };
            let multiplier: usize = input_shape.iter().take(end).skip(2).product();
            return Ok(Rc::new(FeaturesCalculator::Flatten {
                upstream,
                multiplier,
            }));
        }
        // Merge range is purely spatial: channel count just propagates.
        return Ok(upstream);
    }

    if flags.squeeze {
        let prev = first_predecessor(graph, node)?;
        let input_shape = prev
            .shape
            .as_ref()
            .ok_or(PropagationError::MissingShape(prev.id))?;
        let dim = node
            .int_arg(0, "dim")
            .ok_or_else(|| invalid_reshape(id, "squeeze without an explicit dim is not supported"))?;
        let dim = normalize_dim(dim, input_shape.len() as i64);
        if dim == 0 {
            return Err(invalid_reshape(id, "squeezing the batch dimension is not supported"));
        }

        let upstream = resolved_calculator(prev)?;
        if dim == 1 {
            // The axis after the channels folds into them.
            let multiplier = input_shape.get(2).copied().unwrap_or(1);
            return Ok(Rc::new(FeaturesCalculator::Flatten {
                upstream,
                multiplier,
            }));
        }
        return Ok(upstream);
    }

    if flags.features_concatenate {
        // Output features are the sum over the predecessors' calculators;
        // again not the static input shape, for the same reason as flatten.
        let mut parts = Vec::with_capacity(node.predecessors.len());
        for &prev in &node.predecessors {
            parts.push(resolved_calculator(graph.get_node(prev)?)?);
        }
        return Ok(Rc::new(FeaturesCalculator::Concat(parts)));
    }

    if flags.shared_input_features {
        // All inputs carry the same count (enforced externally by shared
        // maskers), so any predecessor's calculator will do; take the first.
        let prev = first_predecessor(graph, node)?;
        return resolved_calculator(prev);
    }

    if flags.features_defining {
        let shape = node
            .shape
            .as_ref()
            .filter(|s| s.len() >= 2)
            .ok_or(PropagationError::MissingShape(id))?;
        return Ok(Rc::new(FeaturesCalculator::Const(shape[1])));
    }

    if flags.features_propagating {
        let prev = first_predecessor(graph, node)?;
        let upstream = resolved_calculator(prev)?;
        return Ok(Rc::new(FeaturesCalculator::Passthrough(upstream)));
    }

    Err(unsupported(node))
}

/// Computes a node's back-reference, or `None` when a needed predecessor
/// back-reference has not resolved yet (the silent-skip case).
fn compute_set_by(graph: &Graph, id: NodeId) -> PropagationResult<Option<InputFeaturesSetBy>> {
    let node = graph.get_node(id)?;

    // Input nodes set their own features.
    if node.predecessors.is_empty() {
        return Ok(Some(InputFeaturesSetBy::Single(id)));
    }

    let flags = node.meta.flags.unwrap_or_default();
    if flags.features_concatenate {
        for &prev in &node.predecessors {
            if graph.get_node(prev)?.meta.input_features_set_by.is_none() {
                return Ok(None);
            }
        }
        return Ok(Some(InputFeaturesSetBy::Many(node.predecessors.clone())));
    }

    let prev = first_predecessor(graph, node)?;
    if prev.meta.input_features_set_by.is_none() {
        return Ok(None);
    }
    let prev_flags = prev.meta.flags.unwrap_or_default();

    if prev_flags.flatten {
        let prev_input = first_predecessor(graph, prev)?;
        let input_shape = prev_input
            .shape
            .as_ref()
            .ok_or(PropagationError::MissingShape(prev_input.id))?;
        let start_dim =
            normalize_dim(prev.int_arg(0, "start_dim").unwrap_or(0), input_shape.len() as i64);
        if start_dim == 0 {
            return Err(invalid_reshape(prev.id, "flattening the batch dimension is not supported"));
        }
        if start_dim == 1 {
            // The flatten changed the channel count, so it owns it.
            return Ok(Some(InputFeaturesSetBy::Single(prev.id)));
        }
        return Ok(prev.meta.input_features_set_by.clone());
    }

    if prev_flags.squeeze {
        let prev_input = first_predecessor(graph, prev)?;
        let input_shape = prev_input
            .shape
            .as_ref()
            .ok_or(PropagationError::MissingShape(prev_input.id))?;
        let dim = prev.int_arg(0, "dim").ok_or_else(|| {
            invalid_reshape(prev.id, "squeeze without an explicit dim is not supported")
        })?;
        let dim = normalize_dim(dim, input_shape.len() as i64);
        if dim == 0 {
            return Err(invalid_reshape(prev.id, "squeezing the batch dimension is not supported"));
        }
        if dim == 1 {
            return Ok(Some(InputFeaturesSetBy::Single(prev.id)));
        }
        return Ok(prev.meta.input_features_set_by.clone());
    }

    if prev_flags.features_concatenate || prev_flags.features_defining {
        return Ok(Some(InputFeaturesSetBy::Single(prev.id)));
    }

    if prev_flags.features_propagating {
        return Ok(prev.meta.input_features_set_by.clone());
    }

    // Order matters for combiner predecessors (shared-input): there is no
    // single authoritative upstream node to point at.
    Err(unsupported(node))
}
