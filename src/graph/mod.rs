//! Graph data model for the feature-propagation engine.
//!
//! A [`Graph`] is a directed acyclic description of a network's forward
//! computation: each [`Node`] carries an operation kind, an ordered list of
//! predecessor ids, the integer arguments of the traced call, and the static
//! shape written by the shape-inference collaborator. Everything the analysis
//! passes derive (classification flags, feature calculators, back-references)
//! lives in the typed [`NodeMeta`] record and is rebuilt from scratch on every
//! run; a topology edit invalidates all of it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

use crate::analysis::features_calculation::FeaturesCalculator;

pub mod adapter;

/// Node identifier.
pub type NodeId = usize;
/// Static tensor shape; dim 0 is the batch axis, dim 1 the channel axis.
pub type Shape = Vec<usize>;

pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("node with id {0} not found")]
    NodeNotFound(NodeId),
    #[error("malformed graph: non-input node {node} has no predecessors")]
    MalformedGraph { node: NodeId },
}

/// Free functions that can appear as traced graph operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuncOp {
    Add,
    Sub,
    Relu,
    Relu6,
    LogSoftmax,
    Flatten,
    Squeeze,
    Cat,
}

/// Tensor methods that can appear as traced graph operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodOp {
    Flatten,
    Squeeze,
}

/// Concrete layer types a `CallModule` target can resolve to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Conv1d,
    Conv2d,
    Linear,
    BatchNorm1d,
    BatchNorm2d,
    AvgPool1d,
    AvgPool2d,
    MaxPool1d,
    MaxPool2d,
    Dropout,
    Relu,
    Relu6,
    ConstantPad1d,
    ConstantPad2d,
    Identity,
}

/// Operation kind of a node.
///
/// `CallModule` carries the target name of a sub-module; the concrete layer
/// type is resolved through a [`ModuleRegistry`], mirroring how a tracer
/// separates the call site from the module it refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Input,
    Output,
    CallModule(String),
    CallFunction(FuncOp),
    CallMethod(MethodOp),
}

/// Classification flags computed by the annotation pass.
///
/// Exactly one of the six semantic flags holds for any non-input node;
/// `untouchable` and `zero_or_one_input` are structural, consumed by
/// downstream search logic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ClassFlags {
    pub features_propagating: bool,
    pub features_defining: bool,
    pub shared_input_features: bool,
    pub flatten: bool,
    pub squeeze: bool,
    pub features_concatenate: bool,
    pub untouchable: bool,
    pub zero_or_one_input: bool,
}

/// Back-reference to the node(s) that authoritatively set a node's input
/// channel count. Concatenation nodes record the full ordered predecessor
/// list; everyone else a single upstream node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFeaturesSetBy {
    Single(NodeId),
    Many(Vec<NodeId>),
}

/// Per-node derived state, written by the analysis passes in order.
///
/// A missing field means the corresponding pass has not (successfully)
/// visited this node yet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeMeta {
    pub flags: Option<ClassFlags>,
    pub features_calculator: Option<Rc<FeaturesCalculator>>,
    pub input_features_set_by: Option<InputFeaturesSetBy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// ID of the node (duplicates the map key for convenience elsewhere).
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    /// Ordered data inputs, referenced by id. Order matters for combiners.
    pub predecessors: Vec<NodeId>,
    /// Positional integer arguments of the traced call (after tensor inputs).
    pub args: Vec<i64>,
    /// Keyword integer arguments of the traced call.
    pub kwargs: HashMap<String, i64>,
    /// Static shape, populated externally before the propagation pass.
    pub shape: Option<Shape>,
    #[serde(skip)]
    pub meta: NodeMeta,
}

impl Node {
    /// Looks up an integer argument: first positionally, then by keyword.
    /// Returns `None` if the argument was not given either way.
    pub fn int_arg(&self, idx: usize, key: &str) -> Option<i64> {
        self.args
            .get(idx)
            .copied()
            .or_else(|| self.kwargs.get(key).copied())
    }
}

/// Resolves `CallModule` targets to their concrete layer types.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, LayerKind>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target: impl Into<String>, kind: LayerKind) {
        self.modules.insert(target.into(), kind);
    }

    pub fn resolve(&self, target: &str) -> Option<LayerKind> {
        self.modules.get(target).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: HashMap<NodeId, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id. Ids are assigned sequentially.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        predecessors: Vec<NodeId>,
    ) -> NodeId {
        let id = self.nodes.len();
        let node = Node {
            id,
            name: name.into(),
            op,
            predecessors,
            args: Vec::new(),
            kwargs: HashMap::new(),
            shape: None,
            meta: NodeMeta::default(),
        };
        self.nodes.insert(id, node);
        id
    }

    pub fn get_node(&self, id: NodeId) -> GraphResult<&Node> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> GraphResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Writes the static shape of a node. Normally called by the
    /// shape-inference collaborator before the propagation pass runs.
    pub fn set_shape(&mut self, id: NodeId, shape: Shape) -> GraphResult<()> {
        self.get_node_mut(id)?.shape = Some(shape);
        Ok(())
    }

    /// Resolved input channel count of a node: the value of its first
    /// predecessor's feature calculator. `None` for input nodes or before
    /// the propagation pass has run.
    pub fn input_features(&self, id: NodeId) -> GraphResult<Option<usize>> {
        let node = self.get_node(id)?;
        let prev_id = match node.predecessors.first() {
            Some(&p) => p,
            None => return Ok(None),
        };
        let prev = self.get_node(prev_id)?;
        Ok(prev.meta.features_calculator.as_ref().map(|fc| fc.features()))
    }
}
