//! Node classification predicates.
//!
//! Each predicate is pure: it maps a node (plus the module registry for
//! `CallModule` targets) to a boolean, consulting the explicit allow-list
//! table in [`ClassifierConfig`]. The six semantic categories are mutually
//! exclusive by construction of the default table; the annotation pass
//! rejects nodes that match none of them.

use std::collections::HashSet;

use crate::graph::{FuncOp, LayerKind, MethodOp, ModuleRegistry, Node, OpKind};

/// Allow-list table mapping operation kinds to classification outcomes.
///
/// Ships with defaults covering the common convolution, normalization,
/// pooling, activation and padding layers; extend it with the `with_*`
/// builders when a network uses kinds the defaults do not cover.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    defining_layers: HashSet<LayerKind>,
    propagating_layers: HashSet<LayerKind>,
    propagating_functions: HashSet<FuncOp>,
    shared_input_functions: HashSet<FuncOp>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            defining_layers: HashSet::from([
                LayerKind::Conv1d,
                LayerKind::Conv2d,
                LayerKind::Linear,
            ]),
            propagating_layers: HashSet::from([
                LayerKind::BatchNorm1d,
                LayerKind::BatchNorm2d,
                LayerKind::AvgPool1d,
                LayerKind::AvgPool2d,
                LayerKind::MaxPool1d,
                LayerKind::MaxPool2d,
                LayerKind::Dropout,
                LayerKind::Relu,
                LayerKind::Relu6,
                LayerKind::ConstantPad1d,
                LayerKind::ConstantPad2d,
                LayerKind::Identity,
            ]),
            propagating_functions: HashSet::from([
                FuncOp::Relu,
                FuncOp::Relu6,
                FuncOp::LogSoftmax,
            ]),
            shared_input_functions: HashSet::from([FuncOp::Add, FuncOp::Sub]),
        }
    }
}

impl ClassifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defining_layer(mut self, kind: LayerKind) -> Self {
        self.defining_layers.insert(kind);
        self
    }

    pub fn with_propagating_layer(mut self, kind: LayerKind) -> Self {
        self.propagating_layers.insert(kind);
        self
    }

    pub fn with_propagating_function(mut self, func: FuncOp) -> Self {
        self.propagating_functions.insert(func);
        self
    }

    pub fn with_shared_input_function(mut self, func: FuncOp) -> Self {
        self.shared_input_functions.insert(func);
        self
    }
}

/// True for operations that "define" the channel count for their successors:
/// network inputs, and layers whose output channels are a property of their
/// own configuration (convolutions, fully-connected layers).
pub fn is_features_defining(n: &Node, registry: &ModuleRegistry, cfg: &ClassifierConfig) -> bool {
    match &n.op {
        OpKind::Input => n.predecessors.is_empty(),
        OpKind::CallModule(target) => registry
            .resolve(target)
            .is_some_and(|kind| cfg.defining_layers.contains(&kind)),
        _ => false,
    }
}

/// True for operations whose output channel count equals their input channel
/// count (normalization, pooling, dropout, activations, padding, outputs).
pub fn is_features_propagating(n: &Node, registry: &ModuleRegistry, cfg: &ClassifierConfig) -> bool {
    match &n.op {
        OpKind::Output => true,
        OpKind::CallModule(target) => registry
            .resolve(target)
            .is_some_and(|kind| cfg.propagating_layers.contains(&kind)),
        OpKind::CallFunction(func) => cfg.propagating_functions.contains(func),
        _ => false,
    }
}

/// True for multi-input element-wise combiners (add, subtract) that require
/// the same channel count on every input.
pub fn is_shared_input_features_op(
    n: &Node,
    _registry: &ModuleRegistry,
    cfg: &ClassifierConfig,
) -> bool {
    if is_zero_or_one_input(n) {
        return false;
    }
    match &n.op {
        OpKind::CallFunction(func) => cfg.shared_input_functions.contains(func),
        _ => false,
    }
}

pub fn is_flatten(n: &Node) -> bool {
    matches!(
        n.op,
        OpKind::CallMethod(MethodOp::Flatten) | OpKind::CallFunction(FuncOp::Flatten)
    )
}

pub fn is_squeeze(n: &Node) -> bool {
    matches!(
        n.op,
        OpKind::CallMethod(MethodOp::Squeeze) | OpKind::CallFunction(FuncOp::Squeeze)
    )
}

/// True for channel-axis concatenation.
pub fn is_features_concatenate(n: &Node) -> bool {
    matches!(n.op, OpKind::CallFunction(FuncOp::Cat))
}

/// Structural flag: nodes the downstream search logic must never rewrite.
pub fn is_untouchable(n: &Node) -> bool {
    matches!(n.op, OpKind::Output)
}

/// Structural flag: at most one data input.
pub fn is_zero_or_one_input(n: &Node) -> bool {
    n.predecessors.len() <= 1
}
