//! End-to-end tests for the three annotation passes on realistic topologies.

use std::rc::Rc;

use featgraph::analysis::annotation::{
    add_features_calculator, add_node_properties, annotate_graph, associate_input_features,
    FeaturesRule, PropagationError,
};
use featgraph::analysis::features_calculation::FeaturesCalculator;
use featgraph::analysis::inspection::ClassifierConfig;
use featgraph::graph::{
    FuncOp, Graph, GraphError, InputFeaturesSetBy, LayerKind, ModuleRegistry, NodeId, OpKind,
};

/// Adds a conv node registered as Conv2d, with its static output shape.
fn add_conv(
    g: &mut Graph,
    reg: &mut ModuleRegistry,
    name: &str,
    pred: NodeId,
    out_channels: usize,
) -> NodeId {
    let id = g.add_node(name, OpKind::CallModule(name.to_string()), vec![pred]);
    reg.register(name, LayerKind::Conv2d);
    g.set_shape(id, vec![1, out_channels, 8, 8]).unwrap();
    id
}

fn calculator_value(g: &Graph, id: NodeId) -> usize {
    g.get_node(id)
        .unwrap()
        .meta
        .features_calculator
        .as_ref()
        .expect("calculator not attached")
        .features()
}

fn set_by(g: &Graph, id: NodeId) -> Option<InputFeaturesSetBy> {
    g.get_node(id).unwrap().meta.input_features_set_by.clone()
}

/// Two parallel convolutions feeding a channel concatenation and a third
/// convolution: the classic branching pattern search methods must size
/// masks for.
#[test]
fn test_parallel_convolutions_concatenated() {
    let mut g = Graph::new();
    let mut reg = ModuleRegistry::new();

    let x = g.add_node("x", OpKind::Input, vec![]);
    g.set_shape(x, vec![1, 3, 8, 8]).unwrap();
    let conv1 = add_conv(&mut g, &mut reg, "conv1", x, 16);
    let conv2 = add_conv(&mut g, &mut reg, "conv2", x, 24);
    let cat = g.add_node("cat", OpKind::CallFunction(FuncOp::Cat), vec![conv1, conv2]);
    let conv3 = add_conv(&mut g, &mut reg, "conv3", cat, 10);
    let out = g.add_node("output", OpKind::Output, vec![conv3]);

    annotate_graph(&mut g, &reg, &ClassifierConfig::default(), &[]).unwrap();

    // The concatenation carries the sum of both branches.
    assert_eq!(calculator_value(&g, cat), 40);
    assert_eq!(g.input_features(conv3).unwrap(), Some(40));

    // The cat owns its own count and lists both branches in input order;
    // the conv behind it points at the cat.
    assert_eq!(set_by(&g, cat), Some(InputFeaturesSetBy::Many(vec![conv1, conv2])));
    assert_eq!(set_by(&g, conv3), Some(InputFeaturesSetBy::Single(cat)));
    assert_eq!(set_by(&g, out), Some(InputFeaturesSetBy::Single(conv3)));
}

/// Branches of different depth: the worklist reaches the concatenation
/// before its deeper branch has resolved, exercising the deferred retry in
/// the calculator pass and the silent skip in the back-reference pass.
#[test]
fn test_unbalanced_branches_defer_until_ready() {
    let mut g = Graph::new();
    let mut reg = ModuleRegistry::new();
    reg.register("bn1", LayerKind::BatchNorm2d);

    let x = g.add_node("x", OpKind::Input, vec![]);
    g.set_shape(x, vec![1, 3, 8, 8]).unwrap();

    // Short branch: one conv.
    let conv1 = add_conv(&mut g, &mut reg, "conv1", x, 16);

    // Deep branch: conv -> bn -> relu -> conv.
    let conv2 = add_conv(&mut g, &mut reg, "conv2", x, 8);
    let bn = g.add_node("bn1", OpKind::CallModule("bn1".to_string()), vec![conv2]);
    let relu = g.add_node("relu", OpKind::CallFunction(FuncOp::Relu), vec![bn]);
    let conv4 = add_conv(&mut g, &mut reg, "conv4", relu, 24);

    let cat = g.add_node("cat", OpKind::CallFunction(FuncOp::Cat), vec![conv1, conv4]);
    let out = g.add_node("output", OpKind::Output, vec![cat]);

    annotate_graph(&mut g, &reg, &ClassifierConfig::default(), &[]).unwrap();

    assert_eq!(calculator_value(&g, cat), 40);
    assert_eq!(set_by(&g, cat), Some(InputFeaturesSetBy::Many(vec![conv1, conv4])));
    assert_eq!(set_by(&g, out), Some(InputFeaturesSetBy::Single(cat)));

    // Every reachable node ends up with flags, a calculator and a
    // back-reference after the three passes.
    for node in g.nodes.values() {
        assert!(node.meta.flags.is_some(), "{} has no flags", node.name);
        assert!(
            node.meta.features_calculator.is_some(),
            "{} has no calculator",
            node.name
        );
        assert!(
            node.meta.input_features_set_by.is_some(),
            "{} has no back-reference",
            node.name
        );
    }
}

/// An element-wise add takes the first branch's calculator; the engine does
/// not re-check sibling equality (shared maskers enforce it externally).
/// Back-references cannot look through a combiner, so resolving a successor
/// of the add fails.
#[test]
fn test_shared_input_combiner() {
    let mut g = Graph::new();
    let mut reg = ModuleRegistry::new();

    let x = g.add_node("x", OpKind::Input, vec![]);
    g.set_shape(x, vec![1, 3, 8, 8]).unwrap();
    let conv1 = add_conv(&mut g, &mut reg, "conv1", x, 16);
    let conv2 = add_conv(&mut g, &mut reg, "conv2", x, 16);
    let add = g.add_node("add", OpKind::CallFunction(FuncOp::Add), vec![conv1, conv2]);
    let relu = g.add_node("relu", OpKind::CallFunction(FuncOp::Relu), vec![add]);

    let cfg = ClassifierConfig::default();
    add_node_properties(&mut g, &reg, &cfg).unwrap();
    add_features_calculator(&mut g, &reg, &[]).unwrap();

    assert_eq!(calculator_value(&g, add), 16);
    assert_eq!(calculator_value(&g, relu), 16);

    let err = associate_input_features(&mut g).unwrap_err();
    match err {
        PropagationError::UnsupportedNode { name, .. } => assert_eq!(name, "relu"),
        other => panic!("expected UnsupportedNode, got {other:?}"),
    }
}

/// Extension rules replace the built-in construction for the nodes they
/// claim, and downstream calculators see the substituted values.
#[test]
fn test_extension_rule_feeds_downstream_counts() {
    let mut g = Graph::new();
    let mut reg = ModuleRegistry::new();

    let x = g.add_node("x", OpKind::Input, vec![]);
    g.set_shape(x, vec![1, 3, 8, 8]).unwrap();
    let conv1 = add_conv(&mut g, &mut reg, "conv1", x, 16);
    let conv2 = add_conv(&mut g, &mut reg, "conv2", x, 24);
    let cat = g.add_node("cat", OpKind::CallFunction(FuncOp::Cat), vec![conv1, conv2]);

    // A search layer wrapping conv1 reports a masked channel count.
    let rules: Vec<FeaturesRule> = vec![Box::new(|node, _reg| {
        if node.name == "conv1" {
            Some(Rc::new(FeaturesCalculator::Const(7)))
        } else {
            None
        }
    })];

    annotate_graph(&mut g, &reg, &ClassifierConfig::default(), &rules).unwrap();
    assert_eq!(calculator_value(&g, conv1), 7);
    assert_eq!(calculator_value(&g, cat), 31);
}

/// A flatten between the convolutional stem and the classifier head: the
/// fully-connected layer's input count comes from the flatten, not from the
/// conv, once the spatial dims are merged into the channels.
#[test]
fn test_flatten_into_classifier_head() {
    let mut g = Graph::new();
    let mut reg = ModuleRegistry::new();
    reg.register("fc", LayerKind::Linear);

    let x = g.add_node("x", OpKind::Input, vec![]);
    g.set_shape(x, vec![1, 3, 5, 3]).unwrap();
    let conv = add_conv(&mut g, &mut reg, "conv1", x, 32);
    g.set_shape(conv, vec![1, 32, 5, 3]).unwrap();
    let flat = g.add_node("flatten", OpKind::CallFunction(FuncOp::Flatten), vec![conv]);
    g.get_node_mut(flat).unwrap().args = vec![1];
    let fc = g.add_node("fc", OpKind::CallModule("fc".to_string()), vec![flat]);
    g.set_shape(fc, vec![1, 10]).unwrap();
    let out = g.add_node("output", OpKind::Output, vec![fc]);

    annotate_graph(&mut g, &reg, &ClassifierConfig::default(), &[]).unwrap();

    assert_eq!(calculator_value(&g, flat), 480);
    assert_eq!(g.input_features(fc).unwrap(), Some(480));
    assert_eq!(set_by(&g, fc), Some(InputFeaturesSetBy::Single(flat)));
    assert_eq!(calculator_value(&g, fc), 10);
    assert_eq!(set_by(&g, out), Some(InputFeaturesSetBy::Single(fc)));
}

/// Structural failures surface before any pass logic runs.
#[test]
fn test_malformed_graph_is_rejected() {
    let mut g = Graph::new();
    g.add_node("x", OpKind::Input, vec![]);
    let orphan = g.add_node("relu", OpKind::CallFunction(FuncOp::Relu), vec![]);

    let reg = ModuleRegistry::new();
    let err = annotate_graph(&mut g, &reg, &ClassifierConfig::default(), &[]).unwrap_err();
    assert_eq!(
        err,
        PropagationError::Graph(GraphError::MalformedGraph { node: orphan })
    );
}
