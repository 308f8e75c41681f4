//! # Graph Analysis Module
//!
//! Passes that annotate the computation graph with feature-channel
//! information before a search method takes over.
//!
//! ## Available Passes
//!
//! - [`add_node_properties`](annotation::add_node_properties): classifies
//!   every node (features-defining, features-propagating, shared-input,
//!   flatten, squeeze, concatenate, plus structural flags).
//! - [`add_features_calculator`](annotation::add_features_calculator):
//!   attaches a [`FeaturesCalculator`](features_calculation::FeaturesCalculator)
//!   per node, modeling how the operation transforms the active channel count.
//! - [`associate_input_features`](annotation::associate_input_features):
//!   records which upstream node(s) set each node's input channel count.
//!
//! ## How It Works
//!
//! ```text
//! Graph (+shapes) -> classification -> calculators -> back-references
//! ```
//!
//! The shape-inference collaborator must have populated node shapes first;
//! the passes then run in the order above, each a forward worklist walk
//! seeded at the input nodes. Downstream consumers (mask sizing, search
//! logic) read the per-node calculator and back-reference as read-only.

pub mod annotation;
pub mod features_calculation;
pub mod inspection;
