//! Feature calculators: lazily-evaluated channel counts.
//!
//! A calculator models how an operation transforms the number of active
//! feature channels, possibly in terms of other calculators. Because
//! search methods can deactivate channels of upstream layers, a node's
//! channel count is in general NOT its static output shape; it must be
//! recomputed through the calculator chain every time it is read.
//!
//! References between calculators are `Rc` handles: the engine is
//! single-threaded and calculators are shared freely between nodes (a
//! channel-preserving node aliases its predecessor's calculator).
//! Resolution walks only calculator references, never the graph.

use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum FeaturesCalculator {
    /// Fixed count: the layer's output channels are its own configuration.
    Const(usize),
    /// Same count as the referenced upstream calculator.
    Passthrough(Rc<FeaturesCalculator>),
    /// Upstream count multiplied by the spatial extents a reshape merged
    /// into the channel axis.
    Flatten {
        upstream: Rc<FeaturesCalculator>,
        multiplier: usize,
    },
    /// Sum over the referenced calculators, in input order.
    Concat(Vec<Rc<FeaturesCalculator>>),
}

impl FeaturesCalculator {
    /// Resolves the current channel count.
    pub fn features(&self) -> usize {
        match self {
            FeaturesCalculator::Const(n) => *n,
            FeaturesCalculator::Passthrough(upstream) => upstream.features(),
            FeaturesCalculator::Flatten {
                upstream,
                multiplier,
            } => upstream.features() * multiplier,
            FeaturesCalculator::Concat(parts) => parts.iter().map(|p| p.features()).sum(),
        }
    }
}
