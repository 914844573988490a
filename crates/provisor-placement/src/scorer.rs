//! Node scoring for placement decisions.
//!
//! A strategy maps a node view to a [`Score`]; higher is better. Scores are
//! compared with `f64::total_cmp`, and equal scores are broken by node ID
//! ascending, so ranking is a total order and placement is deterministic.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use provisor_registry::NodeView;
use provisor_state::MEMORY;

/// Totally ordered score (higher = better).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score(pub f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Pluggable scoring function.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(&self, node: &NodeView) -> Score;
}

/// Advertised minus reserved memory. Spreads load onto the emptiest node.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailableMemory;

impl ScoringStrategy for AvailableMemory {
    fn name(&self) -> &'static str {
        "available_memory"
    }

    fn score(&self, node: &NodeView) -> Score {
        Score(node.free().get(MEMORY) as f64)
    }
}

/// Prefers nodes hosting the fewest instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct FewestInstances;

impl ScoringStrategy for FewestInstances {
    fn name(&self) -> &'static str {
        "fewest_instances"
    }

    fn score(&self, node: &NodeView) -> Score {
        Score(-f64::from(node.instance_count))
    }
}

/// Weighted sum of free attributes.
#[derive(Debug, Clone, Default)]
pub struct Weighted {
    pub weights: BTreeMap<String, f64>,
}

impl ScoringStrategy for Weighted {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn score(&self, node: &NodeView) -> Score {
        let free = node.free();
        let total = self
            .weights
            .iter()
            .map(|(attr, weight)| weight * free.get(attr) as f64)
            .sum();
        Score(total)
    }
}

/// Strategy selection as it appears in configuration and request hints.
///
/// ```toml
/// strategy = "available_memory"
/// # or
/// strategy = { weighted = { memory = 1.0, disk = 0.01 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    AvailableMemory,
    FewestInstances,
    Weighted(BTreeMap<String, f64>),
}

impl StrategyKind {
    pub fn build(&self) -> Box<dyn ScoringStrategy> {
        match self {
            StrategyKind::AvailableMemory => Box::new(AvailableMemory),
            StrategyKind::FewestInstances => Box::new(FewestInstances),
            StrategyKind::Weighted(weights) => Box::new(Weighted {
                weights: weights.clone(),
            }),
        }
    }
}

/// Score all nodes and return them best first, ties by node ID ascending.
pub fn rank_nodes(nodes: Vec<NodeView>, strategy: &dyn ScoringStrategy) -> Vec<(NodeView, Score)> {
    let mut scored: Vec<(NodeView, Score)> = nodes
        .into_iter()
        .map(|node| {
            let score = strategy.score(&node);
            (node, score)
        })
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| sb.cmp(sa).then_with(|| a.node_id.cmp(&b.node_id)));
    scored
}
