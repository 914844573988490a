//! provisor placement: chooses the node that hosts a new service instance.
//!
//! Placement never mutates a node directly. It scores a registry snapshot
//! and then commits through the registry's compare-and-reserve, falling
//! through to the next-best candidate whenever a concurrent placement got
//! there first.
//!
//! # Components
//!
//! - **`scorer`**: `ScoringStrategy` trait and the built-in strategies
//! - **`placer`**: `PlacementEngine` (filter, rank, reserve)

pub mod placer;
pub mod scorer;

pub use placer::{Assignment, PlacementEngine, PlacementError, PlacementRequest, ScoringHints};
pub use scorer::{
    AvailableMemory, FewestInstances, Score, ScoringStrategy, StrategyKind, Weighted, rank_nodes,
};
