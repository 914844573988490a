//! Placement engine: picks a node and commits the reservation.
//!
//! 1. Snapshot the registry and keep healthy, non-avoided nodes whose free
//!    capacity covers every attribute of the profile.
//! 2. Rank the candidates with the request's (or the default) strategy.
//! 3. Reserve on the best candidate; if the registry rejects it because the
//!    snapshot went stale, fall through to the next one.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use provisor_registry::{NodeRegistry, ReserveRejected};
use provisor_state::{CapacityProfile, InstanceId, NodeId};

use crate::scorer::{StrategyKind, rank_nodes};

/// Optional per-request placement hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringHints {
    /// Overrides the engine's default strategy for this request.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    /// Nodes that must not be chosen.
    #[serde(default)]
    pub avoid_nodes: BTreeSet<NodeId>,
}

/// A request to place one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub instance_id: InstanceId,
    pub requester: String,
    pub profile: CapacityProfile,
    #[serde(default)]
    pub hints: ScoringHints,
}

/// A committed placement: `reserved` is now held on `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub node_id: NodeId,
    pub address: String,
    pub reserved: CapacityProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("no healthy nodes registered")]
    NoHealthyNodes,

    #[error("no healthy node has capacity for the requested profile")]
    NoCapacity,
}

pub struct PlacementEngine {
    registry: Arc<NodeRegistry>,
    default_strategy: StrategyKind,
}

impl PlacementEngine {
    pub fn new(registry: Arc<NodeRegistry>, default_strategy: StrategyKind) -> Self {
        Self {
            registry,
            default_strategy,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn default_strategy(&self) -> &StrategyKind {
        &self.default_strategy
    }

    /// Choose a node for `req` and reserve its profile there.
    pub fn place(&self, req: &PlacementRequest) -> Result<Assignment, PlacementError> {
        let snapshot = self.registry.snapshot();
        if !snapshot.iter().any(|n| n.is_healthy()) {
            warn!(instance_id = %req.instance_id, nodes = snapshot.len(), "no healthy nodes");
            return Err(PlacementError::NoHealthyNodes);
        }

        let candidates: Vec<_> = snapshot
            .into_iter()
            .filter(|n| n.is_healthy())
            .filter(|n| !req.hints.avoid_nodes.contains(&n.node_id))
            .filter(|n| n.free().covers(&req.profile))
            .collect();

        let strategy = req
            .hints
            .strategy
            .as_ref()
            .unwrap_or(&self.default_strategy)
            .build();
        let ranked = rank_nodes(candidates, strategy.as_ref());

        for (node, score) in ranked {
            match self.registry.try_reserve(&node.node_id, &req.profile) {
                Ok(view) => {
                    info!(
                        instance_id = %req.instance_id,
                        node_id = %view.node_id,
                        strategy = strategy.name(),
                        score = score.0,
                        "instance placed"
                    );
                    return Ok(Assignment {
                        node_id: view.node_id,
                        address: view.address,
                        reserved: req.profile.clone(),
                    });
                }
                Err(ReserveRejected::InsufficientCapacity | ReserveRejected::NotHealthy(_)) => {
                    debug!(
                        instance_id = %req.instance_id,
                        node_id = %node.node_id,
                        "candidate changed since snapshot, trying next"
                    );
                }
                Err(ReserveRejected::UnknownNode) => {
                    debug!(node_id = %node.node_id, "candidate vanished since snapshot");
                }
            }
        }

        warn!(
            instance_id = %req.instance_id,
            profile = ?req.profile,
            "no node has capacity for instance"
        );
        Err(PlacementError::NoCapacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisor_registry::{NodeAnnouncement, RegistryConfig};
    use provisor_state::{Attributes, MEMORY, StateStore};

    fn engine() -> PlacementEngine {
        let registry = NodeRegistry::new(
            StateStore::open_in_memory().unwrap(),
            RegistryConfig::default(),
        );
        PlacementEngine::new(Arc::new(registry), StrategyKind::AvailableMemory)
    }

    fn add_node(engine: &PlacementEngine, id: &str, memory: u64) {
        engine
            .registry()
            .register(
                NodeAnnouncement {
                    node_id: id.to_string(),
                    address: format!("{id}:9400"),
                    capacity: Attributes::from([(MEMORY, memory)]),
                    replace: false,
                },
                1000,
            )
            .unwrap();
    }

    fn request(id: &str, memory: u64) -> PlacementRequest {
        PlacementRequest {
            instance_id: id.to_string(),
            requester: "tenant-a".to_string(),
            profile: Attributes::from([(MEMORY, memory)]),
            hints: ScoringHints::default(),
        }
    }

    #[test]
    fn empty_registry_has_no_healthy_nodes() {
        let engine = engine();
        assert_eq!(engine.place(&request("i1", 1)), Err(PlacementError::NoHealthyNodes));
    }

    #[test]
    fn all_dead_has_no_healthy_nodes() {
        let engine = engine();
        add_node(&engine, "node-x", 512);
        engine.registry().mark_dead("node-x").unwrap();

        assert_eq!(engine.place(&request("i1", 1)), Err(PlacementError::NoHealthyNodes));
    }

    #[test]
    fn picks_node_with_most_free_memory() {
        let engine = engine();
        add_node(&engine, "node-x", 512);
        add_node(&engine, "node-y", 1024);

        let assignment = engine.place(&request("i1", 100)).unwrap();

        assert_eq!(assignment.node_id, "node-y");
        assert_eq!(assignment.address, "node-y:9400");
        let y = engine.registry().get("node-y").unwrap();
        assert_eq!(y.free().get(MEMORY), 924);
        let x = engine.registry().get("node-x").unwrap();
        assert_eq!(x.free().get(MEMORY), 512);
    }

    #[test]
    fn no_node_large_enough() {
        let engine = engine();
        add_node(&engine, "node-z", 50);

        assert_eq!(engine.place(&request("i1", 100)), Err(PlacementError::NoCapacity));
        assert_eq!(engine.registry().get("node-z").unwrap().free().get(MEMORY), 50);
    }

    #[test]
    fn profile_must_fit_every_attribute() {
        let engine = engine();
        add_node(&engine, "node-x", 4096);

        let mut req = request("i1", 100);
        req.profile.set("disk", 10);
        assert_eq!(engine.place(&req), Err(PlacementError::NoCapacity));
    }

    #[test]
    fn avoid_nodes_hint_is_honoured() {
        let engine = engine();
        add_node(&engine, "node-x", 512);
        add_node(&engine, "node-y", 1024);

        let mut req = request("i1", 100);
        req.hints.avoid_nodes.insert("node-y".to_string());

        assert_eq!(engine.place(&req).unwrap().node_id, "node-x");
    }

    #[test]
    fn strategy_hint_overrides_default() {
        let engine = engine();
        add_node(&engine, "node-x", 512);
        add_node(&engine, "node-y", 1024);
        engine.place(&request("i0", 1)).unwrap(); // lands on node-y

        let mut req = request("i1", 1);
        req.hints.strategy = Some(StrategyKind::FewestInstances);

        assert_eq!(engine.place(&req).unwrap().node_id, "node-x");
    }

    #[test]
    fn ties_break_on_node_id() {
        let engine = engine();
        add_node(&engine, "node-b", 1024);
        add_node(&engine, "node-a", 1024);

        assert_eq!(engine.place(&request("i1", 10)).unwrap().node_id, "node-a");
    }

    #[test]
    fn repeated_placement_fills_then_fails() {
        let engine = engine();
        add_node(&engine, "node-x", 300);

        for i in 0..3 {
            engine.place(&request(&format!("i{i}"), 100)).unwrap();
        }
        assert_eq!(engine.place(&request("i3", 100)), Err(PlacementError::NoCapacity));
    }

    #[test]
    fn concurrent_placement_never_oversubscribes() {
        let engine = Arc::new(engine());
        add_node(&engine, "node-x", 1000);
        add_node(&engine, "node-y", 700);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|i| engine.place(&request(&format!("t{t}-{i}"), 100)).is_ok())
                        .count()
                })
            })
            .collect();
        let placed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(placed, 17);
        for node in engine.registry().snapshot() {
            assert!(node.reserved.get(MEMORY) <= node.capacity.get(MEMORY));
        }
    }
}
