//! Health events published by the registry.

use serde::{Deserialize, Serialize};

use provisor_state::{NodeHealth, NodeId};

/// A node changed health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthEvent {
    Suspected { node_id: NodeId },
    Dead { node_id: NodeId },
    Recovered { node_id: NodeId },
}

impl HealthEvent {
    pub fn node_id(&self) -> &str {
        match self {
            HealthEvent::Suspected { node_id }
            | HealthEvent::Dead { node_id }
            | HealthEvent::Recovered { node_id } => node_id,
        }
    }

    /// The event describing `from → to`, if the transition is observable.
    pub(crate) fn for_transition(node_id: &str, from: NodeHealth, to: NodeHealth) -> Option<Self> {
        let node_id = node_id.to_string();
        match (from, to) {
            (a, b) if a == b => None,
            (_, NodeHealth::Healthy) => Some(HealthEvent::Recovered { node_id }),
            (_, NodeHealth::Suspected) => Some(HealthEvent::Suspected { node_id }),
            (_, NodeHealth::Dead) => Some(HealthEvent::Dead { node_id }),
        }
    }
}
