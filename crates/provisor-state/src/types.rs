//! Domain types for the provisor state store.
//!
//! These types represent the persisted state of nodes, service instances
//! and bindings. All types are serializable to/from JSON for storage in
//! redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a backend node.
pub type NodeId = String;

/// Globally unique identifier for a service instance.
pub type InstanceId = String;

/// Well-known attribute name for available memory.
pub const MEMORY: &str = "memory";

/// Well-known attribute name for disk space.
pub const DISK: &str = "disk";

/// Well-known attribute name for client connection slots.
pub const CONNECTIONS: &str = "connections";

// ── Capacity ──────────────────────────────────────────────────────

/// Named numeric capacity attributes (`memory`, `disk`, `connections`, ...).
///
/// A missing attribute reads as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, u64>);

/// The capacity a provisioning request asks for.
pub type CapacityProfile = Attributes;

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, name: impl Into<String>, value: u64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: impl Into<String>, value: u64) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    /// True if every attribute of `profile` is available in `self`.
    pub fn covers(&self, profile: &Attributes) -> bool {
        profile.iter().all(|(name, wanted)| self.get(name) >= wanted)
    }

    /// `self - other` per attribute of `self`, floored at zero.
    pub fn saturating_sub(&self, other: &Attributes) -> Attributes {
        self.iter()
            .map(|(name, value)| (name.to_string(), value.saturating_sub(other.get(name))))
            .collect()
    }

    /// Add every attribute of `other` into `self`.
    pub fn add(&mut self, other: &Attributes) {
        for (name, value) in other.iter() {
            let slot = self.0.entry(name.to_string()).or_insert(0);
            *slot = slot.saturating_add(value);
        }
    }

    /// Subtract every attribute of `other` from `self`, floored at zero.
    pub fn subtract(&mut self, other: &Attributes) {
        for (name, value) in other.iter() {
            if let Some(slot) = self.0.get_mut(name) {
                *slot = slot.saturating_sub(value);
            }
        }
    }
}

impl FromIterator<(String, u64)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, u64); N]> for Attributes {
    fn from(pairs: [(&str, u64); N]) -> Self {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Health of a backend node as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Suspected,
    Dead,
}

impl NodeHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeHealth::Healthy => "healthy",
            NodeHealth::Suspected => "suspected",
            NodeHealth::Dead => "dead",
        }
    }
}

/// Persisted view of a backend node.
///
/// Reserved capacity is not persisted; it is derived from the
/// instance ledger whenever the registry is rebuilt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Address of the node's command endpoint (host:port).
    pub address: String,
    /// Advertised capacity.
    pub capacity: Attributes,
    pub health: NodeHealth,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub last_heartbeat: u64,
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Placement recorded, node has not confirmed creation.
    Pending,
    /// Node confirmed creation.
    Provisioned,
    /// Hosting node died or never answered; awaiting reconciliation.
    Orphaned,
    /// Delete command issued, node has not confirmed.
    Unprovisioning,
    /// Deleted (or given up on).
    Gone,
}

impl InstanceState {
    /// Position along `pending → provisioned → unprovisioning → gone`.
    ///
    /// `orphaned` shares the rank of `provisioned`: it is a degraded
    /// provisioned instance, never an earlier one.
    pub fn rank(self) -> u8 {
        match self {
            InstanceState::Pending => 0,
            InstanceState::Provisioned | InstanceState::Orphaned => 1,
            InstanceState::Unprovisioning => 2,
            InstanceState::Gone => 3,
        }
    }

    /// Whether the ledger accepts `self → next`.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Provisioned)
                | (Pending, Orphaned)
                | (Pending, Gone)
                | (Provisioned, Orphaned)
                | (Provisioned, Unprovisioning)
                | (Orphaned, Provisioned)
                | (Orphaned, Unprovisioning)
                | (Orphaned, Gone)
                | (Unprovisioning, Gone)
        )
    }

    /// Live instances hold a capacity reservation on their node.
    pub fn holds_reservation(self) -> bool {
        !matches!(self, InstanceState::Gone)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Provisioned => "provisioned",
            InstanceState::Orphaned => "orphaned",
            InstanceState::Unprovisioning => "unprovisioning",
            InstanceState::Gone => "gone",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry for one service instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    /// Node currently hosting the instance.
    pub node_id: NodeId,
    /// Who asked for the instance.
    pub requester: String,
    /// Capacity reserved on the hosting node.
    pub profile: CapacityProfile,
    pub state: InstanceState,
    /// Re-placement target recorded before the create command is sent.
    #[serde(default)]
    pub migration_target: Option<NodeId>,
    /// Why the instance was orphaned, if it was.
    #[serde(default)]
    pub orphan_reason: Option<String>,
    /// The node may still hold data for a `gone` instance.
    #[serde(default)]
    pub residue: bool,
    /// Unix timestamp (seconds) when the instance was first recorded.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last transition.
    pub updated_at: u64,
}

// ── Binding ───────────────────────────────────────────────────────

/// Credentials issued by a node for one client application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingRecord {
    pub id: String,
    pub instance_id: InstanceId,
    /// Options supplied by the binding requester.
    pub options: serde_json::Value,
    /// Credentials returned by the node.
    pub credentials: serde_json::Value,
    pub created_at: u64,
}

impl BindingRecord {
    /// Build the composite key for the bindings table.
    pub fn table_key(&self) -> String {
        binding_key(&self.instance_id, &self.id)
    }
}

/// Composite key `{instance_id}:{binding_id}`.
pub fn binding_key(instance_id: &str, binding_id: &str) -> String {
    format!("{instance_id}:{binding_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_requires_every_profile_attribute() {
        let free = Attributes::from([(MEMORY, 512), (DISK, 100)]);

        assert!(free.covers(&Attributes::from([(MEMORY, 512)])));
        assert!(free.covers(&Attributes::from([(MEMORY, 100), (DISK, 100)])));
        assert!(!free.covers(&Attributes::from([(MEMORY, 513)])));
        assert!(!free.covers(&Attributes::from([(CONNECTIONS, 1)])));
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let capacity = Attributes::from([(MEMORY, 100), (DISK, 10)]);
        let reserved = Attributes::from([(MEMORY, 150)]);

        let free = capacity.saturating_sub(&reserved);
        assert_eq!(free.get(MEMORY), 0);
        assert_eq!(free.get(DISK), 10);
    }

    #[test]
    fn add_and_subtract_round_out() {
        let mut reserved = Attributes::new();
        reserved.add(&Attributes::from([(MEMORY, 100)]));
        reserved.add(&Attributes::from([(MEMORY, 50), (DISK, 5)]));
        assert_eq!(reserved.get(MEMORY), 150);
        assert_eq!(reserved.get(DISK), 5);

        reserved.subtract(&Attributes::from([(MEMORY, 100), (DISK, 10)]));
        assert_eq!(reserved.get(MEMORY), 50);
        assert_eq!(reserved.get(DISK), 0);
        assert!(!reserved.is_empty());
    }

    #[test]
    fn lifecycle_never_moves_backwards() {
        use InstanceState::*;
        let all = [Pending, Provisioned, Orphaned, Unprovisioning, Gone];
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    assert!(to.rank() >= from.rank(), "{from} -> {to} regresses");
                }
            }
        }
    }

    #[test]
    fn gone_is_terminal() {
        use InstanceState::*;
        for to in [Pending, Provisioned, Orphaned, Unprovisioning, Gone] {
            assert!(!Gone.can_transition_to(to));
        }
    }

    #[test]
    fn attributes_serialize_as_plain_map() {
        let attrs = Attributes::from([(MEMORY, 1024)]);
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"memory":1024}"#);
    }
}
