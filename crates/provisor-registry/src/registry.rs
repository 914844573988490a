//! Node registry: advertised capacity, reservations and health.
//!
//! Placement scores a [`NodeRegistry::snapshot`] without holding any lock,
//! then commits through [`NodeRegistry::try_reserve`], which re-checks
//! health and free capacity under the node's own mutex. A snapshot that
//! went stale between scoring and reservation is therefore rejected instead
//! of oversubscribing the node.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use provisor_state::*;

use crate::error::{RegistryError, RegistryResult};
use crate::events::HealthEvent;

/// A node announcing itself (or its new capacity) to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeAnnouncement {
    pub node_id: NodeId,
    pub address: String,
    pub capacity: Attributes,
    /// Overwrite the attributes of a node that is currently healthy.
    #[serde(default)]
    pub replace: bool,
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeView {
    pub node_id: NodeId,
    pub address: String,
    pub capacity: Attributes,
    pub reserved: Attributes,
    pub instance_count: u32,
    pub health: NodeHealth,
    pub last_heartbeat: u64,
}

impl NodeView {
    /// Advertised minus reserved, per advertised attribute.
    pub fn free(&self) -> Attributes {
        self.capacity.saturating_sub(&self.reserved)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == NodeHealth::Healthy
    }
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveRejected {
    UnknownNode,
    NotHealthy(NodeHealth),
    InsufficientCapacity,
}

/// Silence thresholds used by [`NodeRegistry::sweep`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// A healthy node silent this long becomes suspected.
    pub suspect_after: Duration,
    /// A node silent this long is declared dead.
    pub dead_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            suspect_after: Duration::from_secs(30),
            dead_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct NodeEntry {
    record: NodeRecord,
    reserved: Attributes,
    instance_count: u32,
}

impl NodeEntry {
    fn view(&self) -> NodeView {
        NodeView {
            node_id: self.record.id.clone(),
            address: self.record.address.clone(),
            capacity: self.record.capacity.clone(),
            reserved: self.reserved.clone(),
            instance_count: self.instance_count,
            health: self.record.health,
            last_heartbeat: self.record.last_heartbeat,
        }
    }
}

/// The live set of backend nodes.
pub struct NodeRegistry {
    state: StateStore,
    config: RegistryConfig,
    nodes: RwLock<BTreeMap<NodeId, Arc<Mutex<NodeEntry>>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<HealthEvent>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new(state: StateStore, config: RegistryConfig) -> Self {
        Self {
            state,
            config,
            nodes: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the registry from persisted node records.
    ///
    /// Every node starts out `suspected`: nothing is known about its health
    /// until it heartbeats again. Reservations start empty; call
    /// [`NodeRegistry::rebuild`] with the ledger's live instances.
    pub fn load(state: StateStore, config: RegistryConfig) -> RegistryResult<Self> {
        let registry = Self::new(state, config);
        let records = registry.state.list_nodes()?;
        {
            let mut nodes = registry.nodes.write().unwrap_or_else(PoisonError::into_inner);
            for mut record in records {
                if record.health == NodeHealth::Healthy {
                    record.health = NodeHealth::Suspected;
                }
                nodes.insert(
                    record.id.clone(),
                    Arc::new(Mutex::new(NodeEntry {
                        record,
                        reserved: Attributes::new(),
                        instance_count: 0,
                    })),
                );
            }
            info!(count = nodes.len(), "node registry loaded");
        }
        Ok(registry)
    }

    /// Subscribe to health events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HealthEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn publish(&self, event: HealthEvent) {
        debug!(?event, "publishing health event");
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn entry(&self, node_id: &str) -> Option<Arc<Mutex<NodeEntry>>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    /// Add a node or update its advertised attributes.
    ///
    /// Last write wins, except that a differing announcement for a node
    /// that is currently healthy must set `replace`; otherwise it is taken
    /// for an identity collision and rejected with `DuplicateNode`.
    /// Re-announcing identical attributes is idempotent.
    pub fn register(&self, ann: NodeAnnouncement, at: u64) -> RegistryResult<NodeView> {
        let existing = self.entry(&ann.node_id);
        let Some(existing) = existing else {
            let record = NodeRecord {
                id: ann.node_id.clone(),
                address: ann.address,
                capacity: ann.capacity,
                health: NodeHealth::Healthy,
                last_heartbeat: at,
            };
            self.state.put_node(&record)?;
            let entry = NodeEntry {
                record,
                reserved: Attributes::new(),
                instance_count: 0,
            };
            let view = entry.view();
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            // A concurrent registration of the same id may have won the race.
            if let Some(raced) = nodes.get(&ann.node_id).cloned() {
                drop(nodes);
                let again = NodeAnnouncement {
                    node_id: view.node_id,
                    address: view.address,
                    capacity: view.capacity,
                    replace: ann.replace,
                };
                return self.update_registered(&raced, again, at);
            }
            nodes.insert(ann.node_id.clone(), Arc::new(Mutex::new(entry)));
            info!(node_id = %ann.node_id, address = %view.address, "node registered");
            return Ok(view);
        };

        self.update_registered(&existing, ann, at)
    }

    fn update_registered(
        &self,
        entry: &Mutex<NodeEntry>,
        ann: NodeAnnouncement,
        at: u64,
    ) -> RegistryResult<NodeView> {
        let (view, event) = {
            let mut e = lock(entry);
            let differs = e.record.address != ann.address || e.record.capacity != ann.capacity;
            if differs && e.record.health == NodeHealth::Healthy && !ann.replace {
                warn!(node_id = %ann.node_id, "rejected conflicting registration");
                return Err(RegistryError::DuplicateNode(ann.node_id));
            }

            let mut record = e.record.clone();
            let previous = record.health;
            record.address = ann.address;
            record.capacity = ann.capacity;
            record.health = NodeHealth::Healthy;
            record.last_heartbeat = at;
            self.state.put_node(&record)?;
            e.record = record;
            warn_if_overcommitted(&e);

            (e.view(), HealthEvent::for_transition(&ann.node_id, previous, NodeHealth::Healthy))
        };

        debug!(node_id = %view.node_id, "node registration refreshed");
        if let Some(event) = event {
            self.publish(event);
        }
        Ok(view)
    }

    /// Process a heartbeat: the node is healthy as of `at`.
    ///
    /// A capacity report, if present, replaces the advertised capacity.
    pub fn heartbeat(
        &self,
        node_id: &str,
        at: u64,
        capacity_report: Option<Attributes>,
    ) -> RegistryResult<NodeView> {
        let entry = self
            .entry(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        let (view, event) = {
            let mut e = lock(&entry);
            let mut record = e.record.clone();
            let previous = record.health;
            record.health = NodeHealth::Healthy;
            record.last_heartbeat = record.last_heartbeat.max(at);
            if let Some(capacity) = capacity_report {
                record.capacity = capacity;
            }
            self.state.put_node(&record)?;
            e.record = record;
            warn_if_overcommitted(&e);
            (e.view(), HealthEvent::for_transition(node_id, previous, NodeHealth::Healthy))
        };

        debug!(%node_id, "heartbeat received");
        if let Some(event) = event {
            info!(%node_id, "node recovered");
            self.publish(event);
        }
        Ok(view)
    }

    /// Mark a node suspected. A dead node stays dead. Returns whether the
    /// health changed.
    pub fn mark_suspected(&self, node_id: &str) -> RegistryResult<bool> {
        self.transition(node_id, NodeHealth::Suspected)
    }

    /// Mark a node dead; it is excluded from placement until it heartbeats.
    /// Returns whether the health changed.
    pub fn mark_dead(&self, node_id: &str) -> RegistryResult<bool> {
        self.transition(node_id, NodeHealth::Dead)
    }

    fn transition(&self, node_id: &str, to: NodeHealth) -> RegistryResult<bool> {
        let entry = self
            .entry(node_id)
            .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;

        let event = {
            let mut e = lock(&entry);
            let from = e.record.health;
            if from == to || (from == NodeHealth::Dead && to == NodeHealth::Suspected) {
                return Ok(false);
            }
            let mut record = e.record.clone();
            record.health = to;
            self.state.put_node(&record)?;
            e.record = record;
            HealthEvent::for_transition(node_id, from, to)
        };

        warn!(%node_id, health = ?to, "node health changed");
        if let Some(event) = event {
            self.publish(event);
        }
        Ok(true)
    }

    /// Demote nodes that have been silent too long. Returns the events
    /// that were published.
    pub fn sweep(&self, now: u64) -> RegistryResult<Vec<HealthEvent>> {
        let suspect_after = self.config.suspect_after.as_secs();
        let dead_after = self.config.dead_after.as_secs();

        let mut demotions = Vec::new();
        for view in self.snapshot() {
            let silent = now.saturating_sub(view.last_heartbeat);
            let target = if silent >= dead_after {
                NodeHealth::Dead
            } else if silent >= suspect_after {
                NodeHealth::Suspected
            } else {
                continue;
            };
            demotions.push((view.node_id, target));
        }

        let mut events = Vec::new();
        for (node_id, target) in demotions {
            let entry = match self.entry(&node_id) {
                Some(entry) => entry,
                None => continue,
            };
            // Re-check under the lock: a heartbeat may have arrived since.
            let silent = now.saturating_sub(lock(&entry).record.last_heartbeat);
            if silent < suspect_after {
                continue;
            }
            let from = lock(&entry).record.health;
            if self.transition(&node_id, target)? {
                if let Some(event) = HealthEvent::for_transition(&node_id, from, target) {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    /// Consistent view of all nodes, ordered by ID.
    pub fn snapshot(&self) -> Vec<NodeView> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.values().map(|entry| lock(entry).view()).collect()
    }

    /// View of one node.
    pub fn get(&self, node_id: &str) -> Option<NodeView> {
        self.entry(node_id).map(|entry| lock(&entry).view())
    }

    /// Reserve `profile` on a node if it is healthy and has room for it.
    ///
    /// The check and the commit happen under the node's mutex, so two
    /// callers can never both succeed against the same free capacity.
    pub fn try_reserve(
        &self,
        node_id: &str,
        profile: &CapacityProfile,
    ) -> Result<NodeView, ReserveRejected> {
        let entry = self.entry(node_id).ok_or(ReserveRejected::UnknownNode)?;
        let mut e = lock(&entry);

        if e.record.health != NodeHealth::Healthy {
            return Err(ReserveRejected::NotHealthy(e.record.health));
        }
        let free = e.record.capacity.saturating_sub(&e.reserved);
        if !free.covers(profile) {
            return Err(ReserveRejected::InsufficientCapacity);
        }

        e.reserved.add(profile);
        e.instance_count += 1;
        debug!(%node_id, ?profile, "capacity reserved");
        Ok(e.view())
    }

    /// Return a reservation to a node. Unknown nodes are ignored.
    pub fn release(&self, node_id: &str, profile: &CapacityProfile) {
        let Some(entry) = self.entry(node_id) else {
            warn!(%node_id, "release on unknown node ignored");
            return;
        };
        let mut e = lock(&entry);
        e.reserved.subtract(profile);
        e.instance_count = e.instance_count.saturating_sub(1);
        debug!(%node_id, ?profile, "capacity released");
    }

    /// Replace every node's reservation with the sum of `reservations`.
    ///
    /// Returns the node IDs referenced by a reservation but absent from the
    /// registry.
    pub fn rebuild<'a, I>(&self, reservations: I) -> Vec<NodeId>
    where
        I: IntoIterator<Item = (&'a str, &'a CapacityProfile)>,
    {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        for entry in nodes.values() {
            let mut e = lock(entry);
            e.reserved = Attributes::new();
            e.instance_count = 0;
        }

        let mut missing = Vec::new();
        for (node_id, profile) in reservations {
            match nodes.get(node_id) {
                Some(entry) => {
                    let mut e = lock(entry);
                    e.reserved.add(profile);
                    e.instance_count += 1;
                }
                None => {
                    if !missing.iter().any(|m| m == node_id) {
                        missing.push(node_id.to_string());
                    }
                }
            }
        }
        info!(nodes = nodes.len(), missing = missing.len(), "reservations rebuilt");
        missing
    }

    /// Number of nodes per health.
    pub fn health_counts(&self) -> BTreeMap<NodeHealth, usize> {
        let mut counts = BTreeMap::new();
        for view in self.snapshot() {
            *counts.entry(view.health).or_insert(0) += 1;
        }
        counts
    }
}

fn warn_if_overcommitted(entry: &NodeEntry) {
    if !entry.record.capacity.covers(&entry.reserved) {
        warn!(
            node_id = %entry.record.id,
            capacity = ?entry.record.capacity,
            reserved = ?entry.reserved,
            "advertised capacity shrank below reservations; node is full until it grows"
        );
    }
}
