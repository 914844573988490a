//! Instance ledger operations.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use provisor_placement::{Assignment, PlacementRequest};
use provisor_registry::NodeRegistry;
use provisor_state::{
    BindingRecord, CapacityProfile, InstanceRecord, InstanceState, NodeId, StateStore,
};

use crate::error::{LedgerError, LedgerResult};

/// Durable instance lifecycle, coupled to node reservations.
#[derive(Clone)]
pub struct InstanceLedger {
    state: StateStore,
    registry: Arc<NodeRegistry>,
}

impl InstanceLedger {
    pub fn new(state: StateStore, registry: Arc<NodeRegistry>) -> Self {
        Self { state, registry }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn lookup(&self, id: &str) -> LedgerResult<Option<InstanceRecord>> {
        Ok(self.state.get_instance(id)?)
    }

    /// Like [`lookup`](Self::lookup), but a missing entry is an error.
    pub fn get(&self, id: &str) -> LedgerResult<InstanceRecord> {
        self.lookup(id)?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> LedgerResult<Vec<InstanceRecord>> {
        Ok(self.state.list_instances()?)
    }

    /// Live instances hosted on `node_id`.
    pub fn instances_on_node(&self, node_id: &str) -> LedgerResult<Vec<InstanceRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.node_id == node_id && r.state.holds_reservation())
            .collect())
    }

    /// Every reservation the ledger accounts for: one per live instance on
    /// its hosting node, plus one per recorded migration target.
    pub fn reservations(&self) -> LedgerResult<Vec<(NodeId, CapacityProfile)>> {
        let mut out = Vec::new();
        for record in self.list()? {
            if !record.state.holds_reservation() {
                continue;
            }
            if let Some(target) = &record.migration_target {
                out.push((target.clone(), record.profile.clone()));
            }
            out.push((record.node_id, record.profile));
        }
        Ok(out)
    }

    // ── Transitions ───────────────────────────────────────────────

    /// Record a freshly placed instance as `pending`.
    ///
    /// Must commit before the create command is sent to the node.
    pub fn record_pending(
        &self,
        req: &PlacementRequest,
        assignment: &Assignment,
    ) -> LedgerResult<InstanceRecord> {
        let now = epoch_secs();
        let stored = self.state.update_instance::<_, LedgerError>(&req.instance_id, |current| {
            if current.is_some() {
                return Err(LedgerError::AlreadyExists(req.instance_id.clone()));
            }
            Ok(Some(InstanceRecord {
                id: req.instance_id.clone(),
                node_id: assignment.node_id.clone(),
                requester: req.requester.clone(),
                profile: assignment.reserved.clone(),
                state: InstanceState::Pending,
                migration_target: None,
                orphan_reason: None,
                residue: false,
                created_at: now,
                updated_at: now,
            }))
        })?;
        let record = stored.ok_or_else(|| LedgerError::NotFound(req.instance_id.clone()))?;
        debug!(instance_id = %record.id, node_id = %record.node_id, "instance pending");
        Ok(record)
    }

    /// The node confirmed creation.
    ///
    /// For an orphan with a recorded migration, the instance moves to the
    /// migration target and the old node's reservation is released.
    /// Confirming an already provisioned instance is a no-op.
    pub fn confirm_provisioned(&self, id: &str) -> LedgerResult<InstanceRecord> {
        let mut moved_from: Option<(NodeId, CapacityProfile)> = None;
        let record = self.transition(id, |mut record| {
            match (record.state, record.migration_target.take()) {
                (InstanceState::Provisioned, None) => return Ok(None),
                (InstanceState::Pending, None) => {}
                (InstanceState::Orphaned, Some(target)) => {
                    let old = std::mem::replace(&mut record.node_id, target);
                    moved_from = Some((old, record.profile.clone()));
                    record.orphan_reason = None;
                }
                (from, _) => return Err(invalid(id, from, InstanceState::Provisioned)),
            }
            record.state = InstanceState::Provisioned;
            Ok(Some(record))
        })?;

        if let Some((old, profile)) = moved_from {
            self.registry.release(&old, &profile);
            info!(instance_id = %id, from = %old, to = %record.node_id, "instance migrated");
        } else {
            debug!(instance_id = %id, node_id = %record.node_id, "instance provisioned");
        }
        Ok(record)
    }

    /// Mark a live instance orphaned. Returns false if it already was.
    pub fn mark_orphaned(&self, id: &str, reason: &str) -> LedgerResult<bool> {
        let mut changed = false;
        self.transition(id, |mut record| {
            match record.state {
                InstanceState::Orphaned => return Ok(None),
                InstanceState::Pending | InstanceState::Provisioned => {}
                from => return Err(invalid(id, from, InstanceState::Orphaned)),
            }
            record.state = InstanceState::Orphaned;
            record.orphan_reason = Some(reason.to_string());
            changed = true;
            Ok(Some(record))
        })?;
        if changed {
            warn!(instance_id = %id, %reason, "instance orphaned");
        }
        Ok(changed)
    }

    /// Record the intent to re-create an orphan on `assignment.node_id`.
    ///
    /// The reservation on the target is already held by the placement that
    /// produced `assignment`.
    pub fn begin_migration(&self, id: &str, assignment: &Assignment) -> LedgerResult<InstanceRecord> {
        let record = self.transition(id, |mut record| {
            if record.state != InstanceState::Orphaned || record.migration_target.is_some() {
                return Err(invalid(id, record.state, InstanceState::Provisioned));
            }
            record.migration_target = Some(assignment.node_id.clone());
            Ok(Some(record))
        })?;
        info!(instance_id = %id, target = %assignment.node_id, "migration recorded");
        Ok(record)
    }

    /// Drop a recorded migration and release the target's reservation.
    /// Returns false if no migration was recorded.
    pub fn abandon_migration(&self, id: &str) -> LedgerResult<bool> {
        let mut released: Option<(NodeId, CapacityProfile)> = None;
        self.transition(id, |mut record| match record.migration_target.take() {
            Some(target) => {
                released = Some((target, record.profile.clone()));
                Ok(Some(record))
            }
            None => Ok(None),
        })?;

        match released {
            Some((target, profile)) => {
                self.registry.release(&target, &profile);
                info!(instance_id = %id, %target, "migration abandoned");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move to `unprovisioning`. Idempotent. Must commit before the delete
    /// command is sent to the node. A recorded migration is abandoned.
    pub fn begin_unprovision(&self, id: &str) -> LedgerResult<InstanceRecord> {
        let mut released: Option<(NodeId, CapacityProfile)> = None;
        let record = self.transition(id, |mut record| {
            match record.state {
                InstanceState::Unprovisioning => return Ok(None),
                InstanceState::Provisioned | InstanceState::Orphaned => {}
                from => return Err(invalid(id, from, InstanceState::Unprovisioning)),
            }
            if let Some(target) = record.migration_target.take() {
                released = Some((target, record.profile.clone()));
            }
            record.state = InstanceState::Unprovisioning;
            Ok(Some(record))
        })?;

        if let Some((target, profile)) = released {
            self.registry.release(&target, &profile);
        }
        debug!(instance_id = %id, "instance unprovisioning");
        Ok(record)
    }

    /// The instance no longer exists anywhere: release its reservation,
    /// drop its bindings and keep a `gone` tombstone so the id is never
    /// reused. Clears the `residue` flag of an existing tombstone.
    pub fn record_gone(&self, id: &str) -> LedgerResult<InstanceRecord> {
        let mut released: Option<InstanceRecord> = None;
        let record = self.transition(id, |mut record| {
            if record.state == InstanceState::Gone {
                if !record.residue {
                    return Ok(None);
                }
                record.residue = false;
                return Ok(Some(record));
            }
            if !record.state.can_transition_to(InstanceState::Gone) {
                return Err(invalid(id, record.state, InstanceState::Gone));
            }
            released = Some(record.clone());
            record.state = InstanceState::Gone;
            record.migration_target = None;
            record.residue = false;
            Ok(Some(record))
        })?;

        if let Some(previous) = released {
            self.release_all(&previous);
        }
        self.state.delete_bindings_for_instance(id)?;
        info!(instance_id = %id, node_id = %record.node_id, "instance gone");
        Ok(record)
    }

    /// The instance is gone for the caller but the node may still hold its
    /// data. Releases the reservation and keeps a `gone` tombstone with
    /// `residue` set until a later purge succeeds.
    pub fn record_residue(&self, id: &str) -> LedgerResult<InstanceRecord> {
        let mut released: Option<InstanceRecord> = None;
        let record = self.transition(id, |mut record| {
            if record.state == InstanceState::Gone {
                return Ok(None);
            }
            if !record.state.can_transition_to(InstanceState::Gone) {
                return Err(invalid(id, record.state, InstanceState::Gone));
            }
            released = Some(record.clone());
            record.state = InstanceState::Gone;
            record.migration_target = None;
            record.residue = true;
            Ok(Some(record))
        })?;

        if let Some(previous) = released {
            self.release_all(&previous);
            warn!(instance_id = %id, node_id = %record.node_id, "instance gone with residue on node");
        }
        Ok(record)
    }

    // ── Bindings ──────────────────────────────────────────────────

    pub fn put_binding(&self, binding: &BindingRecord) -> LedgerResult<()> {
        Ok(self.state.put_binding(binding)?)
    }

    pub fn get_binding(&self, id: &str, binding_id: &str) -> LedgerResult<Option<BindingRecord>> {
        Ok(self.state.get_binding(id, binding_id)?)
    }

    pub fn list_bindings(&self, id: &str) -> LedgerResult<Vec<BindingRecord>> {
        Ok(self.state.list_bindings_for_instance(id)?)
    }

    pub fn delete_binding(&self, id: &str, binding_id: &str) -> LedgerResult<bool> {
        Ok(self.state.delete_binding(id, binding_id)?)
    }

    // ── Internals ─────────────────────────────────────────────────

    /// Read-validate-write of an existing entry. `f` returns the updated
    /// record, or `None` to leave it untouched, in which case nothing is
    /// written. The stored record is returned either way.
    fn transition<F>(&self, id: &str, f: F) -> LedgerResult<InstanceRecord>
    where
        F: FnOnce(InstanceRecord) -> LedgerResult<Option<InstanceRecord>>,
    {
        let stored = self.state.update_instance::<_, LedgerError>(id, |current| {
            let record = current.ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
            let unchanged = record.clone();
            match f(record)? {
                Some(mut next) => {
                    debug_assert!(next.state.rank() >= unchanged.state.rank());
                    next.updated_at = epoch_secs();
                    Ok(Some(next))
                }
                None => Ok(Some(unchanged)),
            }
        })?;
        stored.ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    fn release_all(&self, record: &InstanceRecord) {
        self.registry.release(&record.node_id, &record.profile);
        if let Some(target) = &record.migration_target {
            self.registry.release(target, &record.profile);
        }
    }
}

fn invalid(id: &str, from: InstanceState, to: InstanceState) -> LedgerError {
    LedgerError::InvalidTransition {
        id: id.to_string(),
        from,
        to,
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisor_placement::{PlacementEngine, ScoringHints, StrategyKind};
    use provisor_registry::{NodeAnnouncement, RegistryConfig};
    use provisor_state::{Attributes, MEMORY};

    struct Fixture {
        ledger: InstanceLedger,
        engine: PlacementEngine,
    }

    fn fixture(nodes: &[(&str, u64)]) -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(NodeRegistry::new(state.clone(), RegistryConfig::default()));
        for (id, memory) in nodes {
            registry
                .register(
                    NodeAnnouncement {
                        node_id: id.to_string(),
                        address: format!("{id}:9400"),
                        capacity: Attributes::from([(MEMORY, *memory)]),
                        replace: false,
                    },
                    1000,
                )
                .unwrap();
        }
        Fixture {
            ledger: InstanceLedger::new(state, Arc::clone(&registry)),
            engine: PlacementEngine::new(registry, StrategyKind::AvailableMemory),
        }
    }

    fn request(id: &str, memory: u64) -> PlacementRequest {
        PlacementRequest {
            instance_id: id.to_string(),
            requester: "tenant-a".to_string(),
            profile: Attributes::from([(MEMORY, memory)]),
            hints: ScoringHints::default(),
        }
    }

    fn place_pending(f: &Fixture, id: &str, memory: u64) -> InstanceRecord {
        let req = request(id, memory);
        let assignment = f.engine.place(&req).unwrap();
        f.ledger.record_pending(&req, &assignment).unwrap()
    }

    fn free(f: &Fixture, node: &str) -> u64 {
        f.ledger.registry().get(node).unwrap().free().get(MEMORY)
    }

    #[test]
    fn full_lifecycle() {
        let f = fixture(&[("node-y", 1024)]);

        let record = place_pending(&f, "i1", 100);
        assert_eq!(record.state, InstanceState::Pending);
        assert_eq!(free(&f, "node-y"), 924);

        let record = f.ledger.confirm_provisioned("i1").unwrap();
        assert_eq!(record.state, InstanceState::Provisioned);

        let record = f.ledger.begin_unprovision("i1").unwrap();
        assert_eq!(record.state, InstanceState::Unprovisioning);
        assert_eq!(free(&f, "node-y"), 924);

        let record = f.ledger.record_gone("i1").unwrap();
        assert_eq!(record.state, InstanceState::Gone);
        assert!(!record.residue);
        assert_eq!(free(&f, "node-y"), 1024);

        // The tombstone keeps the id taken.
        let tombstone = f.ledger.get("i1").unwrap();
        assert_eq!(tombstone.state, InstanceState::Gone);
        assert!(f.ledger.reservations().unwrap().is_empty());
        let req = request("i1", 100);
        let assignment = f.engine.place(&req).unwrap();
        assert!(matches!(
            f.ledger.record_pending(&req, &assignment),
            Err(LedgerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn repeated_record_gone_releases_once() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        place_pending(&f, "i2", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        f.ledger.begin_unprovision("i1").unwrap();

        f.ledger.record_gone("i1").unwrap();
        f.ledger.record_gone("i1").unwrap();

        assert_eq!(free(&f, "node-y"), 924);
        assert_eq!(f.ledger.get("i1").unwrap().state, InstanceState::Gone);
    }

    #[test]
    fn noop_transition_leaves_record_untouched() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        let before = f.ledger.get("i1").unwrap();

        let again = f.ledger.confirm_provisioned("i1").unwrap();
        assert!(!f.ledger.abandon_migration("i1").unwrap());

        assert_eq!(again, before);
        assert_eq!(f.ledger.get("i1").unwrap(), before);
    }

    #[test]
    fn duplicate_pending_is_rejected() {
        let f = fixture(&[("node-y", 1024)]);
        let req = request("i1", 100);
        let assignment = f.engine.place(&req).unwrap();
        f.ledger.record_pending(&req, &assignment).unwrap();

        assert!(matches!(
            f.ledger.record_pending(&req, &assignment),
            Err(LedgerError::AlreadyExists(_))
        ));
    }

    #[test]
    fn transitions_never_move_backwards() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        f.ledger.begin_unprovision("i1").unwrap();

        assert!(matches!(
            f.ledger.confirm_provisioned("i1"),
            Err(LedgerError::InvalidTransition { from: InstanceState::Unprovisioning, .. })
        ));
        assert!(matches!(
            f.ledger.mark_orphaned("i1", "late"),
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert_eq!(f.ledger.get("i1").unwrap().state, InstanceState::Unprovisioning);
    }

    #[test]
    fn pending_cannot_be_unprovisioned() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);

        assert!(matches!(
            f.ledger.begin_unprovision("i1"),
            Err(LedgerError::InvalidTransition { from: InstanceState::Pending, .. })
        ));
    }

    #[test]
    fn repeated_transitions_are_idempotent() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        f.ledger.confirm_provisioned("i1").unwrap();

        assert!(f.ledger.mark_orphaned("i1", "node dead").unwrap());
        assert!(!f.ledger.mark_orphaned("i1", "node dead").unwrap());

        f.ledger.begin_unprovision("i1").unwrap();
        f.ledger.begin_unprovision("i1").unwrap();
        assert_eq!(free(&f, "node-y"), 924);
    }

    #[test]
    fn orphan_keeps_reservation() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        f.ledger.mark_orphaned("i1", "node dead").unwrap();

        let record = f.ledger.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Orphaned);
        assert_eq!(record.orphan_reason.as_deref(), Some("node dead"));
        assert_eq!(free(&f, "node-y"), 924);
    }

    #[test]
    fn orphan_cannot_be_confirmed_without_migration() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.mark_orphaned("i1", "timeout").unwrap();

        assert!(matches!(
            f.ledger.confirm_provisioned("i1"),
            Err(LedgerError::InvalidTransition { from: InstanceState::Orphaned, .. })
        ));
    }

    #[test]
    fn migration_moves_instance_and_reservation() {
        let f = fixture(&[("node-x", 512), ("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        f.ledger.mark_orphaned("i1", "node dead").unwrap();

        let mut req = request("i1", 100);
        req.hints.avoid_nodes.insert("node-y".to_string());
        let assignment = f.engine.place(&req).unwrap();
        assert_eq!(assignment.node_id, "node-x");
        f.ledger.begin_migration("i1", &assignment).unwrap();

        // Both reservations held while the migration is in flight.
        assert_eq!(f.ledger.reservations().unwrap().len(), 2);

        let record = f.ledger.confirm_provisioned("i1").unwrap();
        assert_eq!(record.node_id, "node-x");
        assert_eq!(record.migration_target, None);
        assert_eq!(free(&f, "node-x"), 412);
        assert_eq!(free(&f, "node-y"), 1024);
    }

    #[test]
    fn abandoned_migration_releases_target() {
        let f = fixture(&[("node-x", 512), ("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.mark_orphaned("i1", "timeout").unwrap();
        let assignment = Assignment {
            node_id: "node-x".into(),
            address: "node-x:9400".into(),
            reserved: Attributes::from([(MEMORY, 100)]),
        };
        f.ledger.registry().try_reserve("node-x", &assignment.reserved).unwrap();
        f.ledger.begin_migration("i1", &assignment).unwrap();

        assert!(f.ledger.abandon_migration("i1").unwrap());
        assert!(!f.ledger.abandon_migration("i1").unwrap());
        assert_eq!(free(&f, "node-x"), 512);
        assert_eq!(f.ledger.get("i1").unwrap().state, InstanceState::Orphaned);
    }

    #[test]
    fn residue_keeps_tombstone_until_purged() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        f.ledger.begin_unprovision("i1").unwrap();

        let record = f.ledger.record_residue("i1").unwrap();
        assert_eq!(record.state, InstanceState::Gone);
        assert!(record.residue);
        assert_eq!(free(&f, "node-y"), 1024);
        assert!(f.ledger.reservations().unwrap().is_empty());

        // Repeating is harmless and does not release twice.
        f.ledger.record_residue("i1").unwrap();
        assert_eq!(free(&f, "node-y"), 1024);

        let record = f.ledger.record_gone("i1").unwrap();
        assert_eq!(record.state, InstanceState::Gone);
        assert!(!record.residue);
        assert!(!f.ledger.get("i1").unwrap().residue);
        assert_eq!(free(&f, "node-y"), 1024);
    }

    #[test]
    fn record_gone_unknown_instance() {
        let f = fixture(&[("node-y", 1024)]);
        assert!(matches!(f.ledger.record_gone("ghost"), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn instances_on_node_lists_live_entries() {
        let f = fixture(&[("node-x", 512), ("node-y", 1024)]);
        place_pending(&f, "i1", 600);
        place_pending(&f, "i2", 100);
        place_pending(&f, "i3", 100);

        let on_y: Vec<_> = f
            .ledger
            .instances_on_node("node-y")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(on_y.len(), 2);
        assert!(on_y.contains(&"i3".to_string()));
    }

    #[test]
    fn bindings_are_removed_with_instance() {
        let f = fixture(&[("node-y", 1024)]);
        place_pending(&f, "i1", 100);
        f.ledger.confirm_provisioned("i1").unwrap();
        f.ledger
            .put_binding(&BindingRecord {
                id: "b1".into(),
                instance_id: "i1".into(),
                options: serde_json::json!({}),
                credentials: serde_json::json!({"user": "u"}),
                created_at: 1,
            })
            .unwrap();
        assert_eq!(f.ledger.list_bindings("i1").unwrap().len(), 1);

        f.ledger.begin_unprovision("i1").unwrap();
        f.ledger.record_gone("i1").unwrap();
        assert!(f.ledger.list_bindings("i1").unwrap().is_empty());
    }
}
