//! Reconciliation and restart recovery.
//!
//! `reconcile` runs periodically: it orphans instances stranded on dead
//! nodes, settles flows that stopped between their ledger write and the
//! node's answer, deletes instances and bindings that healthy nodes hold but
//! the ledger does not, re-creates orphans on another node and retries
//! deletes that left residue. `recover` runs once at startup, before new
//! requests are accepted, and settles whatever the previous process left in
//! flight.
//!
//! Both skip instances whose lock is held: a flow in progress owns its
//! instance.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use provisor_placement::{PlacementRequest, ScoringHints};
use provisor_state::{InstanceRecord, InstanceState, NodeHealth};

use crate::channel::{NodeCommand, NodeEndpoint, NodeInventory};
use crate::error::{ProvisionError, ProvisionResult};
use crate::orchestrator::{CommandOutcome, Orchestrator};

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Live instances found on dead nodes and orphaned.
    pub orphaned: usize,
    /// Pending creates and unfinished deletes no flow was driving, settled.
    pub resumed: usize,
    /// Instances a node held that the ledger does not place there, deleted.
    pub stray_instances: usize,
    /// Bindings a node held that the ledger does not know, revoked.
    pub stray_bindings: usize,
    /// Orphans re-created on another node.
    pub migrated: usize,
    /// Orphans left in place for lack of a healthy node with capacity.
    pub awaiting_capacity: usize,
    /// Migrations whose create command failed.
    pub migration_failed: usize,
    /// Residue deletes that succeeded.
    pub purged: usize,
    pub purge_failed: usize,
    /// Entries referencing nodes the registry does not know.
    pub inconsistent: usize,
    /// Instances skipped because a flow held them.
    pub busy: usize,
}

impl ReconcileReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// What restart recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Reservations re-applied to the registry.
    pub reservations: usize,
    pub abandoned_migrations: usize,
    /// Pending creates the node confirmed.
    pub confirmed: usize,
    /// Pending creates the node refused.
    pub refused: usize,
    /// Pending creates the node did not answer.
    pub orphaned: usize,
    /// Interrupted deletes the node confirmed.
    pub deleted: usize,
    /// Interrupted deletes that left residue.
    pub residue: usize,
    pub inconsistent: usize,
}

/// How an interrupted create or delete was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resumed {
    Confirmed,
    Refused,
    Orphaned,
    Deleted,
    Residue,
}

impl Orchestrator {
    /// One reconciliation pass.
    pub async fn reconcile(&self) -> ProvisionResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let nodes: HashMap<_, _> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();

        // Live instances on dead or unknown nodes.
        for record in self.ledger.list()? {
            if !matches!(record.state, InstanceState::Pending | InstanceState::Provisioned) {
                continue;
            }
            match nodes.get(&record.node_id) {
                None => {
                    error!(instance_id = %record.id, node_id = %record.node_id, "instance on unknown node");
                    report.inconsistent += 1;
                }
                Some(node) if node.health == NodeHealth::Dead => {
                    let Some(_guard) = self.try_lock_instance(&record.id) else {
                        report.busy += 1;
                        continue;
                    };
                    let reason = format!("node {} dead", record.node_id);
                    if self.ledger.mark_orphaned(&record.id, &reason)? {
                        report.orphaned += 1;
                    }
                }
                Some(_) => {}
            }
        }

        // Flows that stopped after their ledger write.
        for record in self.ledger.list()? {
            if !matches!(record.state, InstanceState::Pending | InstanceState::Unprovisioning) {
                continue;
            }
            let Some(_guard) = self.try_lock_instance(&record.id) else {
                report.busy += 1;
                continue;
            };
            let Some(record) = self.ledger.lookup(&record.id)? else {
                continue;
            };
            let Some(node) = nodes.get(&record.node_id) else {
                continue;
            };
            match record.state {
                InstanceState::Pending if node.health != NodeHealth::Dead => {}
                InstanceState::Unprovisioning if node.health == NodeHealth::Dead => {
                    self.ledger.record_residue(&record.id)?;
                    report.resumed += 1;
                    continue;
                }
                InstanceState::Unprovisioning => {}
                _ => continue,
            }
            let endpoint = NodeEndpoint {
                node_id: node.node_id.clone(),
                address: node.address.clone(),
            };
            let resumed = self.resume(&record, &endpoint).await?;
            info!(instance_id = %record.id, ?resumed, "stalled flow settled");
            report.resumed += 1;
        }

        // Instances and bindings nodes hold without the ledger knowing.
        for node in nodes.values() {
            if node.health != NodeHealth::Healthy {
                continue;
            }
            let endpoint = NodeEndpoint {
                node_id: node.node_id.clone(),
                address: node.address.clone(),
            };
            self.purge_strays(&endpoint, &mut report).await?;
        }

        // Orphans.
        for record in self.ledger.list()? {
            if record.state != InstanceState::Orphaned {
                continue;
            }
            let Some(_guard) = self.try_lock_instance(&record.id) else {
                report.busy += 1;
                continue;
            };
            let Some(record) = self.ledger.lookup(&record.id)? else {
                continue;
            };
            if record.state != InstanceState::Orphaned {
                continue;
            }
            match self.migrate(&record).await {
                Ok(true) => report.migrated += 1,
                Ok(false) => report.awaiting_capacity += 1,
                Err(e) => {
                    warn!(instance_id = %record.id, error = %e, "orphan migration failed");
                    report.migration_failed += 1;
                }
            }
        }

        // Residue.
        for record in self.ledger.list()? {
            if record.state != InstanceState::Gone || !record.residue {
                continue;
            }
            let Some(node) = nodes.get(&record.node_id) else {
                report.inconsistent += 1;
                continue;
            };
            if node.health != NodeHealth::Healthy {
                continue;
            }
            let Some(_guard) = self.try_lock_instance(&record.id) else {
                report.busy += 1;
                continue;
            };
            let endpoint = NodeEndpoint {
                node_id: node.node_id.clone(),
                address: node.address.clone(),
            };
            let command = NodeCommand::DeleteInstance {
                instance_id: record.id.clone(),
            };
            match self.send_command(&endpoint, &command).await {
                CommandOutcome::Accepted(_) => {
                    self.ledger.record_gone(&record.id)?;
                    info!(instance_id = %record.id, node_id = %node.node_id, "residue purged");
                    report.purged += 1;
                }
                _ => report.purge_failed += 1,
            }
        }

        self.prune_locks();
        if report.is_idle() {
            debug!("reconcile pass: nothing to do");
        } else {
            info!(?report, "reconcile pass complete");
        }
        Ok(report)
    }

    /// Ask a node what it holds and remove whatever the ledger does not
    /// account for. Nodes that cannot answer are skipped until the next pass.
    async fn purge_strays(&self, endpoint: &NodeEndpoint, report: &mut ReconcileReport) -> ProvisionResult<()> {
        let inventory = match self.send_command(endpoint, &NodeCommand::ListInstances).await {
            CommandOutcome::Accepted(payload) => match serde_json::from_value::<NodeInventory>(payload) {
                Ok(inventory) => inventory,
                Err(e) => {
                    warn!(node_id = %endpoint.node_id, error = %e, "unreadable node inventory");
                    return Ok(());
                }
            },
            CommandOutcome::Rejected(reason) => {
                debug!(node_id = %endpoint.node_id, %reason, "node did not list its instances");
                return Ok(());
            }
            CommandOutcome::Exhausted { last_error, .. } => {
                debug!(node_id = %endpoint.node_id, error = %last_error, "node inventory unavailable");
                return Ok(());
            }
        };

        for instance_id in &inventory.instances {
            let Some(_guard) = self.try_lock_instance(instance_id) else {
                report.busy += 1;
                continue;
            };
            if !self.is_stray(instance_id, &endpoint.node_id)? {
                continue;
            }
            let command = NodeCommand::DeleteInstance {
                instance_id: instance_id.clone(),
            };
            match self.send_command(endpoint, &command).await {
                CommandOutcome::Accepted(_) => {
                    info!(%instance_id, node_id = %endpoint.node_id, "stray instance deleted");
                    report.stray_instances += 1;
                }
                _ => report.purge_failed += 1,
            }
        }

        for binding in &inventory.bindings {
            if inventory.instances.contains(&binding.instance_id)
                && self.is_stray(&binding.instance_id, &endpoint.node_id)?
            {
                // Went with its instance.
                continue;
            }
            let Some(_guard) = self.try_lock_instance(&binding.instance_id) else {
                report.busy += 1;
                continue;
            };
            if self
                .ledger
                .get_binding(&binding.instance_id, &binding.binding_id)?
                .is_some()
            {
                continue;
            }
            let command = NodeCommand::Unbind {
                instance_id: binding.instance_id.clone(),
                binding_id: binding.binding_id.clone(),
            };
            match self.send_command(endpoint, &command).await {
                CommandOutcome::Accepted(_) => {
                    info!(
                        instance_id = %binding.instance_id,
                        binding_id = %binding.binding_id,
                        node_id = %endpoint.node_id,
                        "stray binding revoked"
                    );
                    report.stray_bindings += 1;
                }
                _ => report.purge_failed += 1,
            }
        }
        Ok(())
    }

    /// Whether `node_id` holding `instance_id` is unaccounted for. Residue
    /// tombstones are left to the residue purge.
    fn is_stray(&self, instance_id: &str, node_id: &str) -> ProvisionResult<bool> {
        let Some(record) = self.ledger.lookup(instance_id)? else {
            return Ok(true);
        };
        if record.state == InstanceState::Gone {
            return Ok(!(record.residue && record.node_id == node_id));
        }
        let placed_here = record.node_id == node_id
            || record.migration_target.as_deref() == Some(node_id);
        Ok(!placed_here)
    }

    /// Re-send the command of an interrupted create or delete and settle the
    /// ledger from the answer. The caller holds the instance lock.
    async fn resume(&self, record: &InstanceRecord, endpoint: &NodeEndpoint) -> ProvisionResult<Resumed> {
        if record.state == InstanceState::Pending {
            let command = NodeCommand::CreateInstance {
                instance_id: record.id.clone(),
                requester: record.requester.clone(),
                profile: record.profile.clone(),
            };
            return Ok(match self.send_command(endpoint, &command).await {
                CommandOutcome::Accepted(_) => {
                    self.ledger.confirm_provisioned(&record.id)?;
                    Resumed::Confirmed
                }
                CommandOutcome::Rejected(_) => {
                    self.ledger.record_gone(&record.id)?;
                    Resumed::Refused
                }
                CommandOutcome::Exhausted { last_error, .. } => {
                    self.ledger.mark_orphaned(
                        &record.id,
                        &format!("create not confirmed on resume: {last_error}"),
                    )?;
                    Resumed::Orphaned
                }
            });
        }

        let command = NodeCommand::DeleteInstance {
            instance_id: record.id.clone(),
        };
        Ok(match self.send_command(endpoint, &command).await {
            CommandOutcome::Accepted(_) => {
                self.ledger.record_gone(&record.id)?;
                Resumed::Deleted
            }
            _ => {
                self.ledger.record_residue(&record.id)?;
                Resumed::Residue
            }
        })
    }

    /// Re-create an orphan on a healthy node other than its current one.
    /// Returns false if no node can take it right now.
    async fn migrate(&self, record: &InstanceRecord) -> ProvisionResult<bool> {
        if record.migration_target.is_some() {
            self.ledger.abandon_migration(&record.id)?;
        }

        let req = PlacementRequest {
            instance_id: record.id.clone(),
            requester: record.requester.clone(),
            profile: record.profile.clone(),
            hints: ScoringHints {
                strategy: None,
                avoid_nodes: BTreeSet::from([record.node_id.clone()]),
            },
        };
        let assignment = match self.engine.place(&req) {
            Ok(assignment) => assignment,
            Err(e) => {
                debug!(instance_id = %record.id, error = %e, "no migration target yet");
                return Ok(false);
            }
        };
        if let Err(e) = self.ledger.begin_migration(&record.id, &assignment) {
            self.registry.release(&assignment.node_id, &assignment.reserved);
            return Err(e.into());
        }

        let target = NodeEndpoint {
            node_id: assignment.node_id.clone(),
            address: assignment.address.clone(),
        };
        let command = NodeCommand::CreateInstance {
            instance_id: record.id.clone(),
            requester: record.requester.clone(),
            profile: record.profile.clone(),
        };
        let failure = match self.send_command(&target, &command).await {
            CommandOutcome::Accepted(_) => {
                self.ledger.confirm_provisioned(&record.id)?;
                self.retire_old_copy(record).await;
                return Ok(true);
            }
            CommandOutcome::Rejected(reason) => ProvisionError::NodeCommandFailure {
                node_id: target.node_id,
                reason,
            },
            CommandOutcome::Exhausted { attempts, .. } => ProvisionError::NodeCommandTimeout {
                node_id: target.node_id,
                attempts,
            },
        };
        self.ledger.abandon_migration(&record.id)?;
        Err(failure)
    }

    /// Best-effort delete of the copy an orphan may have left on its old
    /// node. Dead nodes are not contacted.
    async fn retire_old_copy(&self, record: &InstanceRecord) {
        let Some(old) = self.registry.get(&record.node_id) else {
            return;
        };
        if old.health == NodeHealth::Dead {
            return;
        }
        let endpoint = NodeEndpoint {
            node_id: old.node_id,
            address: old.address,
        };
        let command = NodeCommand::DeleteInstance {
            instance_id: record.id.clone(),
        };
        if let CommandOutcome::Exhausted { last_error, .. } = self.send_command(&endpoint, &command).await {
            debug!(instance_id = %record.id, error = %last_error, "old copy not deleted");
        }
    }

    /// Settle the ledger after a restart.
    ///
    /// Rebuilds the registry's reservations from the ledger, abandons
    /// interrupted migrations, re-sends pending creates and interrupted
    /// deletes.
    pub async fn recover(&self) -> ProvisionResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let reservations = self.ledger.reservations()?;
        let missing = self
            .registry
            .rebuild(reservations.iter().map(|(node, profile)| (node.as_str(), profile)));
        report.reservations = reservations.len();
        for node_id in &missing {
            error!(%node_id, "ledger holds reservations on a node the registry does not know");
        }

        for record in self.ledger.list()? {
            if record.migration_target.is_some() && self.ledger.abandon_migration(&record.id)? {
                report.abandoned_migrations += 1;
            }
            if !matches!(record.state, InstanceState::Pending | InstanceState::Unprovisioning) {
                continue;
            }

            let _guard = self.lock_instance(&record.id).await;
            let endpoint = match self.endpoint_for(&record) {
                Ok(endpoint) => endpoint,
                Err(_) => {
                    report.inconsistent += 1;
                    continue;
                }
            };

            match self.resume(&record, &endpoint).await? {
                Resumed::Confirmed => report.confirmed += 1,
                Resumed::Refused => report.refused += 1,
                Resumed::Orphaned => report.orphaned += 1,
                Resumed::Deleted => report.deleted += 1,
                Resumed::Residue => report.residue += 1,
            }
        }

        report.inconsistent += missing.len();
        info!(?report, "recovery complete");
        Ok(report)
    }

    /// Run [`reconcile`](Self::reconcile) every `interval` until shutdown.
    pub async fn run_reconciler(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "reconcile pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("reconciler stopped");
    }
}
