//! Provisioning orchestrator.
//!
//! Every operation on an instance runs under that instance's async lock, so
//! flows for the same instance queue up in arrival order instead of racing:
//! an unprovision that arrives while the create command is in flight waits
//! for the create to settle. Different instances proceed concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OwnedMutexGuard, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use provisor_ledger::{InstanceLedger, LedgerError};
use provisor_placement::{Assignment, PlacementEngine, PlacementRequest, StrategyKind};
use provisor_registry::{HealthEvent, NodeRegistry};
use provisor_state::{BindingRecord, InstanceId, InstanceRecord, InstanceState, NodeHealth};

use crate::channel::{NodeAck, NodeChannel, NodeCommand, NodeEndpoint};
use crate::error::{ProvisionError, ProvisionResult};
use crate::flow::{FlowPhase, FlowTracker};
use crate::retry::RetryPolicy;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on a single node command attempt.
    pub node_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long a provision keeps retrying placement while no node fits.
    /// Zero fails immediately.
    pub placement_wait: Duration,
    pub strategy: StrategyKind,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            placement_wait: Duration::ZERO,
            strategy: StrategyKind::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_placement_wait(mut self, wait: Duration) -> Self {
        self.placement_wait = wait;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub instance: InstanceRecord,
    /// False when the instance already existed and nothing was done.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnprovisionOutcome {
    pub instance: InstanceRecord,
    /// The node may still hold the instance's data; a later reconcile
    /// retries the delete.
    pub residue: bool,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    /// Ledger entries per lifecycle state.
    pub instances: BTreeMap<String, usize>,
    /// Nodes per health.
    pub nodes: BTreeMap<String, usize>,
    /// Gone instances whose data may remain on a node.
    pub residue: usize,
    pub in_flight: BTreeMap<InstanceId, FlowPhase>,
}

/// Result of sending one command with retries.
#[derive(Debug)]
pub(crate) enum CommandOutcome {
    Accepted(Value),
    Rejected(String),
    Exhausted { attempts: u32, last_error: String },
}

pub struct Orchestrator {
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) engine: PlacementEngine,
    pub(crate) ledger: InstanceLedger,
    channel: Arc<dyn NodeChannel>,
    config: OrchestratorConfig,
    locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
    flows: FlowTracker,
    binding_seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        ledger: InstanceLedger,
        channel: Arc<dyn NodeChannel>,
        config: OrchestratorConfig,
    ) -> Self {
        let registry = Arc::clone(ledger.registry());
        let engine = PlacementEngine::new(Arc::clone(&registry), config.strategy.clone());
        Self {
            registry,
            engine,
            ledger,
            channel,
            config,
            locks: Mutex::new(HashMap::new()),
            flows: FlowTracker::new(),
            binding_seq: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &InstanceLedger {
        &self.ledger
    }

    pub fn flows(&self) -> &FlowTracker {
        &self.flows
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Provision ─────────────────────────────────────────────────

    /// Create a service instance.
    ///
    /// Provisioning an ID that is already provisioned succeeds without
    /// reserving anything new. The flow runs on its own task: dropping the
    /// returned future does not stop it from settling.
    pub async fn provision(self: &Arc<Self>, req: PlacementRequest) -> ProvisionResult<ProvisionOutcome> {
        validate_instance_id(&req.instance_id)?;
        let id = req.instance_id.clone();
        let this = Arc::clone(self);
        let flow = tokio::spawn(async move {
            let _guard = this.lock_instance(&req.instance_id).await;
            let _flow = this.flows.track(&req.instance_id, FlowPhase::Received);
            this.provision_locked(&req).await
        });
        join_flow(&id, flow.await)
    }

    async fn provision_locked(&self, req: &PlacementRequest) -> ProvisionResult<ProvisionOutcome> {
        let id = &req.instance_id;
        if let Some(existing) = self.ledger.lookup(id)? {
            return match existing.state {
                InstanceState::Provisioned => {
                    debug!(instance_id = %id, node_id = %existing.node_id, "instance already provisioned");
                    Ok(ProvisionOutcome {
                        instance: existing,
                        created: false,
                    })
                }
                state => Err(ProvisionError::Conflict {
                    instance_id: id.clone(),
                    state,
                }),
            };
        }

        let assignment = self.place_with_wait(req).await?;
        self.flows.enter(id, FlowPhase::Placed);

        let record = match self.ledger.record_pending(req, &assignment) {
            Ok(record) => record,
            Err(e) => {
                self.registry.release(&assignment.node_id, &assignment.reserved);
                return Err(e.into());
            }
        };

        let endpoint = NodeEndpoint {
            node_id: assignment.node_id.clone(),
            address: assignment.address.clone(),
        };
        let command = NodeCommand::CreateInstance {
            instance_id: id.clone(),
            requester: record.requester.clone(),
            profile: record.profile.clone(),
        };
        self.flows.enter(id, FlowPhase::NodeCommandSent);

        match self.send_command(&endpoint, &command).await {
            CommandOutcome::Accepted(_) => match self.ledger.confirm_provisioned(id) {
                Ok(instance) => {
                    self.flows.enter(id, FlowPhase::Confirmed);
                    info!(instance_id = %id, node_id = %instance.node_id, "instance provisioned");
                    Ok(ProvisionOutcome {
                        instance,
                        created: true,
                    })
                }
                Err(LedgerError::InvalidTransition {
                    from: InstanceState::Orphaned,
                    ..
                }) => Err(ProvisionError::NodeLost {
                    instance_id: id.clone(),
                    node_id: assignment.node_id,
                }),
                Err(e) => Err(e.into()),
            },
            CommandOutcome::Rejected(reason) => {
                self.ledger.record_gone(id)?;
                Err(ProvisionError::NodeCommandFailure {
                    node_id: assignment.node_id,
                    reason,
                })
            }
            CommandOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                self.ledger
                    .mark_orphaned(id, &format!("create not confirmed: {last_error}"))?;
                Err(ProvisionError::NodeCommandTimeout {
                    node_id: assignment.node_id,
                    attempts,
                })
            }
        }
    }

    /// Place `req`, retrying with backoff while nothing fits, for at most
    /// `placement_wait`.
    async fn place_with_wait(&self, req: &PlacementRequest) -> ProvisionResult<Assignment> {
        let deadline = Instant::now() + self.config.placement_wait;
        let mut retry = 0;
        loop {
            match self.engine.place(req) {
                Ok(assignment) => return Ok(assignment),
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(e.into());
                    }
                    retry += 1;
                    let delay = self.config.retry.backoff(retry).min(deadline - now);
                    debug!(instance_id = %req.instance_id, error = %e, ?delay, "placement failed, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ── Unprovision ───────────────────────────────────────────────

    /// Delete a service instance and its bindings.
    ///
    /// If the node cannot be reached or refuses, the instance is still gone
    /// for the caller and the outcome is flagged `residue`. Like
    /// [`provision`](Self::provision), the flow outlives a dropped caller.
    pub async fn unprovision(self: &Arc<Self>, id: &str) -> ProvisionResult<UnprovisionOutcome> {
        let id = id.to_string();
        let this = Arc::clone(self);
        let flow = {
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = this.lock_instance(&id).await;
                let _flow = this.flows.track(&id, FlowPhase::UnprovisionReceived);
                this.unprovision_locked(&id).await
            })
        };
        join_flow(&id, flow.await)
    }

    async fn unprovision_locked(&self, id: &str) -> ProvisionResult<UnprovisionOutcome> {
        let record = self.ledger.get(id)?;
        match record.state {
            InstanceState::Provisioned | InstanceState::Orphaned | InstanceState::Unprovisioning => {}
            InstanceState::Gone => return Err(ProvisionError::NotFound(id.to_string())),
            state => {
                return Err(ProvisionError::Conflict {
                    instance_id: id.to_string(),
                    state,
                });
            }
        }

        let endpoint = self.endpoint_for(&record)?;
        let node_dead = self
            .registry
            .get(&endpoint.node_id)
            .is_some_and(|n| n.health == NodeHealth::Dead);

        self.ledger.begin_unprovision(id)?;
        self.remove_bindings(&endpoint, id, !node_dead).await?;

        if node_dead {
            warn!(instance_id = %id, node_id = %endpoint.node_id, "hosting node dead, leaving residue");
            let instance = self.ledger.record_residue(id)?;
            return Ok(UnprovisionOutcome {
                instance,
                residue: true,
            });
        }

        self.flows.enter(id, FlowPhase::NodeDeleteCommandSent);
        let command = NodeCommand::DeleteInstance {
            instance_id: id.to_string(),
        };
        match self.send_command(&endpoint, &command).await {
            CommandOutcome::Accepted(_) => {
                let instance = self.ledger.record_gone(id)?;
                self.flows.enter(id, FlowPhase::Gone);
                info!(instance_id = %id, node_id = %endpoint.node_id, "instance unprovisioned");
                Ok(UnprovisionOutcome {
                    instance,
                    residue: false,
                })
            }
            CommandOutcome::Rejected(reason) => {
                warn!(instance_id = %id, %reason, "node refused delete, leaving residue");
                let instance = self.ledger.record_residue(id)?;
                Ok(UnprovisionOutcome {
                    instance,
                    residue: true,
                })
            }
            CommandOutcome::Exhausted { last_error, .. } => {
                warn!(instance_id = %id, error = %last_error, "delete not confirmed, leaving residue");
                let instance = self.ledger.record_residue(id)?;
                Ok(UnprovisionOutcome {
                    instance,
                    residue: true,
                })
            }
        }
    }

    /// Drop every binding of `id`, telling the node when it can listen.
    async fn remove_bindings(
        &self,
        endpoint: &NodeEndpoint,
        id: &str,
        notify_node: bool,
    ) -> ProvisionResult<()> {
        for binding in self.ledger.list_bindings(id)? {
            if notify_node {
                let command = NodeCommand::Unbind {
                    instance_id: id.to_string(),
                    binding_id: binding.id.clone(),
                };
                if let CommandOutcome::Exhausted { last_error, .. } =
                    self.send_command(endpoint, &command).await
                {
                    warn!(instance_id = %id, binding_id = %binding.id, error = %last_error, "unbind not confirmed");
                }
            }
            self.ledger.delete_binding(id, &binding.id)?;
        }
        Ok(())
    }

    // ── Bindings ──────────────────────────────────────────────────

    /// Ask the hosting node for credentials to the instance.
    pub async fn bind(&self, id: &str, options: Value) -> ProvisionResult<BindingRecord> {
        let _guard = self.lock_instance(id).await;
        let record = self.ledger.get(id)?;
        if record.state != InstanceState::Provisioned {
            return Err(ProvisionError::Conflict {
                instance_id: id.to_string(),
                state: record.state,
            });
        }

        let endpoint = self.endpoint_for(&record)?;
        let binding_id = self.next_binding_id();
        let command = NodeCommand::Bind {
            instance_id: id.to_string(),
            binding_id: binding_id.clone(),
            options: options.clone(),
        };

        match self.send_command(&endpoint, &command).await {
            CommandOutcome::Accepted(credentials) => {
                let binding = BindingRecord {
                    id: binding_id,
                    instance_id: id.to_string(),
                    options,
                    credentials,
                    created_at: epoch_secs(),
                };
                self.ledger.put_binding(&binding)?;
                info!(instance_id = %id, binding_id = %binding.id, "binding created");
                Ok(binding)
            }
            CommandOutcome::Rejected(reason) => Err(ProvisionError::NodeCommandFailure {
                node_id: endpoint.node_id,
                reason,
            }),
            CommandOutcome::Exhausted { attempts, .. } => Err(ProvisionError::NodeCommandTimeout {
                node_id: endpoint.node_id,
                attempts,
            }),
        }
    }

    /// Revoke a binding.
    pub async fn unbind(&self, id: &str, binding_id: &str) -> ProvisionResult<()> {
        let _guard = self.lock_instance(id).await;
        let record = self.ledger.get(id)?;
        if self.ledger.get_binding(id, binding_id)?.is_none() {
            return Err(ProvisionError::BindingNotFound(binding_id.to_string()));
        }

        let endpoint = self.endpoint_for(&record)?;
        let command = NodeCommand::Unbind {
            instance_id: id.to_string(),
            binding_id: binding_id.to_string(),
        };
        match self.send_command(&endpoint, &command).await {
            CommandOutcome::Accepted(_) => {}
            CommandOutcome::Rejected(reason) => {
                // The node does not know the binding; nothing left to revoke.
                warn!(instance_id = %id, %binding_id, %reason, "node refused unbind");
            }
            CommandOutcome::Exhausted { attempts, .. } => {
                return Err(ProvisionError::NodeCommandTimeout {
                    node_id: endpoint.node_id,
                    attempts,
                });
            }
        }
        self.ledger.delete_binding(id, binding_id)?;
        info!(instance_id = %id, %binding_id, "binding removed");
        Ok(())
    }

    pub fn list_bindings(&self, id: &str) -> ProvisionResult<Vec<BindingRecord>> {
        if self.ledger.get(id)?.state == InstanceState::Gone {
            return Err(ProvisionError::NotFound(id.to_string()));
        }
        Ok(self.ledger.list_bindings(id)?)
    }

    // ── Health events ─────────────────────────────────────────────

    /// Apply a registry health event. Returns the number of instances
    /// orphaned. Safe to apply more than once.
    pub fn handle_health_event(&self, event: &HealthEvent) -> ProvisionResult<usize> {
        match event {
            HealthEvent::Dead { node_id } => {
                let mut orphaned = 0;
                for record in self.ledger.instances_on_node(node_id)? {
                    if !matches!(record.state, InstanceState::Pending | InstanceState::Provisioned) {
                        continue;
                    }
                    if self
                        .ledger
                        .mark_orphaned(&record.id, &format!("node {node_id} dead"))?
                    {
                        orphaned += 1;
                    }
                }
                if orphaned > 0 {
                    warn!(%node_id, orphaned, "node dead, instances orphaned");
                }
                Ok(orphaned)
            }
            HealthEvent::Suspected { node_id } => {
                debug!(%node_id, "node suspected");
                Ok(0)
            }
            HealthEvent::Recovered { node_id } => {
                info!(%node_id, "node recovered");
                Ok(0)
            }
        }
    }

    /// Consume health events until shutdown or until the registry goes away.
    pub async fn run_health_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Err(e) = self.handle_health_event(&event) {
                        error!(error = %e, ?event, "failed to apply health event");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("health event loop stopped");
    }

    // ── Stats ─────────────────────────────────────────────────────

    pub fn stats(&self) -> ProvisionResult<OrchestratorStats> {
        let mut stats = OrchestratorStats::default();
        for record in self.ledger.list()? {
            *stats
                .instances
                .entry(record.state.as_str().to_string())
                .or_insert(0) += 1;
            if record.residue {
                stats.residue += 1;
            }
        }
        for (health, count) in self.registry.health_counts() {
            stats.nodes.insert(health.as_str().to_string(), count);
        }
        stats.in_flight = self.flows.snapshot();
        Ok(stats)
    }

    // ── Internals ─────────────────────────────────────────────────

    pub(crate) async fn lock_instance(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.instance_lock(id);
        lock.lock_owned().await
    }

    /// The lock for `id`, unless a flow currently holds it.
    pub(crate) fn try_lock_instance(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        self.instance_lock(id).try_lock_owned().ok()
    }

    fn instance_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Forget locks nobody holds or waits for.
    pub(crate) fn prune_locks(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    }

    /// Where the node hosting `record` listens.
    pub(crate) fn endpoint_for(&self, record: &InstanceRecord) -> ProvisionResult<NodeEndpoint> {
        match self.registry.get(&record.node_id) {
            Some(node) => Ok(NodeEndpoint {
                node_id: node.node_id,
                address: node.address,
            }),
            None => {
                error!(
                    instance_id = %record.id,
                    node_id = %record.node_id,
                    "ledger references a node missing from the registry"
                );
                Err(ProvisionError::LedgerInconsistency {
                    instance_id: record.id.clone(),
                    node_id: record.node_id.clone(),
                })
            }
        }
    }

    /// Send `command`, bounding each attempt by `node_timeout` and retrying
    /// timeouts and transport errors with backoff.
    pub(crate) async fn send_command(
        &self,
        endpoint: &NodeEndpoint,
        command: &NodeCommand,
    ) -> CommandOutcome {
        let attempts = self.config.retry.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry.backoff(attempt - 1)).await;
            }
            debug!(
                node_id = %endpoint.node_id,
                command = command.name(),
                instance_id = command.instance_id().unwrap_or("-"),
                attempt,
                "sending node command"
            );

            match tokio::time::timeout(self.config.node_timeout, self.channel.send(endpoint, command))
                .await
            {
                Ok(Ok(NodeAck::Accepted { payload })) => return CommandOutcome::Accepted(payload),
                Ok(Ok(NodeAck::Rejected { reason })) => {
                    warn!(node_id = %endpoint.node_id, command = command.name(), %reason, "node rejected command");
                    return CommandOutcome::Rejected(reason);
                }
                Ok(Err(e)) => {
                    warn!(node_id = %endpoint.node_id, command = command.name(), attempt, error = %e, "node command failed");
                    last_error = e;
                }
                Err(_) => {
                    warn!(node_id = %endpoint.node_id, command = command.name(), attempt, "node command timed out");
                    last_error = format!("timed out after {:?}", self.config.node_timeout);
                }
            }
        }

        CommandOutcome::Exhausted {
            attempts,
            last_error,
        }
    }

    fn next_binding_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.binding_seq.fetch_add(1, Ordering::Relaxed);
        format!("b{nanos:x}{seq:04x}")
    }
}

fn join_flow<T>(id: &str, joined: Result<ProvisionResult<T>, tokio::task::JoinError>) -> ProvisionResult<T> {
    joined.unwrap_or_else(|e| {
        error!(instance_id = %id, error = %e, "flow task failed");
        Err(ProvisionError::FlowAborted {
            instance_id: id.to_string(),
            reason: e.to_string(),
        })
    })
}

fn validate_instance_id(id: &str) -> ProvisionResult<()> {
    if id.is_empty() {
        return Err(ProvisionError::InvalidRequest("instance id is empty".into()));
    }
    if id.contains(':') || id.contains('/') {
        return Err(ProvisionError::InvalidRequest(format!(
            "instance id {id:?} contains a reserved character"
        )));
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
