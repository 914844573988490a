//! provisor orchestrator: drives provisioning flows end to end.
//!
//! For every request the orchestrator consults the placement engine,
//! records the outcome in the instance ledger *before* talking to the node,
//! issues the node command with a bounded timeout and retries, and settles
//! the ledger from the reply.
//!
//! # Components
//!
//! - **`orchestrator`**: `Orchestrator` with provision, unprovision, bind, unbind,
//!   health-event handling
//! - **`reconcile`**: periodic orphan migration, stalled-flow resumption,
//!   stray and residue purge, restart recovery
//! - **`channel`**: `NodeChannel` trait (the outbound command seam) and an
//!   in-memory implementation
//! - **`retry`**: bounded exponential backoff
//! - **`flow`**: in-flight flow phases

pub mod channel;
pub mod error;
pub mod flow;
pub mod orchestrator;
pub mod reconcile;
pub mod retry;

pub use channel::{
    ChannelFuture, MemoryChannel, NodeAck, NodeBehaviour, NodeBinding, NodeChannel, NodeCommand,
    NodeEndpoint, NodeInventory,
};
pub use error::{ProvisionError, ProvisionResult};
pub use flow::{FlowGuard, FlowPhase, FlowTracker};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorStats, ProvisionOutcome, UnprovisionOutcome,
};
pub use reconcile::{ReconcileReport, RecoveryReport};
pub use retry::RetryPolicy;
