//! Orchestrator error types.

use provisor_ledger::LedgerError;
use provisor_placement::PlacementError;
use provisor_registry::RegistryError;
use provisor_state::{InstanceState, StateError};
use thiserror::Error;

/// Errors surfaced to the requester of a provisioning operation.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no healthy nodes available")]
    NoHealthyNodes,

    #[error("no node has capacity for the requested profile")]
    NoCapacity,

    #[error("node already registered with different attributes: {0}")]
    DuplicateNode(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node {node_id} did not answer after {attempts} attempt(s)")]
    NodeCommandTimeout { node_id: String, attempts: u32 },

    #[error("node {node_id} refused the command: {reason}")]
    NodeCommandFailure { node_id: String, reason: String },

    #[error("instance {instance_id} was orphaned while its node {node_id} confirmed it")]
    NodeLost { instance_id: String, node_id: String },

    #[error("instance {instance_id} references node {node_id} which the registry does not know")]
    LedgerInconsistency { instance_id: String, node_id: String },

    #[error("flow for instance {instance_id} ended abnormally: {reason}")]
    FlowAborted { instance_id: String, reason: String },

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("binding not found: {0}")]
    BindingNotFound(String),

    #[error("instance {instance_id} is {state}")]
    Conflict {
        instance_id: String,
        state: InstanceState,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl From<PlacementError> for ProvisionError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NoHealthyNodes => ProvisionError::NoHealthyNodes,
            PlacementError::NoCapacity => ProvisionError::NoCapacity,
        }
    }
}

impl From<LedgerError> for ProvisionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => ProvisionError::NotFound(id),
            LedgerError::AlreadyExists(id) => ProvisionError::Conflict {
                instance_id: id,
                state: InstanceState::Pending,
            },
            LedgerError::InvalidTransition { id, from, .. } => ProvisionError::Conflict {
                instance_id: id,
                state: from,
            },
            LedgerError::State(e) => ProvisionError::State(e),
        }
    }
}

impl From<RegistryError> for ProvisionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateNode(id) => ProvisionError::DuplicateNode(id),
            RegistryError::UnknownNode(id) => ProvisionError::UnknownNode(id),
            RegistryError::State(e) => ProvisionError::State(e),
        }
    }
}
