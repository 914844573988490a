use provisor_state::{InstanceState, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("instance {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
