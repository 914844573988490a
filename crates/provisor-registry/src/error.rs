//! Registry error types.

use thiserror::Error;

/// Errors returned by [`crate::NodeRegistry`] operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A healthy node already uses this identity with different attributes.
    #[error("duplicate node: {0} is registered and healthy with different attributes")]
    DuplicateNode(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("state store error: {0}")]
    State(#[from] provisor_state::StateError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
