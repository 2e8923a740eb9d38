use crate::types::{EntityKind, ReplicaId};
use std::time::Duration;

/// Errors returned by graph store calls.
///
/// None of these affect the store's state; they only concern the one call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: EntityKind, key: String },

    #[error("graph store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("graph store {0} is unavailable")]
    Unavailable(ReplicaId),
}

impl GraphError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
