//! Errors reported to front ends.

use queue_client::RemoteError;
use queue_core::{CoercionError, PayloadError, RowError, RowState};
use thiserror::Error;

/// Why an edit, move or command did not go through.
///
/// None of these are fatal: the projection is always left at its last known
/// good state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("Row {row} is {state} and cannot be changed")]
    ImmutableRow { row: usize, state: RowState },

    #[error("Row {row} has no uid")]
    MissingUid { row: usize },

    #[error("Row {row} is out of range ({rows} rows)")]
    RowOutOfRange { row: usize, rows: usize },

    #[error("Item {0} is no longer in the queue")]
    UnknownItem(String),

    #[error("Reordering needs at least two pending items, all with uids")]
    DragDisabled,

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("Rejected by server: {0}")]
    RemoteRejected(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Monitor unavailable: {0}")]
    Unavailable(String),
}

impl From<RowError> for ReconcileError {
    fn from(err: RowError) -> Self {
        match err {
            RowError::OutOfRange { row, rows } => ReconcileError::RowOutOfRange { row, rows },
            RowError::Immutable { row, state } => ReconcileError::ImmutableRow { row, state },
            RowError::MissingUid { row } => ReconcileError::MissingUid { row },
            RowError::DragDisabled => ReconcileError::DragDisabled,
        }
    }
}

impl From<RemoteError> for ReconcileError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Rejected(msg) => ReconcileError::RemoteRejected(msg),
            other => ReconcileError::Transport(other.to_string()),
        }
    }
}

impl ReconcileError {
    /// Whether the local state was changed and then restored.
    pub fn rolled_back(&self) -> bool {
        matches!(
            self,
            ReconcileError::Payload(_)
                | ReconcileError::RemoteRejected(_)
                | ReconcileError::Transport(_)
        )
    }
}
