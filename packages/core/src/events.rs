//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ColumnSpec, QueueActions, ServerStatus};

/// Events emitted by the monitor for front ends and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    // Projection events
    /// A snapshot replaced the projection.
    SnapshotApplied {
        pending: usize,
        running: bool,
        completed: usize,
        timestamp: DateTime<Utc>,
    },
    /// A snapshot arrived while operations were in flight and was held back.
    SnapshotDeferred {
        in_flight: usize,
        timestamp: DateTime<Utc>,
    },
    /// Plan parameter definitions arrived from the server.
    ParametersLoaded {
        plans: usize,
        timestamp: DateTime<Utc>,
    },
    /// New columns were discovered.
    ColumnsChanged {
        columns: Vec<ColumnSpec>,
        timestamp: DateTime<Utc>,
    },

    // Reconciliation events
    /// The server accepted an edit.
    EditCommitted {
        uid: String,
        key: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// An edit was undone locally.
    EditRolledBack {
        uid: String,
        key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// The server accepted a move.
    MoveCommitted {
        uid: String,
        destination: usize,
        timestamp: DateTime<Utc>,
    },
    /// A move was refused; local order is unchanged.
    MoveRejected {
        uid: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A queue command finished.
    CommandCompleted {
        command: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A queue command failed.
    CommandFailed {
        command: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Connection events
    /// Fresh server status from a poll.
    ServerStatus {
        status: ServerStatus,
        actions: QueueActions,
        timestamp: DateTime<Utc>,
    },
    /// A poll could not reach the server.
    Disconnected {
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Free-form message for the status bar.
    StatusMessage {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    pub fn status_message(message: impl Into<String>) -> Self {
        MonitorEvent::StatusMessage {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn server_status(status: ServerStatus) -> Self {
        let actions = status.actions();
        MonitorEvent::ServerStatus {
            status,
            actions,
            timestamp: Utc::now(),
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MonitorEvent::SnapshotApplied { timestamp, .. } => *timestamp,
            MonitorEvent::SnapshotDeferred { timestamp, .. } => *timestamp,
            MonitorEvent::ParametersLoaded { timestamp, .. } => *timestamp,
            MonitorEvent::ColumnsChanged { timestamp, .. } => *timestamp,
            MonitorEvent::EditCommitted { timestamp, .. } => *timestamp,
            MonitorEvent::EditRolledBack { timestamp, .. } => *timestamp,
            MonitorEvent::MoveCommitted { timestamp, .. } => *timestamp,
            MonitorEvent::MoveRejected { timestamp, .. } => *timestamp,
            MonitorEvent::CommandCompleted { timestamp, .. } => *timestamp,
            MonitorEvent::CommandFailed { timestamp, .. } => *timestamp,
            MonitorEvent::ServerStatus { timestamp, .. } => *timestamp,
            MonitorEvent::Disconnected { timestamp, .. } => *timestamp,
            MonitorEvent::StatusMessage { timestamp, .. } => *timestamp,
        }
    }

    /// Get the item uid associated with this event, if any.
    pub fn uid(&self) -> Option<&str> {
        match self {
            MonitorEvent::EditCommitted { uid, .. }
            | MonitorEvent::EditRolledBack { uid, .. }
            | MonitorEvent::MoveCommitted { uid, .. }
            | MonitorEvent::MoveRejected { uid, .. } => Some(uid),
            _ => None,
        }
    }

    /// Whether the table should be redrawn after this event.
    pub fn changes_table(&self) -> bool {
        matches!(
            self,
            MonitorEvent::SnapshotApplied { .. }
                | MonitorEvent::ParametersLoaded { .. }
                | MonitorEvent::ColumnsChanged { .. }
                | MonitorEvent::EditCommitted { .. }
                | MonitorEvent::EditRolledBack { .. }
                | MonitorEvent::MoveCommitted { .. }
        )
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            MonitorEvent::SnapshotApplied {
                pending,
                running,
                completed,
                ..
            } => {
                let running = if *running { ", 1 running" } else { "" };
                format!(
                    "Queue refreshed: {} pending{}, {} completed",
                    pending, running, completed
                )
            }
            MonitorEvent::SnapshotDeferred { in_flight, .. } => {
                format!("Refresh deferred ({} operations in flight)", in_flight)
            }
            MonitorEvent::ParametersLoaded { plans, .. } => {
                format!("Loaded {} plan definitions", plans)
            }
            MonitorEvent::ColumnsChanged { columns, .. } => {
                format!("Columns changed ({} columns)", columns.len())
            }
            MonitorEvent::EditCommitted { uid, key, message, .. } => {
                format!("Item {} '{}' updated: {}", uid, key, message)
            }
            MonitorEvent::EditRolledBack { uid, key, reason, .. } => {
                format!("Item {} '{}' edit rolled back: {}", uid, key, reason)
            }
            MonitorEvent::MoveCommitted {
                uid, destination, ..
            } => format!("Item {} moved to {}", uid, destination),
            MonitorEvent::MoveRejected { uid, reason, .. } => {
                format!("Item {} move rejected: {}", uid, reason)
            }
            MonitorEvent::CommandCompleted {
                command, message, ..
            } => format!("{}: {}", command, message),
            MonitorEvent::CommandFailed { command, error, .. } => {
                format!("{} failed: {}", command, error)
            }
            MonitorEvent::ServerStatus { status, .. } => format!(
                "Server {} ({} queued, {} in history)",
                status.manager_state, status.items_in_queue, status.items_in_history
            ),
            MonitorEvent::Disconnected { error, .. } => format!("Disconnected: {}", error),
            MonitorEvent::StatusMessage { message, .. } => message.clone(),
        }
    }
}
