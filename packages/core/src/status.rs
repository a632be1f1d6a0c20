//! Queue server status and the queue actions it allows.

use serde::{Deserialize, Serialize};

/// Manager state reported while the queue is being executed.
const EXECUTING_QUEUE: &str = "executing_queue";

/// Status as reported by the queue server's `status` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStatus {
    pub manager_state: String,
    pub re_state: Option<String>,
    pub items_in_queue: u64,
    pub items_in_history: u64,
    pub running_item_uid: Option<String>,
    pub queue_stop_pending: bool,
    pub worker_environment_exists: bool,
}

impl ServerStatus {
    pub fn queue_running(&self) -> bool {
        self.manager_state == EXECUTING_QUEUE
    }

    /// The run engine is closed when no worker environment exists.
    pub fn re_closed(&self) -> bool {
        !self.worker_environment_exists
            || self.re_state.as_deref().is_none_or(|state| state == "closed")
    }

    pub fn actions(&self) -> QueueActions {
        if self.queue_stop_pending || self.re_closed() {
            return QueueActions::default();
        }
        QueueActions {
            can_start: !self.queue_running(),
            can_stop: self.queue_running(),
        }
    }
}

/// Which queue controls are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueActions {
    pub can_start: bool,
    pub can_stop: bool,
}
