//! Message types for actor communication.

use std::sync::Arc;

use queue_client::QueueServer;
use queue_core::{
    DragIntent, MonitorEvent, PendingEntry, PlanDefinition, QueueSnapshot, TableView,
};
use ractor::{ActorRef, RpcReplyPort};

use crate::error::ReconcileError;

/// Reply carrying the server's message or the reason for failure.
pub type CommandReply = RpcReplyPort<Result<String, ReconcileError>>;

/// Queue-level commands that do not touch local state directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCommand {
    /// Remove pending rows.
    RemoveRows(Vec<usize>),
    /// Copy pending or completed rows to the front of the queue.
    DuplicateRows(Vec<usize>),
    ClearQueue,
    ClearHistory,
    StartQueue,
    StopQueue,
}

impl QueueCommand {
    pub fn name(&self) -> &'static str {
        match self {
            QueueCommand::RemoveRows(_) => "remove",
            QueueCommand::DuplicateRows(_) => "duplicate",
            QueueCommand::ClearQueue => "clear queue",
            QueueCommand::ClearHistory => "clear history",
            QueueCommand::StartQueue => "start queue",
            QueueCommand::StopQueue => "stop queue",
        }
    }
}

/// Messages for the ProjectionActor.
#[derive(Debug)]
pub enum ProjectionMessage {
    /// A fresh snapshot from the poller.
    ApplySnapshot { snapshot: Box<QueueSnapshot> },

    /// Edit one cell of a pending row.
    ApplyEdit {
        row: usize,
        column_id: String,
        text: String,
        reply: CommandReply,
    },

    /// An update issued for an edit has resolved.
    EditResolved {
        uid: String,
        key: String,
        previous: Box<PendingEntry>,
        outcome: Result<String, ReconcileError>,
        reply: CommandReply,
    },

    /// A plan definition fetch has finished.
    CatalogLoaded {
        generation: u64,
        fetched: Result<Vec<PlanDefinition>, ReconcileError>,
    },

    /// Capture the item under `row` for reordering.
    BeginDrag {
        row: usize,
        reply: RpcReplyPort<Result<DragIntent, ReconcileError>>,
    },

    /// Drop a dragged item on `target_row`; replies with the pending
    /// destination.
    ProposeMove {
        intent: DragIntent,
        target_row: usize,
        reply: RpcReplyPort<Result<usize, ReconcileError>>,
    },

    /// A move command has resolved.
    MoveResolved {
        uid: String,
        destination: usize,
        outcome: Result<String, ReconcileError>,
        reply: RpcReplyPort<Result<usize, ReconcileError>>,
    },

    /// Run a queue command. Without a reply port the command is fire and
    /// forget.
    Command {
        command: QueueCommand,
        reply: Option<CommandReply>,
    },

    /// Render the table.
    GetTable { reply: RpcReplyPort<TableView> },

    /// Number of edits and moves awaiting the server.
    InFlight { reply: RpcReplyPort<usize> },

    /// Use a different queue server.
    ReplaceServer { server: Arc<dyn QueueServer> },

    /// Poller to nudge after commands.
    AttachPoller { poller: ActorRef<PollerMessage> },

    /// Shutdown the projection.
    Shutdown,
}

/// Messages for the PollerActor.
#[derive(Debug)]
pub enum PollerMessage {
    /// Periodic tick.
    Tick,

    /// Poll immediately.
    PollNow,

    /// Use a different queue server.
    SetServer { server: Arc<dyn QueueServer> },

    /// Shutdown the poller.
    Shutdown,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Get the projection actor.
    GetProjection {
        reply: RpcReplyPort<ActorRef<ProjectionMessage>>,
    },

    /// Swap the queue server in every child (reconnect).
    ReplaceServer { server: Arc<dyn QueueServer> },

    /// Ask the poller for an immediate refresh.
    PollNow,

    /// Subscribe to events.
    Subscribe {
        sender: tokio::sync::broadcast::Sender<MonitorEvent>,
    },

    /// Shutdown the poller and the projection.
    Shutdown,
}
