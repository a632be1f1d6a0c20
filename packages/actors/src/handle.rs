//! Front-end handle to a running monitor.

use std::sync::Arc;

use queue_client::QueueServer;
use queue_core::{DragIntent, MonitorEvent, TableView};
use ractor::{Actor, ActorRef, RpcReplyPort};
use tokio::sync::broadcast;

use crate::config::MonitorConfig;
use crate::error::ReconcileError;
use crate::messages::{ProjectionMessage, QueueCommand, SupervisorMessage};
use crate::registry::global_registry;
use crate::supervisor::{Supervisor, SupervisorArgs};

/// Start a monitor talking to `server`.
///
/// The supervisor is registered in the global registry under the handle's
/// name until it stops.
pub async fn start_monitor(
    config: MonitorConfig,
    server: Arc<dyn QueueServer>,
) -> Result<(MonitorHandle, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let name = format!("monitor-{}", ulid::Ulid::new());
    let (event_tx, _) = broadcast::channel(config.event_capacity);

    let (supervisor, join) = Actor::spawn(
        Some(name.clone()),
        Supervisor,
        SupervisorArgs {
            config,
            server,
            event_tx: event_tx.clone(),
        },
    )
    .await?;

    let (tx, rx) = ractor::concurrency::oneshot();
    let projection = match supervisor
        .send_message(SupervisorMessage::GetProjection { reply: tx.into() })
    {
        Ok(()) => rx.await.ok(),
        Err(_) => None,
    };
    let Some(projection) = projection else {
        supervisor.stop(None);
        return Err(ractor::SpawnErr::StartupFailed(
            "monitor stopped during startup".into(),
        ));
    };

    global_registry().register(&name, supervisor.clone());

    Ok((
        MonitorHandle {
            name,
            supervisor,
            projection,
            event_tx,
        },
        join,
    ))
}

/// Cheap, cloneable access to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    name: String,
    supervisor: ActorRef<SupervisorMessage>,
    projection: ActorRef<ProjectionMessage>,
    event_tx: broadcast::Sender<MonitorEvent>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(RpcReplyPort<T>) -> ProjectionMessage,
    ) -> Result<T, ReconcileError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.projection
            .send_message(build(tx.into()))
            .map_err(|e| ReconcileError::Unavailable(e.to_string()))?;
        rx.await
            .map_err(|_| ReconcileError::Unavailable("projection stopped".into()))
    }

    /// Render the current table.
    pub async fn table(&self) -> Result<TableView, ReconcileError> {
        self.ask(|reply| ProjectionMessage::GetTable { reply }).await
    }

    /// Edit one cell. Resolves once the server accepted or the edit was
    /// rolled back.
    pub async fn edit(
        &self,
        row: usize,
        column_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<String, ReconcileError> {
        let column_id = column_id.into();
        let text = text.into();
        self.ask(|reply| ProjectionMessage::ApplyEdit {
            row,
            column_id,
            text,
            reply,
        })
        .await?
    }

    pub async fn begin_drag(&self, row: usize) -> Result<DragIntent, ReconcileError> {
        self.ask(|reply| ProjectionMessage::BeginDrag { row, reply })
            .await?
    }

    /// Drop a dragged item on `target_row`. Returns the pending index the
    /// item ended up at.
    pub async fn propose_move(
        &self,
        intent: DragIntent,
        target_row: usize,
    ) -> Result<usize, ReconcileError> {
        self.ask(|reply| ProjectionMessage::ProposeMove {
            intent,
            target_row,
            reply,
        })
        .await?
    }

    /// Drag `row` and drop it on `target_row`.
    pub async fn move_row(&self, row: usize, target_row: usize) -> Result<usize, ReconcileError> {
        let intent = self.begin_drag(row).await?;
        self.propose_move(intent, target_row).await
    }

    /// Run a queue command and wait for the server.
    pub async fn command(&self, command: QueueCommand) -> Result<String, ReconcileError> {
        self.ask(|reply| ProjectionMessage::Command {
            command,
            reply: Some(reply),
        })
        .await?
    }

    /// Run a queue command; the outcome arrives as an event.
    pub fn submit(&self, command: QueueCommand) -> Result<(), ReconcileError> {
        self.projection
            .send_message(ProjectionMessage::Command {
                command,
                reply: None,
            })
            .map_err(|e| ReconcileError::Unavailable(e.to_string()))
    }

    /// Edits and moves still awaiting the server.
    pub async fn in_flight(&self) -> Result<usize, ReconcileError> {
        self.ask(|reply| ProjectionMessage::InFlight { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    /// Forward every future event into `sender`.
    pub fn forward_events(
        &self,
        sender: broadcast::Sender<MonitorEvent>,
    ) -> Result<(), ReconcileError> {
        self.send_supervisor(SupervisorMessage::Subscribe { sender })
    }

    /// Poll without waiting for the next tick.
    pub fn refresh(&self) -> Result<(), ReconcileError> {
        self.send_supervisor(SupervisorMessage::PollNow)
    }

    /// Talk to a different server from now on.
    pub fn replace_server(&self, server: Arc<dyn QueueServer>) -> Result<(), ReconcileError> {
        self.send_supervisor(SupervisorMessage::ReplaceServer { server })
    }

    pub fn shutdown(&self) -> Result<(), ReconcileError> {
        self.send_supervisor(SupervisorMessage::Shutdown)
    }

    fn send_supervisor(&self, message: SupervisorMessage) -> Result<(), ReconcileError> {
        self.supervisor
            .send_message(message)
            .map_err(|e| ReconcileError::Unavailable(e.to_string()))
    }
}
