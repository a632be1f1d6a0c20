//! Projection actor owning the local view of the remote queue.
//!
//! Every mutation of the projection goes through this actor. Remote calls for
//! edits, moves and plan definitions run in spawned tasks that report back
//! with a message, so the actor keeps answering reads while the server thinks.
//! While an edit or move is in flight, incoming snapshots are held back
//! (latest wins). A commit discards the held snapshot, since it predates the
//! change, and asks for a fresh poll; a rollback applies it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queue_client::{QueueServer, RemoteResult};
use queue_core::{
    AliasMap, ColumnSchema, EditContext, MonitorEvent, PendingEntry, QueueProjection,
    QueueRecord, QueueSnapshot, RowState, apply_item_edit, build_update_payload,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;

use crate::catalog::ParameterCatalog;
use crate::error::ReconcileError;
use crate::messages::{CommandReply, PollerMessage, ProjectionMessage, QueueCommand};

/// Row fields that never go into an update payload.
const PAYLOAD_EXCLUDED: [&str; 10] = [
    "name", "status", "state", "scan_ids", "uid", "item_uid", "args", "kwargs", "plan", "index",
];

/// Run a remote call, treating a timeout as a transport failure.
pub(crate) async fn remote_call<T>(
    timeout: Duration,
    call: impl Future<Output = RemoteResult<T>>,
) -> Result<T, ReconcileError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(ReconcileError::from),
        Err(_) => Err(ReconcileError::Transport(format!(
            "no response within {} ms",
            timeout.as_millis()
        ))),
    }
}

/// An edit waiting for an earlier edit of the same item.
#[derive(Debug)]
struct QueuedEdit {
    column_id: String,
    text: String,
    reply: CommandReply,
}

/// A queue command with rows resolved to uids.
#[derive(Debug)]
enum RemoteCommand {
    Remove(Vec<String>),
    Duplicate(Vec<String>),
    ClearQueue,
    ClearHistory,
    Start,
    Stop,
}

impl RemoteCommand {
    async fn run(self, server: &dyn QueueServer) -> RemoteResult<String> {
        match self {
            RemoteCommand::Remove(uids) => {
                let count = uids.len();
                server.remove_items(uids).await?;
                Ok(format!("Removed {} item(s)", count))
            }
            RemoteCommand::Duplicate(uids) => {
                let count = uids.len();
                server.duplicate_items(uids).await?;
                Ok(format!("Duplicated {} item(s)", count))
            }
            RemoteCommand::ClearQueue => {
                server.clear_queue().await?;
                Ok("Queue cleared".to_string())
            }
            RemoteCommand::ClearHistory => {
                server.clear_history().await?;
                Ok("History cleared".to_string())
            }
            RemoteCommand::Start => server.start_queue().await?.into_result(),
            RemoteCommand::Stop => server.stop_queue().await?.into_result(),
        }
    }
}

/// Arguments for spawning a projection actor.
pub struct ProjectionArgs {
    pub server: Arc<dyn QueueServer>,
    pub aliases: AliasMap,
    pub remote_timeout: Duration,
    pub event_tx: broadcast::Sender<MonitorEvent>,
}

/// State for the projection actor.
pub struct ProjectionState {
    projection: QueueProjection,
    schema: ColumnSchema,
    aliases: AliasMap,
    catalog: ParameterCatalog,
    server: Arc<dyn QueueServer>,
    remote_timeout: Duration,
    /// Edits and moves awaiting the server.
    in_flight: usize,
    /// Uids with an edit awaiting the server.
    editing: HashSet<String>,
    queued_edits: HashMap<String, VecDeque<QueuedEdit>>,
    /// Edits waiting for plan definitions, in arrival order.
    catalog_waiters: VecDeque<(String, QueuedEdit)>,
    deferred: Option<QueueSnapshot>,
    poller: Option<ActorRef<PollerMessage>>,
    event_tx: broadcast::Sender<MonitorEvent>,
}

impl ProjectionState {
    pub fn new(args: ProjectionArgs) -> Self {
        Self {
            projection: QueueProjection::new(),
            schema: ColumnSchema::new(),
            aliases: args.aliases,
            catalog: ParameterCatalog::new(),
            server: args.server,
            remote_timeout: args.remote_timeout,
            in_flight: 0,
            editing: HashSet::new(),
            queued_edits: HashMap::new(),
            catalog_waiters: VecDeque::new(),
            deferred: None,
            poller: None,
            event_tx: args.event_tx,
        }
    }

    fn broadcast(&self, event: MonitorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn poll_now(&self) {
        if let Some(ref poller) = self.poller {
            let _ = poller.send_message(PollerMessage::PollNow);
        }
    }

    /// Start fetching plan definitions unless they are cached, already on
    /// the way or cooling down after a failure.
    fn load_catalog(&mut self, myself: &ActorRef<ProjectionMessage>) {
        let Some(generation) = self.catalog.begin_load() else {
            return;
        };
        let server = self.server.clone();
        let timeout = self.remote_timeout;
        let myself = myself.clone();
        tokio::spawn(async move {
            let fetched = ParameterCatalog::fetch(server.as_ref(), timeout).await;
            let _ = myself.send_message(ProjectionMessage::CatalogLoaded {
                generation,
                fetched,
            });
        });
    }

    /// Parameter names of every plan currently visible.
    fn visible_params(&mut self) -> HashMap<String, HashSet<String>> {
        let plans: Vec<String> = self
            .projection
            .visible_rows()
            .iter()
            .map(|record| record.plan_name())
            .collect();
        self.catalog.names_by_plan(plans.iter().map(String::as_str))
    }

    fn apply_snapshot(&mut self, snapshot: QueueSnapshot) {
        self.projection.apply_snapshot(snapshot);

        if self
            .schema
            .ensure_columns(self.projection.visible_rows(), &self.aliases)
        {
            tracing::debug!("Columns now {:?}", self.schema.ids());
            self.broadcast(MonitorEvent::ColumnsChanged {
                columns: self.schema.columns().to_vec(),
                timestamp: Utc::now(),
            });
        }

        self.broadcast(MonitorEvent::SnapshotApplied {
            pending: self.projection.pending().len(),
            running: self.projection.running().is_some(),
            completed: self.projection.completed().len(),
            timestamp: Utc::now(),
        });
    }

    /// Apply the held-back snapshot once nothing is in flight.
    fn flush_deferred(&mut self) {
        if self.in_flight == 0
            && let Some(snapshot) = self.deferred.take()
        {
            tracing::debug!("Applying deferred snapshot");
            self.apply_snapshot(snapshot);
        }
    }

    /// Mutate the pending item `uid` and build its update payload.
    ///
    /// Returns the effective key, the entry as it was before the edit, and the
    /// payload. On error the entry is left as it was.
    fn prepare_edit(
        &mut self,
        uid: &str,
        column_id: &str,
        text: &str,
    ) -> Result<(String, PendingEntry, QueueRecord), ReconcileError> {
        let row = self
            .projection
            .row_of(uid)
            .ok_or_else(|| ReconcileError::UnknownItem(uid.to_string()))?;
        let (index, _) = self.projection.mutable_row(row)?;

        let columns = self.schema.columns().to_vec();
        let params = self.visible_params();
        let key = self
            .projection
            .row_view(row, &columns, &self.aliases, &params)
            .and_then(|view| view.cells.into_iter().find(|cell| cell.column_id == column_id))
            .map(|cell| cell.key)
            .unwrap_or_else(|| column_id.to_string());

        let previous = self
            .projection
            .pending_entry(index)
            .cloned()
            .ok_or_else(|| ReconcileError::UnknownItem(uid.to_string()))?;
        let definition = self.catalog.definition(&previous.raw.plan_name()).cloned();
        let ctx = EditContext::new(definition.as_ref(), &self.aliases);

        ctx.coerce(&key, text)?;

        let Some(entry) = self.projection.pending_entry_mut(index) else {
            return Err(ReconcileError::UnknownItem(uid.to_string()));
        };
        apply_item_edit(&mut entry.raw, &key, text, &ctx)?;
        entry.refresh_display();
        let raw = entry.raw.clone();

        let row_values = self.projection.row_values(row, &columns, &self.aliases, &params);
        match build_update_payload(&raw, &row_values, &PAYLOAD_EXCLUDED, definition.as_ref()) {
            Ok(payload) => Ok((key, previous, payload)),
            Err(e) => {
                self.projection.restore_entry(uid, previous);
                Err(e.into())
            }
        }
    }

    /// Send an edit now, or queue it behind the edit of the same item that is
    /// still in flight.
    fn submit_edit(
        &mut self,
        myself: &ActorRef<ProjectionMessage>,
        uid: String,
        column_id: String,
        text: String,
        reply: CommandReply,
    ) {
        if self.editing.contains(&uid) {
            tracing::debug!("Queueing edit of {} behind the one in flight", uid);
            self.queued_edits
                .entry(uid)
                .or_default()
                .push_back(QueuedEdit {
                    column_id,
                    text,
                    reply,
                });
        } else {
            self.dispatch_edit(myself, uid, column_id, text, reply);
        }
    }

    /// Apply an edit locally and send the update. Returns `false` when the
    /// edit failed before reaching the server.
    fn dispatch_edit(
        &mut self,
        myself: &ActorRef<ProjectionMessage>,
        uid: String,
        column_id: String,
        text: String,
        reply: CommandReply,
    ) -> bool {
        let (key, previous, payload) = match self.prepare_edit(&uid, &column_id, &text) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::debug!("Edit of {} '{}' refused: {}", uid, column_id, e);
                let _ = reply.send(Err(e));
                return false;
            }
        };

        self.in_flight += 1;
        self.editing.insert(uid.clone());

        let server = self.server.clone();
        let timeout = self.remote_timeout;
        let myself = myself.clone();
        tokio::spawn(async move {
            let outcome = remote_call(timeout, server.update_item(payload.into_value(), false))
                .await
                .and_then(|response| response.into_result().map_err(ReconcileError::from));
            let _ = myself.send_message(ProjectionMessage::EditResolved {
                uid,
                key,
                previous: Box::new(previous),
                outcome,
                reply,
            });
        });
        true
    }

    /// Dispatch the next queued edit of `uid`, skipping edits that fail locally.
    fn dispatch_queued(&mut self, myself: &ActorRef<ProjectionMessage>, uid: &str) {
        loop {
            let Some(next) = self
                .queued_edits
                .get_mut(uid)
                .and_then(|queue| queue.pop_front())
            else {
                self.queued_edits.remove(uid);
                return;
            };
            if self.dispatch_edit(myself, uid.to_string(), next.column_id, next.text, next.reply) {
                return;
            }
        }
    }

    fn resolve_command(&self, command: &QueueCommand) -> Result<RemoteCommand, ReconcileError> {
        match command {
            QueueCommand::RemoveRows(rows) => rows
                .iter()
                .map(|row| Ok(self.projection.mutable_row(*row)?.1))
                .collect::<Result<Vec<_>, ReconcileError>>()
                .map(RemoteCommand::Remove),
            QueueCommand::DuplicateRows(rows) => rows
                .iter()
                .map(|row| self.duplicable_uid(*row))
                .collect::<Result<Vec<_>, _>>()
                .map(RemoteCommand::Duplicate),
            QueueCommand::ClearQueue => Ok(RemoteCommand::ClearQueue),
            QueueCommand::ClearHistory => Ok(RemoteCommand::ClearHistory),
            QueueCommand::StartQueue => Ok(RemoteCommand::Start),
            QueueCommand::StopQueue => Ok(RemoteCommand::Stop),
        }
    }

    /// Pending and completed rows can be duplicated; the running one cannot.
    fn duplicable_uid(&self, row: usize) -> Result<String, ReconcileError> {
        let state = self.projection.row_state(row).ok_or(ReconcileError::RowOutOfRange {
            row,
            rows: self.projection.row_count(),
        })?;
        if state == RowState::Running {
            return Err(ReconcileError::ImmutableRow { row, state });
        }
        self.projection
            .uid_at(row)
            .ok_or(ReconcileError::MissingUid { row })
    }
}

/// Projection actor that serializes all local mutation.
pub struct ProjectionActor;

impl Actor for ProjectionActor {
    type Msg = ProjectionMessage;
    type State = ProjectionState;
    type Arguments = ProjectionArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting projection actor for {}", args.server.endpoint());
        Ok(ProjectionState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ProjectionMessage::ApplySnapshot { snapshot } => {
                if state.in_flight > 0 {
                    tracing::debug!("Deferring snapshot, {} operations in flight", state.in_flight);
                    state.deferred = Some(*snapshot);
                    state.broadcast(MonitorEvent::SnapshotDeferred {
                        in_flight: state.in_flight,
                        timestamp: Utc::now(),
                    });
                } else {
                    state.apply_snapshot(*snapshot);
                }
                state.load_catalog(&myself);
            }

            ProjectionMessage::ApplyEdit {
                row,
                column_id,
                text,
                reply,
            } => {
                let uid = match state.projection.mutable_row(row) {
                    Ok((_, uid)) => uid,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        return Ok(());
                    }
                };

                if !state.catalog.is_loaded() {
                    state.load_catalog(&myself);
                    if state.catalog.is_loading() {
                        tracing::debug!("Edit of {} waits for plan definitions", uid);
                        let edit = QueuedEdit {
                            column_id,
                            text,
                            reply,
                        };
                        state.catalog_waiters.push_back((uid, edit));
                        return Ok(());
                    }
                }
                state.submit_edit(&myself, uid, column_id, text, reply);
            }

            ProjectionMessage::CatalogLoaded {
                generation,
                fetched,
            } => {
                if !state.catalog.finish_load(generation, fetched) {
                    tracing::debug!("Dropping plan definitions from a replaced server");
                    return Ok(());
                }
                if state.catalog.is_loaded() {
                    state.broadcast(MonitorEvent::ParametersLoaded {
                        plans: state.catalog.len(),
                        timestamp: Utc::now(),
                    });
                }
                // On failure the waiting edits go ahead untyped.
                while let Some((uid, edit)) = state.catalog_waiters.pop_front() {
                    state.submit_edit(&myself, uid, edit.column_id, edit.text, edit.reply);
                }
            }

            ProjectionMessage::EditResolved {
                uid,
                key,
                previous,
                outcome,
                reply,
            } => {
                state.in_flight = state.in_flight.saturating_sub(1);
                state.editing.remove(&uid);

                match outcome {
                    Ok(message) => {
                        tracing::info!("Item {} '{}' updated", uid, key);
                        state.broadcast(MonitorEvent::EditCommitted {
                            uid: uid.clone(),
                            key,
                            message: message.clone(),
                            timestamp: Utc::now(),
                        });
                        let _ = reply.send(Ok(message));
                        if state.deferred.take().is_some() {
                            tracing::debug!("Dropping snapshot taken before the commit");
                        }
                        state.poll_now();
                    }
                    Err(e) => {
                        tracing::warn!("Rolling back edit of {} '{}': {}", uid, key, e);
                        state.projection.restore_entry(&uid, *previous);
                        state.broadcast(MonitorEvent::EditRolledBack {
                            uid: uid.clone(),
                            key,
                            reason: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        let _ = reply.send(Err(e));
                    }
                }

                state.dispatch_queued(&myself, &uid);
                state.flush_deferred();
            }

            ProjectionMessage::BeginDrag { row, reply } => {
                let _ = reply.send(state.projection.begin_drag(row).map_err(Into::into));
            }

            ProjectionMessage::ProposeMove {
                intent,
                target_row,
                reply,
            } => {
                if !state.projection.drag_enabled() {
                    let _ = reply.send(Err(ReconcileError::DragDisabled));
                    return Ok(());
                }
                if state.projection.pending_position(&intent.uid).is_none() {
                    let _ = reply.send(Err(ReconcileError::UnknownItem(intent.uid)));
                    return Ok(());
                }
                let Some(destination) = state.projection.clamp_destination(target_row) else {
                    let _ = reply.send(Err(ReconcileError::DragDisabled));
                    return Ok(());
                };

                state.in_flight += 1;
                let server = state.server.clone();
                let timeout = state.remote_timeout;
                let myself = myself.clone();
                let uid = intent.uid;
                tokio::spawn(async move {
                    let outcome = remote_call(timeout, server.move_item(uid.clone(), destination))
                        .await
                        .and_then(|response| response.into_result().map_err(ReconcileError::from));
                    let _ = myself.send_message(ProjectionMessage::MoveResolved {
                        uid,
                        destination,
                        outcome,
                        reply,
                    });
                });
            }

            ProjectionMessage::MoveResolved {
                uid,
                destination,
                outcome,
                reply,
            } => {
                state.in_flight = state.in_flight.saturating_sub(1);

                match outcome {
                    Ok(_) => {
                        state.projection.move_pending(&uid, destination);
                        tracing::info!("Item {} moved to {}", uid, destination);
                        state.broadcast(MonitorEvent::MoveCommitted {
                            uid,
                            destination,
                            timestamp: Utc::now(),
                        });
                        let _ = reply.send(Ok(destination));
                        if state.deferred.take().is_some() {
                            tracing::debug!("Dropping snapshot taken before the move");
                        }
                        state.poll_now();
                    }
                    Err(e) => {
                        tracing::warn!("Move of {} rejected: {}", uid, e);
                        state.broadcast(MonitorEvent::MoveRejected {
                            uid,
                            reason: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        let _ = reply.send(Err(e));
                    }
                }

                state.flush_deferred();
            }

            ProjectionMessage::Command { command, reply } => {
                let name = command.name();
                let remote = match state.resolve_command(&command) {
                    Ok(remote) => remote,
                    Err(e) => {
                        state.broadcast(MonitorEvent::CommandFailed {
                            command: name.to_string(),
                            error: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                        return Ok(());
                    }
                };

                let server = state.server.clone();
                let timeout = state.remote_timeout;
                let event_tx = state.event_tx.clone();
                let poller = state.poller.clone();
                tokio::spawn(async move {
                    let outcome = remote_call(timeout, remote.run(server.as_ref())).await;
                    let event = match &outcome {
                        Ok(message) => MonitorEvent::CommandCompleted {
                            command: name.to_string(),
                            message: message.clone(),
                            timestamp: Utc::now(),
                        },
                        Err(e) => {
                            tracing::warn!("{} failed: {}", name, e);
                            MonitorEvent::CommandFailed {
                                command: name.to_string(),
                                error: e.to_string(),
                                timestamp: Utc::now(),
                            }
                        }
                    };
                    let _ = event_tx.send(event);
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                    if let Some(poller) = poller {
                        let _ = poller.send_message(PollerMessage::PollNow);
                    }
                });
            }

            ProjectionMessage::GetTable { reply } => {
                state.load_catalog(&myself);
                let params = state.visible_params();
                let mut table = state
                    .projection
                    .table(state.schema.columns(), &state.aliases, &params);
                table.parameters_loaded = state.catalog.is_loaded();
                let _ = reply.send(table);
            }

            ProjectionMessage::InFlight { reply } => {
                let _ = reply.send(state.in_flight);
            }

            ProjectionMessage::ReplaceServer { server } => {
                tracing::info!("Projection now talking to {}", server.endpoint());
                state.server = server;
                state.catalog.invalidate();
                if !state.catalog_waiters.is_empty() {
                    state.load_catalog(&myself);
                }
            }

            ProjectionMessage::AttachPoller { poller } => {
                state.poller = Some(poller);
            }

            ProjectionMessage::Shutdown => {
                tracing::info!("Shutting down projection actor");
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }
}
