//! In-process queue server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use queue_core::{PlanDefinition, PlanKind, PlanParameter, QueueRecord, ServerStatus};
use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore};
use ulid::Ulid;

use crate::http::copies_of;
use crate::{
    CommandResponse, HistoryListing, QueueListing, QueueServer, RemoteError, RemoteFuture,
};

/// A failure the next matching call will produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Answer the next update with `success: false`.
    RejectUpdate(String),
    /// Fail the next update at the transport level.
    DropUpdate,
    /// Answer the next move with `success: false`.
    RejectMove(String),
    /// Fail the next move at the transport level.
    DropMove,
    /// Fail the next queue fetch at the transport level.
    DropFetch,
    /// Never answer the next plan definition request.
    StallDefinitions,
}

#[derive(Debug, Default)]
struct ServerState {
    pending: Vec<Value>,
    running: Option<Value>,
    history: Vec<Value>,
    definitions: Vec<PlanDefinition>,
    stop_pending: bool,
    failures: VecDeque<ScriptedFailure>,
    updates: Vec<Value>,
}

impl ServerState {
    fn take_failure(&mut self, matches: impl Fn(&ScriptedFailure) -> bool) -> Option<ScriptedFailure> {
        let index = self.failures.iter().position(matches)?;
        self.failures.remove(index)
    }

    fn position(&self, uid: &str) -> Option<usize> {
        self.pending.iter().position(|item| uid_of(item).as_deref() == Some(uid))
    }
}

fn uid_of(item: &Value) -> Option<String> {
    QueueRecord::from_value(item.clone()).uid()
}

fn with_fresh_uid(item: Value) -> Value {
    match item {
        Value::Object(mut map) => {
            map.insert("item_uid".to_string(), Value::String(Ulid::new().to_string()));
            Value::Object(map)
        }
        other => other,
    }
}

/// A queue server living in process memory.
///
/// Behaves like the real server for the calls the monitor makes, assigns
/// ULIDs to new items, and can be scripted to reject or drop calls. Updates
/// and moves can also be held until released, to observe in-flight state.
#[derive(Debug)]
pub struct MemoryQueueServer {
    state: Mutex<ServerState>,
    hold: AtomicBool,
    gate: Semaphore,
}

impl Default for MemoryQueueServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            hold: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    /// A server preloaded with a few scans, for the demo mode.
    pub fn demo() -> Self {
        let fly_scan = PlanDefinition::new("fly_scan", PlanKind::Plan)
            .with_parameter(PlanParameter::new("detectors").with_type_name("list").with_required(true))
            .with_parameter(PlanParameter::new("roi_width").with_default(json!(10.0)))
            .with_parameter(PlanParameter::new("roi_height").with_default(json!(10.0)))
            .with_parameter(PlanParameter::new("dwell").with_type_name("float").with_default(json!(0.1)))
            .with_parameter(PlanParameter::new("title").with_type_name("str"));
        let count = PlanDefinition::new("count", PlanKind::Plan)
            .with_parameter(PlanParameter::new("detectors").with_type_name("list").with_required(true))
            .with_parameter(PlanParameter::new("num").with_default(json!(1)))
            .with_parameter(PlanParameter::new("delay").with_type_name("float").with_default(json!(0.0)));

        Self::new()
            .with_definition(fly_scan)
            .with_definition(count)
            .with_pending(vec![
                json!({"item_type": "plan", "name": "fly_scan", "args": [],
                       "kwargs": {"detectors": ["xspress3"], "roi_width": 20.0, "dwell": 0.05, "title": "Overview"}}),
                json!({"item_type": "plan", "name": "fly_scan", "args": [],
                       "kwargs": {"detectors": ["xspress3"], "roi_width": 5.0, "roi_height": 5.0, "dwell": 0.2}}),
                json!({"item_type": "plan", "name": "count", "args": [],
                       "kwargs": {"detectors": ["det1"], "num": 5}}),
            ])
            .with_history(vec![json!({
                "item_type": "plan",
                "name": "count",
                "kwargs": {"detectors": ["det1"], "num": 1},
                "result": {"exit_status": "completed", "scan_ids": [101]}
            })])
    }

    /// Append items to the queue, assigning uids to items without one.
    pub fn with_pending(mut self, items: Vec<Value>) -> Self {
        let state = self.state.get_mut();
        state.pending.extend(items.into_iter().map(|item| match uid_of(&item) {
            Some(_) => item,
            None => with_fresh_uid(item),
        }));
        self
    }

    /// Append items to the history, oldest first.
    pub fn with_history(mut self, items: Vec<Value>) -> Self {
        let state = self.state.get_mut();
        state.history.extend(items.into_iter().map(|item| match uid_of(&item) {
            Some(_) => item,
            None => with_fresh_uid(item),
        }));
        self
    }

    pub fn with_running(mut self, item: Value) -> Self {
        self.state.get_mut().running = Some(item);
        self
    }

    pub fn with_definition(mut self, definition: PlanDefinition) -> Self {
        self.state.get_mut().definitions.push(definition);
        self
    }

    /// Queue a failure for the next matching call.
    pub async fn fail_next(&self, failure: ScriptedFailure) {
        self.state.lock().await.failures.push_back(failure);
    }

    /// Make updates and moves wait until [`release`](Self::release) is called.
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    /// Let `calls` held updates or moves through.
    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    /// Stop holding calls; already waiting calls still need a release.
    pub fn unhold(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    pub async fn pending_items(&self) -> Vec<Value> {
        self.state.lock().await.pending.clone()
    }

    pub async fn pending_uids(&self) -> Vec<String> {
        self.state.lock().await.pending.iter().filter_map(uid_of).collect()
    }

    /// Every update payload received, in arrival order.
    pub async fn received_updates(&self) -> Vec<Value> {
        self.state.lock().await.updates.clone()
    }

    /// Replace a queued item as if another client edited it.
    pub async fn replace_pending(&self, index: usize, item: Value) {
        if let Some(slot) = self.state.lock().await.pending.get_mut(index) {
            *slot = item;
        }
    }

    /// Finish the running item, moving it to history. When the queue is still
    /// running the next pending item starts.
    pub async fn complete_running(&self, exit_status: &str) {
        let mut state = self.state.lock().await;
        let Some(Value::Object(mut finished)) = state.running.take() else {
            return;
        };
        finished.insert("result".to_string(), json!({"exit_status": exit_status}));
        state.history.push(Value::Object(finished));
        if state.stop_pending {
            state.stop_pending = false;
        } else if !state.pending.is_empty() {
            let next = state.pending.remove(0);
            state.running = Some(next);
        }
    }

    async fn wait_for_gate(&self) {
        if self.hold.load(Ordering::SeqCst)
            && let Ok(permit) = self.gate.acquire().await
        {
            permit.forget();
        }
    }
}

impl QueueServer for MemoryQueueServer {
    fn endpoint(&self) -> &str {
        "memory://"
    }

    fn status(&self) -> RemoteFuture<'_, ServerStatus> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let running = state.running.is_some();
            Ok(ServerStatus {
                manager_state: if running { "executing_queue" } else { "idle" }.to_string(),
                re_state: Some(if running { "running" } else { "idle" }.to_string()),
                items_in_queue: state.pending.len() as u64,
                items_in_history: state.history.len() as u64,
                running_item_uid: state.running.as_ref().and_then(uid_of),
                queue_stop_pending: state.stop_pending,
                worker_environment_exists: true,
            })
        })
    }

    fn fetch_queue(&self) -> RemoteFuture<'_, QueueListing> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state
                .take_failure(|f| *f == ScriptedFailure::DropFetch)
                .is_some()
            {
                return Err(RemoteError::Transport("connection reset".to_string()));
            }
            Ok(QueueListing {
                items: state.pending.clone(),
                running_item: Some(state.running.clone().unwrap_or_else(|| json!({}))),
            })
        })
    }

    fn fetch_history(&self) -> RemoteFuture<'_, HistoryListing> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(HistoryListing {
                items: state.history.clone(),
            })
        })
    }

    fn update_item(&self, item: Value, replace: bool) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(async move {
            self.wait_for_gate().await;
            let mut state = self.state.lock().await;
            state.updates.push(item.clone());

            match state.take_failure(|f| {
                matches!(f, ScriptedFailure::RejectUpdate(_) | ScriptedFailure::DropUpdate)
            }) {
                Some(ScriptedFailure::RejectUpdate(msg)) => return Ok(CommandResponse::rejected(msg)),
                Some(_) => return Err(RemoteError::Transport("connection reset".to_string())),
                None => {}
            }

            let Some(uid) = uid_of(&item) else {
                return Ok(CommandResponse::rejected("Item has no uid"));
            };
            let Some(index) = state.position(&uid) else {
                return Ok(CommandResponse::rejected(format!("Item {} is not in the queue", uid)));
            };
            state.pending[index] = if replace { with_fresh_uid(item) } else { item };
            Ok(CommandResponse::accepted("Item updated"))
        })
    }

    fn move_item(&self, uid: String, destination: usize) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(async move {
            self.wait_for_gate().await;
            let mut state = self.state.lock().await;

            match state.take_failure(|f| {
                matches!(f, ScriptedFailure::RejectMove(_) | ScriptedFailure::DropMove)
            }) {
                Some(ScriptedFailure::RejectMove(msg)) => return Ok(CommandResponse::rejected(msg)),
                Some(_) => return Err(RemoteError::Transport("connection reset".to_string())),
                None => {}
            }

            let Some(source) = state.position(&uid) else {
                return Ok(CommandResponse::rejected(format!("Item {} is not in the queue", uid)));
            };
            if destination >= state.pending.len() {
                return Ok(CommandResponse::rejected(format!(
                    "Destination {} is out of range",
                    destination
                )));
            }
            let item = state.pending.remove(source);
            state.pending.insert(destination, item);
            Ok(CommandResponse::accepted("Item moved"))
        })
    }

    fn remove_items(&self, uids: Vec<String>) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state
                .pending
                .retain(|item| !uid_of(item).is_some_and(|uid| uids.contains(&uid)));
            Ok(())
        })
    }

    fn duplicate_items(&self, uids: Vec<String>) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let copies: Vec<Value> = copies_of(
                &uids,
                state
                    .pending
                    .iter()
                    .chain(state.running.iter())
                    .chain(state.history.iter()),
            )
            .into_iter()
            .map(with_fresh_uid)
            .collect();
            state.pending.splice(0..0, copies);
            Ok(())
        })
    }

    fn clear_queue(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.pending.clear();
            Ok(())
        })
    }

    fn clear_history(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.history.clear();
            Ok(())
        })
    }

    fn start_queue(&self) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.running.is_some() {
                return Ok(CommandResponse::rejected("Queue is already running"));
            }
            if state.pending.is_empty() {
                return Ok(CommandResponse::rejected("Queue is empty"));
            }
            let next = state.pending.remove(0);
            state.running = Some(next);
            Ok(CommandResponse::accepted("Queue started"))
        })
    }

    fn stop_queue(&self) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.running.is_none() {
                return Ok(CommandResponse::rejected("Queue is not running"));
            }
            state.stop_pending = true;
            Ok(CommandResponse::accepted("Queue will stop after the current item"))
        })
    }

    fn allowed_definitions(&self, kind: PlanKind) -> RemoteFuture<'_, Vec<PlanDefinition>> {
        Box::pin(async move {
            let stalled = self
                .state
                .lock()
                .await
                .take_failure(|f| *f == ScriptedFailure::StallDefinitions)
                .is_some();
            if stalled {
                std::future::pending::<()>().await;
            }
            let state = self.state.lock().await;
            Ok(state
                .definitions
                .iter()
                .filter(|definition| definition.kind == kind)
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    fn server() -> MemoryQueueServer {
        MemoryQueueServer::new().with_pending(vec![
            json!({"item_uid": "A", "name": "count"}),
            json!({"item_uid": "B", "name": "count"}),
            json!({"item_uid": "C", "name": "count"}),
        ])
    }

    #[tokio::test]
    async fn move_places_item_at_destination() {
        let server = server();
        let response = server.move_item("A".to_string(), 2).await.unwrap();
        assert!(response.success);
        assert_eq!(server.pending_uids().await, ["B", "C", "A"]);

        let response = server.move_item("A".to_string(), 3).await.unwrap();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn scripted_failures_apply_once() {
        let server = server();
        server.fail_next(ScriptedFailure::RejectUpdate("busy".to_string())).await;
        let item = json!({"item_uid": "A", "name": "count", "kwargs": {"num": 3}});

        let first = server.update_item(item.clone(), false).await.unwrap();
        assert_eq!(first, CommandResponse::rejected("busy"));
        let second = server.update_item(item.clone(), false).await.unwrap();
        assert!(second.success);
        assert_eq!(server.pending_items().await[0], item);
        assert_eq!(server.received_updates().await.len(), 2);
    }

    #[tokio::test]
    async fn duplicates_go_to_the_front_with_new_uids() {
        let server = server();
        server.duplicate_items(vec!["C".to_string()]).await.unwrap();
        let uids = server.pending_uids().await;
        assert_eq!(uids.len(), 4);
        assert_ne!(uids[0], "C");
        assert_eq!(&uids[1..], ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn start_and_complete_advance_the_queue() {
        let server = server();
        assert!(server.start_queue().await.unwrap().success);
        assert!(server.status().await.unwrap().queue_running());
        server.complete_running("completed").await;
        let queue = server.fetch_queue().await.unwrap();
        assert_eq!(queue.items.len(), 1);
        assert_eq!(server.fetch_history().await.unwrap().items.len(), 1);
        assert!(server.stop_queue().await.unwrap().success);
        server.complete_running("completed").await;
        assert!(!server.status().await.unwrap().queue_running());
    }
}
