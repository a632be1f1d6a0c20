//! Remote queue server access.
//!
//! [`QueueServer`] is the seam between the monitor and the queue server. Two
//! implementations are provided:
//!
//! - [`HttpQueueServer`] talks to the queue server's REST gateway
//! - [`MemoryQueueServer`] keeps a queue in memory, for tests and demos

mod http;
mod memory;

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

use queue_core::{PlanDefinition, PlanKind, ServerStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::HttpQueueServer;
pub use memory::{MemoryQueueServer, ScriptedFailure};

/// Errors from the remote queue server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Future type for remote calls.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = RemoteResult<T>> + Send + 'a>>;

/// Pending items and the running item, as returned by `queue/get`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueListing {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub running_item: Option<Value>,
}

/// Completed items, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryListing {
    #[serde(default)]
    pub items: Vec<Value>,
}

/// The `{success, msg}` envelope most queue server calls answer with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub msg: String,
}

impl CommandResponse {
    pub fn accepted(msg: impl Into<String>) -> Self {
        Self {
            success: true,
            msg: msg.into(),
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: msg.into(),
        }
    }

    /// `Ok(msg)` when the server accepted the call, `Rejected` otherwise.
    pub fn into_result(self) -> RemoteResult<String> {
        if self.success {
            Ok(self.msg)
        } else {
            Err(RemoteError::Rejected(self.msg))
        }
    }
}

/// Operations the monitor needs from a queue server.
pub trait QueueServer: Debug + Send + Sync + 'static {
    /// Short label for logs.
    fn endpoint(&self) -> &str;

    fn status(&self) -> RemoteFuture<'_, ServerStatus>;

    fn fetch_queue(&self) -> RemoteFuture<'_, QueueListing>;

    fn fetch_history(&self) -> RemoteFuture<'_, HistoryListing>;

    /// Update a queued item in place. `item` must carry its `item_uid`.
    fn update_item(&self, item: Value, replace: bool) -> RemoteFuture<'_, CommandResponse>;

    /// Move an item to `destination` in the queue.
    fn move_item(&self, uid: String, destination: usize) -> RemoteFuture<'_, CommandResponse>;

    fn remove_items(&self, uids: Vec<String>) -> RemoteFuture<'_, ()>;

    /// Copy items from the queue or history back to the front of the queue.
    fn duplicate_items(&self, uids: Vec<String>) -> RemoteFuture<'_, ()>;

    fn clear_queue(&self) -> RemoteFuture<'_, ()>;

    fn clear_history(&self) -> RemoteFuture<'_, ()>;

    fn start_queue(&self) -> RemoteFuture<'_, CommandResponse>;

    fn stop_queue(&self) -> RemoteFuture<'_, CommandResponse>;

    /// Plans (or instructions) the server allows, with their parameters.
    fn allowed_definitions(&self, kind: PlanKind) -> RemoteFuture<'_, Vec<PlanDefinition>>;
}
