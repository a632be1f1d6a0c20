//! Actor system for the queue monitor.
//!
//! This crate keeps a local projection of a remote queue server's queue in
//! sync and reconciles local edits and reorders with the server.
//!
//! # Architecture
//!
//! - `Supervisor` - Starts the children and swaps servers on reconnect
//! - `ProjectionActor` - Owns the projection, applies edits and moves
//! - `PollerActor` - Fetches status, queue and history on an interval
//!
//! # Usage
//!
//! ```ignore
//! use actors::{MonitorConfig, start_monitor};
//!
//! let (monitor, _join) = start_monitor(MonitorConfig::default(), server).await?;
//! let table = monitor.table().await?;
//! monitor.edit(0, "dwell", "2.5").await?;
//! ```

mod catalog;
mod config;
mod error;
mod handle;
mod messages;
mod poller;
mod projection_actor;
pub mod registry;
mod supervisor;

pub use catalog::ParameterCatalog;
pub use config::{
    ConfigError, ENV_API_KEY, ENV_POLL_INTERVAL_MS, ENV_REMOTE_TIMEOUT_MS, ENV_SERVER_URL,
    MonitorConfig,
};
pub use error::ReconcileError;
pub use handle::{MonitorHandle, start_monitor};
pub use messages::{PollerMessage, ProjectionMessage, QueueCommand, SupervisorMessage};
pub use poller::PollerActor;
pub use projection_actor::ProjectionActor;
pub use registry::{MonitorRegistry, global_registry};
pub use supervisor::Supervisor;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
