//! Core model for the queue monitor.
//!
//! This crate contains the client-side view of a remote plan queue:
//! - `QueueRecord` and the resolver that finds fields in loosely shaped records
//! - `ColumnSchema` for stable, append-only column discovery
//! - `PlanDefinition`/`PlanParameter` for type-directed coercion of edited text
//! - `QueueProjection` holding pending, running and completed records
//! - Events for real-time updates

mod columns;
mod edit;
mod events;
mod parameter;
mod projection;
mod record;
mod resolver;
mod status;

pub use columns::{AliasMap, ColumnSchema, ColumnSpec, alias_label, column_label};
pub use edit::{EditContext, PayloadError, apply_item_edit, build_update_payload};
pub use events::MonitorEvent;
pub use parameter::{CoercionError, ParamType, PlanDefinition, PlanKind, PlanParameter};
pub use projection::{
    CellView, DragIntent, PendingEntry, QueueProjection, QueueSnapshot, RowError, RowState,
    RowView, TableView,
};
pub use record::{QueueRecord, format_mapping, format_scalar, format_sequence};
pub use resolver::{AliasMatch, DisplayCell, display_value, lookup_alias_value, resolve};
pub use status::{QueueActions, ServerStatus};
