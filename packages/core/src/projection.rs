//! The local projection of the remote queue.
//!
//! Rows are laid out as `[running?] + pending + completed`. Only pending rows
//! can be edited or reordered; the running and completed rows mirror whatever
//! the last snapshot said.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::columns::{AliasMap, ColumnSpec};
use crate::record::QueueRecord;
use crate::resolver::display_value;

/// Position-derived classification of a visible row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    Running,
    Pending,
    Completed,
}

impl RowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowState::Running => "running",
            RowState::Pending => "pending",
            RowState::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-addressing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("Row {row} is out of range ({rows} rows)")]
    OutOfRange { row: usize, rows: usize },

    #[error("Row {row} is {state} and cannot be changed")]
    Immutable { row: usize, state: RowState },

    #[error("Row {row} has no uid")]
    MissingUid { row: usize },

    #[error("Reordering needs at least two pending items, all with uids")]
    DragDisabled,
}

/// One poll's worth of queue state, oldest-first history as delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: Vec<QueueRecord>,
    pub running: Option<QueueRecord>,
    pub completed: Vec<QueueRecord>,
}

impl QueueSnapshot {
    pub fn new(
        pending: Vec<QueueRecord>,
        running: Option<QueueRecord>,
        completed: Vec<QueueRecord>,
    ) -> Self {
        Self {
            pending,
            running,
            completed,
        }
    }

    /// Build a snapshot from raw server values. An empty or non-object
    /// running item means nothing is running.
    pub fn from_raw(pending: Vec<Value>, running: Option<Value>, completed: Vec<Value>) -> Self {
        let running = running
            .filter(|value| value.as_object().is_some_and(|map| !map.is_empty()))
            .map(QueueRecord::from_value);
        Self {
            pending: pending.into_iter().map(QueueRecord::from_value).collect(),
            running,
            completed: completed.into_iter().map(QueueRecord::from_value).collect(),
        }
    }
}

/// A pending item: the record as received plus its display form.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub raw: QueueRecord,
    pub display: QueueRecord,
}

impl PendingEntry {
    pub fn new(raw: QueueRecord) -> Self {
        let display = raw.normalized(false);
        Self { raw, display }
    }

    pub fn uid(&self) -> Option<String> {
        self.raw.uid()
    }

    /// Recompute the display form after `raw` was mutated.
    pub fn refresh_display(&mut self) {
        self.display = self.raw.normalized(false);
    }
}

/// Drag state captured when a drag starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DragIntent {
    pub uid: String,
    pub source: usize,
}

/// A rendered cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellView {
    pub column_id: String,
    pub text: String,
    /// Record key an edit of this cell writes to.
    pub key: String,
    /// Set when `key` is a declared parameter of the row's plan.
    pub bound_key: Option<String>,
    pub editable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowView {
    pub uid: Option<String>,
    pub state: RowState,
    pub cells: Vec<CellView>,
}

/// Everything a front end needs to draw the queue table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableView {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<RowView>,
    pub drag_enabled: bool,
    /// Plan definitions were known when this was rendered. Until then no cell
    /// is bound to a declared parameter.
    #[serde(default)]
    pub parameters_loaded: bool,
}

impl TableView {
    pub fn cell(&self, row: usize, column_id: &str) -> Option<&CellView> {
        self.rows
            .get(row)?
            .cells
            .iter()
            .find(|cell| cell.column_id == column_id)
    }
}

/// Pending, running and completed records with local mutation rights over the
/// pending list.
#[derive(Debug, Clone, Default)]
pub struct QueueProjection {
    pending: Vec<PendingEntry>,
    running: Option<QueueRecord>,
    completed: Vec<QueueRecord>,
}

impl QueueProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all three record sets.
    ///
    /// History arrives oldest-first and is stored newest-first. Records that
    /// share the running item's uid are dropped from the other sets.
    pub fn apply_snapshot(&mut self, snapshot: QueueSnapshot) {
        let running_uid = snapshot.running.as_ref().and_then(QueueRecord::uid);
        let not_running =
            |record: &QueueRecord| running_uid.is_none() || record.uid() != running_uid;

        self.pending = snapshot
            .pending
            .into_iter()
            .filter(not_running)
            .map(PendingEntry::new)
            .collect();
        self.running = snapshot.running.map(|record| record.normalized(false));
        self.completed = snapshot
            .completed
            .iter()
            .rev()
            .filter(|record| not_running(record))
            .map(|record| record.normalized(true))
            .collect();
    }

    pub fn pending(&self) -> &[PendingEntry] {
        &self.pending
    }

    pub fn running(&self) -> Option<&QueueRecord> {
        self.running.as_ref()
    }

    pub fn completed(&self) -> &[QueueRecord] {
        &self.completed
    }

    /// Display records in row order.
    pub fn visible_rows(&self) -> Vec<&QueueRecord> {
        self.running
            .iter()
            .chain(self.pending.iter().map(|entry| &entry.display))
            .chain(self.completed.iter())
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.running_offset() + self.pending.len() + self.completed.len()
    }

    fn running_offset(&self) -> usize {
        usize::from(self.running.is_some())
    }

    pub fn row_state(&self, row: usize) -> Option<RowState> {
        let offset = self.running_offset();
        if row < offset {
            Some(RowState::Running)
        } else if row < offset + self.pending.len() {
            Some(RowState::Pending)
        } else if row < self.row_count() {
            Some(RowState::Completed)
        } else {
            None
        }
    }

    /// Index into the pending list of a visible pending row.
    pub fn pending_index(&self, row: usize) -> Option<usize> {
        match self.row_state(row)? {
            RowState::Pending => Some(row - self.running_offset()),
            _ => None,
        }
    }

    /// Check that `row` is an editable pending row and return its pending
    /// index and uid.
    pub fn mutable_row(&self, row: usize) -> Result<(usize, String), RowError> {
        let state = self.row_state(row).ok_or(RowError::OutOfRange {
            row,
            rows: self.row_count(),
        })?;
        let index = self
            .pending_index(row)
            .ok_or(RowError::Immutable { row, state })?;
        let uid = self.pending[index]
            .uid()
            .ok_or(RowError::MissingUid { row })?;
        Ok((index, uid))
    }

    /// The raw record of a visible row; pending rows yield the record as
    /// received, the others their display form.
    pub fn raw_at(&self, row: usize) -> Option<&QueueRecord> {
        match self.row_state(row)? {
            RowState::Running => self.running.as_ref(),
            RowState::Pending => Some(&self.pending[row - self.running_offset()].raw),
            RowState::Completed => self
                .completed
                .get(row - self.running_offset() - self.pending.len()),
        }
    }

    pub fn uid_at(&self, row: usize) -> Option<String> {
        self.raw_at(row).and_then(QueueRecord::uid)
    }

    /// Visible row of the record with `uid`.
    pub fn row_of(&self, uid: &str) -> Option<usize> {
        self.visible_rows()
            .iter()
            .position(|record| record.uid().as_deref() == Some(uid))
    }

    /// Position of `uid` in the pending list.
    pub fn pending_position(&self, uid: &str) -> Option<usize> {
        self.pending
            .iter()
            .position(|entry| entry.uid().as_deref() == Some(uid))
    }

    pub fn pending_entry(&self, index: usize) -> Option<&PendingEntry> {
        self.pending.get(index)
    }

    pub fn pending_entry_mut(&mut self, index: usize) -> Option<&mut PendingEntry> {
        self.pending.get_mut(index)
    }

    /// Put a saved entry back in place of the pending item with the same uid.
    pub fn restore_entry(&mut self, uid: &str, entry: PendingEntry) -> bool {
        match self.pending_position(uid) {
            Some(index) => {
                self.pending[index] = entry;
                true
            }
            None => false,
        }
    }

    pub fn drag_enabled(&self) -> bool {
        self.pending.len() > 1 && self.pending.iter().all(|entry| entry.uid().is_some())
    }

    pub fn begin_drag(&self, row: usize) -> Result<DragIntent, RowError> {
        if !self.drag_enabled() {
            return Err(RowError::DragDisabled);
        }
        let (source, uid) = self.mutable_row(row)?;
        Ok(DragIntent { uid, source })
    }

    /// Pending position for a drop on visible row `target_row`, clamped to the
    /// pending range.
    pub fn clamp_destination(&self, target_row: usize) -> Option<usize> {
        let last = self.pending.len().checked_sub(1)?;
        Some(target_row.saturating_sub(self.running_offset()).min(last))
    }

    /// Move the pending item `uid` so that it ends up at `destination`.
    pub fn move_pending(&mut self, uid: &str, destination: usize) -> bool {
        let Some(source) = self.pending_position(uid) else {
            return false;
        };
        let destination = destination.min(self.pending.len() - 1);
        let entry = self.pending.remove(source);
        self.pending.insert(destination, entry);
        true
    }

    /// Display record of a visible row.
    pub fn display_at(&self, row: usize) -> Option<&QueueRecord> {
        match self.row_state(row)? {
            RowState::Running => self.running.as_ref(),
            RowState::Pending => Some(&self.pending[row - self.running_offset()].display),
            RowState::Completed => self
                .completed
                .get(row - self.running_offset() - self.pending.len()),
        }
    }

    /// Render a single row.
    pub fn row_view(
        &self,
        row: usize,
        columns: &[ColumnSpec],
        aliases: &AliasMap,
        params: &HashMap<String, HashSet<String>>,
    ) -> Option<RowView> {
        let state = self.row_state(row)?;
        let record = self.display_at(row)?;
        Some(self.render_row(row, state, record, columns, aliases, params))
    }

    fn render_row(
        &self,
        row: usize,
        state: RowState,
        record: &QueueRecord,
        columns: &[ColumnSpec],
        aliases: &AliasMap,
        params: &HashMap<String, HashSet<String>>,
    ) -> RowView {
        let empty = HashSet::new();
        let available = params.get(&record.plan_name()).unwrap_or(&empty);

        let cells = columns
            .iter()
            .map(|column| {
                let cell = display_value(&column.id, record, row, state, aliases, available);
                let key = cell.source_key.unwrap_or_else(|| column.id.clone());
                CellView {
                    column_id: column.id.clone(),
                    text: cell.text,
                    bound_key: available.contains(&key).then(|| key.clone()),
                    key,
                    editable: state == RowState::Pending,
                }
            })
            .collect();

        RowView {
            uid: self.uid_at(row),
            state,
            cells,
        }
    }

    /// `(key, text)` of every cell in a row, keyed by the key an edit writes.
    pub fn row_values(
        &self,
        row: usize,
        columns: &[ColumnSpec],
        aliases: &AliasMap,
        params: &HashMap<String, HashSet<String>>,
    ) -> Vec<(String, String)> {
        self.row_view(row, columns, aliases, params)
            .map(|view| view.cells.into_iter().map(|cell| (cell.key, cell.text)).collect())
            .unwrap_or_default()
    }

    /// Render the whole table. `params` maps plan names to their declared
    /// parameter names.
    pub fn table(
        &self,
        columns: &[ColumnSpec],
        aliases: &AliasMap,
        params: &HashMap<String, HashSet<String>>,
    ) -> TableView {
        let running = self.running.iter().map(|record| (RowState::Running, record));
        let pending = self
            .pending
            .iter()
            .map(|entry| (RowState::Pending, &entry.display));
        let completed = self
            .completed
            .iter()
            .map(|record| (RowState::Completed, record));
        let rows = running
            .chain(pending)
            .chain(completed)
            .enumerate()
            .map(|(row, (state, record))| {
                self.render_row(row, state, record, columns, aliases, params)
            })
            .collect();
        TableView {
            columns: columns.to_vec(),
            rows,
            drag_enabled: self.drag_enabled(),
            parameters_loaded: false,
        }
    }
}
