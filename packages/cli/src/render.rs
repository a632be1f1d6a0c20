//! Plain-text rendering of the queue table.

use queue_core::{RowState, TableView};

/// Cells longer than this are cut.
const MAX_CELL_WIDTH: usize = 32;

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_WIDTH {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(MAX_CELL_WIDTH - 3).collect();
    clipped.push_str("...");
    clipped
}

fn state_label(state: RowState) -> &'static str {
    match state {
        RowState::Running => "running",
        RowState::Pending => "queued",
        RowState::Completed => "done",
    }
}

/// Render the table with a header, one line per row.
pub fn render_table(table: &TableView) -> String {
    let mut header = vec!["Row".to_string(), "State".to_string()];
    header.extend(table.columns.iter().map(|column| column.label.clone()));

    let lines: Vec<Vec<String>> = table
        .rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let mut line = vec![index.to_string(), state_label(row.state).to_string()];
            line.extend(table.columns.iter().map(|column| {
                row.cells
                    .iter()
                    .find(|cell| cell.column_id == column.id)
                    .map(|cell| clip(&cell.text))
                    .unwrap_or_default()
            }));
            line
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for line in &lines {
        for (width, cell) in widths.iter_mut().zip(line) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let format_line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = format_line(&header);
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|width| "-".repeat(*width))
            .collect::<Vec<_>>()
            .join("  "),
    );
    out.push('\n');
    for line in &lines {
        out.push_str(&format_line(line));
        out.push('\n');
    }
    if table.rows.is_empty() {
        out.push_str("(queue and history are empty)\n");
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use std::collections::HashMap;

    use super::*;
    use queue_core::{AliasMap, ColumnSchema, QueueProjection, QueueSnapshot};
    use serde_json::json;

    fn table() -> TableView {
        let mut projection = QueueProjection::new();
        projection.apply_snapshot(QueueSnapshot::from_raw(
            vec![json!({"item_uid": "A", "name": "count", "kwargs": {"num": 3}})],
            Some(json!({"item_uid": "R", "name": "fly_scan", "kwargs": {"title": "a very long comment that will not fit in a column"}})),
            vec![],
        ));
        let mut schema = ColumnSchema::new();
        let aliases = AliasMap::new();
        schema.ensure_columns(projection.visible_rows(), &aliases);
        projection.table(schema.columns(), &aliases, &HashMap::new())
    }

    #[test]
    fn renders_header_and_rows() {
        let text = render_table(&table());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Row  State"));
        assert!(lines[0].contains("Plan"));
        assert!(lines[0].contains("Title"));
        assert!(lines[2].starts_with("0    running"));
        assert!(lines[2].contains("fly_scan"));
        assert!(lines[3].starts_with("1    queued"));
    }

    #[test]
    fn long_cells_are_clipped() {
        let text = render_table(&table());
        assert!(text.contains("a very long comment that will..."));
        assert!(!text.contains("not fit"));
    }

    #[test]
    fn empty_table_says_so() {
        let text = render_table(&TableView::default());
        assert!(text.ends_with("(queue and history are empty)\n"));
    }
}
