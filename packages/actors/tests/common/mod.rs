#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{MonitorConfig, MonitorHandle, start_monitor};
use queue_client::MemoryQueueServer;
use queue_core::{AliasMap, MonitorEvent, PlanDefinition, PlanKind, PlanParameter, TableView};
use serde_json::{Value, json};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

pub fn item(uid: &str, kwargs: Value) -> Value {
    json!({"item_uid": uid, "item_type": "plan", "name": "count", "kwargs": kwargs})
}

pub fn count_definition() -> PlanDefinition {
    PlanDefinition::new("count", PlanKind::Plan)
        .with_parameter(PlanParameter::new("num").with_type_name("int").with_default(json!(1)))
        .with_parameter(PlanParameter::new("delay").with_default(json!(0.0)))
        .with_parameter(PlanParameter::new("roi_width").with_default(json!(10.0)))
        .with_parameter(PlanParameter::new("title").with_type_name("str"))
}

/// A server holding pending items A, B and C.
pub fn three_items() -> MemoryQueueServer {
    MemoryQueueServer::new()
        .with_definition(count_definition())
        .with_pending(vec![
            item("A", json!({"num": 1, "delay": 0.5})),
            item("B", json!({"num": 2})),
            item("C", json!({"num": 3})),
        ])
}

/// Polls once at startup; later polls only follow commits and refreshes.
pub fn config() -> MonitorConfig {
    MonitorConfig::default()
        .with_poll_interval(Duration::from_secs(3600))
        .with_remote_timeout(Duration::from_secs(2))
}

pub async fn start(
    server: Arc<MemoryQueueServer>,
    aliases: AliasMap,
) -> Result<MonitorHandle, Box<dyn Error>> {
    let (monitor, _join) = start_monitor(config().with_aliases(aliases), server).await?;
    Ok(monitor)
}

/// Wait until the table satisfies `ready`.
pub async fn wait_for_table(
    monitor: &MonitorHandle,
    ready: impl Fn(&TableView) -> bool,
) -> Result<TableView, Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let table = monitor.table().await?;
        if ready(&table) {
            return Ok(table);
        }
        if tokio::time::Instant::now() > deadline {
            return Err(format!("table never became ready: {:?}", table).into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for `rows` rows rendered with plan definitions.
pub async fn wait_for_rows(
    monitor: &MonitorHandle,
    rows: usize,
) -> Result<TableView, Box<dyn Error>> {
    wait_for_table(monitor, |table| {
        table.rows.len() == rows && table.parameters_loaded
    })
    .await
}

pub async fn wait_for_in_flight(
    monitor: &MonitorHandle,
    count: usize,
) -> Result<(), Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while monitor.in_flight().await? != count {
        if tokio::time::Instant::now() > deadline {
            return Err(format!("never reached {} operations in flight", count).into());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Receive events until one matches.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<MonitorEvent>,
    matches: impl Fn(&MonitorEvent) -> bool,
) -> Result<MonitorEvent, Box<dyn Error>> {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    })
    .await??;
    Ok(found)
}

/// Uids of the table rows, top to bottom.
pub fn row_uids(table: &TableView) -> Vec<String> {
    table
        .rows
        .iter()
        .map(|row| row.uid.clone().unwrap_or_default())
        .collect()
}

pub fn cell_text(table: &TableView, row: usize, column_id: &str) -> String {
    table
        .cell(row, column_id)
        .map(|cell| cell.text.clone())
        .unwrap_or_default()
}
