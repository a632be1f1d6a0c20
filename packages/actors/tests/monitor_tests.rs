#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{QueueCommand, ReconcileError, global_registry};
use common::{
    cell_text, count_definition, item, row_uids, start, three_items, wait_for_event,
    wait_for_in_flight, wait_for_rows, wait_for_table,
};
use queue_client::{MemoryQueueServer, ScriptedFailure};
use queue_core::{AliasMap, CoercionError, MonitorEvent, RowState};
use serde_json::json;
use tokio::time::Instant;

#[tokio::test]
async fn test_edit_sends_typed_kwargs() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let table = wait_for_rows(&monitor, 3).await?;
    assert_eq!(table.columns[..3].iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), [
        "status", "name", "scan_ids"
    ]);
    assert!(table.rows.iter().all(|row| row.state == RowState::Pending));

    let message = monitor.edit(0, "num", "5").await?;
    assert_eq!(message, "Item updated");

    let updates = server.received_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["item_uid"], json!("A"));
    assert_eq!(updates[0]["kwargs"], json!({"num": 5, "delay": 0.5}));

    let table = monitor.table().await?;
    assert_eq!(cell_text(&table, 0, "num"), "5");

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_rejected_edit_restores_row() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let before = wait_for_rows(&monitor, 3).await?;

    server
        .fail_next(ScriptedFailure::RejectUpdate("item is locked".into()))
        .await;
    let err = monitor.edit(0, "num", "7").await.unwrap_err();
    assert_eq!(err, ReconcileError::RemoteRejected("item is locked".into()));
    assert!(err.rolled_back());
    assert_eq!(monitor.table().await?, before);

    // The next payload is built from the restored record.
    monitor.edit(0, "delay", "0.75").await?;
    let updates = server.received_updates().await;
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0]["kwargs"]["num"], json!(7));
    assert_eq!(updates[1]["kwargs"], json!({"num": 1, "delay": 0.75}));

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_dropped_edit_restores_row() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let before = wait_for_rows(&monitor, 3).await?;
    let mut events = monitor.subscribe();

    server.fail_next(ScriptedFailure::DropUpdate).await;
    let err = monitor.edit(1, "num", "12").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Transport(_)));
    assert_eq!(monitor.table().await?, before);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, MonitorEvent::EditRolledBack { .. })
    })
    .await?;
    assert_eq!(event.uid(), Some("B"));

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_coercion_failure_changes_nothing() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let before = wait_for_rows(&monitor, 3).await?;

    let err = monitor.edit(0, "num", "many").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Coercion(CoercionError::Invalid { ref parameter, .. }) if parameter == "num"
    ));
    assert!(!err.rolled_back());
    assert_eq!(monitor.table().await?, before);
    assert!(server.received_updates().await.is_empty());

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_snapshot_waits_for_edit_in_flight() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;
    let mut events = monitor.subscribe();

    server.hold();
    let editing = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.edit(0, "num", "10").await })
    };
    wait_for_in_flight(&monitor, 1).await?;

    // Another client changes B while our edit is pending.
    server
        .replace_pending(1, item("B", json!({"num": 20})))
        .await;
    monitor.refresh()?;
    wait_for_event(&mut events, |e| {
        matches!(e, MonitorEvent::SnapshotDeferred { in_flight: 1, .. })
    })
    .await?;

    let table = monitor.table().await?;
    assert_eq!(cell_text(&table, 0, "num"), "10");
    assert_eq!(cell_text(&table, 1, "num"), "2");

    server.release(1);
    assert_eq!(editing.await??, "Item updated");

    wait_for_table(&monitor, |table| {
        cell_text(table, 0, "num") == "10" && cell_text(table, 1, "num") == "20"
    })
    .await?;

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_commit_discards_snapshot_taken_before_it() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;
    let mut events = monitor.subscribe();

    server.hold();
    let editing = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.edit(0, "num", "10").await })
    };
    wait_for_in_flight(&monitor, 1).await?;
    monitor.refresh()?;
    wait_for_event(&mut events, |e| {
        matches!(e, MonitorEvent::SnapshotDeferred { in_flight: 1, .. })
    })
    .await?;

    // The poll after the commit fails, leaving only the held snapshot.
    server.fail_next(ScriptedFailure::DropFetch).await;
    server.release(1);
    assert_eq!(editing.await??, "Item updated");
    wait_for_event(&mut events, |e| matches!(e, MonitorEvent::Disconnected { .. })).await?;

    assert_eq!(server.pending_items().await[0]["kwargs"]["num"], json!(10));
    assert_eq!(cell_text(&monitor.table().await?, 0, "num"), "10");

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_move_discards_snapshot_taken_before_it() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;
    let mut events = monitor.subscribe();

    server.hold();
    let moving = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.move_row(0, 2).await })
    };
    wait_for_in_flight(&monitor, 1).await?;
    monitor.refresh()?;
    wait_for_event(&mut events, |e| {
        matches!(e, MonitorEvent::SnapshotDeferred { in_flight: 1, .. })
    })
    .await?;

    server.fail_next(ScriptedFailure::DropFetch).await;
    server.release(1);
    assert_eq!(moving.await??, 2);
    wait_for_event(&mut events, |e| matches!(e, MonitorEvent::Disconnected { .. })).await?;

    assert_eq!(server.pending_uids().await, ["B", "C", "A"]);
    assert_eq!(row_uids(&monitor.table().await?), ["B", "C", "A"]);

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_rollback_applies_held_snapshot() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;
    let mut events = monitor.subscribe();

    server.hold();
    server
        .fail_next(ScriptedFailure::RejectUpdate("item is locked".into()))
        .await;
    let editing = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.edit(0, "num", "10").await })
    };
    wait_for_in_flight(&monitor, 1).await?;

    server
        .replace_pending(1, item("B", json!({"num": 20})))
        .await;
    monitor.refresh()?;
    wait_for_event(&mut events, |e| {
        matches!(e, MonitorEvent::SnapshotDeferred { in_flight: 1, .. })
    })
    .await?;

    server.release(1);
    assert!(editing.await?.is_err());

    let table = monitor.table().await?;
    assert_eq!(cell_text(&table, 0, "num"), "1");
    assert_eq!(cell_text(&table, 1, "num"), "20");

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_slow_plan_definitions_do_not_block_the_monitor() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    server.fail_next(ScriptedFailure::StallDefinitions).await;
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let table = wait_for_table(&monitor, |table| table.rows.len() == 3).await?;
    assert!(!table.parameters_loaded);

    let editing = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.edit(0, "num", "5").await })
    };

    for _ in 0..3 {
        let started = Instant::now();
        let table = monitor.table().await?;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!table.parameters_loaded);
    }

    // Moves resolve while the definitions are still outstanding.
    assert_eq!(monitor.move_row(1, 2).await?, 2);
    assert_eq!(server.pending_uids().await, ["A", "C", "B"]);
    assert!(server.received_updates().await.is_empty());

    // Once the request times out the waiting edit goes through untyped.
    assert_eq!(editing.await??, "Item updated");
    let updates = server.received_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["item_uid"], json!("A"));
    assert!(!monitor.table().await?.parameters_loaded);

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_plan_definitions_arrive_with_an_event() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server, AliasMap::new()).await?;
    let table = wait_for_rows(&monitor, 3).await?;
    let num = table.cell(0, "num").ok_or("no num cell")?;
    assert_eq!(num.bound_key.as_deref(), Some("num"));

    // A new server means fetching its definitions again.
    let mut events = monitor.subscribe();
    let other = Arc::new(
        MemoryQueueServer::new()
            .with_definition(count_definition())
            .with_pending(vec![item("Z", json!({"num": 1}))]),
    );
    monitor.replace_server(other)?;
    let event = wait_for_event(&mut events, |e| {
        matches!(e, MonitorEvent::ParametersLoaded { .. })
    })
    .await?;
    assert!(matches!(event, MonitorEvent::ParametersLoaded { plans: 1, .. }));
    wait_for_table(&monitor, |table| {
        row_uids(table) == ["Z"] && table.parameters_loaded
    })
    .await?;

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_every_failed_refresh_is_reported() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;
    let mut events = monitor.subscribe();

    for _ in 0..2 {
        server.fail_next(ScriptedFailure::DropFetch).await;
        monitor.refresh()?;
        let event =
            wait_for_event(&mut events, |e| matches!(e, MonitorEvent::Disconnected { .. }))
                .await?;
        assert!(event.description().contains("connection reset"));
    }

    monitor.refresh()?;
    wait_for_event(&mut events, |e| matches!(e, MonitorEvent::SnapshotApplied { .. })).await?;

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_edits_of_one_item_run_in_order() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;

    server.hold();
    let first = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.edit(0, "num", "5").await })
    };
    wait_for_in_flight(&monitor, 1).await?;
    let second = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.edit(0, "delay", "1.5").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.in_flight().await?, 1);
    assert!(server.received_updates().await.is_empty());

    server.release(1);
    first.await??;
    server.release(1);
    second.await??;

    let updates = server.received_updates().await;
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0]["kwargs"], json!({"num": 5, "delay": 0.5}));
    assert_eq!(updates[1]["kwargs"], json!({"num": 5, "delay": 1.5}));

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_move_reorders_pending() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let table = wait_for_rows(&monitor, 3).await?;
    assert!(table.drag_enabled);

    let destination = monitor.move_row(0, 2).await?;
    assert_eq!(destination, 2);
    assert_eq!(row_uids(&monitor.table().await?), ["B", "C", "A"]);
    assert_eq!(server.pending_uids().await, ["B", "C", "A"]);

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_failed_move_keeps_order() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;

    server
        .fail_next(ScriptedFailure::RejectMove("queue is busy".into()))
        .await;
    let err = monitor.move_row(0, 2).await.unwrap_err();
    assert_eq!(err, ReconcileError::RemoteRejected("queue is busy".into()));
    assert_eq!(row_uids(&monitor.table().await?), ["A", "B", "C"]);

    server.fail_next(ScriptedFailure::DropMove).await;
    let err = monitor.move_row(2, 0).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Transport(_)));
    assert_eq!(row_uids(&monitor.table().await?), ["A", "B", "C"]);
    assert_eq!(server.pending_uids().await, ["A", "B", "C"]);

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_move_below_running_item_is_clamped() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(
        MemoryQueueServer::new()
            .with_definition(count_definition())
            .with_running(item("R", json!({"num": 9})))
            .with_pending(vec![item("A", json!({})), item("B", json!({}))]),
    );
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let table = wait_for_rows(&monitor, 3).await?;
    assert_eq!(table.rows[0].state, RowState::Running);

    assert_eq!(monitor.move_row(1, 10).await?, 1);
    assert_eq!(server.pending_uids().await, ["B", "A"]);

    let err = monitor.begin_drag(0).await.unwrap_err();
    assert_eq!(
        err,
        ReconcileError::ImmutableRow {
            row: 0,
            state: RowState::Running
        }
    );

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_running_and_completed_rows_are_read_only() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(
        MemoryQueueServer::new()
            .with_definition(count_definition())
            .with_running(item("R", json!({"num": 9})))
            .with_pending(vec![item("A", json!({"num": 1}))])
            .with_history(vec![json!({
                "item_uid": "H",
                "name": "count",
                "kwargs": {"num": 4},
                "result": {"exit_status": "completed", "scan_ids": [7]}
            })]),
    );
    let monitor = start(server.clone(), AliasMap::new()).await?;
    let table = wait_for_rows(&monitor, 3).await?;
    assert_eq!(table.rows[2].state, RowState::Completed);
    assert!(!table.rows[2].cells.iter().any(|cell| cell.editable));
    assert!(table.rows[1].cells.iter().all(|cell| cell.editable));

    let err = monitor.edit(0, "num", "1").await.unwrap_err();
    assert_eq!(
        err,
        ReconcileError::ImmutableRow {
            row: 0,
            state: RowState::Running
        }
    );
    let err = monitor.edit(2, "num", "1").await.unwrap_err();
    assert_eq!(
        err,
        ReconcileError::ImmutableRow {
            row: 2,
            state: RowState::Completed
        }
    );
    let err = monitor.edit(9, "num", "1").await.unwrap_err();
    assert_eq!(err, ReconcileError::RowOutOfRange { row: 9, rows: 3 });
    assert!(server.received_updates().await.is_empty());

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_item_without_uid_is_read_only() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;

    server
        .replace_pending(0, json!({"name": "count", "kwargs": {"num": 1}}))
        .await;
    monitor.refresh()?;
    let table = wait_for_table(&monitor, |table| {
        table.rows.first().is_some_and(|row| row.uid.is_none())
    })
    .await?;
    assert!(!table.drag_enabled);

    let err = monitor.edit(0, "num", "2").await.unwrap_err();
    assert_eq!(err, ReconcileError::MissingUid { row: 0 });
    let err = monitor.begin_drag(1).await.unwrap_err();
    assert_eq!(err, ReconcileError::DragDisabled);

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_alias_column_edits_matched_key() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(
        MemoryQueueServer::new()
            .with_definition(count_definition())
            .with_pending(vec![item("A", json!({"num": 1, "roi_width": 20.0}))]),
    );
    let aliases = AliasMap::new().with_column("width", ["width", "roi_width"]);
    let monitor = start(server.clone(), aliases).await?;
    let table = wait_for_rows(&monitor, 1).await?;

    let ids: Vec<&str> = table.columns.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, ["status", "name", "scan_ids", "width", "num"]);
    let cell = table.cell(0, "width").ok_or("no width cell")?;
    assert_eq!(cell.text, "20.0");
    assert_eq!(cell.key, "roi_width");

    monitor.edit(0, "width", "30").await?;
    let updates = server.received_updates().await;
    assert_eq!(updates[0]["kwargs"], json!({"num": 1, "roi_width": 30.0}));

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_queue_commands() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items().with_history(vec![json!({
        "item_uid": "H",
        "name": "count",
        "kwargs": {"num": 4},
        "result": {"exit_status": "completed"}
    })]));
    let monitor = start(server.clone(), AliasMap::new()).await?;
    wait_for_rows(&monitor, 4).await?;

    monitor.command(QueueCommand::RemoveRows(vec![1])).await?;
    assert_eq!(server.pending_uids().await, ["A", "C"]);
    wait_for_rows(&monitor, 3).await?;

    let err = monitor
        .command(QueueCommand::RemoveRows(vec![2]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ReconcileError::ImmutableRow {
            row: 2,
            state: RowState::Completed
        }
    );

    monitor.command(QueueCommand::DuplicateRows(vec![2])).await?;
    let pending = server.pending_items().await;
    assert_eq!(pending.len(), 3);
    assert_eq!(pending[0]["kwargs"], json!({"num": 4}));
    assert_ne!(pending[0]["item_uid"], json!("H"));
    assert!(pending[0].get("result").is_none());
    wait_for_rows(&monitor, 4).await?;

    assert_eq!(monitor.command(QueueCommand::StartQueue).await?, "Queue started");
    wait_for_table(&monitor, |table| {
        table.rows.first().is_some_and(|row| row.state == RowState::Running)
    })
    .await?;

    let err = monitor
        .command(QueueCommand::DuplicateRows(vec![0]))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::ImmutableRow { row: 0, .. }));

    let err = monitor.command(QueueCommand::StartQueue).await.unwrap_err();
    assert_eq!(err, ReconcileError::RemoteRejected("Queue is already running".into()));

    let mut events = monitor.subscribe();
    monitor.submit(QueueCommand::ClearHistory)?;
    let event = wait_for_event(&mut events, |e| {
        matches!(e, MonitorEvent::CommandCompleted { .. })
    })
    .await?;
    assert!(matches!(event, MonitorEvent::CommandCompleted { ref command, .. } if command == "clear history"));

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_replace_server_repolls() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items());
    let monitor = start(server, AliasMap::new()).await?;
    wait_for_rows(&monitor, 3).await?;

    let other = Arc::new(MemoryQueueServer::new().with_pending(vec![item("Z", json!({"num": 1}))]));
    monitor.replace_server(other.clone())?;
    wait_for_table(&monitor, |table| row_uids(table) == ["Z"]).await?;

    monitor.edit(0, "num", "3").await?;
    assert_eq!(other.received_updates().await.len(), 1);

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_status_and_forwarded_events() -> Result<(), Box<dyn Error>> {
    let server = Arc::new(three_items().with_running(item("R", json!({}))));
    let monitor = start(server, AliasMap::new()).await?;

    let (tx, mut rx) = tokio::sync::broadcast::channel(64);
    monitor.forward_events(tx)?;
    // Forwarding is set up by the supervisor; give it a moment.
    tokio::time::sleep(Duration::from_millis(20)).await;
    monitor.refresh()?;

    let event = wait_for_event(&mut rx, |e| matches!(e, MonitorEvent::ServerStatus { .. })).await?;
    let MonitorEvent::ServerStatus { status, actions, .. } = event else {
        unreachable!()
    };
    assert!(status.queue_running());
    assert!(!actions.can_start);
    assert!(actions.can_stop);

    monitor.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_monitor_is_registered_until_shutdown() -> Result<(), Box<dyn Error>> {
    let monitor = start(Arc::new(three_items()), AliasMap::new()).await?;
    let name = monitor.name().to_string();
    assert!(global_registry().get(&name).is_some());

    monitor.shutdown()?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while global_registry().get(&name).is_some() {
        assert!(tokio::time::Instant::now() < deadline, "monitor never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(monitor.table().await.is_err());
    Ok(())
}
