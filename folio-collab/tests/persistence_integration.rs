//! Persistence integration tests.
//!
//! Verifies, through the full engine stack:
//! - Notebooks, versions and outputs survive a clean restart
//! - Operations only in the op log survive a crash (no final checkpoint)
//! - The audit trail is durable
//! - Multiple notebooks stay isolated

use folio_collab::broker::StreamItem;
use folio_collab::config::EngineConfig;
use folio_collab::engine::{Connection, SessionEngine};
use folio_collab::protocol::{ServerEvent, UserIdentity};
use folio_collab::sandbox::MemoryDataset;
use folio_collab::storage::AuditAction;
use folio_core::{CellId, CellKind, DocId, OpKind, Replica, Value};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn open(path: &Path) -> Arc<SessionEngine> {
    SessionEngine::open(EngineConfig::for_testing_at(path), Arc::new(MemoryDataset::demo()))
        .await
        .unwrap()
}

/// Drop the engine and give background tasks a moment to release it.
async fn close(engine: Arc<SessionEngine>) {
    drop(engine);
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn replica(conn: &Connection) -> Replica {
    match &conn.first {
        ServerEvent::Joined { session, notebook, last_counter, .. } => {
            Replica::from_snapshot(*session, notebook.clone(), *last_counter)
        }
        other => panic!("expected Joined, got {other:?}"),
    }
}

async fn wait_for_result(conn: &mut Connection) -> u64 {
    loop {
        match tokio::time::timeout(Duration::from_secs(3), conn.events.recv()).await {
            Ok(StreamItem::Event(event)) => {
                if let ServerEvent::ExecutionResult { version, .. } = &*event {
                    return *version;
                }
            }
            other => panic!("expected event, got {other:?}"),
        }
    }
}

/// Create a notebook with one code cell holding `text`. Returns the open
/// connection so callers can keep editing.
async fn seeded(engine: &SessionEngine, title: &str, text: &str) -> (DocId, CellId, Connection, Replica) {
    let owner = UserIdentity::new("alice");
    let doc = engine.create_notebook(title, &owner).await.unwrap();
    let conn = engine.connect(doc, owner, "t", None).await.unwrap();
    let mut local = replica(&conn);
    let cell = Uuid::new_v4();
    let op = local
        .local(OpKind::InsertCell { cell, index: 0, kind: CellKind::Code, content: String::new() })
        .unwrap();
    engine.submit_operation(&conn.session, op).await.unwrap();
    local.on_ack(1);
    let op = local.local(OpKind::InsertText { cell, pos: 0, text: text.into() }).unwrap();
    engine.submit_operation(&conn.session, op).await.unwrap();
    local.on_ack(2);
    (doc, cell, conn, local)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_clean_restart_preserves_notebook_and_output() {
    let dir = tempdir().unwrap();

    let (doc, cell, version) = {
        let engine = open(dir.path()).await;
        let (doc, cell, mut conn, _) = seeded(&engine, "Revenue", "SELECT SUM(amount) AS total FROM sales").await;
        engine
            .submit_execution(&conn.session, cell, "SELECT SUM(amount) AS total FROM sales")
            .await
            .unwrap();
        let version = wait_for_result(&mut conn).await;
        engine.disconnect(&conn.session).await;
        engine.shutdown().await;
        close(engine).await;
        (doc, cell, version)
    };
    assert_eq!(version, 3);

    let engine = open(dir.path()).await;
    let listed = engine.list_notebooks().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "Revenue");
    assert_eq!(listed[0].version, 3);

    let restored = engine.get_cell(&doc, &cell).await.unwrap();
    assert_eq!(restored.content, "SELECT SUM(amount) AS total FROM sales");
    let output = restored.output.expect("output persisted");
    assert_eq!(output.rows, vec![vec![Value::Float(675.5)]]);

    // New sessions continue from the recovered version.
    let conn = engine.connect(doc, UserIdentity::new("bob"), "t", None).await.unwrap();
    match &conn.first {
        ServerEvent::Joined { version, .. } => assert_eq!(*version, 3),
        other => panic!("expected Joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_crash_recovery_replays_op_log() {
    let dir = tempdir().unwrap();

    let (doc, cell) = {
        let engine = open(dir.path()).await;
        let (doc, cell, conn, mut local) = seeded(&engine, "Crash", "abc").await;
        for (i, ch) in ["d", "e", "f"].iter().enumerate() {
            let op = local.local(OpKind::InsertText { cell, pos: 3 + i, text: ch.to_string() }).unwrap();
            engine.submit_operation(&conn.session, op).await.unwrap();
            local.on_ack(3 + i as u64);
        }
        // No shutdown: nothing is checkpointed beyond what the sequencer wrote.
        close(engine).await;
        (doc, cell)
    };

    let engine = open(dir.path()).await;
    assert_eq!(engine.get_cell(&doc, &cell).await.unwrap().content, "abcdef");
    assert_eq!(engine.list_notebooks().await[0].version, 5);
}

#[tokio::test]
async fn test_audit_trail_survives_restart() {
    let dir = tempdir().unwrap();

    let doc = {
        let engine = open(dir.path()).await;
        let (doc, _, _, _) = seeded(&engine, "Audited", "SELECT 1").await;
        let exported = engine.export_snapshot(&doc, "carol").await.unwrap();
        assert_eq!(exported.version, 2);
        engine.shutdown().await;
        close(engine).await;
        doc
    };

    let engine = open(dir.path()).await;
    let audit = engine.audit_log(&doc).await.unwrap();
    let actions: Vec<AuditAction> = audit.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::Created, AuditAction::Exported]);
    assert_eq!(audit[0].who, "alice");
    assert_eq!(audit[1].who, "carol");
}

#[tokio::test]
async fn test_multi_notebook_isolation() {
    let dir = tempdir().unwrap();

    let ids = {
        let engine = open(dir.path()).await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let (doc, cell, _, _) = seeded(&engine, &format!("nb-{i}"), &format!("SELECT {i}")).await;
            ids.push((doc, cell, i));
        }
        engine.shutdown().await;
        close(engine).await;
        ids
    };

    let engine = open(dir.path()).await;
    assert_eq!(engine.list_notebooks().await.len(), 3);
    for (doc, cell, i) in ids {
        assert_eq!(engine.get_cell(&doc, &cell).await.unwrap().content, format!("SELECT {i}"));
        assert!(engine.get_cell(&doc, &Uuid::new_v4()).await.is_err());
    }
}
