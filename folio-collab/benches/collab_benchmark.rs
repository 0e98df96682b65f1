use criterion::{black_box, criterion_group, criterion_main, Criterion};
use folio_collab::broadcast::{BroadcastGroup, Envelope, Recipients};
use folio_collab::presence::PresenceCoalescer;
use folio_collab::protocol::{ClientMessage, CursorPosition, ServerEvent, UserIdentity};
use folio_collab::sandbox::{sql, ExecutionRequest, MemoryDataset, QuerySandbox, CancelFlag};
use folio_collab::config::SandboxConfig;
use folio_collab::storage::{NotebookDb, StoreConfig};
use folio_core::{CellKind, Notebook, OpKind, Operation};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const QUERY: &str = "SELECT country, SUM(amount) AS total FROM sales WHERE amount > 60 GROUP BY country ORDER BY total DESC";

fn edit_op() -> Operation {
    Operation::new(Uuid::new_v4(), Uuid::new_v4(), 42, 17, OpKind::InsertText {
        cell: Uuid::new_v4(),
        pos: 12,
        text: "amount".into(),
    })
}

fn notebook_with_cells(n: usize) -> Notebook {
    let mut notebook = Notebook::new(Uuid::new_v4(), "bench");
    for i in 0..n {
        notebook
            .apply(&OpKind::InsertCell {
                cell: Uuid::new_v4(),
                index: i,
                kind: CellKind::Code,
                content: QUERY.into(),
            })
            .unwrap();
    }
    notebook
}

fn bench_edit_encode(c: &mut Criterion) {
    let msg = ClientMessage::Edit(edit_op());
    c.bench_function("edit_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_operation_event_decode(c: &mut Criterion) {
    let encoded = ServerEvent::Operation { version: 18, op: edit_op() }.encode().unwrap();
    c.bench_function("operation_event_decode", |b| {
        b.iter(|| black_box(ServerEvent::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_event_encode(c: &mut Criterion) {
    let event = ServerEvent::ResyncSnapshot { notebook: notebook_with_cells(50), version: 50 };
    c.bench_function("snapshot_encode_50_cells", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048, Duration::from_millis(33));
                let mut receivers = Vec::with_capacity(100);
                for i in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4(), UserIdentity::new(format!("u{i}"))).await);
                }
                let sender = Uuid::new_v4();
                for v in 0..1000u64 {
                    group.send(Envelope::new(
                        Recipients::AllExcept(sender),
                        ServerEvent::Participants { count: v as usize },
                    ));
                }
                black_box(receivers.len());
            })
        })
    });
}

fn bench_presence_coalesce(c: &mut Criterion) {
    let sessions: Vec<_> = (0..50).map(|_| Uuid::new_v4()).collect();
    let cell = Uuid::new_v4();
    c.bench_function("presence_coalesce_1000_moves", |b| {
        b.iter(|| {
            let mut presence = PresenceCoalescer::new(Duration::from_millis(33));
            for i in 0..1000 {
                let s = sessions[i % sessions.len()];
                presence.update(s, UserIdentity::new("u"), CursorPosition::caret(cell, i));
            }
            black_box(presence.take());
        })
    });
}

fn bench_sql_parse(c: &mut Criterion) {
    c.bench_function("sql_parse_group_by", |b| {
        b.iter(|| black_box(sql::parse(black_box(QUERY)).unwrap()))
    });
}

fn bench_sandbox_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let sandbox = QuerySandbox::new(Arc::new(MemoryDataset::demo()), SandboxConfig::default());
    let request = ExecutionRequest::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), QUERY);
    c.bench_function("sandbox_execute_group_by", |b| {
        b.iter(|| black_box(rt.block_on(sandbox.execute(&request, CancelFlag::new()))))
    });
}

fn bench_snapshot_save_load(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let db = NotebookDb::open(StoreConfig::for_testing(dir.path())).unwrap();
    let notebook = notebook_with_cells(50);
    db.save_snapshot(&notebook, &[]).unwrap();

    c.bench_function("snapshot_save_50_cells", |b| {
        b.iter(|| black_box(db.save_snapshot(black_box(&notebook), &[]).unwrap()))
    });
    c.bench_function("snapshot_load_50_cells", |b| {
        b.iter(|| black_box(db.load_snapshot(black_box(notebook.id)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_edit_encode,
    bench_operation_event_decode,
    bench_snapshot_event_encode,
    bench_broadcast_1000_messages,
    bench_presence_coalesce,
    bench_sql_parse,
    bench_sandbox_execute,
    bench_snapshot_save_load,
);
criterion_main!(benches);
