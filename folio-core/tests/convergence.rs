//! Randomized convergence: several replicas edit concurrently over FIFO
//! links to one sequencer, and every replica must end up equal to it. The
//! sequencer's own notebook must equal a replay of its log.

use std::collections::VecDeque;

use folio_core::{
    replay, Anchor, CellKind, Comment, ExecutionResult, ExecutionStatus, LogicalTimestamp, MergeEngine,
    Notebook, OpKind, Operation, Outcome, Replica, ResourceUsage, SYSTEM_SESSION,
};
use proptest::prelude::*;
use uuid::Uuid;

enum Uplink {
    Op(Operation),
    Ack(u64),
}

enum Downlink {
    Op(u64, Operation),
    Dropped(LogicalTimestamp),
}

struct Sim {
    base: Notebook,
    engine: MergeEngine,
    replicas: Vec<Replica>,
    uplink: Vec<VecDeque<Uplink>>,
    downlink: Vec<VecDeque<Downlink>>,
    next_cell: u128,
    next_comment: u128,
}

impl Sim {
    fn new(peers: usize) -> Self {
        let doc = Uuid::from_u128(0xD0C);
        let base = Notebook::new(doc, "sim");
        let mut engine = MergeEngine::new(base.clone());
        for (i, text) in ["abcdef", "SELECT 1", ""].iter().enumerate() {
            let op = Operation::new(doc, SYSTEM_SESSION, 0, 0, OpKind::InsertCell {
                cell: Uuid::from_u128(0xC0 + i as u128),
                index: i,
                kind: CellKind::Code,
                content: (*text).into(),
            });
            engine.apply(&op).unwrap();
        }
        let replicas = (1..=peers as u128)
            .map(|s| {
                let session = Uuid::from_u128(s);
                Replica::from_snapshot(session, engine.register_session(session), 0)
            })
            .collect();
        Self {
            base,
            engine,
            replicas,
            uplink: (0..peers).map(|_| VecDeque::new()).collect(),
            downlink: (0..peers).map(|_| VecDeque::new()).collect(),
            next_cell: 0x1000,
            next_comment: 0,
        }
    }

    fn local_edit(&mut self, r: usize, seed: u32) {
        let nb = self.replicas[r].notebook();
        let n = nb.cells.len();
        let kind = if n == 0 {
            self.new_cell(0, seed)
        } else {
            let cell = &nb.cells[(seed as usize / 7) % n];
            let len = cell.char_len();
            let pos = (seed as usize / 11) % (len + 1);
            match seed % 8 {
                0 | 1 => OpKind::InsertText {
                    cell: cell.id,
                    pos,
                    text: ["x", "yz", "é", "--"][(seed as usize / 3) % 4].into(),
                },
                2 if pos < len => OpKind::DeleteText {
                    cell: cell.id,
                    pos,
                    len: 1 + (seed as usize / 13) % (len - pos).min(3),
                },
                3 => {
                    let index = (seed as usize / 5) % (n + 1);
                    self.new_cell(index, seed)
                }
                4 => OpKind::DeleteCell { cell: cell.id, index: (seed as usize / 7) % n },
                5 if n > 1 => OpKind::MoveCell {
                    cell: cell.id,
                    from: (seed as usize / 7) % n,
                    to: (seed as usize / 17) % n,
                },
                6 => {
                    let id = cell.id;
                    let anchor = Anchor::new(pos, (len - pos).min(2));
                    let comment = self.new_comment(seed, anchor);
                    OpKind::AddComment { cell: id, comment }
                }
                7 if !cell.comments.is_empty() => OpKind::DeleteComment {
                    cell: cell.id,
                    comment: cell.comments[(seed as usize / 19) % cell.comments.len()].id,
                },
                _ => OpKind::InsertText { cell: cell.id, pos, text: "q".into() },
            }
        };
        self.submit(r, kind);
    }

    fn submit(&mut self, r: usize, kind: OpKind) {
        let op = self.replicas[r].local(kind).unwrap();
        self.uplink[r].push_back(Uplink::Op(op));
    }

    /// Comment ids vary with the seed so arrival order and id order differ.
    fn new_comment(&mut self, seed: u32, anchor: Anchor) -> Comment {
        self.next_comment += 1;
        Comment {
            id: Uuid::from_u128(((seed as u128) << 32) | self.next_comment),
            author: "sim".into(),
            body: "note".into(),
            anchor,
        }
    }

    /// The sequencer writes an execution result into a cell it holds.
    fn server_output(&mut self, seed: u32) {
        let cells = &self.engine.notebook().cells;
        if cells.is_empty() {
            return;
        }
        let cell = cells[seed as usize % cells.len()].id;
        let result = ExecutionResult::failure(
            Uuid::from_u128(seed as u128),
            cell,
            ExecutionStatus::Error,
            format!("run {seed}"),
            ResourceUsage::default(),
        );
        let counter = self.engine.version() + 1;
        let op = Operation::new(self.base.id, SYSTEM_SESSION, counter, 0, OpKind::SetOutput { cell, result });
        if let Outcome::Applied { version, op, .. } = self.engine.apply(&op).unwrap() {
            for link in &mut self.downlink {
                link.push_back(Downlink::Op(version, op.clone()));
            }
        }
    }

    fn new_cell(&mut self, index: usize, seed: u32) -> OpKind {
        self.next_cell += 1;
        OpKind::InsertCell {
            cell: Uuid::from_u128(self.next_cell),
            index,
            kind: if seed % 2 == 0 { CellKind::Code } else { CellKind::Markdown },
            content: "n".into(),
        }
    }

    fn server_receive(&mut self, r: usize) {
        let op = match self.uplink[r].pop_front() {
            Some(Uplink::Op(op)) => op,
            Some(Uplink::Ack(version)) => {
                let session = self.replicas[r].session();
                self.engine.acknowledge(&session, version).unwrap();
                return;
            }
            None => return,
        };
        match self.engine.apply(&op).unwrap() {
            Outcome::Applied { version, op, .. } => {
                for link in &mut self.downlink {
                    link.push_back(Downlink::Op(version, op.clone()));
                }
            }
            Outcome::Dropped { timestamp, .. } => {
                self.downlink[r].push_back(Downlink::Dropped(timestamp));
            }
        }
    }

    fn client_receive(&mut self, r: usize) {
        match self.downlink[r].pop_front() {
            Some(Downlink::Op(version, op)) => {
                self.replicas[r].on_remote(version, &op);
                self.uplink[r].push_back(Uplink::Ack(version));
            }
            Some(Downlink::Dropped(ts)) => self.replicas[r].on_dropped(ts),
            None => {}
        }
    }

    fn drain(&mut self) {
        let peers = self.replicas.len();
        while (0..peers).any(|r| !self.uplink[r].is_empty() || !self.downlink[r].is_empty()) {
            for r in 0..peers {
                while !self.uplink[r].is_empty() {
                    self.server_receive(r);
                }
            }
            for r in 0..peers {
                while !self.downlink[r].is_empty() {
                    self.client_receive(r);
                }
            }
        }
    }
}

fn run(peers: usize, steps: &[(u8, u8, u32)]) {
    let mut sim = Sim::new(peers);
    for &(action, who, seed) in steps {
        let r = who as usize % peers;
        match action % 7 {
            0 | 1 => sim.local_edit(r, seed),
            2 | 3 => sim.server_receive(r),
            4 | 5 => sim.client_receive(r),
            _ => sim.server_output(seed),
        }
    }
    sim.drain();

    let server = sim.engine.notebook();
    let replayed = replay(sim.base.clone(), sim.engine.log().entries().iter().map(|e| &e.op)).unwrap();
    assert_eq!(&replayed, server);
    for replica in &sim.replicas {
        assert!(!replica.needs_resync(), "replica {} needs resync", replica.session());
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(replica.version(), server.version);
        assert_eq!(replica.notebook().cells, server.cells);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1024))]

    #[test]
    fn test_replicas_converge(steps in prop::collection::vec((any::<u8>(), any::<u8>(), any::<u32>()), 1..150)) {
        run(3, &steps);
    }

    #[test]
    fn test_two_peers_converge(steps in prop::collection::vec((any::<u8>(), any::<u8>(), any::<u32>()), 1..100)) {
        run(2, &steps);
    }
}

#[test]
fn test_typing_race_on_same_position() {
    let mut sim = Sim::new(2);
    // Both peers type at the start of "abcdef" before hearing from each other.
    sim.local_edit(0, 0);
    sim.local_edit(1, 1);
    sim.server_receive(1);
    sim.server_receive(0);
    sim.drain();
    let server = sim.engine.notebook();
    assert_eq!(sim.replicas[0].notebook().cells, server.cells);
    assert_eq!(sim.replicas[1].notebook().cells, server.cells);
}

#[test]
fn test_concurrent_comments_on_same_cell() {
    let mut sim = Sim::new(3);
    let cell = Uuid::from_u128(0xC0);
    // Ids run against arrival order at the sequencer.
    for (r, id) in [(0, 3u128), (1, 1), (2, 2)] {
        let comment = Comment {
            id: Uuid::from_u128(id),
            author: format!("peer{r}"),
            body: "look".into(),
            anchor: Anchor::new(0, 3),
        };
        sim.submit(r, OpKind::AddComment { cell, comment });
    }
    sim.server_receive(2);
    sim.server_receive(0);
    sim.server_receive(1);
    sim.drain();

    let server = sim.engine.notebook();
    let ids: Vec<u128> = server.cell(&cell).unwrap().comments.iter().map(|c| c.id.as_u128()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    for replica in &sim.replicas {
        assert_eq!(replica.notebook().cells, server.cells);
    }
}

#[test]
fn test_output_and_comment_removal_race() {
    let mut sim = Sim::new(2);
    let cell = Uuid::from_u128(0xC1);
    let comment = Comment {
        id: Uuid::from_u128(7),
        author: "ana".into(),
        body: "slow".into(),
        anchor: Anchor::new(0, 6),
    };
    sim.submit(0, OpKind::AddComment { cell, comment });
    sim.drain();

    // Both peers remove the same comment while a result lands on the cell.
    sim.submit(0, OpKind::DeleteComment { cell, comment: Uuid::from_u128(7) });
    sim.submit(1, OpKind::DeleteComment { cell, comment: Uuid::from_u128(7) });
    sim.server_output(1);
    sim.drain();

    let server = sim.engine.notebook();
    let target = server.cell(&cell).unwrap();
    assert!(target.comments.is_empty());
    assert!(target.output.is_some());
    for replica in &sim.replicas {
        assert_eq!(replica.pending_len(), 0);
        assert_eq!(replica.notebook().cells, server.cells);
    }
}
