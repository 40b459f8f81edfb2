// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end coverage of a single fork GC cycle: a real `fork()`, a child that
//! streams repair messages over the pipe, and a parent that applies them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aggcore::config::ServerConfig;
use aggcore::gc::pipe::RepairedBlock;
use aggcore::gc::{BlockSnapshot, CompactableIndex, FgcState, ForkGc};
use aggcore::Result;

struct FakeIndex {
    id: u64,
    blocks: Vec<BlockSnapshot>,
    applied_repaired: usize,
    applied_deleted: usize,
}

impl CompactableIndex for FakeIndex {
    fn unique_id(&self) -> u64 {
        self.id
    }

    fn snapshot(&self) -> Vec<BlockSnapshot> {
        self.blocks.clone()
    }

    fn apply(&mut self, repaired: Vec<RepairedBlock>, deleted: Vec<u32>, _last_block_appended: usize) -> Result<(u64, u64)> {
        self.applied_repaired = repaired.len();
        self.applied_deleted = deleted.len();
        let bytes: u64 = repaired.iter().map(|b| b.bytes.len() as u64).sum();
        Ok((bytes, repaired.len() as u64))
    }
}

#[test]
fn run_cycle_repairs_garbage_blocks_via_a_real_fork() {
    let config = ServerConfig::default();
    let mut gc = ForkGc::new(&config);
    assert_eq!(gc.state(), FgcState::Idle);

    let index: Box<dyn CompactableIndex> = Box::new(FakeIndex {
        id: 99,
        blocks: vec![
            BlockSnapshot { index: 0, garbage_ratio: 0.5, bytes: vec![1, 2, 3, 4], is_last: false },
            BlockSnapshot { index: 1, garbage_ratio: 0.0, bytes: vec![5, 6], is_last: true },
        ],
        applied_repaired: 0,
        applied_deleted: 0,
    });
    let mut indexes = vec![index];

    let errors = gc.run_cycle(&mut indexes).unwrap();
    assert_eq!(errors, vec![None]);
    assert_eq!(gc.state(), FgcState::Idle);
    assert_eq!(gc.stats().num_cycles, 1);
    assert!(gc.stats().total_collected > 0);
}

#[test]
fn run_cycle_reports_a_parent_error_when_apply_rejects_the_repair() {
    let config = ServerConfig::default();
    let mut gc = ForkGc::new(&config);

    struct RefusingIndex {
        blocks: Vec<BlockSnapshot>,
    }

    impl CompactableIndex for RefusingIndex {
        fn unique_id(&self) -> u64 {
            7
        }

        fn snapshot(&self) -> Vec<BlockSnapshot> {
            self.blocks.clone()
        }

        fn apply(&mut self, _repaired: Vec<RepairedBlock>, _deleted: Vec<u32>, _last_block_appended: usize) -> Result<(u64, u64)> {
            // Simulates the parent-side index having changed shape (e.g. a
            // concurrent write) in a way that makes the child's repair invalid.
            Err(aggcore::ErrorKind::InvalidArgument.with_message("index state no longer matches the snapshot"))
        }
    }

    let index: Box<dyn CompactableIndex> = Box::new(RefusingIndex {
        blocks: vec![BlockSnapshot { index: 0, garbage_ratio: 0.9, bytes: vec![9; 16], is_last: true }],
    });
    let mut indexes = vec![index];

    let errors = gc.run_cycle(&mut indexes).unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_some());
}

#[test]
fn run_cycle_discards_a_stale_last_block_repair_when_the_parent_appended_meanwhile() {
    let config = ServerConfig::default();
    let mut gc = ForkGc::new(&config);

    // Simulates a write landing on the last block between the child's fork-time
    // snapshot and the parent's apply-time read: the child (a real forked OS
    // process, with its own pid) sees the block at its original size, while the
    // parent's own later call sees it with the extra bytes appended.
    struct GrowingIndex {
        parent_pid: u32,
        base_last_block: Vec<u8>,
        last_seen_appended: Arc<AtomicUsize>,
    }

    impl CompactableIndex for GrowingIndex {
        fn unique_id(&self) -> u64 {
            123
        }

        fn snapshot(&self) -> Vec<BlockSnapshot> {
            let mut bytes = self.base_last_block.clone();
            if std::process::id() == self.parent_pid {
                bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
            }
            vec![BlockSnapshot { index: 0, garbage_ratio: 0.9, bytes, is_last: true }]
        }

        fn apply(&mut self, repaired: Vec<RepairedBlock>, _deleted: Vec<u32>, last_block_appended: usize) -> Result<(u64, u64)> {
            self.last_seen_appended.store(last_block_appended, Ordering::SeqCst);
            let bytes: u64 = repaired.iter().map(|b| b.bytes.len() as u64).sum();
            Ok((bytes, repaired.len() as u64))
        }
    }

    let last_seen_appended = Arc::new(AtomicUsize::new(usize::MAX));
    let index: Box<dyn CompactableIndex> = Box::new(GrowingIndex {
        parent_pid: std::process::id(),
        base_last_block: vec![1; 16],
        last_seen_appended: Arc::clone(&last_seen_appended),
    });
    let mut indexes = vec![index];

    let errors = gc.run_cycle(&mut indexes).unwrap();
    assert_eq!(errors, vec![None]);
    assert_eq!(gc.stats().gc_numeric_nodes_missed, 1);
    assert_eq!(last_seen_appended.load(Ordering::SeqCst), 4);
}
