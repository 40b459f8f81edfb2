// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fork-based garbage collection: a copy-on-write child process scans the
//! inverted index for garbage while the parent keeps serving traffic, then
//! reports repairs back over a pipe for the parent to apply.

pub mod pipe;

use std::io::{BufReader, BufWriter};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, pipe, ForkResult};

use crate::{ErrorKind, Result};

use pipe::{Header, IndexInfo, Message, RepairedBlock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FgcState {
    Idle,
    WaitFork,
    Scanning,
    WaitApply,
    Applying,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PauseFlags(u8);

impl PauseFlags {
    pub const UNPAUSED: Self = Self(0);
    pub const PAUSE_CHILD: Self = Self(0b01);
    pub const PAUSE_PARENT: Self = Self(0b10);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ForkGcStats {
    pub total_collected: u64,
    pub num_cycles: u64,
    pub total_ms_run: u64,
    pub last_run_time_ms: u64,
    /// Incremented when the last block's repair is discarded because the
    /// parent appended to it after the child's snapshot was taken.
    pub gc_numeric_nodes_missed: u64,
    pub gc_blocks_denied: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FgcError {
    ChildError,
    ParentError,
}

/// A block of an inverted index as the GC sees it: enough to decide whether it's
/// worth repairing and to describe the repair back to the parent.
#[derive(Clone, Debug)]
pub struct BlockSnapshot {
    pub index: u32,
    pub garbage_ratio: f64,
    pub bytes: Vec<u8>,
    pub is_last: bool,
}

/// A single term/numeric/tag index, as exposed to the GC. The parent holds the
/// live instance; the child only ever sees an immutable copy-on-write snapshot.
pub trait CompactableIndex: Send {
    fn unique_id(&self) -> u64;
    fn snapshot(&self) -> Vec<BlockSnapshot>;

    /// Applies the child's findings. `last_block_appended` is how many new byte
    /// ranges the parent wrote to the last block since the child's snapshot was
    /// taken; those bytes must be preserved rather than overwritten.
    fn apply(
        &mut self,
        repaired: Vec<RepairedBlock>,
        deleted: Vec<u32>,
        last_block_appended: usize,
    ) -> Result<(u64, u64)>;
}

pub struct ForkGc {
    state: FgcState,
    pause: PauseFlags,
    stats: ForkGcStats,
    retry_interval: Duration,
    clean_threshold: f64,
    deleted_docs_from_last_run: u64,
    should_stop: bool,
}

impl ForkGc {
    pub fn new(config: &crate::config::ServerConfig) -> Self {
        Self {
            state: FgcState::Idle,
            pause: PauseFlags::UNPAUSED,
            stats: ForkGcStats::default(),
            retry_interval: config.fork_gc_retry_interval,
            clean_threshold: config.fork_gc_clean_threshold,
            deleted_docs_from_last_run: 0,
            should_stop: false,
        }
    }

    pub fn state(&self) -> FgcState {
        self.state
    }

    pub fn stats(&self) -> ForkGcStats {
        self.stats
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn clean_threshold(&self) -> f64 {
        self.clean_threshold
    }

    /// Whether a block is worth compacting, per the configured garbage ratio floor.
    pub fn is_worth_collecting(&self, garbage_ratio: f64) -> bool {
        garbage_ratio >= self.clean_threshold
    }

    pub fn record_deleted_docs(&mut self, count: u64) {
        self.deleted_docs_from_last_run = count;
    }

    pub fn deleted_docs_from_last_run(&self) -> u64 {
        self.deleted_docs_from_last_run
    }

    pub fn pause(&mut self, flags: PauseFlags) {
        self.pause.insert(flags);
    }

    pub fn unpause(&mut self, flags: PauseFlags) {
        self.pause.remove(flags);
    }

    /// Blocks (spins) until `PAUSE_CHILD` is cleared; a testing hook mirroring the
    /// `WaitAtFork` rendezvous point right before the parent calls `fork()`.
    pub fn wait_at_fork(&self) {
        while self.pause.contains(PauseFlags::PAUSE_CHILD) {
            std::thread::yield_now();
        }
    }

    /// Same rendezvous, but right before the parent starts applying results.
    pub fn wait_at_apply(&self) {
        while self.pause.contains(PauseFlags::PAUSE_PARENT) {
            std::thread::yield_now();
        }
    }

    pub fn request_stop(&mut self) {
        self.should_stop = true;
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop
    }

    /// Runs one collection cycle over `indexes`. Returns per-index errors rather
    /// than aborting the whole cycle, matching the original's "skip the bad one,
    /// keep going" behavior on `PARENT_ERROR`.
    pub fn run_cycle(&mut self, indexes: &mut [Box<dyn CompactableIndex>]) -> Result<Vec<Option<FgcError>>> {
        let started = Instant::now();
        self.state = FgcState::WaitFork;
        self.wait_at_fork();

        let (read_fd, write_fd) = pipe().map_err(|e| ErrorKind::Io.with_source(e))?;

        self.state = FgcState::Scanning;
        // SAFETY: the child immediately closes its copy of `read_fd` and does not
        // touch any Rust state shared with the parent beyond what it already
        // forked with (copy-on-write snapshots, never mutated by the parent
        // concurrently with the child's view of them).
        let errors = match unsafe { fork() }.map_err(|e| ErrorKind::Io.with_source(e))? {
            ForkResult::Child => {
                close(read_fd.as_raw_fd()).ok();
                // SAFETY: the child process is single-threaded from this point
                // until it exits; no Rust destructors from the parent's side run here.
                let child_result = unsafe { run_child(write_fd.as_raw_fd(), indexes) };
                drop(write_fd);
                std::process::exit(if child_result.is_ok() { 0 } else { 1 });
            }
            ForkResult::Parent { child } => {
                drop(write_fd);
                self.state = FgcState::WaitApply;
                self.wait_at_apply();
                self.state = FgcState::Applying;

                let errors = run_parent(read_fd, indexes, &mut self.stats);

                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, 0)) => {}
                    _ => self.stats.gc_blocks_denied += 1,
                }

                self.state = FgcState::Idle;
                self.stats.num_cycles += 1;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.stats.last_run_time_ms = elapsed_ms;
                self.stats.total_ms_run += elapsed_ms;
                errors
            }
        };
        Ok(errors)
    }
}

/// # Safety
/// Must only run in the freshly forked child, before any other Rust code executes.
unsafe fn run_child(write_fd: std::os::fd::RawFd, indexes: &[Box<dyn CompactableIndex>]) -> Result<()> {
    let file = std::fs::File::from_raw_fd(write_fd);
    let mut writer = BufWriter::new(file);
    for index in indexes {
        let blocks = index.snapshot();
        pipe::send(
            &mut writer,
            &Message::Header(Header { unique_id: index.unique_id(), cur_ptr: 0 }),
        )?;
        let mut repaired = 0u32;
        let mut bytes_collected = 0u64;
        let mut docs_collected = 0u64;
        // Size of the last block as this snapshot saw it; the parent diffs this
        // against the block's current size to learn what was appended since fork.
        let last_block_num_docs = blocks.iter().find(|b| b.is_last).map(|b| b.bytes.len() as u64).unwrap_or(0);
        for block in &blocks {
            if block.garbage_ratio <= 0.0 {
                continue;
            }
            repaired += 1;
            bytes_collected += (block.bytes.len() as f64 * block.garbage_ratio) as u64;
            docs_collected += 1;
            pipe::send(
                &mut writer,
                &Message::RepairedBlock(RepairedBlock {
                    old_index: block.index,
                    new_index: block.index,
                    bytes: block.bytes.clone(),
                }),
            )?;
        }
        pipe::send(
            &mut writer,
            &Message::IndexInfo(IndexInfo {
                nblocks_original: blocks.len() as u32,
                nblocks_repaired: repaired,
                nbytes_collected: bytes_collected,
                ndocs_collected: docs_collected,
                last_block_num_docs,
                ..Default::default()
            }),
        )?;
        pipe::send(&mut writer, &Message::Terminator)?;
    }
    Ok(())
}

fn run_parent(
    read_fd: OwnedFd,
    indexes: &mut [Box<dyn CompactableIndex>],
    stats: &mut ForkGcStats,
) -> Vec<Option<FgcError>> {
    let file = std::fs::File::from(read_fd);
    let mut reader = BufReader::new(file);
    let mut errors = Vec::with_capacity(indexes.len());

    for index in indexes {
        let result = parent_handle_one_index(&mut reader, index.as_mut(), stats);
        errors.push(result.err());
    }
    errors
}

fn parent_handle_one_index(
    reader: &mut impl std::io::Read,
    index: &mut dyn CompactableIndex,
    stats: &mut ForkGcStats,
) -> std::result::Result<(), FgcError> {
    let header = match pipe::recv(reader) {
        Ok(Message::Header(h)) => h,
        _ => return Err(FgcError::ChildError),
    };
    if header.unique_id != index.unique_id() {
        // The index was swapped out from under us between fork and apply.
        stats.gc_blocks_denied += 1;
        return Err(FgcError::ParentError);
    }

    let mut repaired = Vec::new();
    let mut deleted = Vec::new();
    loop {
        match pipe::recv(reader) {
            Ok(Message::RepairedBlock(b)) => repaired.push(b),
            Ok(Message::DeletedBlock(b)) => deleted.push(b),
            Ok(Message::IndexInfo(info)) => {
                match pipe::recv(reader) {
                    Ok(Message::Terminator) => {}
                    _ => return Err(FgcError::ChildError),
                }

                // The last block may have grown since the child's snapshot (the
                // parent keeps serving writes while the child scans). Diff the
                // live size against what the child saw, and if it grew, the
                // child's repair of that block is stale and must be discarded
                // rather than applied over newly written data.
                let current_last_block = index.snapshot().into_iter().find(|b| b.is_last);
                let last_block_appended = current_last_block
                    .as_ref()
                    .map(|b| (b.bytes.len() as u64).saturating_sub(info.last_block_num_docs))
                    .unwrap_or(0);
                if last_block_appended > 0 {
                    if let Some(last_block) = &current_last_block {
                        if let Some(pos) = repaired.iter().position(|b| b.old_index == last_block.index) {
                            repaired.remove(pos);
                            stats.gc_numeric_nodes_missed += 1;
                        }
                    }
                }

                let deleted_indices: Vec<u32> = deleted.iter().map(|d| d.old_index).collect();
                let (bytes, _docs) = index
                    .apply(repaired, deleted_indices, last_block_appended as usize)
                    .map_err(|_| FgcError::ParentError)?;
                stats.total_collected += bytes.max(info.nbytes_collected);
                return Ok(());
            }
            _ => return Err(FgcError::ChildError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_flags_are_independent() {
        let mut flags = PauseFlags::UNPAUSED;
        flags.insert(PauseFlags::PAUSE_CHILD);
        assert!(flags.contains(PauseFlags::PAUSE_CHILD));
        assert!(!flags.contains(PauseFlags::PAUSE_PARENT));
        flags.insert(PauseFlags::PAUSE_PARENT);
        flags.remove(PauseFlags::PAUSE_CHILD);
        assert!(!flags.contains(PauseFlags::PAUSE_CHILD));
        assert!(flags.contains(PauseFlags::PAUSE_PARENT));
    }

    #[test]
    fn new_gc_starts_idle_and_unpaused() {
        let config = crate::config::ServerConfig::default();
        let gc = ForkGc::new(&config);
        assert_eq!(gc.state(), FgcState::Idle);
        assert_eq!(gc.stats().num_cycles, 0);
    }
}
