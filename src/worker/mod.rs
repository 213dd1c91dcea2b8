//! Read-loop driver
//!
//! Keeps an engine's queue full of positioned reads over one file. Each queue
//! slot owns an [`Op`] and an aligned buffer; when a slot's completion is
//! harvested the Op is reset and resubmitted for the next block until the
//! requested number of reads has been issued.
//!
//! Completions are retrieved with a blocking `wait(1)` or, for pollable
//! engines, by polling the readiness descriptor and draining
//! `poll_completed`. Latencies, short reads, errors, and optional fixture
//! checks are accumulated into [`ReadStats`].
//!
//! # Example
//!
//! ```no_run
//! use diskaio::engine::{libaio::AsyncIo, PollMode};
//! use diskaio::worker::{run_reads, ReadPlan};
//! use std::os::unix::io::AsRawFd;
//!
//! let file = std::fs::File::open("/var/tmp/fixture.dat")?;
//! let size = file.metadata()?.len();
//! let mut engine = AsyncIo::new(32, PollMode::Pollable)?;
//!
//! let plan = ReadPlan::new(size, 4096);
//! let stats = run_reads(&mut engine, file.as_raw_fd(), &plan)?;
//! println!("{} reads, {} bytes", stats.ops, stats.bytes);
//! # Ok::<(), anyhow::Error>(())
//! ```

use crate::engine::op::Op;
use crate::engine::{wait_readable, AioEngine, PollMode};
use crate::stats::ReadStats;
use crate::util::buffer::AlignedBuffer;
use crate::util::fixture;
use anyhow::{Context, Result};
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Default alignment of slot buffers (one page)
pub const BUFFER_ALIGNMENT: usize = 4096;

/// How long one readiness poll blocks before it is retried
const POLL_TIMEOUT_MS: i32 = 1000;

/// Parameters of a read run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    /// Bytes requested per read
    pub block_size: usize,
    /// Total reads to issue; offsets wrap around the file
    pub count: u64,
    /// Size of the file being read
    pub file_size: u64,
    /// Alignment of slot buffers
    pub alignment: usize,
    /// Seed of the fixture the file is expected to hold
    pub verify_seed: Option<u64>,
}

impl ReadPlan {
    /// A plan that reads the whole file once in `block_size` pieces
    pub fn new(file_size: u64, block_size: usize) -> Self {
        let mut plan = Self {
            block_size,
            count: 0,
            file_size,
            alignment: BUFFER_ALIGNMENT,
            verify_seed: None,
        };
        plan.count = plan.blocks();
        plan
    }

    /// Number of distinct block offsets in the file
    pub fn blocks(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.block_size as u64)
    }

    /// File offset of the `index`-th read
    pub fn offset_of(&self, index: u64) -> u64 {
        (index % self.blocks()) * self.block_size as u64
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            anyhow::bail!("block size must be greater than zero");
        }
        if self.count > 0 && self.file_size == 0 {
            anyhow::bail!("cannot issue {} reads against an empty file", self.count);
        }
        if !self.alignment.is_power_of_two() {
            anyhow::bail!("buffer alignment {} is not a power of two", self.alignment);
        }
        Ok(())
    }
}

/// One queue position: an Op and the buffer it reads into
struct Slot {
    op: Op,
    buffer: AlignedBuffer,
    offset: u64,
    submitted: Instant,
}

struct ReadLoop<'a> {
    engine: &'a mut dyn AioEngine,
    fd: RawFd,
    plan: &'a ReadPlan,
    slots: Vec<Slot>,
    ready: Vec<(u64, i64)>,
    issued: u64,
    stats: ReadStats,
}

impl<'a> ReadLoop<'a> {
    fn new(engine: &'a mut dyn AioEngine, fd: RawFd, plan: &'a ReadPlan) -> Self {
        let depth = usize::try_from(plan.count)
            .unwrap_or(usize::MAX)
            .min(engine.capacity());

        // Slots are never added or removed after this point
        let slots = (0..depth)
            .map(|i| Slot {
                op: Op::with_tag(i as u64),
                buffer: AlignedBuffer::new(plan.block_size, plan.alignment),
                offset: 0,
                submitted: Instant::now(),
            })
            .collect();

        Self {
            engine,
            fd,
            plan,
            slots,
            ready: Vec::with_capacity(depth),
            issued: 0,
            stats: ReadStats::new(),
        }
    }

    fn run(&mut self) -> Result<()> {
        for idx in 0..self.slots.len() {
            self.submit(idx)?;
        }
        while self.engine.pending() > 0 {
            self.harvest()?;
        }
        Ok(())
    }

    fn submit(&mut self, idx: usize) -> Result<()> {
        let offset = self.plan.offset_of(self.issued);
        let slot = &mut self.slots[idx];
        slot.offset = offset;
        slot.submitted = Instant::now();

        // Safety: the slot lives in `self.slots`, which never reallocates, and
        // neither its Op nor its buffer is touched until the Op is harvested
        unsafe {
            self.engine
                .pread(&mut slot.op, self.fd, slot.buffer.as_mut_slice(), offset)
        }
        .with_context(|| format!("Failed to submit read at offset {}", offset))?;

        self.issued += 1;
        Ok(())
    }

    /// Retrieve one batch and recycle its slots
    fn harvest(&mut self) -> Result<()> {
        self.ready.clear();
        let batch = match self.engine.poll_mode() {
            PollMode::Pollable => {
                let fd = self
                    .engine
                    .poll_fd()
                    .context("pollable engine has no readiness descriptor")?;
                if !wait_readable(fd, POLL_TIMEOUT_MS).context("poll on readiness descriptor failed")? {
                    log::debug!(
                        "no completions within {} ms, {} pending",
                        POLL_TIMEOUT_MS,
                        self.engine.pending()
                    );
                    return Ok(());
                }
                self.engine.poll_completed()?
            }
            PollMode::NotPollable => self.engine.wait(1)?,
        };
        self.ready.extend(batch.iter().map(|c| (c.tag(), c.result())));
        log::trace!("harvested {} completions", self.ready.len());

        for i in 0..self.ready.len() {
            let (tag, result) = self.ready[i];
            let idx = tag as usize;
            self.complete(idx, result)?;
            if self.issued < self.plan.count {
                self.submit(idx)?;
            }
        }
        Ok(())
    }

    fn complete(&mut self, idx: usize, result: i64) -> Result<()> {
        let slot = self
            .slots
            .get_mut(idx)
            .with_context(|| format!("completion for unknown slot {}", idx))?;

        self.stats
            .record(result, self.plan.block_size, slot.submitted.elapsed());
        if result < 0 {
            log::warn!("{}", slot.op);
        } else if let Some(seed) = self.plan.verify_seed {
            let got = &slot.buffer.as_slice()[..result as usize];
            if let Some(pos) = fixture::first_mismatch(seed, slot.offset, got) {
                self.stats.verify_failures += 1;
                log::warn!(
                    "content mismatch at byte {} of read at offset {}",
                    pos,
                    slot.offset
                );
            }
        }

        slot.op.reset()?;
        Ok(())
    }

    /// Harvest everything still outstanding so no slot is dropped pending
    fn drain(&mut self) {
        while self.engine.pending() > 0 {
            let pending = self.engine.pending();
            if let Err(err) = self.engine.wait(pending) {
                log::error!("failed to drain {} outstanding reads: {}", pending, err);
                return;
            }
        }
    }
}

/// Issue `plan.count` reads of `fd` through `engine`, keeping up to
/// `engine.capacity()` of them in flight
///
/// The engine must have nothing pending on entry. Every read has been
/// harvested when this returns, including on error.
pub fn run_reads(engine: &mut dyn AioEngine, fd: RawFd, plan: &ReadPlan) -> Result<ReadStats> {
    plan.validate()?;
    if engine.pending() != 0 {
        anyhow::bail!("engine already has {} requests pending", engine.pending());
    }
    log::info!(
        "reading {} blocks of {} bytes with {} in flight ({})",
        plan.count,
        plan.block_size,
        engine.capacity(),
        engine.poll_mode()
    );

    let start = Instant::now();
    let mut read_loop = ReadLoop::new(engine, fd, plan);
    if let Err(err) = read_loop.run() {
        read_loop.drain();
        return Err(err);
    }

    let mut stats = read_loop.stats;
    stats.elapsed = start.elapsed();
    log::info!(
        "completed {} reads ({} bytes) in {:.3}s",
        stats.ops,
        stats.bytes,
        stats.elapsed.as_secs_f64()
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::libaio::AsyncIo;
    use crate::engine::sync::SyncIo;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const SEED: u64 = 42;

    fn fixture_file(size: u64) -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fixture.dat");
        fixture::write_fixture(&path, size, SEED).unwrap();
        (temp_dir, path)
    }

    fn verified_run(engine: &mut dyn AioEngine, size: u64, block_size: usize) -> ReadStats {
        let (_dir, path) = fixture_file(size);
        let file = File::open(&path).unwrap();
        let mut plan = ReadPlan::new(size, block_size);
        plan.verify_seed = Some(SEED);
        run_reads(engine, file.as_raw_fd(), &plan).unwrap()
    }

    #[test]
    fn test_plan_offsets_wrap() {
        let plan = ReadPlan::new(10_000, 4096);
        assert_eq!(plan.blocks(), 3);
        assert_eq!(plan.count, 3);
        assert_eq!(plan.offset_of(0), 0);
        assert_eq!(plan.offset_of(2), 8192);
        assert_eq!(plan.offset_of(3), 0);
        assert_eq!(plan.offset_of(7), 4096);
    }

    #[test]
    fn test_plan_validation() {
        assert!(ReadPlan::new(4096, 0).validate().is_err());
        let mut plan = ReadPlan::new(0, 4096);
        assert!(plan.validate().is_ok());
        plan.count = 1;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_kernel_blocking_reads() {
        let mut engine = AsyncIo::new(8, PollMode::NotPollable).unwrap();
        let stats = verified_run(&mut engine, 256 * 1024, 4096);
        assert_eq!(stats.ops, 64);
        assert_eq!(stats.bytes, 256 * 1024);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.verify_failures, 0);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_kernel_pollable_reads() {
        let mut engine = AsyncIo::new(16, PollMode::Pollable).unwrap();
        let stats = verified_run(&mut engine, 256 * 1024, 8192);
        assert_eq!(stats.ops, 32);
        assert_eq!(stats.bytes, 256 * 1024);
        assert_eq!(stats.verify_failures, 0);
        assert_eq!(stats.latency.len(), 32);
    }

    #[test]
    fn test_sync_backend_reads() {
        let mut engine = SyncIo::new(4, PollMode::Pollable).unwrap();
        let stats = verified_run(&mut engine, 64 * 1024, 4096);
        assert_eq!(stats.ops, 16);
        assert_eq!(stats.verify_failures, 0);

        let mut engine = SyncIo::new(4, PollMode::NotPollable).unwrap();
        let stats = verified_run(&mut engine, 64 * 1024, 4096);
        assert_eq!(stats.bytes, 64 * 1024);
    }

    #[test]
    fn test_partial_tail_block_is_short() {
        let mut engine = AsyncIo::new(4, PollMode::NotPollable).unwrap();
        let stats = verified_run(&mut engine, 10_000, 4096);
        assert_eq!(stats.ops, 3);
        assert_eq!(stats.bytes, 10_000);
        assert_eq!(stats.short_reads, 1);
        assert_eq!(stats.verify_failures, 0);
    }

    #[test]
    fn test_count_beyond_file_wraps() {
        let (_dir, path) = fixture_file(32 * 1024);
        let file = File::open(&path).unwrap();
        let mut plan = ReadPlan::new(32 * 1024, 4096);
        plan.count = 100;
        plan.verify_seed = Some(SEED);

        let mut engine = AsyncIo::new(64, PollMode::Pollable).unwrap();
        let stats = run_reads(&mut engine, file.as_raw_fd(), &plan).unwrap();
        assert_eq!(stats.ops, 100);
        assert_eq!(stats.bytes, 100 * 4096);
        assert_eq!(stats.verify_failures, 0);
    }

    #[test]
    fn test_verification_cost_follows_reads_not_file_size() {
        let (_dir, path) = fixture_file(32 * 1024);
        let file = File::open(&path).unwrap();

        // A plan for a 64 GiB file that only touches its first 8 blocks
        let mut plan = ReadPlan::new(64 << 30, 4096);
        plan.count = 8;
        plan.verify_seed = Some(SEED);

        let mut engine = AsyncIo::new(4, PollMode::Pollable).unwrap();
        let stats = run_reads(&mut engine, file.as_raw_fd(), &plan).unwrap();
        assert_eq!(stats.ops, 8);
        assert_eq!(stats.bytes, 32 * 1024);
        assert_eq!(stats.verify_failures, 0);
    }

    #[test]
    fn test_wrong_seed_fails_verification() {
        let (_dir, path) = fixture_file(16 * 1024);
        let file = File::open(&path).unwrap();
        let mut plan = ReadPlan::new(16 * 1024, 4096);
        plan.verify_seed = Some(SEED + 1);

        let mut engine = AsyncIo::new(4, PollMode::NotPollable).unwrap();
        let stats = run_reads(&mut engine, file.as_raw_fd(), &plan).unwrap();
        assert_eq!(stats.verify_failures, 4);
    }

    #[test]
    fn test_submit_failure_drains_queue() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("write-only.dat");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();

        let plan = ReadPlan::new(8192, 4096);
        let mut engine = AsyncIo::new(4, PollMode::NotPollable).unwrap();
        assert!(run_reads(&mut engine, file.as_raw_fd(), &plan).is_err());
        assert_eq!(engine.pending(), 0);
    }
}
