//! Synchronous fallback engine
//!
//! Executes each request with a blocking `pread`/`pwrite`/`fsync`/`fdatasync`
//! at submission and queues the outcome. The Op still goes through the full
//! idle -> pending -> completed cycle: it stays pending, and occupies a
//! capacity slot, until a retrieval call hands it back.
//!
//! Useful on hosts where kernel AIO is disabled (for example `fs.aio-max-nr`
//! exhausted or seccomp-filtered containers) and for exercising callers
//! without a kernel context.
//!
//! Like kernel AIO, each request is a single syscall: short reads are
//! reported as-is and never retried.
//!
//! # Example
//!
//! ```no_run
//! use diskaio::engine::{AioEngine, PollMode};
//! use diskaio::engine::sync::SyncIo;
//! use diskaio::engine::op::Op;
//!
//! let mut engine = SyncIo::new(4, PollMode::Pollable)?;
//! let mut op = Op::new();
//! let mut buf = vec![0u8; 4096];
//! unsafe { engine.pread(&mut op, 3, &mut buf, 0)? };
//!
//! // The request already ran; the descriptor is readable
//! let done = engine.poll_completed()?;
//! assert_eq!(done.len(), 1);
//! # Ok::<(), diskaio::AioError>(())
//! ```

use super::op::{Completion, Op, OpKind, Request};
use super::sys::EventFd;
use super::{admit, check_wait, AioEngine, PollMode};
use crate::config::EngineConfig;
use crate::error::{AioError, Result};
use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::time::Duration;

/// Blocking-syscall engine with the asynchronous engine contract
pub struct SyncIo {
    capacity: usize,

    /// Executed requests awaiting harvest, with their raw result
    ready: VecDeque<(NonNull<Op>, i64)>,

    /// Readiness descriptor, present only in pollable mode
    poll_fd: Option<EventFd>,

    alignment: Option<usize>,

    /// Completion batch handed back to the caller (reused across calls)
    completed: Vec<Completion>,
}

// Safety: the queued pointers refer to pending Ops, which the submission
// contract keeps alive and untouched until harvested.
unsafe impl Send for SyncIo {}

impl SyncIo {
    /// Create an engine with room for `capacity` outstanding requests
    pub fn new(capacity: usize, poll_mode: PollMode) -> Result<Self> {
        Self::with_alignment(capacity, poll_mode, None)
    }

    /// Create an engine from configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::with_alignment(config.capacity, config.poll_mode, config.alignment)
    }

    /// Create an engine that rejects requests not aligned to `alignment`
    pub fn with_alignment(
        capacity: usize,
        poll_mode: PollMode,
        alignment: Option<usize>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(AioError::InvalidArgument("capacity must be positive".to_string()));
        }
        let poll_fd = match poll_mode {
            PollMode::Pollable => Some(
                EventFd::new().map_err(|err| AioError::from_io(err, "eventfd creation failed"))?,
            ),
            PollMode::NotPollable => None,
        };

        Ok(Self {
            capacity,
            ready: VecDeque::with_capacity(capacity),
            poll_fd,
            alignment,
            completed: Vec::with_capacity(capacity),
        })
    }

    /// Run one request to completion, returning bytes or -errno
    ///
    /// # Safety
    ///
    /// `req.buf` must be valid for `req.len` bytes.
    unsafe fn execute(req: &Request) -> i64 {
        loop {
            let rc: isize = match req.kind {
                OpKind::Read => libc::pread(
                    req.fd,
                    req.buf as *mut libc::c_void,
                    req.len,
                    req.offset as libc::off_t,
                ),
                OpKind::Write => libc::pwrite(
                    req.fd,
                    req.buf as *const libc::c_void,
                    req.len,
                    req.offset as libc::off_t,
                ),
                OpKind::Fsync => libc::fsync(req.fd) as isize,
                OpKind::Fdatasync => libc::fdatasync(req.fd) as isize,
            };
            if rc >= 0 {
                return rc as i64;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return -(err.raw_os_error().unwrap_or(libc::EIO) as i64);
            }
        }
    }

    /// Move every queued result into `self.completed`
    fn harvest(&mut self) -> Result<usize> {
        self.completed.clear();
        while let Some((ptr, res)) = self.ready.pop_front() {
            // Safety: the Op is pending and pinned in place by the submission contract
            let op = unsafe { &mut *ptr.as_ptr() };
            self.completed.push(op.complete(res));
        }
        if let Some(efd) = &self.poll_fd {
            // Everything queued is now harvested; clear the readiness edge
            efd.take()
                .map_err(|err| AioError::from_io(err, "read from eventfd failed"))?;
        }
        log::trace!("harvested {} completions", self.completed.len());
        Ok(self.completed.len())
    }
}

impl AioEngine for SyncIo {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn pending(&self) -> usize {
        self.ready.len()
    }

    fn poll_mode(&self) -> PollMode {
        if self.poll_fd.is_some() {
            PollMode::Pollable
        } else {
            PollMode::NotPollable
        }
    }

    unsafe fn submit(&mut self, op: &mut Op) -> Result<()> {
        let req = admit(op, self.ready.len(), self.capacity, self.alignment)?;

        let res = Self::execute(&req);
        // Unlike io_submit, a blocking syscall reports a bad descriptor as
        // its result; surface it at submission like the kernel engine does
        if res == -(libc::EBADF as i64) {
            return Err(AioError::from_submit(
                std::io::Error::from_raw_os_error(libc::EBADF),
                req.kind,
            ));
        }

        // The request already ran, so it is queued even if signalling fails;
        // the next wait or poll_completed still drains it
        if let Some(efd) = &self.poll_fd {
            if let Err(err) = efd.add(1) {
                log::error!("{} completed but readiness signal failed: {}", req.kind, err);
            }
        }
        op.start();
        self.ready.push_back((NonNull::from(&mut *op), res));
        log::trace!("executed {} fd={} -> {}", req.kind, req.fd, res);
        Ok(())
    }

    fn wait(&mut self, min_completions: usize) -> Result<&[Completion]> {
        check_wait(min_completions, self.ready.len())?;
        self.harvest()?;
        Ok(&self.completed)
    }

    fn wait_timeout(&mut self, min_completions: usize, _timeout: Duration) -> Result<&[Completion]> {
        // Every queued request has already finished
        self.wait(min_completions)
    }

    fn poll_fd(&self) -> Option<RawFd> {
        self.poll_fd.as_ref().map(|efd| efd.as_raw_fd())
    }

    fn poll_completed(&mut self) -> Result<&[Completion]> {
        if self.poll_fd.is_none() {
            return Err(AioError::NotPollable);
        }
        self.harvest()?;
        Ok(&self.completed)
    }
}

impl Drop for SyncIo {
    fn drop(&mut self) {
        if !self.ready.is_empty() {
            log::error!("destroying sync engine with {} requests pending", self.ready.len());
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::op::OpState;
    use crate::engine::wait_readable;
    use crate::util::fixture::{expected_bytes, write_fixture};
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    #[test]
    fn test_sync_engine_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fixture.dat");
        write_fixture(&path, 64 * 1024, 7).unwrap();
        let file = File::open(&path).unwrap();

        let mut engine = SyncIo::new(3, PollMode::NotPollable).unwrap();
        let mut ops = [Op::new(), Op::new(), Op::new()];
        let sizes = [1024usize, 1024, 2048];
        let mut bufs: Vec<Vec<u8>> = sizes.iter().map(|&s| vec![0u8; s]).collect();

        for (op, buf) in ops.iter_mut().zip(bufs.iter_mut()) {
            unsafe { engine.pread(op, file.as_raw_fd(), buf, 512).unwrap() };
        }
        assert_eq!(engine.pending(), 3);
        assert!(ops.iter().all(|op| op.state() == OpState::Pending));

        let total: usize = engine.wait(1).unwrap().iter().map(|c| c.bytes().unwrap()).sum();
        assert_eq!(total, 1024 + 1024 + 2048);
        assert_eq!(engine.pending(), 0);

        for ((op, buf), &size) in ops.iter().zip(&bufs).zip(&sizes) {
            assert_eq!(op.result().unwrap(), size as i64);
            assert_eq!(buf, &expected_bytes(7, 512, size));
        }
    }

    #[test]
    fn test_sync_engine_zero_length() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.dat");
        std::fs::write(&path, b"").unwrap();
        let file = File::open(&path).unwrap();

        let mut engine = SyncIo::new(1, PollMode::NotPollable).unwrap();
        let mut op = Op::new();
        unsafe { engine.pread(&mut op, file.as_raw_fd(), &mut [], 0).unwrap() };
        assert_eq!(op.state(), OpState::Pending);
        assert_eq!(engine.wait(1).unwrap().len(), 1);
        assert_eq!(op.result().unwrap(), 0);
    }

    #[test]
    fn test_sync_engine_pollable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("poll.dat");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();

        let mut engine = SyncIo::new(2, PollMode::Pollable).unwrap();
        let fd = engine.poll_fd().unwrap();
        assert!(!wait_readable(fd, 0).unwrap());

        let data = b"sync engine payload";
        let mut op = Op::with_tag(5);
        unsafe { engine.pwrite(&mut op, file.as_raw_fd(), data, 0).unwrap() };
        assert!(wait_readable(fd, 0).unwrap());

        let batch = engine.poll_completed().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].tag(), 5);
        assert!(!wait_readable(fd, 0).unwrap());
        assert!(engine.poll_completed().unwrap().is_empty());

        assert_eq!(op.io_result().unwrap(), data.len());
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_executed_write_is_queued_when_signal_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("saturated.dat");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();

        let mut engine = SyncIo::new(1, PollMode::Pollable).unwrap();
        // Counter at its ceiling: a further add fails with EAGAIN
        engine.poll_fd.as_ref().unwrap().add(u64::MAX - 1).unwrap();

        let data = b"written before signalling";
        let mut op = Op::new();
        unsafe { engine.pwrite(&mut op, file.as_raw_fd(), data, 0).unwrap() };
        assert_eq!(op.state(), OpState::Pending);
        assert_eq!(engine.pending(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), data);

        let batch = engine.poll_completed().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].is(&op));
        assert_eq!(op.io_result().unwrap(), data.len());
        assert!(!wait_readable(engine.poll_fd().unwrap(), 0).unwrap());
    }

    #[test]
    fn test_sync_engine_failure_is_a_completion() {
        let temp_dir = TempDir::new().unwrap();
        let dir = File::open(temp_dir.path()).unwrap();

        let mut engine = SyncIo::new(1, PollMode::NotPollable).unwrap();
        let mut op = Op::new();
        let mut buf = vec![0u8; 16];

        // Reading a directory fails with EISDIR after submission
        unsafe { engine.pread(&mut op, dir.as_raw_fd(), &mut buf, 0).unwrap() };
        assert_eq!(engine.wait(1).unwrap().len(), 1);
        assert_eq!(op.result().unwrap(), -(libc::EISDIR as i64));
        assert!(matches!(
            op.io_result(),
            Err(AioError::OperationFailed { errno, .. }) if errno == libc::EISDIR
        ));
    }

    #[test]
    fn test_sync_engine_capacity_and_bad_fd() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cap.dat");
        write_fixture(&path, 4096, 1).unwrap();
        let file = File::open(&path).unwrap();

        let mut engine = SyncIo::new(1, PollMode::NotPollable).unwrap();
        let mut first = Op::new();
        let mut second = Op::new();
        let mut buf1 = vec![0u8; 512];
        let mut buf2 = vec![0u8; 512];

        unsafe {
            engine.pread(&mut first, file.as_raw_fd(), &mut buf1, 0).unwrap();
            assert!(matches!(
                engine.pread(&mut second, file.as_raw_fd(), &mut buf2, 0),
                Err(AioError::ResourceExhausted(_))
            ));
        }
        assert_eq!(engine.pending(), 1);
        engine.wait(1).unwrap();

        let write_only = File::create(temp_dir.path().join("wo.dat")).unwrap();
        assert!(matches!(
            unsafe { engine.pread(&mut second, write_only.as_raw_fd(), &mut buf2, 0) },
            Err(AioError::InvalidArgument(_))
        ));
        assert_eq!(second.state(), OpState::Idle);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_sync_engine_not_pollable() {
        let mut engine = SyncIo::new(1, PollMode::NotPollable).unwrap();
        assert!(engine.poll_fd().is_none());
        assert!(matches!(engine.poll_completed(), Err(AioError::NotPollable)));
        assert!(engine.wait(0).unwrap().is_empty());
        assert!(matches!(engine.wait(1), Err(AioError::InvalidArgument(_))));
    }
}
