//! Linux kernel AIO engine
//!
//! Multiplexes caller-owned [`Op`]s onto a fixed-capacity kernel AIO context.
//!
//! # Features
//!
//! - One `io_submit` per request; submission never waits for the IO
//! - Blocking retrieval via `io_getevents` with optional timeout
//! - Pollable retrieval through an eventfd attached to every request
//!   (`IOCB_FLAG_RESFD`)
//! - Completion batches reuse an engine-owned buffer sized to capacity
//!
//! # Readiness accounting
//!
//! In pollable mode the kernel bumps the eventfd once per completed request.
//! `poll_completed` reads (and thereby resets) the counter and harvests
//! exactly that many events. Requests harvested through `wait` instead are
//! remembered as "unsignaled" and subtracted from later counter reads, so the
//! descriptor only stays readable while `poll_completed` has work to return.
//!
//! # Requirements
//!
//! - Linux with AIO support; capacity counts against `fs.aio-max-nr`
//! - Without `O_DIRECT` most filesystems complete reads synchronously inside
//!   `io_submit`, which is still correct, just not concurrent

use super::sys::{
    AioContext, EventFd, IoControlBlock, IoEvent, IOCB_CMD_FDSYNC, IOCB_CMD_FSYNC, IOCB_CMD_PREAD,
    IOCB_CMD_PWRITE, IOCB_FLAG_RESFD,
};
use super::{admit, check_wait, AioEngine, PollMode};
use crate::config::EngineConfig;
use crate::engine::op::{Completion, Op, OpKind};
use crate::error::{AioError, Result};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// Kernel AIO engine
pub struct AsyncIo {
    /// Kernel context, destroyed when the engine drops
    ctx: AioContext,

    capacity: usize,

    pending: usize,

    /// Readiness descriptor, present only in pollable mode
    poll_fd: Option<EventFd>,

    /// Completions harvested by `wait` whose eventfd signal was not yet read
    unsignaled: u64,

    /// Required alignment for buffer, length, and offset (direct IO)
    alignment: Option<usize>,

    /// Scratch space for `io_getevents` (reused across calls)
    events: Vec<IoEvent>,

    /// Completion batch handed back to the caller (reused across calls)
    completed: Vec<Completion>,
}

impl AsyncIo {
    /// Create an engine with room for `capacity` outstanding requests
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `capacity` is zero
    /// - `ResourceExhausted` if the kernel cannot allocate the context
    ///   (for example when `fs.aio-max-nr` is reached)
    /// - `Os` if the readiness descriptor cannot be created
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
        if let Some(align) = alignment {
            if !align.is_power_of_two() {
                return Err(AioError::InvalidArgument(format!(
                    "alignment {} is not a power of two",
                    align
                )));
            }
        }

        let ctx = AioContext::setup(capacity).map_err(|err| match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::ENOMEM) => AioError::ResourceExhausted(format!(
                "io_setup failed with capacity={}: {}",
                capacity, err
            )),
            _ => AioError::from_io(err, format!("io_setup failed with capacity={}", capacity)),
        })?;

        // Dropping `ctx` on error keeps construction all-or-nothing
        let poll_fd = match poll_mode {
            PollMode::Pollable => Some(
                EventFd::new().map_err(|err| AioError::from_io(err, "eventfd creation failed"))?,
            ),
            PollMode::NotPollable => None,
        };

        log::debug!("kernel aio context ready: capacity={} mode={}", capacity, poll_mode);

        Ok(Self {
            ctx,
            capacity,
            pending: 0,
            poll_fd,
            unsignaled: 0,
            alignment,
            events: vec![IoEvent::zeroed(); capacity],
            completed: Vec::with_capacity(capacity),
        })
    }

    /// Collect between `min` and `pending` events into `self.completed`
    fn harvest(&mut self, min: usize, max: usize, timeout: Option<Duration>) -> Result<usize> {
        self.completed.clear();
        if max == 0 {
            return Ok(0);
        }

        let count = self
            .ctx
            .get_events(min, &mut self.events[..max], timeout)
            .map_err(|err| AioError::from_io(err, "io_getevents failed"))?;

        for event in &self.events[..count] {
            // Safety: aio_data holds the address of a pending Op, which the
            // submission contract keeps alive and in place until now
            let op = unsafe { &mut *(event.data as *mut Op) };
            self.completed.push(op.complete(event.res));
        }

        debug_assert!(count <= self.pending);
        self.pending -= count;
        log::trace!("harvested {} completions, {} still pending", count, self.pending);
        Ok(count)
    }

    /// Credit completions taken by `wait` against the eventfd counter
    fn settle_readiness(&mut self, harvested: usize) -> Result<()> {
        let Some(efd) = &self.poll_fd else {
            return Ok(());
        };
        self.unsignaled += harvested as u64;
        if self.unsignaled == 0 {
            return Ok(());
        }

        let map_err = |err| AioError::from_io(err, "eventfd access failed");
        if let Some(count) = efd.take().map_err(map_err)? {
            let absorbed = count.min(self.unsignaled);
            self.unsignaled -= absorbed;
            let rest = count - absorbed;
            if rest > 0 {
                efd.add(rest).map_err(map_err)?;
            }
        }
        Ok(())
    }

    fn blocking_wait(&mut self, min: usize, timeout: Option<Duration>) -> Result<&[Completion]> {
        check_wait(min, self.pending)?;
        let count = self.harvest(min, self.pending, timeout)?;
        self.settle_readiness(count)?;
        Ok(&self.completed)
    }
}

impl AioEngine for AsyncIo {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn pending(&self) -> usize {
        self.pending
    }

    fn poll_mode(&self) -> PollMode {
        if self.poll_fd.is_some() {
            PollMode::Pollable
        } else {
            PollMode::NotPollable
        }
    }

    unsafe fn submit(&mut self, op: &mut Op) -> Result<()> {
        let req = admit(op, self.pending, self.capacity, self.alignment)?;

        let mut iocb = IoControlBlock::zeroed();
        iocb.data = op as *mut Op as u64;
        iocb.lio_opcode = match req.kind {
            OpKind::Read => IOCB_CMD_PREAD,
            OpKind::Write => IOCB_CMD_PWRITE,
            OpKind::Fsync => IOCB_CMD_FSYNC,
            OpKind::Fdatasync => IOCB_CMD_FDSYNC,
        };
        iocb.aio_fildes = req.fd as u32;
        iocb.buf = req.buf as u64;
        iocb.nbytes = req.len as u64;
        iocb.offset = req.offset as i64;
        if let Some(efd) = &self.poll_fd {
            iocb.flags = IOCB_FLAG_RESFD;
            iocb.aio_resfd = efd.as_raw_fd() as u32;
        }

        self.ctx
            .submit(&mut iocb)
            .map_err(|err| AioError::from_submit(err, req.kind))?;

        op.start();
        self.pending += 1;
        log::trace!(
            "submitted {} fd={} offset={} len={} ({} pending)",
            req.kind,
            req.fd,
            req.offset,
            req.len,
            self.pending
        );
        Ok(())
    }

    fn wait(&mut self, min_completions: usize) -> Result<&[Completion]> {
        self.blocking_wait(min_completions, None)
    }

    fn wait_timeout(&mut self, min_completions: usize, timeout: Duration) -> Result<&[Completion]> {
        self.blocking_wait(min_completions, Some(timeout))
    }

    fn poll_fd(&self) -> Option<RawFd> {
        self.poll_fd.as_ref().map(|efd| efd.as_raw_fd())
    }

    fn poll_completed(&mut self) -> Result<&[Completion]> {
        let signaled = match &self.poll_fd {
            Some(efd) => efd
                .take()
                .map_err(|err| AioError::from_io(err, "read from eventfd failed"))?,
            None => return Err(AioError::NotPollable),
        };

        let count = signaled.unwrap_or(0);
        let absorbed = count.min(self.unsignaled);
        self.unsignaled -= absorbed;
        let ready = (count - absorbed) as usize;

        if ready == 0 {
            if count > 0 {
                log::trace!("readiness consumed by earlier wait");
            }
            self.completed.clear();
            return Ok(&self.completed);
        }

        if ready > self.pending {
            log::warn!("eventfd reported {} completions with {} pending", ready, self.pending);
        }
        let ready = ready.min(self.pending);
        self.harvest(ready, ready, None)?;
        Ok(&self.completed)
    }
}

impl Drop for AsyncIo {
    fn drop(&mut self) {
        if self.pending > 0 {
            // The kernel still owns buffers of in-flight requests
            log::error!("destroying aio engine with {} requests pending", self.pending);
            std::process::abort();
        }
        log::debug!("destroying kernel aio context (capacity={})", self.capacity);
    }
}
