//! Asynchronous IO engine abstraction
//!
//! An engine accepts caller-owned [`Op`] requests, hands them to the kernel
//! without blocking on the IO itself, and later returns them as completion
//! batches. Two retrieval models are offered over the same queue:
//!
//! - **Blocking**: [`AioEngine::wait`] returns once at least N requests finished
//!   (`wait(0)` is a non-blocking probe).
//! - **Pollable**: in [`PollMode::Pollable`] the engine exposes a readiness
//!   descriptor ([`AioEngine::poll_fd`]) for an external poll/epoll loop and
//!   [`AioEngine::poll_completed`] drains whatever is ready.
//!
//! # Backends
//!
//! - **Kernel** ([`libaio::AsyncIo`]): Linux native AIO (`io_setup`/`io_submit`/
//!   `io_getevents`), with an eventfd registered per request in pollable mode
//! - **Sync** ([`sync::SyncIo`]): executes the request with blocking syscalls at
//!   submission and queues the result, for hosts without kernel AIO
//!
//! # Example
//!
//! ```no_run
//! use diskaio::engine::{AioEngine, PollMode};
//! use diskaio::engine::libaio::AsyncIo;
//! use diskaio::engine::op::Op;
//! use std::os::unix::io::AsRawFd;
//!
//! let file = std::fs::File::open("/etc/hostname")?;
//! let mut engine = AsyncIo::new(8, PollMode::NotPollable)?;
//! let mut op = Op::new();
//! let mut buf = vec![0u8; 512];
//!
//! // Safety: `op` and `buf` outlive the wait below and are not touched meanwhile
//! unsafe { engine.pread(&mut op, file.as_raw_fd(), &mut buf, 0)? };
//! let done = engine.wait(1)?;
//! assert!(done[0].is(&op));
//! println!("read {} bytes", op.result()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::EngineConfig;
use crate::error::{AioError, Result};
use op::{Completion, Op, OpKind, OpState, Request};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub mod libaio;
pub mod op;
pub mod sync;
mod sys;

pub use sys::wait_readable;

/// How completions are retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Expose a readiness descriptor and `poll_completed`
    Pollable,
    /// Completions are retrieved with `wait` only
    NotPollable,
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollMode::Pollable => write!(f, "pollable"),
            PollMode::NotPollable => write!(f, "not_pollable"),
        }
    }
}

/// Engine implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Linux kernel AIO
    Kernel,
    /// Blocking syscalls executed at submission
    Sync,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Kernel => write!(f, "kernel"),
            Backend::Sync => write!(f, "sync"),
        }
    }
}

/// Capability interface shared by all engine backends
///
/// # Thread Safety
///
/// Engines are `Send` but not `Sync`. Submission and retrieval on one
/// instance from several threads must be serialised by the caller.
///
/// # Completion batches
///
/// `wait`, `wait_timeout`, and `poll_completed` return a view into an
/// engine-owned scratch buffer. The view borrows the engine, so it has to be
/// dropped before the next call. Every Op in a batch is already `Completed`
/// and each submitted Op appears in exactly one batch.
pub trait AioEngine: Send {
    /// Maximum number of simultaneously outstanding requests
    fn capacity(&self) -> usize;

    /// Requests submitted but not yet harvested
    fn pending(&self) -> usize;

    /// Retrieval mode chosen at construction
    fn poll_mode(&self) -> PollMode;

    /// Submit an Op whose parameters were bound with [`Op::bind`]
    ///
    /// On success the Op is pending and `pending()` grew by one. On failure
    /// nothing changed and the Op is still idle.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the Op is not idle or has nothing bound
    /// - `ResourceExhausted` if `pending() == capacity()`
    /// - `InvalidArgument` if the request was rejected (bad descriptor,
    ///   misaligned direct IO)
    ///
    /// # Safety
    ///
    /// Until the Op is returned by a retrieval call:
    /// - the Op must not be moved, dropped, or otherwise accessed
    /// - the bound buffer must stay allocated, and must not be written (for
    ///   writes) or read or written (for reads) by anyone but the kernel
    unsafe fn submit(&mut self, op: &mut Op) -> Result<()>;

    /// Block until at least `min_completions` requests finished
    ///
    /// `wait(0)` never blocks and may return an empty batch.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `min_completions > pending()`, since such a wait
    /// could never return.
    fn wait(&mut self, min_completions: usize) -> Result<&[Completion]>;

    /// Like `wait`, but gives up after `timeout`
    ///
    /// A timed-out wait returns whatever completed in the meantime, possibly
    /// nothing; the remaining requests stay pending.
    fn wait_timeout(&mut self, min_completions: usize, timeout: Duration) -> Result<&[Completion]>;

    /// Readiness descriptor, readable while completions wait to be drained
    ///
    /// `None` unless the engine was built in pollable mode.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Drain every completion that is ready without blocking
    ///
    /// May return an empty batch after a spurious wakeup.
    ///
    /// # Errors
    ///
    /// `NotPollable` if the engine has no readiness descriptor.
    fn poll_completed(&mut self) -> Result<&[Completion]>;

    /// Bind and submit a positioned read into `buf`
    ///
    /// # Safety
    ///
    /// See [`AioEngine::submit`]; `buf` is loaned to the kernel until `op`
    /// is harvested.
    unsafe fn pread(&mut self, op: &mut Op, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<()> {
        self.submit_request(op, OpKind::Read, fd, buf.as_mut_ptr(), buf.len(), offset)
    }

    /// Bind and submit a positioned write from `buf`
    ///
    /// # Safety
    ///
    /// See [`AioEngine::submit`]; `buf` must not change until `op` is harvested.
    unsafe fn pwrite(&mut self, op: &mut Op, fd: RawFd, buf: &[u8], offset: u64) -> Result<()> {
        self.submit_request(op, OpKind::Write, fd, buf.as_ptr() as *mut u8, buf.len(), offset)
    }

    /// Bind and submit an fsync
    ///
    /// # Safety
    ///
    /// See [`AioEngine::submit`].
    unsafe fn fsync(&mut self, op: &mut Op, fd: RawFd) -> Result<()> {
        self.submit_request(op, OpKind::Fsync, fd, std::ptr::null_mut(), 0, 0)
    }

    /// Bind and submit an fdatasync
    ///
    /// # Safety
    ///
    /// See [`AioEngine::submit`].
    unsafe fn fdatasync(&mut self, op: &mut Op, fd: RawFd) -> Result<()> {
        self.submit_request(op, OpKind::Fdatasync, fd, std::ptr::null_mut(), 0, 0)
    }

    /// Bind raw parameters and submit; the Op is left unbound on failure
    ///
    /// # Safety
    ///
    /// See [`AioEngine::submit`]; `buf` must be valid for `len` bytes.
    unsafe fn submit_request(
        &mut self,
        op: &mut Op,
        kind: OpKind,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
    ) -> Result<()> {
        op.bind(kind, fd, buf, len, offset)?;
        if let Err(err) = self.submit(op) {
            op.unbind();
            return Err(err);
        }
        Ok(())
    }
}

/// Build the engine described by `config`
pub fn open_engine(config: &EngineConfig) -> Result<Box<dyn AioEngine>> {
    let engine: Box<dyn AioEngine> = match config.backend {
        Backend::Kernel => Box::new(libaio::AsyncIo::from_config(config)?),
        Backend::Sync => Box::new(sync::SyncIo::from_config(config)?),
    };
    log::debug!(
        "opened {} engine: capacity={} mode={}",
        config.backend,
        config.capacity,
        config.poll_mode
    );
    Ok(engine)
}

/// Common admission checks for a submission
fn admit(op: &Op, pending: usize, capacity: usize, alignment: Option<usize>) -> Result<Request> {
    if op.state() != OpState::Idle {
        return Err(AioError::InvalidState { op: "submit", state: op.state() });
    }
    let req = op.request().ok_or(AioError::InvalidState {
        op: "submit of unbound op",
        state: OpState::Idle,
    })?;
    if pending >= capacity {
        return Err(AioError::ResourceExhausted(format!(
            "queue full: {} of {} requests pending",
            pending, capacity
        )));
    }
    if let Some(align) = alignment {
        check_alignment(&req, align)?;
    }
    Ok(req)
}

/// Direct IO requires address, length, and offset to be block aligned
fn check_alignment(req: &Request, align: usize) -> Result<()> {
    if !req.kind.transfers_data() || req.len == 0 {
        return Ok(());
    }
    let align64 = align as u64;
    if (req.buf as usize) % align != 0 || req.len % align != 0 || req.offset % align64 != 0 {
        return Err(AioError::InvalidArgument(format!(
            "{} not aligned to {} bytes (buf={:p} len={} offset={})",
            req.kind, align, req.buf, req.len, req.offset
        )));
    }
    Ok(())
}

/// A wait for more completions than are outstanding would never return
fn check_wait(min_completions: usize, pending: usize) -> Result<()> {
    if min_completions > pending {
        return Err(AioError::InvalidArgument(format!(
            "wait for {} completions with only {} pending",
            min_completions, pending
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::buffer::AlignedBuffer;

    #[test]
    fn test_admit_checks_state_and_capacity() {
        let mut op = Op::new();
        assert!(matches!(admit(&op, 0, 1, None), Err(AioError::InvalidState { .. })));

        let mut buf = vec![0u8; 8];
        op.bind(OpKind::Read, 0, buf.as_mut_ptr(), buf.len(), 0).unwrap();
        assert!(admit(&op, 0, 1, None).is_ok());
        assert!(matches!(admit(&op, 1, 1, None), Err(AioError::ResourceExhausted(_))));
    }

    #[test]
    fn test_alignment_check() {
        let mut buffer = AlignedBuffer::new(4096, 512);
        let mut op = Op::new();

        op.bind(OpKind::Read, 0, buffer.as_mut_ptr(), 4096, 512).unwrap();
        assert!(admit(&op, 0, 4, Some(512)).is_ok());

        op.bind(OpKind::Read, 0, buffer.as_mut_ptr(), 4000, 512).unwrap();
        assert!(matches!(admit(&op, 0, 4, Some(512)), Err(AioError::InvalidArgument(_))));

        op.bind(OpKind::Read, 0, buffer.as_mut_ptr(), 4096, 100).unwrap();
        assert!(matches!(admit(&op, 0, 4, Some(512)), Err(AioError::InvalidArgument(_))));

        let misaligned = unsafe { buffer.as_mut_ptr().add(1) };
        op.bind(OpKind::Read, 0, misaligned, 512, 0).unwrap();
        assert!(matches!(admit(&op, 0, 4, Some(512)), Err(AioError::InvalidArgument(_))));

        // Zero-length and sync requests are exempt
        op.bind(OpKind::Read, 0, misaligned, 0, 3).unwrap();
        assert!(admit(&op, 0, 4, Some(512)).is_ok());
        op.bind(OpKind::Fsync, 0, std::ptr::null_mut(), 0, 0).unwrap();
        assert!(admit(&op, 0, 4, Some(512)).is_ok());
    }

    #[test]
    fn test_wait_bound() {
        assert!(check_wait(0, 0).is_ok());
        assert!(check_wait(2, 2).is_ok());
        assert!(matches!(check_wait(3, 2), Err(AioError::InvalidArgument(_))));
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(PollMode::Pollable.to_string(), "pollable");
        assert_eq!(PollMode::NotPollable.to_string(), "not_pollable");
        assert_eq!(Backend::Kernel.to_string(), "kernel");
        assert_eq!(Backend::Sync.to_string(), "sync");
    }
}
