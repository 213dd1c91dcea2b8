//! Asynchronous request descriptor
//!
//! An `Op` describes one positioned read, write, or sync request and carries
//! its own state machine:
//!
//! ```text
//! Idle --submit--> Pending --harvest--> Completed --reset--> Idle
//! ```
//!
//! Ops are owned by the caller. An engine only observes an Op while it is
//! pending, through a raw pointer stashed in the kernel request. The Op must
//! therefore stay at the same address, and its buffer must stay valid, until
//! the engine hands it back from `wait` or `poll_completed`. That window is
//! enforced by kernel timing rather than by the borrow checker, which is why
//! the submission calls are `unsafe`.

use crate::error::{AioError, Result};
use std::fmt;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Kind of IO request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Positioned read into the bound buffer
    Read,
    /// Positioned write from the bound buffer
    Write,
    /// Flush file data and metadata; buffer and offset are ignored
    Fsync,
    /// Flush file data only; buffer and offset are ignored
    Fdatasync,
}

impl OpKind {
    /// Whether this kind transfers data through the bound buffer
    pub fn transfers_data(self) -> bool {
        matches!(self, OpKind::Read | OpKind::Write)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Read => write!(f, "read"),
            OpKind::Write => write!(f, "write"),
            OpKind::Fsync => write!(f, "fsync"),
            OpKind::Fdatasync => write!(f, "fdatasync"),
        }
    }
}

/// Lifecycle state of an `Op`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpState {
    /// Not registered with any engine; may be bound and submitted
    Idle,
    /// Owned by an engine until its completion is harvested
    Pending,
    /// Result is available
    Completed,
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpState::Idle => write!(f, "idle"),
            OpState::Pending => write!(f, "pending"),
            OpState::Completed => write!(f, "completed"),
        }
    }
}

/// Parameters bound to an `Op` before submission
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    pub kind: OpKind,
    pub fd: RawFd,
    pub buf: *mut u8,
    pub len: usize,
    pub offset: u64,
}

/// Callback invoked when the engine observes an Op's completion
pub type NotificationCallback = Box<dyn FnMut(&Op) + Send>;

/// A single asynchronous IO request
///
/// Dropping an Op while it is pending aborts the process, since the kernel
/// may still write into memory the Op and its buffer no longer own.
pub struct Op {
    state: OpState,
    request: Option<Request>,
    result: i64,
    tag: u64,
    notify: Option<NotificationCallback>,
}

// Safety: the raw buffer pointer is only dereferenced by the kernel or by the
// engine that owns the Op while pending; the caller upholds the buffer contract.
unsafe impl Send for Op {}

impl Op {
    /// Create an idle, unbound request
    pub fn new() -> Self {
        Self {
            state: OpState::Idle,
            request: None,
            result: 0,
            tag: 0,
            notify: None,
        }
    }

    /// Create an idle request carrying a caller-defined tag
    pub fn with_tag(tag: u64) -> Self {
        let mut op = Self::new();
        op.tag = tag;
        op
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> OpState {
        self.state
    }

    /// Caller-defined tag, echoed in every `Completion` for this Op
    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Replace the tag. Not allowed while pending.
    pub fn set_tag(&mut self, tag: u64) -> Result<()> {
        self.require_not_pending("set_tag")?;
        self.tag = tag;
        Ok(())
    }

    /// Kind of the bound request, if any
    pub fn kind(&self) -> Option<OpKind> {
        self.request.map(|r| r.kind)
    }

    /// Whether parameters are bound and the Op is ready for an engine
    pub fn is_bound(&self) -> bool {
        self.request.is_some()
    }

    /// Install a callback run once each time this Op completes
    ///
    /// The callback runs inside the engine's retrieval call, after the result
    /// is populated and before the Op is returned to the caller.
    pub fn set_notification(&mut self, callback: NotificationCallback) -> Result<()> {
        self.require_not_pending("set_notification")?;
        self.notify = Some(callback);
        Ok(())
    }

    /// Bind request parameters without submitting
    ///
    /// The Op stays idle; it moves to pending only when an engine accepts it.
    /// A zero-length transfer is valid and still completes through the engine.
    pub fn bind(
        &mut self,
        kind: OpKind,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
    ) -> Result<()> {
        if self.state != OpState::Idle {
            return Err(AioError::InvalidState { op: "bind", state: self.state });
        }
        if fd < 0 {
            return Err(AioError::InvalidArgument(format!("negative file descriptor {}", fd)));
        }
        if kind.transfers_data() {
            if buf.is_null() && len > 0 {
                return Err(AioError::InvalidArgument(format!(
                    "null buffer for {} of {} bytes",
                    kind, len
                )));
            }
            if len > isize::MAX as usize {
                return Err(AioError::InvalidArgument(format!("length {} too large", len)));
            }
            if offset > i64::MAX as u64 {
                return Err(AioError::InvalidArgument(format!("offset {} too large", offset)));
            }
        }

        let (buf, len, offset) = if kind.transfers_data() {
            (buf, len, offset)
        } else {
            (std::ptr::null_mut(), 0, 0)
        };

        self.request = Some(Request { kind, fd, buf, len, offset });
        Ok(())
    }

    /// Raw outcome of a completed request
    ///
    /// Non-negative values are bytes transferred; negative values are the
    /// negated errno of the failure.
    pub fn result(&self) -> Result<i64> {
        if self.state != OpState::Completed {
            return Err(AioError::InvalidState { op: "result", state: self.state });
        }
        Ok(self.result)
    }

    /// Completed result as bytes transferred, or `OperationFailed`
    pub fn io_result(&self) -> Result<usize> {
        let res = self.result()?;
        if res < 0 {
            let kind = self.kind().unwrap_or(OpKind::Read);
            return Err(AioError::OperationFailed { kind, errno: (-res) as i32 });
        }
        Ok(res as usize)
    }

    /// Return to idle, clearing the result and bound parameters
    pub fn reset(&mut self) -> Result<()> {
        self.require_not_pending("reset")?;
        self.state = OpState::Idle;
        self.request = None;
        self.result = 0;
        Ok(())
    }

    pub(crate) fn request(&self) -> Option<Request> {
        self.request
    }

    pub(crate) fn unbind(&mut self) {
        debug_assert_eq!(self.state, OpState::Idle);
        self.request = None;
    }

    /// Mark as handed to an engine
    pub(crate) fn start(&mut self) {
        debug_assert_eq!(self.state, OpState::Idle);
        debug_assert!(self.request.is_some());
        self.state = OpState::Pending;
    }

    /// Record the outcome observed by the engine
    pub(crate) fn complete(&mut self, result: i64) -> Completion {
        debug_assert_eq!(self.state, OpState::Pending);
        self.state = OpState::Completed;
        self.result = result;

        if let Some(mut notify) = self.notify.take() {
            notify(&*self);
            self.notify = Some(notify);
        }

        Completion {
            op: NonNull::from(&*self),
            tag: self.tag,
            result,
        }
    }

    fn require_not_pending(&self, op: &'static str) -> Result<()> {
        if self.state == OpState::Pending {
            return Err(AioError::InvalidState { op, state: self.state });
        }
        Ok(())
    }
}

impl Default for Op {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        if self.state == OpState::Pending {
            log::error!("dropping pending op ({}); the kernel may still own its buffer", self);
            std::process::abort();
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}", self.state)?;
        if let Some(req) = &self.request {
            write!(
                f,
                ", {} fd={} offset={} len={}",
                req.kind, req.fd, req.offset, req.len
            )?;
        }
        if self.state == OpState::Completed {
            if self.result < 0 {
                write!(f, ", result={}", std::io::Error::from_raw_os_error((-self.result) as i32))?;
            } else {
                write!(f, ", result={}", self.result)?;
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("state", &self.state)
            .field("request", &self.request)
            .field("result", &self.result)
            .field("tag", &self.tag)
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

/// One entry of a completion batch
///
/// Identifies the completed Op by address and carries a copy of its tag and
/// result taken at harvest time, so reading it never touches the Op.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    op: NonNull<Op>,
    tag: u64,
    result: i64,
}

// Safety: the pointer is only compared, never dereferenced, through this type.
unsafe impl Send for Completion {}

impl Completion {
    /// Whether this completion belongs to `op`
    #[inline]
    pub fn is(&self, op: &Op) -> bool {
        std::ptr::eq(self.op.as_ptr(), op)
    }

    /// Address of the completed Op
    #[inline]
    pub fn as_ptr(&self) -> *const Op {
        self.op.as_ptr()
    }

    /// Tag of the completed Op
    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Raw result: bytes transferred, or negated errno
    #[inline]
    pub fn result(&self) -> i64 {
        self.result
    }

    /// Bytes transferred, or `None` if the request failed
    #[inline]
    pub fn bytes(&self) -> Option<usize> {
        (self.result >= 0).then_some(self.result as usize)
    }
}
