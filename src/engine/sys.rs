//! Raw Linux AIO and eventfd plumbing
//!
//! Direct syscalls via libc rather than a binding crate, keeping the crate
//! MIT-compatible (the libaio userspace library is LGPL). Every handle is
//! owned: `AioContext` destroys its kernel context on drop and `EventFd`
//! closes its descriptor on drop.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

type ContextId = libc::c_ulong;

pub(crate) const IOCB_CMD_PREAD: u16 = 0;
pub(crate) const IOCB_CMD_PWRITE: u16 = 1;
pub(crate) const IOCB_CMD_FSYNC: u16 = 2;
pub(crate) const IOCB_CMD_FDSYNC: u16 = 3;

/// Deliver completion notification through `aio_resfd`
pub(crate) const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// Kernel `struct iocb` (little-endian field order)
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IoControlBlock {
    pub data: u64,          // aio_data, echoed in the io_event
    pub key: u32,           // aio_key, set by the kernel
    pub aio_rw_flags: u32,  // RWF_* flags
    pub lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub buf: u64,
    pub nbytes: u64,
    pub offset: i64,
    pub aio_reserved2: u64,
    pub flags: u32,         // IOCB_FLAG_*
    pub aio_resfd: u32,     // eventfd signalled on completion
}

impl IoControlBlock {
    pub fn zeroed() -> Self {
        // Safety: all-zero is a valid iocb
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

/// Kernel `struct io_event`
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IoEvent {
    pub data: u64, // aio_data from the iocb
    pub obj: u64,  // address of the iocb
    pub res: i64,  // bytes transferred or -errno
    pub res2: i64,
}

impl IoEvent {
    pub fn zeroed() -> Self {
        // Safety: all-zero is a valid io_event
        unsafe { MaybeUninit::zeroed().assume_init() }
    }
}

unsafe fn io_setup(maxevents: libc::c_uint, ctxp: *mut ContextId) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, maxevents, ctxp)
}

unsafe fn io_destroy(ctx: ContextId) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

unsafe fn io_submit(ctx: ContextId, nr: libc::c_long, iocbpp: *mut *mut IoControlBlock) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

unsafe fn io_getevents(
    ctx: ContextId,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}

/// Owned kernel AIO context
pub(crate) struct AioContext {
    id: ContextId,
}

impl AioContext {
    /// Create a context able to hold `capacity` in-flight requests
    pub fn setup(capacity: usize) -> io::Result<Self> {
        let mut id: ContextId = 0;
        let rc = unsafe { io_setup(capacity as libc::c_uint, &mut id) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id })
    }

    /// Hand one request to the kernel
    ///
    /// The kernel copies the iocb during the call, so it only has to live
    /// for the duration of this function.
    pub fn submit(&self, iocb: &mut IoControlBlock) -> io::Result<()> {
        let mut iocb_ptr = iocb as *mut IoControlBlock;
        loop {
            let rc = unsafe { io_submit(self.id, 1, &mut iocb_ptr) };
            if rc == 1 {
                return Ok(());
            }
            if rc == 0 {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Harvest between `min` and `events.len()` completions
    ///
    /// `None` blocks until `min` events arrived; a timeout returns early with
    /// whatever is ready. Timeouts beyond `time_t` are clamped. EINTR
    /// restarts the wait.
    pub fn get_events(
        &self,
        min: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        loop {
            let ts_ptr = ts
                .as_mut()
                .map_or(ptr::null_mut(), |t| t as *mut libc::timespec);
            let rc = unsafe {
                io_getevents(
                    self.id,
                    min as libc::c_long,
                    events.len() as libc::c_long,
                    events.as_mut_ptr(),
                    ts_ptr,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        let rc = unsafe { io_destroy(self.id) };
        if rc < 0 {
            log::warn!("io_destroy failed: {}", io::Error::last_os_error());
        }
    }
}

/// Non-blocking eventfd used as a readiness descriptor
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: fd was just returned by eventfd and is owned by nobody else
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// Read and reset the counter; `None` when it is zero
    pub fn take(&self) -> io::Result<Option<u64>> {
        let mut value: u64 = 0;
        loop {
            let rc = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if rc == std::mem::size_of::<u64>() as isize {
                return Ok(Some(value));
            }
            if rc >= 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short eventfd read of {} bytes", rc),
                ));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    /// Add `value` to the counter
    pub fn add(&self, value: u64) -> io::Result<()> {
        loop {
            let rc = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    &value as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if rc == std::mem::size_of::<u64>() as isize {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Wait up to `timeout_ms` for `fd` to become readable
///
/// Returns `true` when readable. A negative timeout blocks indefinitely.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc >= 0 {
            return Ok(rc == 1 && (pfd.revents & libc::POLLIN) != 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
