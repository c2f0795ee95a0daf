//! Raw Linux AIO syscall interface.

use libc::{c_int, c_long, c_uint, c_ulong, syscall, timespec, SYS_io_cancel, SYS_io_destroy, SYS_io_getevents, SYS_io_setup, SYS_io_submit};
use std::{
    io::{Error, Result},
    os::fd::RawFd,
};

/// Opaque AIO context id, allocated by the kernel.
pub type ContextId = c_ulong;

/// `IOCB_CMD_PREAD`.
pub const CMD_PREAD: u16 = 0;

/// `IOCB_FLAG_RESFD`: [`IoCb::resfd`] is an eventfd to signal on completion.
pub const FLAG_RESFD: u32 = 1 << 0;

/// Completion event read via [`io_getevents`].
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IoEvent {
    /// User data copied from [`IoCb::data`].
    pub data: u64,
    /// Address of the originating control block.
    pub obj: u64,
    /// Byte count on success, negated errno on failure.
    pub res: i64,
    /// Secondary result.
    pub res2: i64,
}

/// AIO control block, as consumed by [`io_submit`].
///
/// The kernel keeps a pointer to this block and to the buffer it references
/// for the whole lifetime of the operation.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IoCb {
    /// User data, returned in [`IoEvent::data`].
    pub data: u64,

    /// Set by the kernel to the request number.
    #[cfg(target_endian = "little")]
    pub key: u32,
    /// `RWF_*` flags.
    #[cfg(target_endian = "little")]
    pub rw_flags: c_int,

    /// `RWF_*` flags.
    #[cfg(target_endian = "big")]
    pub rw_flags: c_int,
    /// Set by the kernel to the request number.
    #[cfg(target_endian = "big")]
    pub key: u32,

    /// `IOCB_CMD_*` opcode.
    pub opcode: u16,
    /// Request priority.
    pub reqprio: i16,
    /// File descriptor to operate on.
    pub fildes: RawFd,
    /// Transfer buffer address.
    pub buf: u64,
    /// Transfer buffer size.
    pub nbytes: u64,
    /// File offset.
    pub offset: i64,

    pub _reserved2: u64,

    /// `IOCB_FLAG_*` validity flags.
    pub flags: u32,
    /// eventfd signalled on completion when [`FLAG_RESFD`] is set.
    pub resfd: RawFd,
}

impl IoCb {
    /// Control block for an asynchronous read of `nbytes` into `buf`,
    /// signalling `resfd` on completion and carrying `data` through.
    pub fn read(fildes: RawFd, buf: *mut u8, nbytes: u64, resfd: RawFd, data: u64) -> Self {
        Self {
            data,
            opcode: CMD_PREAD,
            fildes,
            buf: buf as usize as u64,
            nbytes,
            flags: FLAG_RESFD,
            resfd,
            ..Default::default()
        }
    }
}

/// Create an AIO context able to hold `nr_events` concurrent operations.
pub unsafe fn io_setup(nr_events: c_uint, ctx_id: &mut ContextId) -> Result<()> {
    match syscall(SYS_io_setup, nr_events, ctx_id as *mut _) {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// Destroy an AIO context, cancelling and waiting out outstanding operations.
pub unsafe fn io_destroy(ctx_id: ContextId) -> Result<()> {
    match syscall(SYS_io_destroy, ctx_id) as c_int {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// Submit `nr` control blocks; returns how many were accepted.
pub unsafe fn io_submit(ctx_id: ContextId, nr: c_long, iocbpp: *mut *mut IoCb) -> Result<c_int> {
    match syscall(SYS_io_submit, ctx_id, nr, iocbpp) as c_int {
        -1 => Err(Error::last_os_error()),
        n => Ok(n),
    }
}

/// Attempt to cancel an outstanding operation.
///
/// On old kernels a successful cancel returns the completion event in
/// `result` instead of queuing it.
pub unsafe fn io_cancel(ctx_id: ContextId, iocb: *mut IoCb, result: *mut IoEvent) -> Result<()> {
    match syscall(SYS_io_cancel, ctx_id, iocb, result) as c_int {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// Fetch up to `nr` completion events, waiting for at least `min_nr`.
pub unsafe fn io_getevents(
    ctx_id: ContextId, min_nr: c_long, nr: c_long, events: *mut IoEvent, timeout: *const timespec,
) -> Result<c_int> {
    match syscall(SYS_io_getevents, ctx_id, min_nr, nr, events, timeout) as c_int {
        -1 => Err(Error::last_os_error()),
        n => Ok(n),
    }
}
