//! Kernel AIO driver for the OUT endpoint.
//!
//! Reads against a FunctionFS endpoint file cannot use readiness-based
//! nonblocking I/O; they must be submitted as kernel AIO operations. The
//! [`Driver`] wires each submission to an eventfd so that completions become
//! a pollable readiness source for the main loop.

use std::{
    fs::File,
    io::{Error, ErrorKind, Result},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr,
    sync::Arc,
};

use rustix::event::{eventfd, EventfdFlags};

mod sys;

/// Index of a read slot within the pool.
pub type SlotId = usize;

/// A drained completion event.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Slot the operation was submitted for.
    pub slot: SlotId,
    /// Byte count on success, negated errno on failure.
    pub result: i64,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancellation was initiated; the completion will still be delivered.
    Cancelled,
    /// The operation finished before the cancellation reached the kernel.
    AlreadyComplete,
}

/// Submission interface for asynchronous endpoint reads.
///
/// Implemented by [`Driver`] against the kernel and by scripted mocks in
/// tests.
pub trait ReadQueue {
    /// Submits an asynchronous read for `slot` into `buf`.
    ///
    /// # Safety
    /// `buf` must stay allocated and unmoved until the completion for `slot`
    /// has been observed via [`drain_completions`](Self::drain_completions).
    unsafe fn submit(&mut self, slot: SlotId, buf: &mut [u8]) -> Result<()>;

    /// Requests cancellation of the in-flight read on `slot`.
    ///
    /// Losing the race against the completion is reported as
    /// [`CancelOutcome::AlreadyComplete`], not as an error.
    fn cancel(&mut self, slot: SlotId) -> Result<CancelOutcome>;

    /// Appends all currently available completions to `out` without blocking.
    fn drain_completions(&mut self, out: &mut Vec<Completion>) -> Result<()>;
}

/// eventfd signalled by the kernel when submitted operations complete.
#[derive(Debug)]
struct CompletionNotifier(OwnedFd);

impl CompletionNotifier {
    fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(Self(fd))
    }

    /// Reads and discards the counter so the descriptor stops polling readable.
    ///
    /// Returns the counter value, which may disagree with the number of
    /// events actually fetchable; treat it as advisory only.
    fn drain(&self) -> Result<u64> {
        let mut buf = [0; 8];
        match rustix::io::read(&self.0, &mut buf) {
            Ok(n) if n == buf.len() => Ok(u64::from_ne_bytes(buf)),
            Ok(_) => Err(Error::new(ErrorKind::InvalidData, "short eventfd read")),
            Err(rustix::io::Errno::AGAIN) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl AsFd for CompletionNotifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// AIO context, destroyed on drop.
#[derive(Debug)]
struct Context(sys::ContextId);

impl Context {
    fn new(nr_events: u32) -> Result<Self> {
        let mut id = 0;
        unsafe { sys::io_setup(nr_events, &mut id) }?;
        Ok(Self(id))
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = unsafe { sys::io_destroy(self.0) } {
            log::error!("cannot destroy AIO context: {err}");
        }
    }
}

/// AIO driver for one OUT endpoint.
///
/// Holds one control block per slot; the endpoint file is shared with the
/// FunctionFS session and stays open for the driver's lifetime.
pub struct Driver {
    ctx: Context,
    notifier: CompletionNotifier,
    ep: Arc<File>,
    iocbs: Vec<Box<sys::IoCb>>,
    /// Completions returned directly by `io_cancel` on old kernels,
    /// replayed on the next drain.
    stashed: Vec<Completion>,
}

impl Driver {
    /// Number of events fetched per `io_getevents` call.
    const EVENT_BATCH: usize = 16;

    /// Creates a driver with space for `queue_len` concurrent reads on `ep`.
    pub fn new(ep: Arc<File>, queue_len: usize) -> Result<Self> {
        let ctx = Context::new(queue_len.try_into().map_err(|_| ErrorKind::InvalidInput)?)?;
        let notifier = CompletionNotifier::new()?;
        let iocbs = (0..queue_len).map(|_| Box::new(sys::IoCb::default())).collect();
        Ok(Self { ctx, notifier, ep, iocbs, stashed: Vec::new() })
    }

    /// Descriptor that polls readable when completions are pending.
    pub fn notify_fd(&self) -> BorrowedFd<'_> {
        self.notifier.as_fd()
    }
}

impl ReadQueue for Driver {
    unsafe fn submit(&mut self, slot: SlotId, buf: &mut [u8]) -> Result<()> {
        let iocb = self.iocbs.get_mut(slot).ok_or(ErrorKind::InvalidInput)?;
        **iocb = sys::IoCb::read(
            self.ep.as_raw_fd(),
            buf.as_mut_ptr(),
            buf.len() as u64,
            self.notifier.as_fd().as_raw_fd(),
            slot as u64,
        );

        let mut iocbs = [&mut **iocb as *mut sys::IoCb];
        match sys::io_submit(self.ctx.0, 1, iocbs.as_mut_ptr())? {
            1 => Ok(()),
            _ => Err(Error::new(ErrorKind::WouldBlock, "AIO request not accepted")),
        }
    }

    fn cancel(&mut self, slot: SlotId) -> Result<CancelOutcome> {
        let iocb = self.iocbs.get_mut(slot).ok_or(ErrorKind::InvalidInput)?;
        let mut event = sys::IoEvent::default();

        match unsafe { sys::io_cancel(self.ctx.0, &mut **iocb, &mut event) } {
            Ok(()) => {
                // Pre-2.6.8 semantics: the completion came back with the
                // syscall and will not be queued.
                self.stashed.push(Completion { slot, result: event.res });
                Ok(CancelOutcome::Cancelled)
            }
            Err(err) => match err.raw_os_error() {
                Some(libc::EINPROGRESS) => Ok(CancelOutcome::Cancelled),
                Some(libc::EAGAIN) | Some(libc::EINVAL) => Ok(CancelOutcome::AlreadyComplete),
                _ => Err(err),
            },
        }
    }

    fn drain_completions(&mut self, out: &mut Vec<Completion>) -> Result<()> {
        out.append(&mut self.stashed);

        let signalled = self.notifier.drain()?;
        log::trace!("eventfd reports {signalled} completions");

        loop {
            let mut events = [sys::IoEvent::default(); Self::EVENT_BATCH];
            let n = unsafe {
                sys::io_getevents(self.ctx.0, 0, events.len() as _, events.as_mut_ptr(), ptr::null())
            }?;
            if n == 0 {
                break;
            }

            for event in &events[..n as usize] {
                out.push(Completion { slot: event.data as SlotId, result: event.res });
            }
        }

        Ok(())
    }
}
