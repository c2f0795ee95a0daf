//! Readiness multiplexing for the relay loop.

use rustix::event::{poll, PollFd, PollFlags};
use std::{
    io::Result,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
};

/// Single-threaded readiness dispatcher.
///
/// Each registered descriptor carries a caller-defined token; [`wait`](Self::wait)
/// blocks until at least one descriptor is readable and reports the tokens of
/// all ready descriptors.
pub struct Poller<T> {
    sources: Vec<(RawFd, T)>,
}

impl<T: Copy> Poller<T> {
    /// Creates a dispatcher with no registered descriptors.
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    /// Registers a descriptor under the given token.
    ///
    /// The descriptor must stay open for as long as the dispatcher is used.
    pub fn register(&mut self, fd: BorrowedFd<'_>, token: T) {
        self.sources.push((fd.as_raw_fd(), token));
    }

    /// Blocks until at least one registered descriptor becomes ready and
    /// collects the ready tokens into `ready`.
    ///
    /// A wait interrupted by a signal is not an error; it returns with
    /// `ready` empty so the caller can check its shutdown condition.
    pub fn wait(&self, ready: &mut Vec<T>) -> Result<()> {
        ready.clear();

        let mut fds: Vec<PollFd> = self
            .sources
            .iter()
            // Registered fds are alive per the register contract.
            .map(|(fd, _)| PollFd::from_borrowed_fd(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::IN))
            .collect();

        match poll(&mut fds, None) {
            Ok(_) => (),
            Err(rustix::io::Errno::INTR) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        for (fd, (_, token)) in fds.iter().zip(&self.sources) {
            // Error and hangup conditions are reported too; the handler's
            // read surfaces the actual error.
            if !fd.revents().is_empty() {
                ready.push(*token);
            }
        }

        Ok(())
    }
}

impl<T: Copy> Default for Poller<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::event::{eventfd, EventfdFlags};
    use std::os::fd::AsFd;

    #[test]
    fn ready_tokens() {
        let quiet = eventfd(0, EventfdFlags::CLOEXEC).unwrap();
        let signalled = eventfd(0, EventfdFlags::CLOEXEC).unwrap();

        let mut poller = Poller::new();
        poller.register(quiet.as_fd(), 1u8);
        poller.register(signalled.as_fd(), 2u8);

        rustix::io::write(&signalled, &1u64.to_ne_bytes()).unwrap();

        let mut ready = Vec::new();
        poller.wait(&mut ready).unwrap();
        assert_eq!(ready, vec![2]);
    }
}
