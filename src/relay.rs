//! Relay core: read-slot pool, completion policy and function lifecycle.

use std::{
    io::{Error, ErrorKind, Read, Result, Write},
    mem,
};

use crate::aio::{CancelOutcome, Completion, ReadQueue, SlotId};

/// Default number of reads kept in flight against the OUT endpoint.
///
/// More than one, so the kernel can fill one buffer while the previous one
/// is being drained.
pub const DEFAULT_QUEUE_LEN: usize = 2;

/// Default read buffer size.
///
/// Large enough to tolerate bursts without a wakeup per packet.
pub const DEFAULT_BUF_SIZE: usize = 1024 * 1024;

/// One outstanding read: a fixed buffer and its in-flight flag.
struct ReadSlot {
    /// Never grown or reallocated; the kernel writes into it while the slot
    /// is in flight and the allocation must stay put until the completion
    /// has been observed.
    buf: Box<[u8]>,
    in_flight: bool,
}

/// Fixed pool of read slots submitted and cancelled as a unit.
pub struct ReadPool<Q> {
    /// Dropped before `slots`, ending in-flight kernel operations before
    /// the buffers they reference are freed.
    queue: Q,
    slots: Vec<ReadSlot>,
    events: Vec<Completion>,
}

impl<Q: ReadQueue> ReadPool<Q> {
    fn new(queue: Q, queue_len: usize, buf_size: usize) -> Self {
        let slots = (0..queue_len)
            .map(|_| ReadSlot { buf: vec![0; buf_size].into_boxed_slice(), in_flight: false })
            .collect();
        Self { queue, slots, events: Vec::new() }
    }

    /// Number of reads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_flight).count()
    }

    /// Submits a read for every idle slot.
    ///
    /// Only valid while the endpoint accepts I/O; the error is propagated
    /// otherwise.
    fn submit_all(&mut self) -> Result<()> {
        for slot in 0..self.slots.len() {
            let state = &mut self.slots[slot];
            if state.in_flight {
                continue;
            }
            // The buffer outlives the operation: slots are only dropped
            // after the queue, and never while unretired.
            unsafe { self.queue.submit(slot, &mut state.buf) }?;
            state.in_flight = true;
            log::trace!("submitted read on slot {slot}");
        }
        Ok(())
    }

    /// Requests cancellation of every in-flight slot.
    ///
    /// Cancellation is best-effort: losing the race against a completion or
    /// any other cancel failure is logged and otherwise ignored, since the
    /// completion still arrives and retires the slot.
    fn cancel_all(&mut self) {
        for slot in 0..self.slots.len() {
            if !self.slots[slot].in_flight {
                continue;
            }
            match self.queue.cancel(slot) {
                Ok(CancelOutcome::Cancelled) => log::trace!("cancelled read on slot {slot}"),
                Ok(CancelOutcome::AlreadyComplete) => log::trace!("read on slot {slot} already complete"),
                Err(err) => log::warn!("cancelling read on slot {slot} failed: {err}"),
            }
        }
    }

    /// Drains available completions and applies the completion policy to
    /// each, forwarding payloads to `sink`.
    fn process_completions(&mut self, sink: &mut impl Write) -> Result<()> {
        let mut events = mem::take(&mut self.events);
        self.queue.drain_completions(&mut events)?;

        for completion in events.drain(..) {
            self.complete(completion.slot, completion.result, sink)?;
        }

        self.events = events;
        Ok(())
    }

    /// Completion policy: a shutdown result retires the slot; any other
    /// result forwards the payload (if any) and resubmits the same slot.
    fn complete(&mut self, slot: SlotId, result: i64, sink: &mut impl Write) -> Result<()> {
        let Some(state) = self.slots.get_mut(slot) else {
            log::warn!("completion for unknown slot {slot}");
            return Ok(());
        };
        state.in_flight = false;

        if result == -i64::from(libc::ESHUTDOWN) {
            log::trace!("slot {slot} retired: endpoint shut down");
            return Ok(());
        }

        if result < 0 {
            log::warn!("read on slot {slot} failed: {}", Error::from_raw_os_error(-result as i32));
        } else {
            let n = (result as usize).min(state.buf.len());
            log::trace!("received {n} bytes on slot {slot}");
            if n > 0 {
                sink.write_all(&state.buf[..n])?;
                sink.flush()?;
            }
        }

        let state = &mut self.slots[slot];
        match unsafe { self.queue.submit(slot, &mut state.buf) } {
            Ok(()) => state.in_flight = true,
            Err(err) => log::warn!("cannot resubmit read on slot {slot}: {err}"),
        }
        Ok(())
    }
}

/// Function lifecycle state, driven by `ep0` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    /// Not attached to a gadget.
    Unbound,
    /// Attached but the configuration is not active; endpoints reject I/O.
    Bound,
    /// Configuration active; reads are in flight.
    Enabled,
}

/// Lifecycle signal delivered by the kernel through `ep0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Function attached to the gadget.
    Bind,
    /// Function detached; the kernel has already cancelled in-flight I/O.
    Unbind,
    /// Configuration activated by the host.
    Enable,
    /// Configuration deactivated by the host.
    Disable,
}

/// Byte-stream relay between a local source/sink pair and an endpoint pair.
///
/// Dropping the relay forces a disable, so in-flight reads are cancelled
/// before the queue and the buffers are released.
pub struct Relay<Q: ReadQueue, R, W, S> {
    pool: ReadPool<Q>,
    state: FunctionState,
    source: R,
    writer: W,
    sink: S,
    in_buf: Box<[u8]>,
    source_eof: bool,
}

impl<Q: ReadQueue, R: Read, W: Write, S: Write> Relay<Q, R, W, S> {
    /// Creates a relay over `queue` with `queue_len` read slots of
    /// `buf_size` bytes each.
    ///
    /// `source` must be nonblocking; `writer` is the IN endpoint and `sink`
    /// receives OUT endpoint payloads.
    pub fn new(queue: Q, source: R, writer: W, sink: S, queue_len: usize, buf_size: usize) -> Self {
        Self {
            pool: ReadPool::new(queue, queue_len, buf_size),
            state: FunctionState::Unbound,
            source,
            writer,
            sink,
            in_buf: vec![0; buf_size].into_boxed_slice(),
            source_eof: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FunctionState {
        self.state
    }

    /// Number of endpoint reads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Whether the local source reached end of stream.
    pub fn local_eof(&self) -> bool {
        self.source_eof
    }

    /// Applies a lifecycle signal.
    pub fn handle_event(&mut self, event: LifecycleEvent) -> Result<()> {
        log::debug!("lifecycle event {event:?} in state {:?}", self.state);

        match event {
            LifecycleEvent::Bind => {
                self.state = FunctionState::Bound;
            }
            LifecycleEvent::Unbind => {
                // The kernel cancels all pending I/O before delivering
                // unbind; the shutdown completions retire the slots, so no
                // cancellation is issued here.
                self.state = FunctionState::Unbound;
            }
            LifecycleEvent::Enable => {
                // A stray enable while already enabled must not double-submit.
                self.force_disable();
                self.pool.submit_all()?;
                self.state = FunctionState::Enabled;
            }
            LifecycleEvent::Disable => {
                self.force_disable();
            }
        }

        Ok(())
    }

    /// Idempotent disable: cancels the pool when enabled, no-op otherwise.
    fn force_disable(&mut self) {
        if self.state == FunctionState::Enabled {
            self.pool.cancel_all();
            self.state = FunctionState::Bound;
        }
    }

    /// Drains read completions and forwards their payloads to the sink.
    pub fn process_completions(&mut self) -> Result<()> {
        self.pool.process_completions(&mut self.sink)
    }

    /// Forwards available local input to the IN endpoint.
    ///
    /// A would-block read is a no-op; a zero-length read marks end of
    /// stream; any other source or endpoint error is fatal.
    pub fn forward_local(&mut self) -> Result<()> {
        match self.source.read(&mut self.in_buf) {
            Ok(0) => {
                log::debug!("local input at end of stream");
                self.source_eof = true;
            }
            Ok(n) => {
                log::trace!("sending {n} bytes");
                self.writer.write_all(&self.in_buf[..n])?;
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => (),
            Err(err) => return Err(err),
        }
        Ok(())
    }
}

impl<Q: ReadQueue, R, W, S> Drop for Relay<Q, R, W, S> {
    fn drop(&mut self) {
        if self.state == FunctionState::Enabled {
            self.pool.cancel_all();
            self.state = FunctionState::Bound;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::Completion;
    use std::io;

    /// Queue that accepts everything and completes nothing.
    struct IdleQueue;

    impl ReadQueue for IdleQueue {
        unsafe fn submit(&mut self, _slot: SlotId, _buf: &mut [u8]) -> Result<()> {
            Ok(())
        }

        fn cancel(&mut self, _slot: SlotId) -> Result<CancelOutcome> {
            Ok(CancelOutcome::Cancelled)
        }

        fn drain_completions(&mut self, _out: &mut Vec<Completion>) -> Result<()> {
            Ok(())
        }
    }

    /// Local source producing one chunk, then end of stream.
    struct OneShotSource(Option<Vec<u8>>);

    impl Read for OneShotSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.take() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => Ok(0),
            }
        }
    }

    fn relay(queue_len: usize) -> Relay<IdleQueue, OneShotSource, Vec<u8>, Vec<u8>> {
        Relay::new(IdleQueue, OneShotSource(Some(b"hello".to_vec())), Vec::new(), Vec::new(), queue_len, 64)
    }

    #[test]
    fn lifecycle_transitions() {
        let mut relay = relay(2);
        assert_eq!(relay.state(), FunctionState::Unbound);

        relay.handle_event(LifecycleEvent::Bind).unwrap();
        assert_eq!(relay.state(), FunctionState::Bound);
        assert_eq!(relay.in_flight(), 0);

        relay.handle_event(LifecycleEvent::Enable).unwrap();
        assert_eq!(relay.state(), FunctionState::Enabled);
        assert_eq!(relay.in_flight(), 2);

        relay.handle_event(LifecycleEvent::Disable).unwrap();
        assert_eq!(relay.state(), FunctionState::Bound);

        relay.handle_event(LifecycleEvent::Unbind).unwrap();
        assert_eq!(relay.state(), FunctionState::Unbound);
    }

    #[test]
    fn disable_is_idempotent() {
        let mut relay = relay(2);
        relay.handle_event(LifecycleEvent::Bind).unwrap();
        relay.handle_event(LifecycleEvent::Enable).unwrap();

        relay.handle_event(LifecycleEvent::Disable).unwrap();
        let state_once = relay.state();
        let in_flight_once = relay.in_flight();

        relay.handle_event(LifecycleEvent::Disable).unwrap();
        assert_eq!(relay.state(), state_once);
        assert_eq!(relay.in_flight(), in_flight_once);
    }

    #[test]
    fn local_input_reaches_writer_then_eof() {
        let mut relay = relay(2);

        relay.forward_local().unwrap();
        assert_eq!(relay.writer, b"hello");
        assert!(!relay.local_eof());

        relay.forward_local().unwrap();
        assert_eq!(relay.writer, b"hello");
        assert!(relay.local_eof());
    }
}
