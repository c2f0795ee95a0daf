//! Relay stdin/stdout to a USB host through a FunctionFS endpoint pair.

use clap::Parser;
use std::{
    io::{self, Error, Result},
    os::fd::AsFd,
    path::PathBuf,
    process::ExitCode,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use usbcat::{aio, ffs, poll::Poller, relay::LifecycleEvent, Relay, DEFAULT_BUF_SIZE, DEFAULT_QUEUE_LEN};

/// Relay stdin/stdout to a USB host through a FunctionFS endpoint pair.
///
/// The FunctionFS instance must be mounted at the given directory and the
/// gadget containing it must be composed and bound to a UDC externally.
/// Runs until stdin reaches end of stream or the process is interrupted.
#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// FunctionFS mount directory.
    ffs_dir: PathBuf,
    /// Number of concurrently outstanding endpoint reads.
    #[arg(long, default_value_t = DEFAULT_QUEUE_LEN)]
    queue_len: usize,
    /// Read buffer size in bytes.
    #[arg(long, default_value_t = DEFAULT_BUF_SIZE)]
    buffer_size: usize,
}

/// Readiness sources of the relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// `ep0` has lifecycle or setup events pending.
    Control,
    /// Endpoint reads have completed.
    Completions,
    /// stdin has data available.
    LocalInput,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Installs a SIGINT handler without `SA_RESTART`, so a pending interrupt
/// breaks the poll wait.
fn install_sigint() -> Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_sigint as usize;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    if unsafe { libc::sigaction(libc::SIGINT, &action, ptr::null_mut()) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: impl AsFd) -> Result<()> {
    let flags = rustix::fs::fcntl_getfl(&fd)?;
    rustix::fs::fcntl_setfl(&fd, flags | rustix::fs::OFlags::NONBLOCK)?;
    Ok(())
}

fn run(opts: &Opts) -> Result<()> {
    let mut func = ffs::Function::open(&opts.ffs_dir)?;
    let driver = aio::Driver::new(func.out_endpoint(), opts.queue_len)?;

    let stdin = io::stdin().lock();
    set_nonblocking(&stdin)?;

    let mut poller = Poller::new();
    poller.register(func.event_fd(), Token::Control);
    poller.register(driver.notify_fd(), Token::Completions);
    poller.register(stdin.as_fd(), Token::LocalInput);

    let mut relay =
        Relay::new(driver, stdin, func.writer()?, io::stdout().lock(), opts.queue_len, opts.buffer_size);

    let mut ready = Vec::new();
    while !INTERRUPTED.load(Ordering::Relaxed) && !relay.local_eof() {
        poller.wait(&mut ready)?;

        for token in &ready {
            match token {
                Token::Control => {
                    for event in func.events()? {
                        match event {
                            ffs::Event::Bind => relay.handle_event(LifecycleEvent::Bind)?,
                            ffs::Event::Unbind => relay.handle_event(LifecycleEvent::Unbind)?,
                            ffs::Event::Enable => relay.handle_event(LifecycleEvent::Enable)?,
                            ffs::Event::Disable => relay.handle_event(LifecycleEvent::Disable)?,
                            ffs::Event::Suspend => log::debug!("bus suspended"),
                            ffs::Event::Resume => log::debug!("bus resumed"),
                            ffs::Event::Setup(req) => {
                                log::debug!("stalling setup request {req:?}");
                                func.stall(&req)?;
                            }
                            ffs::Event::Unknown(event_type) => {
                                log::warn!("ignoring unknown ep0 event {event_type}");
                            }
                        }
                    }
                }
                Token::Completions => relay.process_completions()?,
                Token::LocalInput => relay.forward_local()?,
            }
        }
    }

    if INTERRUPTED.load(Ordering::Relaxed) {
        log::info!("interrupted");
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let opts = Opts::parse();

    if let Err(err) = install_sigint() {
        eprintln!("usbcat: cannot install signal handler: {err}");
        return ExitCode::FAILURE;
    }

    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("usbcat: {err}");
            ExitCode::FAILURE
        }
    }
}
