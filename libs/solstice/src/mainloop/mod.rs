//! The event loop: timers, idlers, fd watches, child watches and
//! polymorphic sources, dispatched cooperatively from one thread.
//!
//! The loop is a thread-local singleton. [`init`] must run before any other
//! operation and is idempotent; [`shutdown`] tears the loop down and allows
//! re-init. Registrations return handles that cancel; a callback returning
//! `false` releases its handle automatically.
//!
//! Dispatch order within one pass: expired timers, then idlers, then child
//! exits, posted cross-thread jobs, ready sources, and finally ready fd
//! callbacks. Work registered during a pass does not run before the next
//! pass. The loop only blocks in `poll` and is woken by fd readiness, timer
//! deadlines, signals, or a cross-thread [`Dispatcher::post`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use bitflags::bitflags;
use rustix::event::{PollFd, PollFlags};
use tracing::{error, warn};

use crate::{Error, time};

bitflags! {
    /// Readiness conditions for [`fd_add`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u8 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
        const PRI = 1 << 2;
        const ERR = 1 << 3;
        const HUP = 1 << 4;
        const NVAL = 1 << 5;
    }
}

fn to_poll_flags(flags: FdFlags) -> PollFlags {
    let mut out = PollFlags::empty();
    if flags.contains(FdFlags::IN) {
        out |= PollFlags::IN;
    }
    if flags.contains(FdFlags::OUT) {
        out |= PollFlags::OUT;
    }
    if flags.contains(FdFlags::PRI) {
        out |= PollFlags::PRI;
    }
    out
}

fn from_poll_flags(flags: PollFlags) -> FdFlags {
    let mut out = FdFlags::empty();
    if flags.contains(PollFlags::IN) {
        out |= FdFlags::IN;
    }
    if flags.contains(PollFlags::OUT) {
        out |= FdFlags::OUT;
    }
    if flags.contains(PollFlags::PRI) {
        out |= FdFlags::PRI;
    }
    if flags.contains(PollFlags::ERR) {
        out |= FdFlags::ERR;
    }
    if flags.contains(PollFlags::HUP) {
        out |= FdFlags::HUP;
    }
    if flags.contains(PollFlags::NVAL) {
        out |= FdFlags::NVAL;
    }
    out
}

/// A pluggable readiness source so a host toolkit's loop can feed this one.
///
/// `prepare` may report immediate readiness and `timeout` contributes to the
/// poll deadline; `check` decides after polling and `dispatch` runs the
/// source's work. Disposal is `Drop`.
pub trait Source: 'static {
    fn prepare(&mut self) -> bool {
        false
    }
    fn timeout(&mut self) -> Option<Duration> {
        None
    }
    fn check(&mut self) -> bool;
    fn dispatch(&mut self);
}

struct TimeoutEntry {
    interval: Duration,
    expire: Cell<Duration>,
    cb: RefCell<Box<dyn FnMut() -> bool>>,
    removed: Cell<bool>,
}

struct IdleEntry {
    cb: RefCell<Box<dyn FnMut() -> bool>>,
    removed: Cell<bool>,
    /// Registered during the current pass; runs starting next pass.
    fresh: Cell<bool>,
}

struct FdEntry {
    fd: RawFd,
    interest: FdFlags,
    cb: RefCell<Box<dyn FnMut(RawFd, FdFlags) -> bool>>,
    removed: Cell<bool>,
}

struct ChildEntry {
    pid: i32,
    cb: RefCell<Option<Box<dyn FnOnce(i32, i32)>>>,
    removed: Cell<bool>,
}

struct SourceEntry {
    source: RefCell<Box<dyn Source>>,
    removed: Cell<bool>,
    ready: Cell<bool>,
    next_timeout: Cell<Option<Duration>>,
}

type Job = Box<dyn FnOnce() + Send>;

struct PostShared {
    jobs: Mutex<VecDeque<Job>>,
    wake: OwnedFd,
}

/// Cross-thread entry into the loop: queue a closure to run on the loop
/// thread during its next pass. Clone freely; this is the only loop API
/// usable off the main thread.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<PostShared>,
}

impl Dispatcher {
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.shared
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Box::new(job));
        match rustix::io::write(&self.shared.wake, &[1]) {
            Ok(_) => Ok(()),
            // full pipe means a wakeup is already pending
            Err(rustix::io::Errno::AGAIN) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

static CHILD_PENDING: AtomicBool = AtomicBool::new(false);
static TERM_PENDING: AtomicBool = AtomicBool::new(false);

struct SignalPipe {
    read: OwnedFd,
}

static SIGNAL_PIPE: OnceLock<SignalPipe> = OnceLock::new();

fn signal_pipe() -> Result<&'static SignalPipe, Error> {
    if let Some(pipe) = SIGNAL_PIPE.get() {
        return Ok(pipe);
    }
    let (read, write) = rustix::pipe::pipe_with(
        rustix::pipe::PipeFlags::NONBLOCK | rustix::pipe::PipeFlags::CLOEXEC,
    )?;
    let write_raw = {
        use std::os::fd::IntoRawFd;
        // handed to the signal handlers for the life of the process
        write.into_raw_fd()
    };
    use signal_hook::consts::signal::{SIGCHLD, SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::low_level;
    unsafe {
        low_level::register(SIGCHLD, || {
            CHILD_PENDING.store(true, Ordering::SeqCst);
        })
        .map_err(Error::Io)?;
        for sig in [SIGINT, SIGTERM, SIGQUIT] {
            low_level::register(sig, || {
                TERM_PENDING.store(true, Ordering::SeqCst);
            })
            .map_err(Error::Io)?;
        }
    }
    for sig in [SIGCHLD, SIGINT, SIGTERM, SIGQUIT] {
        low_level::pipe::register_raw(sig, write_raw).map_err(Error::Io)?;
    }
    Ok(SIGNAL_PIPE.get_or_init(|| SignalPipe { read }))
}

struct MainLoop {
    timeouts: RefCell<Vec<Rc<TimeoutEntry>>>,
    idlers: RefCell<Vec<Rc<IdleEntry>>>,
    fds: RefCell<Vec<Rc<FdEntry>>>,
    children: RefCell<Vec<Rc<ChildEntry>>>,
    sources: RefCell<Vec<Rc<SourceEntry>>>,
    post: Arc<PostShared>,
    post_read: OwnedFd,
    quit_requested: Cell<bool>,
    exit_code: Cell<i32>,
    run_depth: Cell<u32>,
}

impl MainLoop {
    fn new() -> Result<MainLoop, Error> {
        signal_pipe()?;
        let (post_read, post_write) = rustix::pipe::pipe_with(
            rustix::pipe::PipeFlags::NONBLOCK | rustix::pipe::PipeFlags::CLOEXEC,
        )?;
        Ok(MainLoop {
            timeouts: RefCell::new(Vec::new()),
            idlers: RefCell::new(Vec::new()),
            fds: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
            sources: RefCell::new(Vec::new()),
            post: Arc::new(PostShared {
                jobs: Mutex::new(VecDeque::new()),
                wake: post_write,
            }),
            post_read,
            quit_requested: Cell::new(false),
            exit_code: Cell::new(0),
            run_depth: Cell::new(0),
        })
    }
}

thread_local! {
    static LOOP: RefCell<Option<Rc<MainLoop>>> = const { RefCell::new(None) };
}

fn with_loop<R>(f: impl FnOnce(&Rc<MainLoop>) -> R) -> R {
    let ml = LOOP.with(|l| l.borrow().clone());
    match ml {
        Some(ml) => f(&ml),
        None => panic!("mainloop API used before init()"),
    }
}

/// Bring the loop up on the current thread. Idempotent.
pub fn init() -> Result<(), Error> {
    LOOP.with(|l| {
        if l.borrow().is_some() {
            return Ok(());
        }
        let ml = Rc::new(MainLoop::new()?);
        *l.borrow_mut() = Some(ml);
        Ok(())
    })
}

/// Tear the loop down, releasing every registration. A later [`init`]
/// starts fresh.
pub fn shutdown() {
    let ml = LOOP.with(|l| l.borrow_mut().take());
    if let Some(ml) = ml {
        if ml.run_depth.get() > 0 {
            error!("mainloop shutdown() called while run() is active");
        }
    }
}

pub fn is_initialized() -> bool {
    LOOP.with(|l| l.borrow().is_some())
}

/// Dispatch until [`quit`]. Nested calls are allowed; the innermost `quit`
/// exits one level. Returns the exit code.
pub fn run() -> i32 {
    with_loop(|ml| {
        ml.run_depth.set(ml.run_depth.get() + 1);
        loop {
            iter(ml);
            if ml.quit_requested.replace(false) {
                break;
            }
        }
        ml.run_depth.set(ml.run_depth.get() - 1);
        ml.exit_code.get()
    })
}

pub fn quit() {
    quit_with_code(0)
}

pub fn quit_with_code(code: i32) {
    with_loop(|ml| {
        ml.exit_code.set(code);
        ml.quit_requested.set(true);
    })
}

/// Handle for the loop's cross-thread post queue.
pub fn dispatcher() -> Dispatcher {
    with_loop(|ml| Dispatcher {
        shared: ml.post.clone(),
    })
}

macro_rules! cancel_handle {
    ($(#[$meta:meta])* $name:ident, $entry:ty) => {
        $(#[$meta])*
        pub struct $name(Weak<$entry>);

        impl $name {
            /// Stop the callback from firing again. The loop releases the
            /// entry after the current pass.
            pub fn cancel(self) {
                if let Some(entry) = self.0.upgrade() {
                    entry.removed.set(true);
                }
            }

            /// Whether the registration is still live.
            pub fn is_active(&self) -> bool {
                self.0.upgrade().is_some_and(|e| !e.removed.get())
            }
        }
    };
}

cancel_handle!(TimeoutHandle, TimeoutEntry);
cancel_handle!(IdleHandle, IdleEntry);
cancel_handle!(FdHandle, FdEntry);
cancel_handle!(ChildWatchHandle, ChildEntry);
cancel_handle!(SourceHandle, SourceEntry);

/// Run `cb` every `interval` until it returns `false` or the handle is
/// cancelled. The first invocation happens no earlier than `interval` from
/// now; re-arming is relative to each dispatch.
pub fn timeout_add(interval: Duration, cb: impl FnMut() -> bool + 'static) -> TimeoutHandle {
    with_loop(|ml| {
        let entry = Rc::new(TimeoutEntry {
            interval,
            expire: Cell::new(time::now() + interval),
            cb: RefCell::new(Box::new(cb)),
            removed: Cell::new(false),
        });
        let handle = TimeoutHandle(Rc::downgrade(&entry));
        ml.timeouts.borrow_mut().push(entry);
        handle
    })
}

/// Run `cb` whenever a pass has no expired timers left, until it returns
/// `false`. Idlers registered during a pass first run in the next one.
pub fn idle_add(cb: impl FnMut() -> bool + 'static) -> IdleHandle {
    with_loop(|ml| {
        let entry = Rc::new(IdleEntry {
            cb: RefCell::new(Box::new(cb)),
            removed: Cell::new(false),
            fresh: Cell::new(ml.run_depth.get() > 0),
        });
        let handle = IdleHandle(Rc::downgrade(&entry));
        ml.idlers.borrow_mut().push(entry);
        handle
    })
}

/// Watch `fd` for `interest` plus the always-on error conditions. The
/// callback receives the active flags and keeps the watch by returning
/// `true`.
pub fn fd_add(
    fd: RawFd,
    interest: FdFlags,
    cb: impl FnMut(RawFd, FdFlags) -> bool + 'static,
) -> FdHandle {
    with_loop(|ml| {
        let entry = Rc::new(FdEntry {
            fd,
            interest,
            cb: RefCell::new(Box::new(cb)),
            removed: Cell::new(false),
        });
        let handle = FdHandle(Rc::downgrade(&entry));
        ml.fds.borrow_mut().push(entry);
        handle
    })
}

/// Invoke `cb` once with `(pid, status)` when the child exits. The status is
/// the exit code, or 128 plus the signal number for signal deaths.
pub fn child_watch_add(pid: i32, cb: impl FnOnce(i32, i32) + 'static) -> ChildWatchHandle {
    with_loop(|ml| {
        let entry = Rc::new(ChildEntry {
            pid,
            cb: RefCell::new(Some(Box::new(cb))),
            removed: Cell::new(false),
        });
        let handle = ChildWatchHandle(Rc::downgrade(&entry));
        ml.children.borrow_mut().push(entry);
        handle
    })
}

/// Plug a polymorphic [`Source`] into the loop. Sources dispatch in
/// registration order.
pub fn source_add(source: Box<dyn Source>) -> SourceHandle {
    with_loop(|ml| {
        let entry = Rc::new(SourceEntry {
            source: RefCell::new(source),
            removed: Cell::new(false),
            ready: Cell::new(false),
            next_timeout: Cell::new(None),
        });
        let handle = SourceHandle(Rc::downgrade(&entry));
        ml.sources.borrow_mut().push(entry);
        handle
    })
}

fn sources_prepare(ml: &MainLoop) {
    let snapshot: Vec<_> = ml.sources.borrow().iter().cloned().collect();
    for entry in snapshot {
        if entry.removed.get() {
            continue;
        }
        let Ok(mut source) = entry.source.try_borrow_mut() else {
            continue;
        };
        entry.ready.set(source.prepare());
        entry.next_timeout.set(source.timeout());
    }
}

fn timeout_process(ml: &MainLoop) {
    let now = time::now();
    let mut expired: Vec<_> = ml
        .timeouts
        .borrow()
        .iter()
        .filter(|t| !t.removed.get() && t.expire.get() <= now)
        .cloned()
        .collect();
    expired.sort_by_key(|t| t.expire.get());
    for entry in expired {
        if entry.removed.get() {
            continue;
        }
        let Ok(mut cb) = entry.cb.try_borrow_mut() else {
            continue;
        };
        let keep = cb();
        drop(cb);
        if entry.removed.get() {
            continue;
        }
        if keep {
            entry.expire.set(time::now() + entry.interval);
        } else {
            entry.removed.set(true);
        }
    }
}

fn idler_process(ml: &MainLoop) {
    let snapshot: Vec<_> = ml
        .idlers
        .borrow()
        .iter()
        .filter(|i| !i.removed.get() && !i.fresh.get())
        .cloned()
        .collect();
    for entry in snapshot {
        if entry.removed.get() {
            continue;
        }
        let Ok(mut cb) = entry.cb.try_borrow_mut() else {
            continue;
        };
        let keep = cb();
        drop(cb);
        if !keep {
            entry.removed.set(true);
        }
    }
}

/// Poll timeout in milliseconds; -1 blocks until an fd or signal wakes us.
fn next_wait(ml: &MainLoop) -> i32 {
    // fresh idlers count too: they run next pass, so the poll must not block
    let idler_runnable = ml.idlers.borrow().iter().any(|i| !i.removed.get());
    if idler_runnable {
        return 0;
    }
    let source_ready = ml
        .sources
        .borrow()
        .iter()
        .any(|s| !s.removed.get() && s.ready.get());
    if source_ready {
        return 0;
    }
    let now = time::now();
    let mut deadline: Option<Duration> = None;
    for entry in ml.timeouts.borrow().iter() {
        if entry.removed.get() {
            continue;
        }
        let left = entry.expire.get().saturating_sub(now);
        deadline = Some(deadline.map_or(left, |d| d.min(left)));
    }
    for entry in ml.sources.borrow().iter() {
        if entry.removed.get() {
            continue;
        }
        if let Some(left) = entry.next_timeout.get() {
            deadline = Some(deadline.map_or(left, |d| d.min(left)));
        }
    }
    match deadline {
        None => -1,
        Some(d) => {
            // round up so we never wake before the deadline and spin
            let mut ms = d.as_millis() as i64;
            if d.as_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as i64) as i32
        }
    }
}

fn drain_pipe(fd: BorrowedFd<'_>) {
    let mut buf = [0u8; 64];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => break,
        }
    }
}

fn poll_wait(ml: &MainLoop, timeout_ms: i32) -> Vec<(Rc<FdEntry>, FdFlags)> {
    let entries: Vec<_> = ml
        .fds
        .borrow()
        .iter()
        .filter(|e| !e.removed.get())
        .cloned()
        .collect();
    let signal_fd = SIGNAL_PIPE.get().map(|p| p.read.as_fd());
    let mut pollfds: Vec<PollFd<'_>> = Vec::with_capacity(entries.len() + 2);
    pollfds.push(PollFd::new(&ml.post_read, PollFlags::IN));
    if let Some(fd) = signal_fd {
        pollfds.push(PollFd::from_borrowed_fd(fd, PollFlags::IN));
    }
    let internal = pollfds.len();
    for entry in &entries {
        let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
        pollfds.push(PollFd::from_borrowed_fd(fd, to_poll_flags(entry.interest)));
    }
    match rustix::event::poll(&mut pollfds, timeout_ms) {
        Ok(_) => {}
        Err(rustix::io::Errno::INTR) => return Vec::new(),
        Err(err) => {
            error!(?err, "poll failed");
            return Vec::new();
        }
    }
    if !pollfds[0].revents().is_empty() {
        drain_pipe(ml.post_read.as_fd());
    }
    if internal > 1 && !pollfds[1].revents().is_empty() {
        if let Some(fd) = signal_fd {
            drain_pipe(fd);
        }
    }
    let mut ready = Vec::new();
    for (entry, pollfd) in entries.iter().zip(&pollfds[internal..]) {
        let active = from_poll_flags(pollfd.revents());
        if !active.is_empty() {
            ready.push((entry.clone(), active));
        }
    }
    ready
}

fn encode_wait_status(status: rustix::process::WaitStatus) -> i32 {
    if let Some(code) = status.exit_status() {
        code as i32
    } else if let Some(sig) = status.terminating_signal() {
        128 + sig as i32
    } else {
        -1
    }
}

fn child_process(ml: &MainLoop) {
    CHILD_PENDING.store(false, Ordering::SeqCst);
    let snapshot: Vec<_> = ml
        .children
        .borrow()
        .iter()
        .filter(|c| !c.removed.get())
        .cloned()
        .collect();
    for entry in snapshot {
        let Some(pid) = rustix::process::Pid::from_raw(entry.pid) else {
            entry.removed.set(true);
            continue;
        };
        match rustix::process::waitpid(Some(pid), rustix::process::WaitOptions::NOHANG) {
            Ok(Some(status)) => {
                entry.removed.set(true);
                let cb = entry.cb.borrow_mut().take();
                if let Some(cb) = cb {
                    cb(entry.pid, encode_wait_status(status));
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(pid = entry.pid, ?err, "waitpid failed, dropping watch");
                entry.removed.set(true);
            }
        }
    }
}

fn post_process(ml: &MainLoop) {
    loop {
        let job = ml
            .post
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

fn source_dispatch(ml: &MainLoop) {
    let snapshot: Vec<_> = ml.sources.borrow().iter().cloned().collect();
    for entry in snapshot {
        if entry.removed.get() {
            continue;
        }
        let Ok(mut source) = entry.source.try_borrow_mut() else {
            continue;
        };
        let ready = entry.ready.replace(false) || source.check();
        if ready {
            source.dispatch();
        }
    }
}

fn fd_process(ready: Vec<(Rc<FdEntry>, FdFlags)>) {
    for (entry, active) in ready {
        if entry.removed.get() {
            continue;
        }
        let Ok(mut cb) = entry.cb.try_borrow_mut() else {
            continue;
        };
        let keep = cb(entry.fd, active);
        drop(cb);
        if !keep {
            entry.removed.set(true);
        }
    }
}

fn prune(ml: &MainLoop) {
    ml.timeouts.borrow_mut().retain(|e| !e.removed.get());
    ml.idlers.borrow_mut().retain(|e| !e.removed.get());
    ml.fds.borrow_mut().retain(|e| !e.removed.get());
    ml.children.borrow_mut().retain(|e| !e.removed.get());
    ml.sources.borrow_mut().retain(|e| !e.removed.get());
}

fn iter(ml: &MainLoop) {
    sources_prepare(ml);
    timeout_process(ml);
    idler_process(ml);
    let wait = if ml.quit_requested.get() {
        0
    } else {
        next_wait(ml)
    };
    let ready = poll_wait(ml, wait);
    if !ml.children.borrow().is_empty() {
        child_process(ml);
    }
    post_process(ml);
    source_dispatch(ml);
    fd_process(ready);
    if TERM_PENDING.swap(false, Ordering::SeqCst) {
        ml.quit_requested.set(true);
    }
    for idler in ml.idlers.borrow().iter() {
        idler.fresh.set(false);
    }
    prune(ml);
}
