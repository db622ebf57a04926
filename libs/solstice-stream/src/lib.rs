//! Buffered reader/writer over any byte-oriented descriptor.
//!
//! Outgoing data is a queue of [`Blob`]s flushed by a write monitor that
//! exists only while the queue is non-empty; `tx_size` bounds the
//! outstanding bytes and overcommitting fails with `NoSpace`. Incoming data
//! lands in a receive buffer and is handed to `rx_cb` from a deferred
//! delivery idler; the callback reports how many bytes it consumed.
//! Closing from inside a callback is safe: teardown is deferred through the
//! handle's reentrancy cell until the callback unwinds.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use solstice::blob::Blob;
use solstice::buffer::Buf;
use solstice::guard::ReentryCell;
use solstice::mainloop::{self, FdFlags, FdHandle, IdleHandle};
use solstice::Error;
use tracing::{error, warn};

/// Read chunk appended to a growable receive buffer per readiness pass.
const RX_GROW_CHUNK: usize = 1024;

pub type TxCb = Box<dyn FnMut(&Stream, &Blob, Result<usize, Error>)>;
pub type RxCb = Box<dyn FnMut(&Stream, &Buf) -> Result<usize, Error>>;

pub struct StreamConfig {
    /// Completion callback per written blob. Also receives `Cancelled` for
    /// blobs still queued at close.
    pub tx_cb: Option<TxCb>,
    /// Delivery callback; returns how many buffered bytes it consumed. No
    /// receive path is set up when absent.
    pub rx_cb: Option<RxCb>,
    /// Upper bound on queued-but-unwritten bytes; 0 means unbounded.
    pub tx_size: usize,
    /// Fixed receive buffer capacity; 0 means grow on demand.
    pub rx_size: usize,
}

impl StreamConfig {
    pub fn new() -> Self {
        StreamConfig {
            tx_cb: None,
            rx_cb: None,
            tx_size: 0,
            rx_size: 0,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct State {
    queue: VecDeque<Blob>,
    /// Bytes of the queue head already written out.
    written: usize,
    pending_bytes: usize,
    rx: Buf,
    read_watch: Option<FdHandle>,
    write_watch: Option<FdHandle>,
    delivery: Option<IdleHandle>,
}

struct Inner {
    fd: OwnedFd,
    tx_size: usize,
    cell: ReentryCell,
    torn_down: Cell<bool>,
    state: RefCell<State>,
    tx_cb: RefCell<Option<TxCb>>,
    rx_cb: RefCell<Option<RxCb>>,
}

pub struct Stream {
    inner: Rc<Inner>,
    /// The handle given to the caller; aliases passed to callbacks never
    /// tear the stream down on drop.
    owner: bool,
}

impl Stream {
    /// Wrap `fd`, which is switched to non-blocking. A read monitor is
    /// registered iff the config carries an `rx_cb`; no write monitor
    /// exists until there is data to write.
    pub fn new(config: StreamConfig, fd: OwnedFd) -> Result<Stream, Error> {
        let flags = rustix::fs::fcntl_getfl(&fd)?;
        rustix::fs::fcntl_setfl(&fd, flags | rustix::fs::OFlags::NONBLOCK)?;

        let wants_rx = config.rx_cb.is_some();
        let rx = if wants_rx && config.rx_size > 0 {
            Buf::with_fixed_capacity(config.rx_size)
        } else {
            Buf::new()
        };
        let inner = Rc::new(Inner {
            fd,
            tx_size: config.tx_size,
            cell: ReentryCell::new(),
            torn_down: Cell::new(false),
            state: RefCell::new(State {
                queue: VecDeque::new(),
                written: 0,
                pending_bytes: 0,
                rx,
                read_watch: None,
                write_watch: None,
                delivery: None,
            }),
            tx_cb: RefCell::new(config.tx_cb),
            rx_cb: RefCell::new(config.rx_cb),
        });
        if wants_rx {
            let weak = Rc::downgrade(&inner);
            let watch = mainloop::fd_add(inner.fd.as_raw_fd(), FdFlags::IN, move |_, _| {
                match weak.upgrade() {
                    Some(inner) => can_read(&inner),
                    None => false,
                }
            });
            inner.state.borrow_mut().read_watch = Some(watch);
        }
        Ok(Stream { inner, owner: true })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }

    /// Bytes queued but not yet written out.
    pub fn pending_bytes(&self) -> usize {
        self.inner.state.borrow().pending_bytes
    }

    /// Queue `blob` for transmission. With `tx_size > 0`, a total that
    /// would meet or exceed the bound fails with `NoSpace` and the blob is
    /// not retained.
    pub fn write(&self, blob: Blob) -> Result<(), Error> {
        if self.inner.cell.is_stale() {
            return Err(Error::InvalidArgument);
        }
        let mut st = self.inner.state.borrow_mut();
        let total = st.pending_bytes + blob.len();
        if self.inner.tx_size > 0 && total >= self.inner.tx_size {
            return Err(Error::NoSpace);
        }
        st.queue.push_back(blob);
        st.pending_bytes = total;
        if st.write_watch.is_none() {
            let weak = Rc::downgrade(&self.inner);
            st.write_watch = Some(mainloop::fd_add(
                self.inner.fd.as_raw_fd(),
                FdFlags::OUT,
                move |_, _| match weak.upgrade() {
                    Some(inner) => can_write(&inner),
                    None => false,
                },
            ));
        }
        Ok(())
    }

    /// Release the stream. Inside a callback the actual teardown waits for
    /// the callback to unwind; either way each queued blob gets a
    /// `Cancelled` completion and a non-empty receive buffer is delivered
    /// one final time.
    pub fn close(&self) {
        if self.inner.cell.is_stale() {
            return;
        }
        self.inner.cell.mark_stale();
        if self.inner.cell.in_use() {
            return;
        }
        teardown(&self.inner);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cell.is_stale()
    }

    fn alias(inner: &Rc<Inner>) -> Stream {
        Stream {
            inner: inner.clone(),
            owner: false,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.owner {
            self.close();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some(h) = st.delivery.take() {
            h.cancel();
        }
        if let Some(h) = st.read_watch.take() {
            h.cancel();
        }
        if let Some(h) = st.write_watch.take() {
            h.cancel();
        }
    }
}

fn invoke_tx_cb(inner: &Rc<Inner>, blob: &Blob, status: Result<usize, Error>) {
    {
        let stream = Stream::alias(inner);
        let mut cb = inner.tx_cb.borrow_mut();
        if let Some(cb) = cb.as_mut() {
            inner.cell.enter(|| cb(&stream, blob, status));
        }
    }
    if inner.cell.should_destroy() {
        teardown(inner);
    }
}

/// Write monitor callback: flush the queue head's unwritten tail.
fn can_write(inner: &Rc<Inner>) -> bool {
    if inner.torn_down.get() {
        return false;
    }
    let mut st = inner.state.borrow_mut();
    let Some(blob) = st.queue.front().cloned() else {
        st.write_watch = None;
        return false;
    };
    let written = st.written;
    match rustix::io::write(&inner.fd, &blob.as_slice()[written..]) {
        Err(rustix::io::Errno::AGAIN | rustix::io::Errno::INTR) => true,
        Err(err) => {
            warn!(fd = inner.fd.as_raw_fd(), ?err, "stream write failed");
            st.write_watch = None;
            st.pending_bytes -= blob.len() - st.written;
            st.written = 0;
            st.queue.pop_front();
            drop(st);
            invoke_tx_cb(inner, &blob, Err(err.into()));
            false
        }
        Ok(n) => {
            st.written += n;
            st.pending_bytes -= n;
            if st.written < blob.len() {
                return true;
            }
            st.queue.pop_front();
            st.written = 0;
            let keep = !st.queue.is_empty();
            if !keep {
                st.write_watch = None;
            }
            drop(st);
            invoke_tx_cb(inner, &blob, Ok(blob.len()));
            keep && !inner.torn_down.get()
        }
    }
}

fn schedule_delivery(inner: &Rc<Inner>, st: &mut State) {
    if !st.rx.is_empty() && st.delivery.is_none() {
        let weak = Rc::downgrade(inner);
        st.delivery = Some(mainloop::idle_add(move || match weak.upgrade() {
            Some(inner) => deliver(&inner),
            None => false,
        }));
    }
}

/// Read monitor callback: fill the buffer tail and schedule delivery.
fn can_read(inner: &Rc<Inner>) -> bool {
    if inner.torn_down.get() {
        return false;
    }
    let mut st = inner.state.borrow_mut();
    let read = match st.rx.reserve_tail(RX_GROW_CHUNK) {
        Ok(tail) => rustix::io::read(&inner.fd, tail),
        // fixed buffer is full; keep the monitor, delivery frees room
        Err(_) => {
            schedule_delivery(inner, &mut st);
            return true;
        }
    };
    match read {
        Err(rustix::io::Errno::AGAIN | rustix::io::Errno::INTR) => true,
        Err(err) => {
            warn!(fd = inner.fd.as_raw_fd(), ?err, "stream read failed");
            st.read_watch = None;
            false
        }
        Ok(0) => {
            // eof
            st.read_watch = None;
            schedule_delivery(inner, &mut st);
            false
        }
        Ok(n) => {
            st.rx.commit(n);
            schedule_delivery(inner, &mut st);
            true
        }
    }
}

/// Deferred delivery idler: hand the buffer to `rx_cb`, drop what it
/// consumed, stay scheduled while data remains.
fn deliver(inner: &Rc<Inner>) -> bool {
    if inner.torn_down.get() {
        return false;
    }
    let mut rx = std::mem::take(&mut inner.state.borrow_mut().rx);
    let result = {
        let stream = Stream::alias(inner);
        let mut cb = inner.rx_cb.borrow_mut();
        match cb.as_mut() {
            Some(cb) => inner.cell.enter(|| cb(&stream, &rx)),
            None => Ok(rx.len()),
        }
    };
    match result {
        Ok(consumed) => {
            let consumed = consumed.min(rx.len());
            if rx.remove_front(consumed).is_err() {
                error!("stream rx consumed count out of range");
            }
        }
        Err(err) => error!(?err, "stream rx callback failed"),
    }
    let keep = !rx.is_empty();
    {
        let mut st = inner.state.borrow_mut();
        st.rx = rx;
        if !keep {
            st.delivery = None;
        }
    }
    if inner.cell.should_destroy() {
        teardown(inner);
        return false;
    }
    keep
}

/// Final teardown, runs exactly once.
fn teardown(inner: &Rc<Inner>) {
    if inner.torn_down.replace(true) {
        return;
    }
    let (queued, rx) = {
        let mut st = inner.state.borrow_mut();
        if let Some(h) = st.delivery.take() {
            h.cancel();
        }
        if let Some(h) = st.read_watch.take() {
            h.cancel();
        }
        if let Some(h) = st.write_watch.take() {
            h.cancel();
        }
        st.pending_bytes = 0;
        st.written = 0;
        let queued: Vec<Blob> = st.queue.drain(..).collect();
        (queued, std::mem::take(&mut st.rx))
    };
    let stream = Stream::alias(inner);
    {
        let mut cb = inner.tx_cb.borrow_mut();
        if let Some(cb) = cb.as_mut() {
            for blob in &queued {
                cb(&stream, blob, Err(Error::Cancelled));
            }
        }
    }
    drop(queued);
    if !rx.is_empty() {
        let mut cb = inner.rx_cb.borrow_mut();
        if let Some(cb) = cb.as_mut() {
            let _ = cb(&stream, &rx);
        }
    }
}
