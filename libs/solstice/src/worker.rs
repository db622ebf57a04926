//! Offload blocking work to a helper thread and re-enter the loop safely.
//!
//! The worker thread runs `setup` once, `iterate` until it returns `false`
//! or cancellation is requested, then `cleanup`. `feedback` and `finished`
//! run on the loop thread; `feedback` requests made before the loop gets to
//! run coalesce into one invocation. `cancel` blocks until the worker has
//! exited and then runs `finished` synchronously.
//!
//! Shared `data` crosses threads, so mutation discipline is the caller's
//! responsibility (interior mutability with atomics or a mutex).

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

use crate::mainloop::Dispatcher;
use crate::{Error, mainloop};

pub struct WorkerConfig<T> {
    /// Runs once on the worker thread; returning `false` skips `iterate`
    /// and `cleanup`.
    pub setup: Option<Box<dyn FnMut(&WorkerCtl, &T) -> bool + Send>>,
    /// Runs once on the worker thread after iteration ends.
    pub cleanup: Option<Box<dyn FnMut(&WorkerCtl, &T) + Send>>,
    /// Runs repeatedly on the worker thread while it returns `true`.
    pub iterate: Box<dyn FnMut(&WorkerCtl, &T) -> bool + Send>,
    /// Runs on the loop thread during [`Worker::cancel`].
    pub cancel: Option<Box<dyn FnMut(&T)>>,
    /// Runs on the loop thread once the worker has terminated; receives the
    /// data back. The handle is invalid afterwards.
    pub finished: Option<Box<dyn FnOnce(T)>>,
    /// Runs on the loop thread when the worker called
    /// [`WorkerCtl::feedback`].
    pub feedback: Option<Box<dyn FnMut(&T)>>,
}

impl<T> WorkerConfig<T> {
    pub fn new(iterate: impl FnMut(&WorkerCtl, &T) -> bool + Send + 'static) -> Self {
        WorkerConfig {
            setup: None,
            cleanup: None,
            iterate: Box::new(iterate),
            cancel: None,
            finished: None,
            feedback: None,
        }
    }
}

struct Flags {
    cancelled: AtomicBool,
    // one pending main-thread feedback at a time
    feedback_pending: Mutex<bool>,
}

/// Worker-thread-side control surface, passed to the worker callbacks.
#[derive(Clone)]
pub struct WorkerCtl {
    flags: Arc<Flags>,
    dispatcher: Dispatcher,
    id: u64,
}

impl WorkerCtl {
    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::Relaxed)
    }

    /// Schedule the main-thread `feedback` callback. Multiple calls before
    /// the loop runs collapse into one invocation.
    pub fn feedback(&self) {
        let mut pending = self
            .flags
            .feedback_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *pending {
            return;
        }
        *pending = true;
        drop(pending);
        let id = self.id;
        if self.dispatcher.post(move || feedback_dispatch(id)).is_err() {
            error!("worker feedback lost, loop is gone");
        }
    }
}

struct MainRecord {
    join: Option<std::thread::JoinHandle<()>>,
    flags: Arc<Flags>,
    cancel: Option<Box<dyn FnMut()>>,
    feedback: Option<Box<dyn FnMut()>>,
    finished: Option<Box<dyn FnOnce()>>,
}

thread_local! {
    static WORKERS: RefCell<HashMap<u64, MainRecord>> = RefCell::new(HashMap::new());
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a running worker, held on the loop thread.
pub struct Worker {
    id: u64,
    flags: Arc<Flags>,
}

impl Worker {
    /// Spawn a helper thread around `data`. Requires an initialized loop on
    /// the calling thread.
    pub fn spawn<T>(data: T, config: WorkerConfig<T>) -> Result<Worker, Error>
    where
        T: Send + Sync + 'static,
    {
        let WorkerConfig {
            mut setup,
            mut cleanup,
            mut iterate,
            mut cancel,
            finished,
            mut feedback,
        } = config;
        let dispatcher = mainloop::dispatcher();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let flags = Arc::new(Flags {
            cancelled: AtomicBool::new(false),
            feedback_pending: Mutex::new(false),
        });
        let data = Arc::new(data);

        let ctl = WorkerCtl {
            flags: flags.clone(),
            dispatcher: dispatcher.clone(),
            id,
        };
        let worker_data = data.clone();
        let worker_dispatcher = dispatcher.clone();
        let thread = std::thread::Builder::new()
            .name(format!("solstice-worker-{id}"))
            .spawn(move || {
                let data = worker_data;
                debug!(id, "worker thread started");
                let ok = match setup.as_mut() {
                    Some(setup) => setup(&ctl, &data),
                    None => true,
                };
                if ok {
                    while !ctl.is_cancelled() && iterate(&ctl, &data) {}
                    if let Some(cleanup) = cleanup.as_mut() {
                        cleanup(&ctl, &data);
                    }
                }
                drop(data);
                drop(ctl);
                debug!(id, "worker thread stopped");
                if worker_dispatcher.post(move || finish(id)).is_err() {
                    error!(id, "worker finished but the loop is gone");
                }
            })
            .map_err(|err| {
                error!(?err, "failed to spawn worker thread");
                Error::NoResources
            })?;

        let cancel_data = data.clone();
        let feedback_data = data.clone();
        let record = MainRecord {
            join: Some(thread),
            flags: flags.clone(),
            cancel: cancel.take().map(|mut cb| {
                Box::new(move || cb(&cancel_data)) as Box<dyn FnMut()>
            }),
            feedback: feedback.take().map(|mut cb| {
                Box::new(move || cb(&feedback_data)) as Box<dyn FnMut()>
            }),
            finished: finished.map(|cb| {
                Box::new(move || match Arc::try_unwrap(data) {
                    Ok(data) => cb(data),
                    Err(_) => error!("worker data still referenced at finish"),
                }) as Box<dyn FnOnce()>
            }),
        };
        WORKERS.with(|w| w.borrow_mut().insert(id, record));
        Ok(Worker { id, flags })
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation, wait for the worker to exit and run `finished`.
    /// No-op if the worker already finished.
    pub fn cancel(self) {
        let record = WORKERS.with(|w| w.borrow_mut().remove(&self.id));
        let Some(mut record) = record else {
            return;
        };
        self.flags.cancelled.store(true, Ordering::SeqCst);
        if let Some(cancel) = record.cancel.as_mut() {
            cancel();
        }
        finish_record(record);
    }
}

fn finish_record(mut record: MainRecord) {
    if let Some(join) = record.join.take() {
        if join.join().is_err() {
            error!("worker thread panicked");
        }
    }
    // release the feedback capture's data reference before handing the
    // data back
    record.cancel = None;
    record.feedback = None;
    if let Some(finished) = record.finished.take() {
        finished();
    }
}

fn finish(id: u64) {
    let record = WORKERS.with(|w| w.borrow_mut().remove(&id));
    if let Some(record) = record {
        finish_record(record);
    }
}

fn feedback_dispatch(id: u64) {
    // clear the pending flag before the callback so a feedback() issued
    // from inside it schedules another pass
    let cleared = WORKERS.with(|w| {
        let workers = w.borrow();
        workers.get(&id).map(|record| {
            *record
                .flags
                .feedback_pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = false;
        })
    });
    if cleared.is_none() {
        return;
    }
    // take the callback out so the worker map is not borrowed across it
    let cb = WORKERS.with(|w| w.borrow_mut().get_mut(&id).and_then(|r| r.feedback.take()));
    if let Some(mut cb) = cb {
        cb();
        WORKERS.with(|w| {
            if let Some(record) = w.borrow_mut().get_mut(&id) {
                record.feedback = Some(cb);
            }
        });
    }
}
