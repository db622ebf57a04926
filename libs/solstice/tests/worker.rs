use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use solstice::mainloop;
use solstice::worker::{Worker, WorkerConfig};

fn failsafe() -> mainloop::TimeoutHandle {
    mainloop::timeout_add(Duration::from_secs(10), || {
        panic!("test wedged, loop never quit");
    })
}

struct Counters {
    setup: AtomicU32,
    iterations: AtomicU32,
    cleanup: AtomicU32,
}

impl Counters {
    fn new() -> Self {
        Counters {
            setup: AtomicU32::new(0),
            iterations: AtomicU32::new(0),
            cleanup: AtomicU32::new(0),
        }
    }
}

#[test]
fn worker_iterates_then_finishes_on_main_thread() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let finished = Rc::new(Cell::new(false));
    let finished_flag = finished.clone();
    let loop_thread = std::thread::current().id();

    let mut config = WorkerConfig::new(|_ctl, data: &Counters| {
        data.iterations.fetch_add(1, Ordering::SeqCst) < 4
    });
    config.setup = Some(Box::new(|_ctl, data: &Counters| {
        data.setup.fetch_add(1, Ordering::SeqCst);
        true
    }));
    config.cleanup = Some(Box::new(|_ctl, data: &Counters| {
        data.cleanup.fetch_add(1, Ordering::SeqCst);
    }));
    config.finished = Some(Box::new(move |data: Counters| {
        assert_eq!(std::thread::current().id(), loop_thread);
        assert_eq!(data.setup.load(Ordering::SeqCst), 1);
        assert_eq!(data.iterations.load(Ordering::SeqCst), 5);
        assert_eq!(data.cleanup.load(Ordering::SeqCst), 1);
        finished_flag.set(true);
        mainloop::quit();
    }));

    Worker::spawn(Counters::new(), config).unwrap();
    mainloop::run();
    assert!(finished.get());
    mainloop::shutdown();
}

#[test]
fn setup_failure_skips_iterate_but_still_finishes() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let finished = Rc::new(Cell::new(false));
    let finished_flag = finished.clone();

    let mut config = WorkerConfig::new(|_ctl, data: &Counters| {
        data.iterations.fetch_add(1, Ordering::SeqCst);
        false
    });
    config.setup = Some(Box::new(|_ctl, _data: &Counters| false));
    config.cleanup = Some(Box::new(|_ctl, data: &Counters| {
        data.cleanup.fetch_add(1, Ordering::SeqCst);
    }));
    config.finished = Some(Box::new(move |data: Counters| {
        assert_eq!(data.iterations.load(Ordering::SeqCst), 0);
        assert_eq!(data.cleanup.load(Ordering::SeqCst), 0);
        finished_flag.set(true);
        mainloop::quit();
    }));

    Worker::spawn(Counters::new(), config).unwrap();
    mainloop::run();
    assert!(finished.get());
    mainloop::shutdown();
}

#[test]
fn feedback_burst_coalesces_to_one_dispatch() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let barrier = Arc::new(Barrier::new(2));
    let worker_barrier = barrier.clone();
    let feedback_runs = Rc::new(Cell::new(0u32));
    let feedback_counter = feedback_runs.clone();

    let mut config = WorkerConfig::new(move |ctl, _data: &()| {
        for _ in 0..10 {
            ctl.feedback();
        }
        // hold the loop thread back until the burst is queued
        worker_barrier.wait();
        false
    });
    config.feedback = Some(Box::new(move |_data: &()| {
        feedback_counter.set(feedback_counter.get() + 1);
    }));
    config.finished = Some(Box::new(|_data: ()| {
        mainloop::quit();
    }));

    Worker::spawn((), config).unwrap();
    barrier.wait();
    mainloop::run();
    assert_eq!(feedback_runs.get(), 1);
    mainloop::shutdown();
}

#[test]
fn cancel_blocks_until_worker_exits_and_runs_finished() {
    mainloop::init().unwrap();
    let finished = Rc::new(Cell::new(0u32));
    let finished_counter = finished.clone();
    let cancel_cb = Rc::new(Cell::new(false));
    let cancel_seen = cancel_cb.clone();

    let mut config = WorkerConfig::new(|_ctl, data: &AtomicU32| {
        data.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));
        true
    });
    config.cancel = Some(Box::new(move |_data: &AtomicU32| {
        cancel_seen.set(true);
    }));
    config.finished = Some(Box::new(move |_data: AtomicU32| {
        finished_counter.set(finished_counter.get() + 1);
    }));

    let worker = Worker::spawn(AtomicU32::new(0), config).unwrap();
    // give it a moment to start iterating
    std::thread::sleep(Duration::from_millis(10));
    assert!(!worker.is_cancelled());
    worker.cancel();
    assert!(cancel_cb.get());
    assert_eq!(finished.get(), 1);

    // the worker's own finish post must now be a no-op
    let _guard = failsafe();
    mainloop::timeout_add(Duration::from_millis(20), || {
        mainloop::quit();
        false
    });
    mainloop::run();
    assert_eq!(finished.get(), 1);
    mainloop::shutdown();
}
