//! Cooperative-multitasking runtime for IoT and edge daemons.
//!
//! One event loop drives timers, idlers, fd watches, child watches and
//! pluggable sources from a single thread; blocking work goes through the
//! worker facade and re-enters the loop via idle dispatch. The companion
//! crates build on this core: `solstice-stream` for buffered descriptor
//! I/O, `solstice-ipm` for inter-processor messaging and `solstice-bt` for
//! Bluetooth/GATT.

pub mod blob;
pub mod buffer;
pub mod codec;
mod error;
pub mod guard;
pub mod log;
pub mod mainloop;
pub mod time;
pub mod util;
pub mod worker;

pub use error::Error;

/// Default program entry: bring up logging and the loop, run `startup`,
/// dispatch until quit, run `shutdown`, tear the loop down and return the
/// exit code.
pub fn run_main(startup: impl FnOnce(), shutdown: impl FnOnce()) -> i32 {
    log::init();
    if let Err(err) = mainloop::init() {
        tracing::error!(?err, "mainloop init failed");
        return 1;
    }
    startup();
    let code = mainloop::run();
    shutdown();
    mainloop::shutdown();
    code
}
