//! Id-routed message passing with consumed acknowledgement.
//!
//! On hosted Linux the only inter-core bus is the process itself, so the
//! transport is a loopback pair: `send` hands the receiver a shadow [`Blob`]
//! parented to the original, and when the receiver drops its last reference
//! the sender learns about it on its own main thread. Receivers and
//! consumed handlers are keyed by id; id 0 is reserved.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use solstice::Error;
use solstice::blob::Blob;
use solstice::mainloop;
use tracing::warn;

/// Highest routable id. Id 0 is reserved for the transport.
pub const fn max_id() -> u32 {
    0xffff
}

pub type ReceiverCb = Box<dyn FnMut(u32, &Blob)>;
pub type ConsumedCb = Box<dyn FnMut(u32, &Blob)>;
pub type SendConsumedCb = Box<dyn FnOnce(u32, Blob)>;

struct Inflight {
    id: u32,
    original: Blob,
    consumed: Option<SendConsumedCb>,
}

#[derive(Default)]
struct State {
    receivers: HashMap<u32, Rc<RefCell<ReceiverCb>>>,
    consumed: HashMap<u32, Rc<RefCell<ConsumedCb>>>,
    inflight: HashMap<u64, Inflight>,
    next_seq: u64,
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State::default());
}

fn check_id(id: u32) -> Result<(), Error> {
    if id == 0 || id > max_id() {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// Install (`Some`) or remove (`None`) the receiver for `id`. At most one
/// receiver per id: installing over an existing one is `AlreadyExists`,
/// removing an absent one is `NotFound`.
pub fn set_receiver(id: u32, cb: Option<ReceiverCb>) -> Result<(), Error> {
    check_id(id)?;
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        match cb {
            Some(cb) => {
                if state.receivers.contains_key(&id) {
                    return Err(Error::AlreadyExists);
                }
                state.receivers.insert(id, Rc::new(RefCell::new(cb)));
                Ok(())
            }
            None => match state.receivers.remove(&id) {
                Some(_) => Ok(()),
                None => Err(Error::NotFound),
            },
        }
    })
}

/// Install or remove the id-level consumed handler, with the same
/// replace/remove rules as [`set_receiver`]. It fires for sends on `id`
/// that did not carry their own consumed callback.
pub fn set_consumed_callback(id: u32, cb: Option<ConsumedCb>) -> Result<(), Error> {
    check_id(id)?;
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        match cb {
            Some(cb) => {
                if state.consumed.contains_key(&id) {
                    return Err(Error::AlreadyExists);
                }
                state.consumed.insert(id, Rc::new(RefCell::new(cb)));
                Ok(())
            }
            None => match state.consumed.remove(&id) {
                Some(_) => Ok(()),
                None => Err(Error::NotFound),
            },
        }
    })
}

/// Transmit `blob` on `id`. The original stays referenced while in flight;
/// once the receiver releases its last view the consumed notification runs
/// on this thread with the original blob. With no receiver installed the
/// message is released immediately, so consumption still fires.
pub fn send(id: u32, blob: Blob, consumed: Option<SendConsumedCb>) -> Result<(), Error> {
    check_id(id)?;
    let dispatcher = mainloop::dispatcher();
    let seq = STATE.with(|state| {
        let mut state = state.borrow_mut();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.inflight.insert(
            seq,
            Inflight {
                id,
                original: blob.clone(),
                consumed,
            },
        );
        seq
    });
    let shadow = Blob::share_with_free_fn(&blob, move |_| {
        if dispatcher.post(move || consumed_fire(seq)).is_err() {
            warn!(seq, "message consumed after the loop went away");
        }
    });
    let receiver = STATE.with(|state| state.borrow().receivers.get(&id).cloned());
    match receiver {
        Some(receiver) => {
            // delivery is always asynchronous, even loopback
            let mut pending = Some(shadow);
            mainloop::idle_add(move || {
                if let Some(shadow) = pending.take() {
                    (receiver.borrow_mut())(id, &shadow);
                }
                false
            });
        }
        None => drop(shadow),
    }
    Ok(())
}

fn consumed_fire(seq: u64) {
    let Some(inflight) = STATE.with(|state| state.borrow_mut().inflight.remove(&seq)) else {
        return;
    };
    let Inflight {
        id,
        original,
        consumed,
    } = inflight;
    match consumed {
        Some(cb) => cb(id, original),
        None => {
            let handler = STATE.with(|state| state.borrow().consumed.get(&id).cloned());
            if let Some(handler) = handler {
                (handler.borrow_mut())(id, &original);
            }
        }
    }
}
