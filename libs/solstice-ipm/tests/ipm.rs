use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use solstice::Error;
use solstice::blob::Blob;
use solstice::mainloop;
use solstice_ipm as ipm;

fn failsafe() -> mainloop::TimeoutHandle {
    mainloop::timeout_add(Duration::from_secs(10), || {
        panic!("test wedged, loop never quit");
    })
}

#[test]
fn ids_outside_range_are_rejected() {
    mainloop::init().unwrap();
    let blob = Blob::new(&b"x"[..]);
    assert!(matches!(
        ipm::set_receiver(0, Some(Box::new(|_, _| {}))),
        Err(Error::InvalidArgument)
    ));
    assert!(matches!(
        ipm::send(0, blob.clone(), None),
        Err(Error::InvalidArgument)
    ));
    assert!(matches!(
        ipm::send(ipm::max_id() + 1, blob, None),
        Err(Error::InvalidArgument)
    ));
    mainloop::shutdown();
}

#[test]
fn receiver_slot_is_exclusive() {
    mainloop::init().unwrap();
    ipm::set_receiver(3, Some(Box::new(|_, _| {}))).unwrap();
    assert!(matches!(
        ipm::set_receiver(3, Some(Box::new(|_, _| {}))),
        Err(Error::AlreadyExists)
    ));
    ipm::set_receiver(3, None).unwrap();
    assert!(matches!(ipm::set_receiver(3, None), Err(Error::NotFound)));
    assert!(matches!(
        ipm::set_consumed_callback(3, None),
        Err(Error::NotFound)
    ));
    mainloop::shutdown();
}

#[test]
fn consumed_fires_once_with_the_original_blob() {
    mainloop::init().unwrap();
    let _guard = failsafe();

    let held = Rc::new(RefCell::new(None::<Blob>));
    let receiver_hold = held.clone();
    ipm::set_receiver(
        7,
        Some(Box::new(move |id, shadow| {
            assert_eq!(id, 7);
            assert_eq!(shadow.as_slice(), b"payload");
            // hold it briefly; consumption must wait for the release
            *receiver_hold.borrow_mut() = Some(shadow.clone());
        })),
    )
    .unwrap();

    let consumed = Rc::new(Cell::new(0u32));
    let consumed_count = consumed.clone();
    let original = Blob::new(&b"payload"[..]);
    let sent = original.clone();
    ipm::send(
        7,
        sent,
        Some(Box::new(move |id, blob| {
            assert_eq!(id, 7);
            assert!(Blob::ptr_eq(&blob, &original));
            consumed_count.set(consumed_count.get() + 1);
            mainloop::quit();
        })),
    )
    .unwrap();

    assert_eq!(consumed.get(), 0);
    let release = held.clone();
    mainloop::timeout_add(Duration::from_millis(30), move || {
        assert!(release.borrow().is_some());
        *release.borrow_mut() = None;
        false
    });
    mainloop::run();
    assert_eq!(consumed.get(), 1);
    ipm::set_receiver(7, None).unwrap();
    mainloop::shutdown();
}

#[test]
fn send_without_receiver_is_consumed_immediately() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let consumed = Rc::new(Cell::new(false));
    let flag = consumed.clone();
    ipm::send(
        9,
        Blob::new(&b"nobody home"[..]),
        Some(Box::new(move |_, _| {
            flag.set(true);
            mainloop::quit();
        })),
    )
    .unwrap();
    mainloop::run();
    assert!(consumed.get());
    mainloop::shutdown();
}

#[test]
fn id_level_handler_covers_sends_without_their_own_callback() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    ipm::set_consumed_callback(
        5,
        Some(Box::new(move |id, blob| {
            sink.borrow_mut().push((id, blob.as_slice().to_vec()));
            mainloop::quit();
        })),
    )
    .unwrap();
    ipm::send(5, Blob::new(&b"ack me"[..]), None).unwrap();
    mainloop::run();
    assert_eq!(*seen.borrow(), vec![(5, b"ack me".to_vec())]);
    ipm::set_consumed_callback(5, None).unwrap();
    mainloop::shutdown();
}
