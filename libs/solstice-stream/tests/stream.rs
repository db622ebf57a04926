use std::cell::{Cell, RefCell};
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::time::Duration;

use solstice::Error;
use solstice::blob::Blob;
use solstice::mainloop;
use solstice_stream::{Stream, StreamConfig};

fn failsafe() -> mainloop::TimeoutHandle {
    mainloop::timeout_add(Duration::from_secs(10), || {
        panic!("test wedged, loop never quit");
    })
}

fn socket_pair() -> (OwnedFd, OwnedFd) {
    rustix::net::socketpair(
        rustix::net::AddressFamily::UNIX,
        rustix::net::SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    )
    .unwrap()
}

fn read_all(fd: &OwnedFd) -> Vec<u8> {
    let flags = rustix::fs::fcntl_getfl(fd).unwrap();
    rustix::fs::fcntl_setfl(fd, flags | rustix::fs::OFlags::NONBLOCK).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match rustix::io::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(rustix::io::Errno::AGAIN) => break,
            Err(err) => panic!("read failed: {err}"),
        }
    }
    out
}

#[test]
fn writes_are_delivered_in_order_with_one_tx_cb_each() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let (local, peer) = socket_pair();
    let completions = Rc::new(RefCell::new(Vec::new()));
    let sink = completions.clone();
    let mut config = StreamConfig::new();
    config.tx_cb = Some(Box::new(move |_stream, blob, status| {
        sink.borrow_mut()
            .push((blob.as_slice().to_vec(), status.is_ok()));
        if sink.borrow().len() == 3 {
            mainloop::quit();
        }
    }));
    let stream = Stream::new(config, local).unwrap();
    stream.write(Blob::new(&b"one "[..])).unwrap();
    stream.write(Blob::new(&b"two "[..])).unwrap();
    stream.write(Blob::new(&b"three"[..])).unwrap();
    assert_eq!(stream.pending_bytes(), 13);
    mainloop::run();
    assert_eq!(stream.pending_bytes(), 0);
    let completions = completions.borrow();
    assert_eq!(completions.len(), 3);
    assert!(completions.iter().all(|(_, ok)| *ok));
    assert_eq!(completions[0].0, b"one ");
    assert_eq!(completions[2].0, b"three");
    assert_eq!(read_all(&peer), b"one two three");
    stream.close();
    mainloop::shutdown();
}

#[test]
fn backpressure_rejects_then_accepts_after_drain() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let (local, peer) = socket_pair();
    let drained = Rc::new(Cell::new(0u32));
    let drained_count = drained.clone();
    let mut config = StreamConfig::new();
    config.tx_size = 10;
    config.tx_cb = Some(Box::new(move |stream, _blob, status| {
        assert!(status.is_ok());
        let n = drained_count.get() + 1;
        drained_count.set(n);
        if n == 1 {
            // queue drained; the rejected size now fits
            stream.write(Blob::new(&b"56789"[..])).unwrap();
        } else {
            mainloop::quit();
        }
    }));
    let stream = Stream::new(config, local).unwrap();
    stream.write(Blob::new(&b"abcdef"[..])).unwrap();

    let rejected = Blob::new(&b"56789"[..]);
    assert!(matches!(
        stream.write(rejected.clone()),
        Err(Error::NoSpace)
    ));
    // the blob was not retained
    assert_eq!(rejected.refcount(), 1);

    mainloop::run();
    assert_eq!(drained.get(), 2);
    assert_eq!(read_all(&peer), b"abcdef56789");
    stream.close();
    mainloop::shutdown();
}

#[test]
fn stream_echo_splits_lines_into_blobs() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let (in_local, in_peer) = socket_pair();
    let (out_local, out_peer) = socket_pair();

    let blobs = Rc::new(RefCell::new(Vec::new()));
    let blobs_sink = blobs.clone();
    let mut out_config = StreamConfig::new();
    out_config.tx_cb = Some(Box::new(move |_stream, blob, status| {
        assert!(status.is_ok());
        blobs_sink.borrow_mut().push(blob.as_slice().to_vec());
        if blobs_sink.borrow().len() == 3 {
            mainloop::quit();
        }
    }));
    let out = Rc::new(Stream::new(out_config, out_local).unwrap());

    let echo_out = out.clone();
    let mut in_config = StreamConfig::new();
    in_config.rx_cb = Some(Box::new(move |_stream, buf| {
        let data = buf.as_slice();
        let mut consumed = 0;
        while let Some(nl) = data[consumed..].iter().position(|b| *b == b'\n') {
            let line = &data[consumed..consumed + nl];
            echo_out.write(Blob::new(line)).unwrap();
            consumed += nl + 1;
        }
        Ok(consumed)
    }));
    let input = Stream::new(in_config, in_local).unwrap();

    rustix::io::write(&in_peer, b"hello\nworld\nBye\n").unwrap();
    mainloop::run();

    assert_eq!(
        *blobs.borrow(),
        vec![b"hello".to_vec(), b"world".to_vec(), b"Bye".to_vec()]
    );
    assert_eq!(read_all(&out_peer), b"helloworldBye");
    input.close();
    out.close();
    assert!(input.is_closed() && out.is_closed());
    drop(in_peer);
    mainloop::shutdown();
}

#[test]
fn close_inside_rx_cb_defers_teardown_until_unwind() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let (local, peer) = socket_pair();
    let deliveries = Rc::new(Cell::new(0u32));
    let counter = deliveries.clone();
    let mut config = StreamConfig::new();
    config.rx_cb = Some(Box::new(move |stream, buf| {
        counter.set(counter.get() + 1);
        stream.close();
        // still usable within this frame
        assert!(stream.is_closed());
        Ok(buf.len())
    }));
    let stream = Stream::new(config, local).unwrap();
    rustix::io::write(&peer, b"data").unwrap();
    mainloop::timeout_add(Duration::from_millis(50), || {
        mainloop::quit();
        false
    });
    mainloop::run();
    assert_eq!(deliveries.get(), 1);
    assert!(matches!(
        stream.write(Blob::new(&b"x"[..])),
        Err(Error::InvalidArgument)
    ));
    // the read monitor is gone; more peer data never reaches the callback
    rustix::io::write(&peer, b"more").unwrap();
    mainloop::timeout_add(Duration::from_millis(30), || {
        mainloop::quit();
        false
    });
    mainloop::run();
    assert_eq!(deliveries.get(), 1);
    mainloop::shutdown();
}

#[test]
fn close_cancels_queued_blobs_and_flushes_rx() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let (local, peer) = socket_pair();
    let cancelled = Rc::new(RefCell::new(Vec::new()));
    let final_rx = Rc::new(RefCell::new(Vec::new()));
    let cancelled_sink = cancelled.clone();
    let final_sink = final_rx.clone();
    let mut config = StreamConfig::new();
    config.tx_cb = Some(Box::new(move |_stream, blob, status| {
        if matches!(status, Err(Error::Cancelled)) {
            cancelled_sink.borrow_mut().push(blob.as_slice().to_vec());
        }
    }));
    config.rx_cb = Some(Box::new(move |_stream, buf| {
        final_sink.borrow_mut().extend_from_slice(buf.as_slice());
        // consume nothing so close() has something to flush
        Ok(0)
    }));
    let stream = Stream::new(config, local).unwrap();

    // park data in the rx buffer without letting delivery consume it
    rustix::io::write(&peer, b"tail").unwrap();
    mainloop::timeout_add(Duration::from_millis(40), || {
        mainloop::quit();
        false
    });
    mainloop::run();

    // queue a blob that never gets a chance to flush
    stream.write(Blob::new(&b"queued"[..])).unwrap();
    final_rx.borrow_mut().clear();
    stream.close();
    assert_eq!(*cancelled.borrow(), vec![b"queued".to_vec()]);
    assert_eq!(*final_rx.borrow(), b"tail");
    mainloop::shutdown();
}

#[test]
fn dropping_an_unclosed_stream_runs_teardown() {
    mainloop::init().unwrap();
    let _guard = failsafe();
    let (local, peer) = socket_pair();
    let cancelled = Rc::new(Cell::new(0u32));
    let final_rx = Rc::new(RefCell::new(Vec::new()));
    let cancelled_count = cancelled.clone();
    let final_sink = final_rx.clone();
    let mut config = StreamConfig::new();
    config.tx_cb = Some(Box::new(move |_stream, _blob, status| {
        if matches!(status, Err(Error::Cancelled)) {
            cancelled_count.set(cancelled_count.get() + 1);
        }
    }));
    config.rx_cb = Some(Box::new(move |_stream, buf| {
        final_sink.borrow_mut().extend_from_slice(buf.as_slice());
        Ok(0)
    }));
    let stream = Stream::new(config, local).unwrap();

    rustix::io::write(&peer, b"tail").unwrap();
    mainloop::timeout_add(Duration::from_millis(40), || {
        mainloop::quit();
        false
    });
    mainloop::run();

    stream.write(Blob::new(&b"queued"[..])).unwrap();
    final_rx.borrow_mut().clear();
    drop(stream);
    assert_eq!(cancelled.get(), 1);
    assert_eq!(*final_rx.borrow(), b"tail");
    mainloop::shutdown();
}
