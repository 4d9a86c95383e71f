extern crate libc;
extern crate streamio;

use streamio::*;

use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

#[test]
fn pipe_round_trip() {
    let lp = IoLoop::with_start().unwrap();
    let (rfd, wfd) = make_pipe();
    let reader = IoStream::with_mode(rfd, IoMode::READ, &lp).unwrap();
    let writer = IoStream::with_mode(wfd, IoMode::WRITE, &lp).unwrap();

    let (wtx, wrx) = mpsc::channel();
    assert!(writer.write(
        b"hello".to_vec(),
        Box::new(move |c| wtx.send((c.transferred, c.is_error)).unwrap()),
    ));
    assert_eq!(wrx.recv_timeout(TIMEOUT).unwrap(), (5, false));

    let (rtx, rrx) = mpsc::channel();
    assert!(reader.read(
        vec![0; 16],
        Box::new(move |c| {
            rtx.send((c.buf[..c.transferred].to_vec(), c.is_error)).unwrap();
        }),
    ));
    let (data, is_error) = rrx.recv_timeout(TIMEOUT).unwrap();
    assert!(!is_error);
    assert_eq!(data, b"hello".to_vec());

    lp.release();
}

#[test]
fn queued_reads_complete_in_fifo_order() {
    let lp = IoLoop::with_start().unwrap();
    let (rfd, wfd) = make_pipe();
    let reader = IoStream::with_mode(rfd, IoMode::READ, &lp).unwrap();
    let writer = IoStream::with_mode(wfd, IoMode::WRITE, &lp).unwrap();

    let (tx1, rx1) = mpsc::channel();
    let (tx2, rx2) = mpsc::channel();
    assert!(reader.read(
        vec![0; 3],
        Box::new(move |c| tx1.send(c.buf[..c.transferred].to_vec()).unwrap()),
    ));
    assert!(reader.read(
        vec![0; 3],
        Box::new(move |c| tx2.send(c.buf[..c.transferred].to_vec()).unwrap()),
    ));

    let (wtx, wrx) = mpsc::channel();
    assert!(writer.write(b"abcdef".to_vec(), Box::new(move |c| {
        wtx.send(c.transferred).unwrap();
    })));
    assert_eq!(wrx.recv_timeout(TIMEOUT).unwrap(), 6);

    assert_eq!(rx1.recv_timeout(TIMEOUT).unwrap(), b"abc".to_vec());
    assert_eq!(rx2.recv_timeout(TIMEOUT).unwrap(), b"def".to_vec());

    lp.release();
}

#[test]
fn close_flushes_a_parked_read_with_an_error() {
    let lp = IoLoop::with_start().unwrap();
    let (rfd, wfd) = make_pipe();
    let reader = IoStream::with_mode(rfd, IoMode::READ, &lp).unwrap();
    let _writer = IoStream::with_mode(wfd, IoMode::WRITE, &lp).unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(reader.read(
        vec![0; 8],
        Box::new(move |c| tx.send((c.transferred, c.is_error)).unwrap()),
    ));
    reader.close();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, true));

    lp.release();
}

#[test]
fn zero_size_read_completes_with_success() {
    let lp = IoLoop::with_start().unwrap();
    let (rfd, wfd) = make_pipe();
    let reader = IoStream::with_mode(rfd, IoMode::READ, &lp).unwrap();
    let _writer = IoStream::with_mode(wfd, IoMode::WRITE, &lp).unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(reader.read(
        Vec::new(),
        Box::new(move |c| tx.send((c.transferred, c.is_error)).unwrap()),
    ));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, false));

    lp.release();
}

#[test]
fn close_without_a_running_loop_flushes_inline() {
    let lp = IoLoop::new().unwrap();
    let (rfd, wfd) = make_pipe();
    let reader = IoStream::with_mode(rfd, IoMode::READ, &lp).unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(reader.read(
        vec![0; 8],
        Box::new(move |c| tx.send(c.is_error).unwrap()),
    ));
    reader.close();
    assert!(rx.recv_timeout(TIMEOUT).unwrap());

    unsafe { libc::close(wfd) };
    lp.release();
}

#[test]
fn close_racing_release_never_strands_a_request() {
    let lp = IoLoop::with_start().unwrap();
    let (rfd, wfd) = make_pipe();
    let reader = IoStream::with_mode(rfd, IoMode::READ, &lp).unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(reader.read(
        vec![0; 8],
        Box::new(move |c| tx.send(c.is_error).unwrap()),
    ));

    let closer = std::thread::spawn(move || reader.close());
    lp.release();
    closer.join().unwrap();

    // Whichever side won the race, the parked read fires exactly once.
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    unsafe { libc::close(wfd) };
}

#[test]
fn release_is_idempotent_and_flushes_attached_streams() {
    let lp = IoLoop::with_start().unwrap();
    let (rfd, wfd) = make_pipe();
    let reader = IoStream::with_mode(rfd, IoMode::READ, &lp).unwrap();
    let _writer = IoStream::with_mode(wfd, IoMode::WRITE, &lp).unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(reader.read(
        vec![0; 8],
        Box::new(move |c| tx.send(c.is_error).unwrap()),
    ));

    lp.release();
    lp.release();
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    assert!(!reader.is_open());
}
