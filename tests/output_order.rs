extern crate streamio;

use streamio::*;

use std::io::{self, Cursor, Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    fn new() -> SharedWriter {
        SharedWriter(Arc::new(Mutex::new(Vec::new())))
    }

    fn take(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "broken body"))
    }
}

/// Blocks every read on a channel so the test controls exactly when the
/// body bytes become available.
struct GatedReader {
    gate: mpsc::Receiver<Vec<u8>>,
}

impl Read for GatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.gate.recv() {
            Ok(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Err(_) => Ok(0),
        }
    }
}

#[test]
fn headers_and_bodies_reach_the_target_in_element_order() {
    let pool = Arc::new(ThreadPool::new(2).unwrap());
    let sink = SharedWriter::new();
    let target = StreamSimulator::from_writer(sink.clone(), pool.clone());

    let out = AsyncOutput::new(target);
    assert!(out.write(b"HDR1|"));
    assert!(out.copy_from(
        StreamSimulator::from_reader(Cursor::new(vec![b'A'; 8]), pool.clone()),
        8,
    ));
    assert!(out.write(b"|HDR2|"));
    assert!(out.copy_from(
        StreamSimulator::from_reader(Cursor::new(vec![b'B'; 3]), pool),
        3,
    ));

    let (tx, rx) = mpsc::channel();
    assert!(out.start_writing(Box::new(move |is_error| tx.send(is_error).unwrap())));
    assert!(!rx.recv_timeout(TIMEOUT).unwrap());
    assert_eq!(sink.take(), b"HDR1|AAAAAAAA|HDR2|BBB".to_vec());
    assert!(!out.is_error_occurred());
}

#[test]
fn appends_during_a_body_copy_stay_ordered_behind_it() {
    let (gate_tx, gate_rx) = mpsc::channel();
    let pool = Arc::new(ThreadPool::new(2).unwrap());
    let sink = SharedWriter::new();
    let target = StreamSimulator::from_writer(sink.clone(), pool.clone());
    let body = StreamSimulator::from_reader(GatedReader { gate: gate_rx }, pool);

    let out = AsyncOutput::new(target);
    assert!(out.copy_from(body, 4));
    let (tx, rx) = mpsc::channel();
    assert!(out.start_writing(Box::new(move |is_error| tx.send(is_error).unwrap())));

    // Appended while the body read is still blocked: it must neither
    // overtake the body nor let the writer complete early.
    assert!(out.write(b"XX"));
    std::thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());
    assert!(sink.take().is_empty());

    gate_tx.send(b"AAAA".to_vec()).unwrap();
    assert!(!rx.recv_timeout(TIMEOUT).unwrap());
    assert_eq!(sink.take(), b"AAAAXX".to_vec());
}

#[test]
fn start_writing_twice_is_refused() {
    let (gate_tx, gate_rx) = mpsc::channel();
    let pool = Arc::new(ThreadPool::new(1).unwrap());
    let target = StreamSimulator::from_writer(GatedWriter { gate: gate_rx }, pool);
    let out = AsyncOutput::new(target);
    assert!(out.write(b"pending"));

    let (tx, rx) = mpsc::channel();
    assert!(out.start_writing(Box::new(move |is_error| tx.send(is_error).unwrap())));
    assert!(!out.start_writing(Box::new(|_| panic!("refused call must not fire"))));

    drop(gate_tx);
    assert!(!rx.recv_timeout(TIMEOUT).unwrap());
}

#[test]
fn an_empty_sequence_completes_immediately() {
    let pool = Arc::new(ThreadPool::new(1).unwrap());
    let target = StreamSimulator::from_writer(SharedWriter::new(), pool);
    let out = AsyncOutput::new(target);

    let (tx, rx) = mpsc::channel();
    assert!(out.start_writing(Box::new(move |is_error| tx.send(is_error).unwrap())));
    assert!(!rx.recv_timeout(TIMEOUT).unwrap());
}

#[test]
fn a_failing_body_reports_the_overall_error() {
    let pool = Arc::new(ThreadPool::new(2).unwrap());
    let sink = SharedWriter::new();
    let target = StreamSimulator::from_writer(sink.clone(), pool.clone());

    let out = AsyncOutput::new(target);
    out.write(b"head");
    out.copy_from(StreamSimulator::from_reader(FailingReader, pool), 16);

    let (tx, rx) = mpsc::channel();
    assert!(out.start_writing(Box::new(move |is_error| tx.send(is_error).unwrap())));
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    assert!(out.is_error_occurred());
    // The header preceding the broken body still went out.
    assert_eq!(sink.take(), b"head".to_vec());

    // The writer is finished; later appends are refused.
    assert!(!out.write(b"late"));
}

/// Blocks every write on a channel; dropping the sender releases it.
struct GatedWriter {
    gate: mpsc::Receiver<()>,
}

impl Write for GatedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.gate.recv();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn close_is_idempotent_and_reports_unfinished_work() {
    let (gate_tx, gate_rx) = mpsc::channel();
    let pool = Arc::new(ThreadPool::new(1).unwrap());
    let target = StreamSimulator::from_writer(GatedWriter { gate: gate_rx }, pool);
    let out = AsyncOutput::new(target);
    out.write(b"never sent");

    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = fired.clone();
    assert!(out.start_writing(Box::new(move |is_error| log.lock().unwrap().push(is_error))));
    out.close();
    out.close();

    let log = fired.lock().unwrap().clone();
    assert_eq!(log, vec![true]);

    // Unblock the dispatcher thread so the pool can join it.
    drop(gate_tx);
}
