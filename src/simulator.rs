//! Presents the async `AsyncStream` interface over resources with no
//! native async primitive, by running the blocking call on a dispatcher
//! instead of the reactor thread.
//!
//! Handlers of this family run on an arbitrary pool thread, not the loop
//! thread, and must not assume loop-thread affinity.

use instance::{IoHandler, StreamRequest};
use stream::AsyncStream;

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Submit a zero-argument callback for asynchronous execution.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, task: Task);
}

struct PoolInner {
    queue: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    stopped: AtomicBool,
}

/// A fixed-size worker pool; the reference `Dispatcher`.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(nthreads: usize) -> io::Result<ThreadPool> {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let mut threads = Vec::new();
        for i in 0..::std::cmp::max(1, nthreads) {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("streamio-pool-{}", i))
                .spawn(move || ThreadPool::work(inner))?;
            threads.push(handle);
        }
        Ok(ThreadPool {
            inner: inner,
            threads: Mutex::new(threads),
        })
    }

    fn work(inner: Arc<PoolInner>) {
        loop {
            let task = {
                let mut queue = inner.queue.lock().unwrap();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break task;
                    }
                    if inner.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    queue = inner.condvar.wait(queue).unwrap();
                }
            };
            task();
        }
    }

    /// Stops accepting work and joins the workers. Idempotent.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
        let threads = ::std::mem::replace(&mut *self.threads.lock().unwrap(), Vec::new());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Dispatcher for ThreadPool {
    fn dispatch(&self, task: Task) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.inner.queue.lock().unwrap().push_back(task);
        self.inner.condvar.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The blocking resource contract consumed by the adapter. Reads and
/// writes return the transferred byte count; zero or an error is reported
/// to the request's handler as an error.
pub trait BlockingIo: Send + 'static {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "not readable"))
    }

    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "not writable"))
    }

    fn seek(&mut self, _pos: u64) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Other, "not seekable"))
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(0)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

impl BlockingIo for fs::File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn seek(&mut self, pos: u64) -> io::Result<u64> {
        Seek::seek(self, SeekFrom::Start(pos))
    }

    fn size(&mut self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// Adapts any blocking reader.
pub struct BlockingReader<R>(pub R);

impl<R: Read + Send + 'static> BlockingIo for BlockingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Adapts any blocking writer.
pub struct BlockingWriter<W>(pub W);

impl<W: Write + Send + 'static> BlockingIo for BlockingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
}

enum Direction {
    In,
    Out,
}

struct SimRequest {
    dir: Direction,
    req: StreamRequest,
}

struct SimState {
    resource: Option<Box<dyn BlockingIo>>,
    queue: VecDeque<SimRequest>,
    /// A processing task is scheduled; a burst of requests produces one
    /// dispatch, not one per request.
    processing: bool,
    closed: bool,
}

struct SimCore {
    state: Mutex<SimState>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// The blocking-resource adapter: same interface, dispatcher-thread
/// servicing. Its state machine is idle -> processing -> idle.
pub struct StreamSimulator {
    core: Arc<SimCore>,
}

impl StreamSimulator {
    pub fn new(resource: Box<dyn BlockingIo>, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        Arc::new(StreamSimulator {
            core: Arc::new(SimCore {
                state: Mutex::new(SimState {
                    resource: Some(resource),
                    queue: VecDeque::new(),
                    processing: false,
                    closed: false,
                }),
                dispatcher: dispatcher,
            }),
        })
    }

    pub fn from_file(file: fs::File, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        StreamSimulator::new(Box::new(file), dispatcher)
    }

    pub fn from_reader<R>(reader: R, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self>
    where
        R: Read + Send + 'static,
    {
        StreamSimulator::new(Box::new(BlockingReader(reader)), dispatcher)
    }

    pub fn from_writer<W>(writer: W, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self>
    where
        W: Write + Send + 'static,
    {
        StreamSimulator::new(Box::new(BlockingWriter(writer)), dispatcher)
    }

    /// Forwards `seek` to the resource; `false` while a blocking call is
    /// in flight or the resource is not seekable.
    pub fn seek_to(&self, pos: u64) -> bool {
        let mut state = self.core.state.lock().unwrap();
        match state.resource {
            Some(ref mut res) if res.is_seekable() => res.seek(pos).is_ok(),
            _ => false,
        }
    }

    pub fn len(&self) -> u64 {
        let mut state = self.core.state.lock().unwrap();
        match state.resource {
            Some(ref mut res) => res.size().unwrap_or(0),
            None => 0,
        }
    }
}

impl SimCore {
    fn enqueue(this: &Arc<SimCore>, dir: Direction, req: StreamRequest) -> bool {
        let mut state = this.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.queue.push_back(SimRequest { dir: dir, req: req });
        if !state.processing {
            state.processing = true;
            let core = this.clone();
            this.dispatcher.dispatch(Box::new(move || core.process()));
        }
        true
    }

    /// Drains the request FIFO exhaustively on the dispatcher thread. The
    /// resource is taken out of the state while a blocking call runs, so
    /// enqueues stay nonblocking.
    fn process(&self) {
        loop {
            let (entry, mut resource) = {
                let mut state = self.state.lock().unwrap();
                let entry = match state.queue.pop_front() {
                    Some(entry) => entry,
                    None => {
                        state.processing = false;
                        return;
                    }
                };
                (entry, state.resource.take())
            };
            let SimRequest { dir, req } = entry;
            if req.requested == 0 {
                self.put_back(resource);
                req.complete(0, false);
                continue;
            }
            let mut req = req;
            let result = match resource {
                Some(ref mut res) => match dir {
                    Direction::In => res.read(&mut req.buf[..]),
                    Direction::Out => res.write(&req.buf[..]),
                },
                None => Err(io::Error::new(io::ErrorKind::Other, "stream closed")),
            };
            self.put_back(resource);
            match result {
                Ok(n) if n > 0 => req.complete(n, false),
                Ok(_) => req.complete(0, true),
                Err(err) => {
                    debug!("blocking io failed: {}", err);
                    req.complete(0, true);
                }
            }
        }
    }

    fn put_back(&self, resource: Option<Box<dyn BlockingIo>>) {
        if let Some(res) = resource {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                drop(res);
            } else {
                state.resource = Some(res);
            }
        }
    }
}

impl AsyncStream for StreamSimulator {
    fn read(&self, buf: Vec<u8>, handler: IoHandler) -> bool {
        SimCore::enqueue(&self.core, Direction::In, StreamRequest::new(buf, handler))
    }

    fn write(&self, buf: Vec<u8>, handler: IoHandler) -> bool {
        SimCore::enqueue(&self.core, Direction::Out, StreamRequest::new(buf, handler))
    }

    fn is_open(&self) -> bool {
        !self.core.state.lock().unwrap().closed
    }

    fn is_seekable(&self) -> bool {
        let state = self.core.state.lock().unwrap();
        match state.resource {
            Some(ref res) => res.is_seekable(),
            None => false,
        }
    }

    fn seek(&self, pos: u64) -> bool {
        self.seek_to(pos)
    }

    fn size(&self) -> u64 {
        self.len()
    }

    fn close(&self) {
        let mut flushed = Vec::new();
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.resource = None;
            while let Some(entry) = state.queue.pop_front() {
                flushed.push(entry.req);
            }
        }
        for req in flushed {
            req.complete(0, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_burst_coalesces_into_fifo_completions() {
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let sim = StreamSimulator::from_reader(Cursor::new(b"abcdef".to_vec()), pool);
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            assert!(sim.read(
                vec![0; 2],
                Box::new(move |c| tx.send((i, c.buf, c.transferred)).unwrap()),
            ));
        }
        for i in 0..3 {
            let (idx, buf, n) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(idx, i);
            assert_eq!(n, 2);
            assert_eq!(&buf[..2], &b"abcdef"[i * 2..i * 2 + 2]);
        }
    }

    #[test]
    fn test_exhausted_reader_reports_error() {
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let sim = StreamSimulator::from_reader(Cursor::new(Vec::new()), pool);
        let (tx, rx) = mpsc::channel();
        assert!(sim.read(
            vec![0; 4],
            Box::new(move |c| tx.send((c.transferred, c.is_error)).unwrap()),
        ));
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), (0, true));
    }

    #[test]
    fn test_closed_simulator_rejects_and_flushes() {
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let sim = StreamSimulator::from_writer(Vec::new(), pool);
        sim.close();
        sim.close();
        assert!(!sim.is_open());
        assert!(!sim.write(b"x".to_vec(), Box::new(|_| {
            panic!("handler must not fire for a rejected request");
        })));
    }
}
