//! Per-handle bookkeeping: request queues, closing state, and the
//! loop-thread-only servicing entry points.
//!
//! The concurrency backbone of the whole subsystem is the split between
//! enqueue (`push_read`/`push_write`, callable from any thread) and
//! servicing (`on_order`/`on_event`, called only on the loop thread).

use ffi::{self, RawFd, INVALID_FD};
use reactor::EventDesc;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

bitflags! {
    /// Readiness interest registered with the backend.
    pub struct IoMode: u32 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

/// The outcome of one accepted request, delivered to its handler.
///
/// The request's buffer travels by value through the call and comes back
/// here, so the bytes stay alive for exactly as long as the request does.
pub struct Completion {
    pub buf: Vec<u8>,
    pub transferred: usize,
    pub requested: usize,
    pub is_error: bool,
}

/// Fires at most once per accepted request, never from inside the
/// `read`/`write` call that enqueued it.
pub type IoHandler = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A queued, single-shot read or write operation.
pub struct StreamRequest {
    pub buf: Vec<u8>,
    pub requested: usize,
    handler: IoHandler,
}

impl StreamRequest {
    pub fn new(buf: Vec<u8>, handler: IoHandler) -> Self {
        let requested = buf.len();
        StreamRequest {
            buf: buf,
            requested: requested,
            handler: handler,
        }
    }

    pub fn complete(self, transferred: usize, is_error: bool) {
        (self.handler)(Completion {
            buf: self.buf,
            transferred: transferred,
            requested: self.requested,
            is_error: is_error,
        })
    }
}

/// Handle, closing flag and the per-instance "already queued for order"
/// flag shared by every instance kind.
pub struct InstanceState {
    handle: AtomicI32,
    closing: AtomicBool,
    ordered: AtomicBool,
    mode: IoMode,
}

impl InstanceState {
    pub fn new(fd: RawFd, mode: IoMode) -> Self {
        InstanceState {
            handle: AtomicI32::new(fd),
            closing: AtomicBool::new(false),
            ordered: AtomicBool::new(false),
            mode: mode,
        }
    }

    pub fn handle(&self) -> RawFd {
        self.handle.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.handle() != INVALID_FD
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// First caller wins; later calls observe `false`.
    pub fn set_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    /// Test-and-set for the order queue, so an instance already queued is
    /// not queued twice.
    pub fn set_ordered(&self) -> bool {
        !self.ordered.swap(true, Ordering::SeqCst)
    }

    /// Cleared *before* `on_order` runs, so a request enqueued during
    /// `on_order` triggers a fresh order cycle.
    pub fn clear_ordered(&self) {
        self.ordered.store(false, Ordering::SeqCst)
    }

    pub fn invalidate(&self) -> RawFd {
        self.handle.swap(INVALID_FD, Ordering::SeqCst)
    }
}

/// What a servicing pass found.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Service {
    /// No pending requests in this direction.
    Idle,
    /// The front request would block; an event will retry it.
    Parked,
    /// A request completed and more are pending; another order cycle is
    /// needed, since an edge-triggered backend will not re-fire for data
    /// already buffered.
    More,
}

/// One registration unit for the loop: binds a handle to its pending
/// requests and closing state.
pub trait IoInstance: Send + Sync + 'static {
    fn state(&self) -> &InstanceState;

    /// Attempts at most one pending read and one pending write.
    /// Loop thread only. Returns `true` if another cycle is wanted.
    fn on_order(&self) -> bool;

    /// Translates a readiness notification into retries of the
    /// outstanding requests. Loop thread only.
    fn on_event(&self, desc: &EventDesc) -> bool;

    /// Invalidates the handle and flushes still-queued requests with an
    /// error completion. Called only from the loop thread.
    fn close(&self);
}

/// The fd-backed instance with byte-stream read/write queues.
pub struct StreamInstance {
    state: InstanceState,
    rdq: Mutex<VecDeque<StreamRequest>>,
    wrq: Mutex<VecDeque<StreamRequest>>,
}

impl StreamInstance {
    /// Takes ownership of `fd` and switches it to nonblocking mode.
    pub fn new(fd: RawFd, mode: IoMode) -> io::Result<Arc<Self>> {
        if fd == INVALID_FD {
            return Err(io::Error::from_raw_os_error(::libc::EBADF));
        }
        ffi::setnonblock(fd)?;
        Ok(Arc::new(StreamInstance {
            state: InstanceState::new(fd, mode),
            rdq: Mutex::new(VecDeque::new()),
            wrq: Mutex::new(VecDeque::new()),
        }))
    }

    /// Enqueues only; the caller must `request_order` on the loop so the
    /// request is picked up. Never performs the syscall itself.
    ///
    /// The closing check happens under the queue lock: `close()`
    /// invalidates the handle before draining under the same lock, so a
    /// request is either drained by the flush or refused, never stranded.
    pub fn push_read(&self, req: StreamRequest) -> bool {
        let mut queue = self.rdq.lock().unwrap();
        if self.state.is_closing() || !self.state.is_open() {
            return false;
        }
        queue.push_back(req);
        true
    }

    pub fn push_write(&self, req: StreamRequest) -> bool {
        let mut queue = self.wrq.lock().unwrap();
        if self.state.is_closing() || !self.state.is_open() {
            return false;
        }
        queue.push_back(req);
        true
    }

    fn service_read(&self) -> Service {
        let mut req = match self.rdq.lock().unwrap().pop_front() {
            Some(req) => req,
            None => return Service::Idle,
        };
        if req.requested == 0 {
            // Zero-size requests exist to chain completions.
            req.complete(0, false);
            return self.more(&self.rdq);
        }
        let fd = self.state.handle();
        if fd == INVALID_FD {
            req.complete(0, true);
            return self.more(&self.rdq);
        }
        let n = ffi::read(fd, &mut req.buf[..]);
        if n > 0 {
            req.complete(n as usize, false);
            self.more(&self.rdq)
        } else if n == 0 {
            req.complete(0, true);
            self.more(&self.rdq)
        } else {
            let err = ffi::last_errno();
            if ffi::would_block(err) {
                self.rdq.lock().unwrap().push_front(req);
                Service::Parked
            } else if ffi::interrupted(err) {
                self.rdq.lock().unwrap().push_front(req);
                Service::More
            } else {
                debug!("read failed on fd {}: errno {}", fd, err);
                req.complete(0, true);
                self.more(&self.rdq)
            }
        }
    }

    fn service_write(&self) -> Service {
        let req = match self.wrq.lock().unwrap().pop_front() {
            Some(req) => req,
            None => return Service::Idle,
        };
        if req.requested == 0 {
            req.complete(0, false);
            return self.more(&self.wrq);
        }
        let fd = self.state.handle();
        if fd == INVALID_FD {
            req.complete(0, true);
            return self.more(&self.wrq);
        }
        let n = ffi::write(fd, &req.buf[..]);
        if n >= 0 {
            req.complete(n as usize, false);
            self.more(&self.wrq)
        } else {
            let err = ffi::last_errno();
            if ffi::would_block(err) {
                self.wrq.lock().unwrap().push_front(req);
                Service::Parked
            } else if ffi::interrupted(err) {
                self.wrq.lock().unwrap().push_front(req);
                Service::More
            } else {
                debug!("write failed on fd {}: errno {}", fd, err);
                req.complete(0, true);
                self.more(&self.wrq)
            }
        }
    }

    fn more(&self, queue: &Mutex<VecDeque<StreamRequest>>) -> Service {
        if queue.lock().unwrap().is_empty() {
            Service::Idle
        } else {
            Service::More
        }
    }

    fn fail_pending(&self) {
        loop {
            let req = self.rdq.lock().unwrap().pop_front();
            match req {
                Some(req) => req.complete(0, true),
                None => break,
            }
        }
        loop {
            let req = self.wrq.lock().unwrap().pop_front();
            match req {
                Some(req) => req.complete(0, true),
                None => break,
            }
        }
    }
}

impl IoInstance for StreamInstance {
    fn state(&self) -> &InstanceState {
        &self.state
    }

    fn on_order(&self) -> bool {
        let rd = self.service_read();
        let wr = self.service_write();
        rd == Service::More || wr == Service::More
    }

    fn on_event(&self, desc: &EventDesc) -> bool {
        if desc.error && !desc.input && !desc.output {
            self.fail_pending();
            return false;
        }
        let mut more = false;
        if desc.input {
            more |= self.service_read() == Service::More;
        }
        if desc.output {
            more |= self.service_write() == Service::More;
        }
        more
    }

    fn close(&self) {
        let fd = self.state.invalidate();
        if fd != INVALID_FD {
            ffi::close(fd);
        }
        self.fail_pending();
    }
}

impl Drop for StreamInstance {
    fn drop(&mut self) {
        let fd = self.state.invalidate();
        if fd != INVALID_FD {
            ffi::close(fd);
        }
    }
}
