//! The application-visible stream facade.

use ffi::RawFd;
use instance::{IoHandler, IoInstance, IoMode, StreamInstance, StreamRequest};
use io_loop::IoLoop;

use std::io;
use std::sync::Arc;

/// The contract every layered abstraction is built on. `read`/`write`
/// enqueue a single-shot request and return `false`, without consuming
/// the handler, if the stream cannot accept it; an accepted request fires
/// its handler exactly once, always asynchronously.
pub trait AsyncStream: Send + Sync + 'static {
    /// Requests up to `buf.len()` bytes. A zero-size request completes
    /// immediately (asynchronously) with success.
    fn read(&self, buf: Vec<u8>, handler: IoHandler) -> bool;

    /// Requests that `buf` be written; short writes are reported honestly
    /// through `Completion::transferred`.
    fn write(&self, buf: Vec<u8>, handler: IoHandler) -> bool;

    fn is_open(&self) -> bool;

    fn is_seekable(&self) -> bool {
        false
    }

    fn seek(&self, _pos: u64) -> bool {
        false
    }

    fn size(&self) -> u64 {
        0
    }

    /// Idempotent. Requests still queued at close time fire their handler
    /// once with the error flag set.
    fn close(&self);
}

/// A stream bound to an OS handle and serviced by an `IoLoop`.
pub struct IoStream {
    instance: Arc<StreamInstance>,
    lp: IoLoop,
}

impl IoStream {
    /// Takes ownership of `fd`, attaches it to `lp` for both directions.
    /// Construction failure is the only reportable symptom of a backend
    /// registration problem.
    pub fn new(fd: RawFd, lp: &IoLoop) -> io::Result<Arc<IoStream>> {
        IoStream::with_mode(fd, IoMode::READ | IoMode::WRITE, lp)
    }

    pub fn with_mode(fd: RawFd, mode: IoMode, lp: &IoLoop) -> io::Result<Arc<IoStream>> {
        let instance = StreamInstance::new(fd, mode)?;
        if !lp.attach_instance(instance.clone() as Arc<dyn IoInstance>) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "failed to attach the handle to the io loop",
            ));
        }
        Ok(Arc::new(IoStream {
            instance: instance,
            lp: lp.clone(),
        }))
    }

    fn as_instance(&self) -> Arc<dyn IoInstance> {
        self.instance.clone()
    }
}

impl AsyncStream for IoStream {
    fn read(&self, buf: Vec<u8>, handler: IoHandler) -> bool {
        if !self.instance.push_read(StreamRequest::new(buf, handler)) {
            return false;
        }
        // The loop must notice the new request even if the instance was
        // idle-waiting.
        self.lp.request_order(&self.as_instance());
        true
    }

    fn write(&self, buf: Vec<u8>, handler: IoHandler) -> bool {
        if !self.instance.push_write(StreamRequest::new(buf, handler)) {
            return false;
        }
        self.lp.request_order(&self.as_instance());
        true
    }

    fn is_open(&self) -> bool {
        self.instance.state().is_open() && !self.instance.state().is_closing()
    }

    fn close(&self) {
        self.lp.close_instance(&self.as_instance());
    }
}

impl Drop for IoStream {
    fn drop(&mut self) {
        self.close();
    }
}
