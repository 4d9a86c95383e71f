//! A transforming stream decorator: preserves the `AsyncStream` contract
//! while transforming bytes on the read and/or write path.

use instance::{Completion, IoHandler, StreamRequest};
use stream::AsyncStream;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const READ_CHUNK: usize = 4096;

/// The transformation hooks. The default is the identity on both paths,
/// so an unconfigured filter is a plain pass-through.
pub trait StreamTransform: Send + 'static {
    fn filter_read(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn filter_write(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}

/// The pass-through transform.
pub struct Identity;

impl StreamTransform for Identity {}

struct FilterState {
    base: Option<Arc<dyn AsyncStream>>,
    transform: Box<dyn StreamTransform>,
    /// Caller requests not yet satisfied, strictly FIFO.
    pending: VecDeque<StreamRequest>,
    /// Filtered output not yet delivered to a pending request.
    converted: Vec<u8>,
    /// At most one underlying read in flight.
    reading: bool,
    read_error: bool,
    read_ended: bool,
    write_error: bool,
    write_ended: bool,
}

struct FilterCore {
    state: Mutex<FilterState>,
}

/// A decorator stream transforming bytes in flight.
///
/// Short reads are explicitly permitted: one underlying completion may be
/// distributed across several pending requests, and a request may be
/// satisfied with fewer bytes than it asked for.
pub struct FilterStream {
    core: Arc<FilterCore>,
}

impl FilterStream {
    pub fn new<T: StreamTransform>(base: Arc<dyn AsyncStream>, transform: T) -> Arc<Self> {
        Arc::new(FilterStream {
            core: Arc::new(FilterCore {
                state: Mutex::new(FilterState {
                    base: Some(base),
                    transform: Box::new(transform),
                    pending: VecDeque::new(),
                    converted: Vec::new(),
                    reading: false,
                    read_error: false,
                    read_ended: false,
                    write_error: false,
                    write_ended: false,
                }),
            }),
        })
    }

    /// An identity filter, useful as a buffering indirection layer.
    pub fn pass_through(base: Arc<dyn AsyncStream>) -> Arc<Self> {
        FilterStream::new(base, Identity)
    }

    pub fn is_reading_error_occurred(&self) -> bool {
        self.core.state.lock().unwrap().read_error
    }

    pub fn is_writing_error_occurred(&self) -> bool {
        self.core.state.lock().unwrap().write_error
    }
}

impl FilterCore {
    /// Issues the next underlying read if none is in flight. If converted
    /// bytes are already buffered, a zero-size read is issued purely to
    /// pipeline an asynchronous delivery callback.
    fn start_read(this: &Arc<FilterCore>, state: &mut FilterState) {
        if state.reading {
            return;
        }
        let base = match state.base {
            Some(ref base) => base.clone(),
            None => return,
        };
        // A zero-size request at the queue front needs no data; pair it
        // with a zero-size underlying read so it completes right away.
        let zero_turn = match state.pending.front() {
            Some(req) => req.requested == 0,
            None => false,
        };
        state.reading = true;
        let buf = if state.converted.is_empty() && !zero_turn {
            vec![0; READ_CHUNK]
        } else {
            Vec::new()
        };
        let core = this.clone();
        if !base.read(buf, Box::new(move |c| FilterCore::on_read_complete(&core, c))) {
            state.reading = false;
            state.read_error = true;
        }
    }

    fn on_read_complete(this: &Arc<FilterCore>, comp: Completion) {
        let mut deliveries: Vec<(StreamRequest, usize)> = Vec::new();
        let mut failures: Vec<StreamRequest> = Vec::new();
        {
            let mut state = this.state.lock().unwrap();
            state.reading = false;
            if comp.is_error {
                state.read_error = true;
                while let Some(req) = state.pending.pop_front() {
                    failures.push(req);
                }
            } else {
                if comp.transferred > 0 {
                    let out = state.transform.filter_read(&comp.buf[..comp.transferred]);
                    state.converted.extend_from_slice(&out);
                }
                loop {
                    let zero_front = match state.pending.front() {
                        Some(req) => req.requested == 0,
                        None => break,
                    };
                    if !zero_front && state.converted.is_empty() {
                        break;
                    }
                    let mut req = state.pending.pop_front().unwrap();
                    let len = ::std::cmp::min(req.requested, state.converted.len());
                    req.buf[..len].copy_from_slice(&state.converted[..len]);
                    state.converted.drain(..len);
                    deliveries.push((req, len));
                }
                if !state.pending.is_empty() {
                    FilterCore::start_read(this, &mut state);
                }
            }
        }
        for (req, len) in deliveries {
            req.complete(len, false);
        }
        for req in failures {
            req.complete(0, true);
        }
    }

    fn mark_write_error(&self) {
        self.state.lock().unwrap().write_error = true;
    }
}

impl AsyncStream for FilterStream {
    fn read(&self, buf: Vec<u8>, handler: IoHandler) -> bool {
        let mut state = self.core.state.lock().unwrap();
        if state.read_error || state.read_ended || state.base.is_none() {
            return false;
        }
        state.pending.push_back(StreamRequest::new(buf, handler));
        FilterCore::start_read(&self.core, &mut state);
        true
    }

    /// Filters eagerly, forwards the filtered bytes, and reports the
    /// caller's original size through the completion.
    fn write(&self, buf: Vec<u8>, handler: IoHandler) -> bool {
        let (base, out) = {
            let mut state = self.core.state.lock().unwrap();
            if state.write_error || state.write_ended {
                return false;
            }
            let base = match state.base {
                Some(ref base) => base.clone(),
                None => return false,
            };
            (base, state.transform.filter_write(&buf))
        };
        let requested = buf.len();
        let core = self.core.clone();
        base.write(
            out,
            Box::new(move |c: Completion| {
                if c.is_error {
                    core.mark_write_error();
                }
                handler(Completion {
                    buf: buf,
                    transferred: if c.is_error { 0 } else { requested },
                    requested: requested,
                    is_error: c.is_error,
                })
            }),
        )
    }

    fn is_open(&self) -> bool {
        let state = self.core.state.lock().unwrap();
        state.base.is_some() && !state.read_ended && !state.write_ended
    }

    /// Sets both ended flags and drops the underlying stream reference;
    /// queued read requests flush with an error completion.
    fn close(&self) {
        let mut failures = Vec::new();
        {
            let mut state = self.core.state.lock().unwrap();
            state.read_ended = true;
            state.write_ended = true;
            state.base = None;
            while let Some(req) = state.pending.pop_front() {
                failures.push(req);
            }
        }
        for req in failures {
            req.complete(0, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl StreamTransform for Doubler {
        fn filter_read(&mut self, data: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(data.len() * 2);
            for b in data {
                out.push(*b);
                out.push(*b);
            }
            out
        }
    }

    #[test]
    fn test_transform_hooks() {
        let mut tr = Doubler;
        assert_eq!(tr.filter_read(b"ab"), b"aabb".to_vec());
        assert_eq!(tr.filter_write(b"ab"), b"ab".to_vec());
        let mut id = Identity;
        assert_eq!(id.filter_read(b"xyz"), b"xyz".to_vec());
    }
}
