//! A queued, ordered multi-segment writer: producers append logical
//! "header bytes, then a streamed body" elements, and the output pump
//! serializes them onto one underlying stream in strict FIFO order.

use copy::{AsyncCopy, CopyParams};
use instance::Completion;
use stream::AsyncStream;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const WRITE_CHUNK: usize = 0x10000;

/// Fires exactly once with the overall error state.
pub type OutputHandler = Box<dyn FnOnce(bool) + Send + 'static>;

struct OutputElement {
    header: Vec<u8>,
    body: Option<(Arc<dyn AsyncStream>, u64)>,
}

/// The element queue. Header bytes appended to a tail element that has
/// no body yet are coalesced into it; once a body is attached the
/// element is sealed and later appends open a new one.
///
/// # Examples
///
/// ```
/// use streamio::OutputBuffer;
///
/// let mut buf = OutputBuffer::new();
/// buf.write(b"AB");
/// buf.write(b"CD");
/// assert_eq!(buf.element_count(), 1);
/// ```
pub struct OutputBuffer {
    queue: VecDeque<OutputElement>,
}

impl OutputBuffer {
    pub fn new() -> OutputBuffer {
        OutputBuffer {
            queue: VecDeque::new(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if let Some(tail) = self.queue.back_mut() {
            if tail.body.is_none() {
                tail.header.extend_from_slice(bytes);
                return;
            }
        }
        self.queue.push_back(OutputElement {
            header: bytes.to_vec(),
            body: None,
        });
    }

    pub fn copy_from(&mut self, stream: Arc<dyn AsyncStream>, size: u64) {
        if let Some(tail) = self.queue.back_mut() {
            if tail.body.is_none() {
                tail.body = Some((stream, size));
                return;
            }
        }
        self.queue.push_back(OutputElement {
            header: Vec::new(),
            body: Some((stream, size)),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn element_count(&self) -> usize {
        self.queue.len()
    }

    fn pop(&mut self) -> Option<OutputElement> {
        self.queue.pop_front()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        OutputBuffer::new()
    }
}

struct OutputState {
    buffer: OutputBuffer,
    /// The element currently being served; never preempted. Stays set
    /// until every byte of the element (header and body) has landed.
    current: Option<OutputElement>,
    /// An underlying operation (header write or body copy) is
    /// outstanding; the pump must not advance past it.
    in_flight: bool,
    /// Pump re-entrancy guard.
    pumping: bool,
    pump_again: bool,
    started: bool,
    error: bool,
    closed: bool,
    handler: Option<OutputHandler>,
    body_copy: Option<AsyncCopy>,
}

struct OutputCore {
    target: Arc<dyn AsyncStream>,
    state: Mutex<OutputState>,
}

enum Step {
    WriteHeader(Vec<u8>),
    StartBody(Arc<dyn AsyncStream>, u64),
    Finish(Option<OutputHandler>),
    Wait,
}

/// Drains an `OutputBuffer` onto one real stream: a body never starts
/// before its preceding header bytes (and all prior elements) are fully
/// flushed. Clones refer to the same writer.
#[derive(Clone)]
pub struct AsyncOutput {
    core: Arc<OutputCore>,
}

impl AsyncOutput {
    pub fn new(target: Arc<dyn AsyncStream>) -> AsyncOutput {
        AsyncOutput {
            core: Arc::new(OutputCore {
                target: target,
                state: Mutex::new(OutputState {
                    buffer: OutputBuffer::new(),
                    current: None,
                    in_flight: false,
                    pumping: false,
                    pump_again: false,
                    started: false,
                    error: false,
                    closed: false,
                    handler: None,
                    body_copy: None,
                }),
            }),
        }
    }

    /// Appends header bytes, coalescing into a body-less tail element.
    pub fn write(&self, bytes: &[u8]) -> bool {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closed || state.error {
                return false;
            }
            state.buffer.write(bytes);
        }
        self.kick();
        true
    }

    /// Appends a streamed body of exactly `size` bytes.
    pub fn copy_from(&self, stream: Arc<dyn AsyncStream>, size: u64) -> bool {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closed || state.error {
                return false;
            }
            state.buffer.copy_from(stream, size);
        }
        self.kick();
        true
    }

    /// Declares the element sequence complete; the handler fires once
    /// everything queued has reached the target, or on the first error.
    /// At most one call is accepted; repeated calls (and calls on a
    /// closed writer) are refused without invoking the handler.
    pub fn start_writing(&self, handler: OutputHandler) -> bool {
        {
            let mut state = self.core.state.lock().unwrap();
            if state.closed || state.started {
                return false;
            }
            state.started = true;
            state.handler = Some(handler);
        }
        OutputCore::pump(&self.core);
        true
    }

    pub fn is_error_occurred(&self) -> bool {
        self.core.state.lock().unwrap().error
    }

    /// Idempotent; a not-yet-finished writer reports an error completion.
    pub fn close(&self) {
        let (handler, is_error) = {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            let unfinished =
                state.in_flight || state.current.is_some() || !state.buffer.is_empty();
            if let Some(copy) = state.body_copy.take() {
                drop(state);
                copy.close();
                state = self.core.state.lock().unwrap();
            }
            (state.handler.take(), state.error || unfinished)
        };
        if let Some(handler) = handler {
            handler(is_error);
        }
    }

    /// Pumps only after `start_writing`; earlier appends wait.
    fn kick(&self) {
        let started = self.core.state.lock().unwrap().started;
        if started {
            OutputCore::pump(&self.core);
        }
    }
}

impl OutputCore {
    /// The re-entrancy-guarded pump. At most one underlying operation
    /// (header write or body copy) is outstanding at a time.
    fn pump(this: &Arc<OutputCore>) {
        {
            let mut state = this.state.lock().unwrap();
            if state.pumping {
                state.pump_again = true;
                return;
            }
            state.pumping = true;
        }
        loop {
            let step = {
                let mut state = this.state.lock().unwrap();
                if state.closed || state.error {
                    state.pumping = false;
                    return;
                }
                loop {
                    if state.in_flight {
                        break Step::Wait;
                    }
                    if state.current.is_none() {
                        state.current = state.buffer.pop();
                    }
                    let step = match state.current {
                        None => {
                            if state.started {
                                state.closed = true;
                                Step::Finish(state.handler.take())
                            } else {
                                Step::Wait
                            }
                        }
                        Some(ref mut el) => {
                            if !el.header.is_empty() {
                                let n = ::std::cmp::min(WRITE_CHUNK, el.header.len());
                                let chunk: Vec<u8> = el.header.drain(..n).collect();
                                state.in_flight = true;
                                Step::WriteHeader(chunk)
                            } else if el.body.is_some() {
                                let (stream, size) = el.body.take().unwrap();
                                state.in_flight = true;
                                Step::StartBody(stream, size)
                            } else {
                                // Spent element.
                                state.current = None;
                                continue;
                            }
                        }
                    };
                    break step;
                }
            };
            match step {
                Step::Finish(handler) => {
                    this.state.lock().unwrap().pumping = false;
                    if let Some(handler) = handler {
                        handler(false);
                    }
                    return;
                }
                Step::Wait => {
                    if OutputCore::pump_exit(this) {
                        continue;
                    }
                    return;
                }
                Step::WriteHeader(chunk) => {
                    let core = this.clone();
                    let accepted = this
                        .target
                        .write(chunk, Box::new(move |c| OutputCore::on_chunk(&core, c)));
                    if !accepted {
                        this.state.lock().unwrap().pumping = false;
                        OutputCore::fail(this);
                        return;
                    }
                    if OutputCore::pump_exit(this) {
                        continue;
                    }
                    return;
                }
                Step::StartBody(stream, size) => {
                    let core = this.clone();
                    let copy = AsyncCopy::start_new(
                        stream,
                        this.target.clone(),
                        CopyParams::new(size),
                        Box::new(move |_, is_error| OutputCore::on_body_done(&core, is_error)),
                    );
                    {
                        // The copy may already have finished; keep the
                        // handle only while its flight is still open.
                        let mut state = this.state.lock().unwrap();
                        if state.in_flight {
                            state.body_copy = Some(copy);
                        }
                    }
                    if OutputCore::pump_exit(this) {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    /// Clears the guard unless a rerun was requested while pumping.
    fn pump_exit(this: &Arc<OutputCore>) -> bool {
        let mut state = this.state.lock().unwrap();
        if state.pump_again {
            state.pump_again = false;
            true
        } else {
            state.pumping = false;
            false
        }
    }

    fn on_chunk(this: &Arc<OutputCore>, comp: Completion) {
        {
            let mut state = this.state.lock().unwrap();
            state.in_flight = false;
            if !comp.is_error && comp.transferred < comp.requested {
                // `current` is still the chunk's element: the flight flag
                // kept the pump from advancing past it.
                if let Some(ref mut el) = state.current {
                    let mut rest = comp.buf;
                    rest.drain(..comp.transferred);
                    rest.extend_from_slice(&el.header);
                    el.header = rest;
                }
            }
        }
        if comp.is_error {
            OutputCore::fail(this);
            return;
        }
        OutputCore::pump(this);
    }

    fn on_body_done(this: &Arc<OutputCore>, is_error: bool) {
        {
            let mut state = this.state.lock().unwrap();
            state.in_flight = false;
            state.body_copy = None;
            if !is_error {
                // The element is spent once its body has landed.
                state.current = None;
            }
        }
        if is_error {
            OutputCore::fail(this);
            return;
        }
        OutputCore::pump(this);
    }

    /// Sticky; fires the overall handler exactly once with the error
    /// flag. The pump does not retry.
    fn fail(this: &Arc<OutputCore>) {
        let handler = {
            let mut state = this.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.error = true;
            state.closed = true;
            state.handler.take()
        };
        if let Some(handler) = handler {
            handler(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simulator::{StreamSimulator, ThreadPool};
    use std::io::Cursor;

    #[test]
    fn test_header_coalescing() {
        let mut buf = OutputBuffer::new();
        buf.write(b"AB");
        buf.write(b"CD");
        assert_eq!(buf.element_count(), 1);

        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let body = StreamSimulator::from_reader(Cursor::new(vec![0; 4]), pool);
        buf.copy_from(body.clone(), 4);
        assert_eq!(buf.element_count(), 1);

        // The tail has a body now; new header bytes open a new element.
        buf.write(b"EF");
        assert_eq!(buf.element_count(), 2);
        buf.copy_from(body, 4);
        assert_eq!(buf.element_count(), 2);
    }

    #[test]
    fn test_element_order_is_fifo() {
        let mut buf = OutputBuffer::new();
        buf.write(b"one");
        let pool = Arc::new(ThreadPool::new(1).unwrap());
        let body = StreamSimulator::from_reader(Cursor::new(vec![0; 1]), pool);
        buf.copy_from(body, 1);
        buf.write(b"two");
        let first = buf.pop().unwrap();
        assert_eq!(first.header, b"one".to_vec());
        assert!(first.body.is_some());
        let second = buf.pop().unwrap();
        assert_eq!(second.header, b"two".to_vec());
        assert!(second.body.is_none());
        assert!(buf.pop().is_none());
    }
}
