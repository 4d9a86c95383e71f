//! A bounded-buffer pipelined copy between two streams. The fixed buffer
//! pool gives natural back-pressure: the copy never reads further ahead
//! than the pool allows, with at most one outstanding read and one
//! outstanding write at any time.

use instance::Completion;
use stream::AsyncStream;

use std::cmp;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Completion hook; receives the finished task and its error state.
pub type CopyHandler = Box<dyn FnOnce(&AsyncCopy, bool) + Send + 'static>;

/// Per-chunk interception hook. May transform each chunk before it is
/// queued for writing, or veto it by returning `None`, which turns the
/// copy into a streaming-transform pipeline.
pub type ReadHook = Box<dyn FnMut(Vec<u8>) -> Option<Vec<u8>> + Send + 'static>;

#[derive(Clone, Copy, Debug)]
pub struct CopyParams {
    pub total_size: u64,
    pub buffer_size: usize,
    pub buffer_count: usize,
}

impl CopyParams {
    /// # Examples
    ///
    /// ```
    /// use streamio::CopyParams;
    ///
    /// let params = CopyParams::new(100);
    /// assert!(params.buffer_size > 0 && params.buffer_count > 0);
    /// ```
    pub fn new(total_size: u64) -> CopyParams {
        CopyParams {
            total_size: total_size,
            buffer_size: 0x10000,
            buffer_count: 4,
        }
    }
}

struct CopyState {
    /// Buffers ready to be filled by a read.
    free: Vec<Vec<u8>>,
    /// Filled buffers awaiting a write slot, FIFO.
    ready: VecDeque<Vec<u8>>,
    reading: bool,
    writing: bool,
    read_error: bool,
    write_error: bool,
    /// Re-entrancy guard: a completion calling back into `enqueue` while
    /// another thread is mid-`enqueue` defers to it instead of
    /// interleaving.
    enqueue_flag: bool,
    enqueue_again: bool,
    closed: bool,
    on_read: Option<ReadHook>,
    on_complete: Option<CopyHandler>,
}

enum Action {
    Read(Vec<u8>),
    Write(Vec<u8>),
}

struct CopyCore {
    source: Arc<dyn AsyncStream>,
    target: Arc<dyn AsyncStream>,
    total: u64,
    buffer_size: usize,
    read_size: AtomicU64,
    written_size: AtomicU64,
    state: Mutex<CopyState>,
}

/// The copy task handle; clones refer to the same task. Terminal exactly
/// once: on completion, on an unrecoverable error, or on explicit
/// `close()`.
#[derive(Clone)]
pub struct AsyncCopy {
    core: Arc<CopyCore>,
}

impl AsyncCopy {
    pub fn new(
        source: Arc<dyn AsyncStream>,
        target: Arc<dyn AsyncStream>,
        params: CopyParams,
        handler: CopyHandler,
    ) -> AsyncCopy {
        let count = cmp::max(1, params.buffer_count);
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            free.push(Vec::new());
        }
        AsyncCopy {
            core: Arc::new(CopyCore {
                source: source,
                target: target,
                total: params.total_size,
                buffer_size: cmp::max(1, params.buffer_size),
                read_size: AtomicU64::new(0),
                written_size: AtomicU64::new(0),
                state: Mutex::new(CopyState {
                    free: free,
                    ready: VecDeque::new(),
                    reading: false,
                    writing: false,
                    read_error: false,
                    write_error: false,
                    enqueue_flag: false,
                    enqueue_again: false,
                    closed: false,
                    on_read: None,
                    on_complete: Some(handler),
                }),
            }),
        }
    }

    /// Creates and immediately starts the task.
    pub fn start_new(
        source: Arc<dyn AsyncStream>,
        target: Arc<dyn AsyncStream>,
        params: CopyParams,
        handler: CopyHandler,
    ) -> AsyncCopy {
        let copy = AsyncCopy::new(source, target, params, handler);
        copy.start();
        copy
    }

    /// Installs the per-chunk interception hook. Call before `start()`.
    pub fn set_read_hook(&self, hook: ReadHook) {
        self.core.state.lock().unwrap().on_read = Some(hook);
    }

    pub fn start(&self) {
        CopyCore::enqueue(&self.core);
    }

    pub fn total_size(&self) -> u64 {
        self.core.total
    }

    pub fn read_size(&self) -> u64 {
        self.core.read_size.load(Ordering::SeqCst)
    }

    pub fn written_size(&self) -> u64 {
        self.core.written_size.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.written_size() == self.core.total
    }

    pub fn is_reading_error_occurred(&self) -> bool {
        self.core.state.lock().unwrap().read_error
    }

    pub fn is_writing_error_occurred(&self) -> bool {
        self.core.state.lock().unwrap().write_error
    }

    pub fn is_error_occurred(&self) -> bool {
        let state = self.core.state.lock().unwrap();
        state.read_error || state.write_error
    }

    /// Idempotent; fires the completion handler exactly once.
    pub fn close(&self) {
        CopyCore::close(&self.core);
    }
}

impl CopyCore {
    fn close(this: &Arc<CopyCore>) {
        let handler = {
            let mut state = this.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.on_complete.take()
        };
        if let Some(handler) = handler {
            let copy = AsyncCopy { core: this.clone() };
            let is_error = copy.is_error_occurred();
            handler(&copy, is_error);
        }
    }

    /// The single scheduling function, called on `start()` and after
    /// every completion. Guard-then-recurse-then-clear discipline: a
    /// caller finding the guard set records a rerun and leaves.
    fn enqueue(this: &Arc<CopyCore>) {
        {
            let mut state = this.state.lock().unwrap();
            if state.closed {
                return;
            }
            if state.enqueue_flag {
                state.enqueue_again = true;
                return;
            }
            state.enqueue_flag = true;
        }
        loop {
            let mut actions: Vec<Action> = Vec::new();
            {
                let mut state = this.state.lock().unwrap();
                if state.closed {
                    state.enqueue_flag = false;
                    return;
                }
                let read_size = this.read_size.load(Ordering::SeqCst);
                if !state.reading && !state.read_error && !state.write_error
                    && read_size < this.total
                {
                    if let Some(mut buf) = state.free.pop() {
                        let remain = this.total - read_size;
                        let want = cmp::min(remain, this.buffer_size as u64) as usize;
                        buf.resize(want, 0);
                        state.reading = true;
                        actions.push(Action::Read(buf));
                    }
                }
                if !state.writing && !state.write_error {
                    if let Some(buf) = state.ready.pop_front() {
                        state.writing = true;
                        actions.push(Action::Write(buf));
                    }
                }
                if actions.is_empty() {
                    let done = !state.reading && !state.writing
                        && (state.write_error
                            || (state.ready.is_empty()
                                && (state.read_error || read_size >= this.total)));
                    if done {
                        state.enqueue_flag = false;
                        drop(state);
                        CopyCore::close(this);
                        return;
                    }
                    if state.enqueue_again {
                        state.enqueue_again = false;
                        continue;
                    }
                    state.enqueue_flag = false;
                    return;
                }
            }
            for action in actions {
                match action {
                    Action::Read(buf) => {
                        let core = this.clone();
                        let accepted = this
                            .source
                            .read(buf, Box::new(move |c| CopyCore::on_read(&core, c)));
                        if !accepted {
                            let mut state = this.state.lock().unwrap();
                            state.reading = false;
                            state.read_error = true;
                        }
                    }
                    Action::Write(buf) => {
                        let core = this.clone();
                        let accepted = this
                            .target
                            .write(buf, Box::new(move |c| CopyCore::on_write(&core, c)));
                        if !accepted {
                            let mut state = this.state.lock().unwrap();
                            state.writing = false;
                            state.write_error = true;
                        }
                    }
                }
            }
        }
    }

    fn on_read(this: &Arc<CopyCore>, comp: Completion) {
        {
            let mut state = this.state.lock().unwrap();
            state.reading = false;
            if comp.is_error || comp.transferred == 0 {
                state.read_error = true;
                state.free.push(comp.buf);
            } else {
                this.read_size
                    .fetch_add(comp.transferred as u64, Ordering::SeqCst);
                let mut data = comp.buf;
                data.truncate(comp.transferred);
                let queued = match state.on_read {
                    Some(ref mut hook) => hook(data),
                    None => Some(data),
                };
                match queued {
                    Some(data) => state.ready.push_back(data),
                    // Vetoed chunk: hand its pool slot back.
                    None => state.free.push(Vec::new()),
                }
            }
        }
        CopyCore::enqueue(this);
    }

    fn on_write(this: &Arc<CopyCore>, comp: Completion) {
        let mut reissue = None;
        {
            let mut state = this.state.lock().unwrap();
            if comp.is_error {
                state.writing = false;
                state.write_error = true;
                state.free.push(comp.buf);
            } else {
                this.written_size
                    .fetch_add(comp.transferred as u64, Ordering::SeqCst);
                if comp.transferred < comp.requested {
                    // Short write; the writing slot stays occupied until
                    // the remainder lands.
                    let mut rest = comp.buf;
                    rest.drain(..comp.transferred);
                    reissue = Some(rest);
                } else {
                    state.writing = false;
                    state.free.push(comp.buf);
                }
            }
        }
        if let Some(rest) = reissue {
            let core = this.clone();
            let accepted = this
                .target
                .write(rest, Box::new(move |c| CopyCore::on_write(&core, c)));
            if !accepted {
                let mut state = this.state.lock().unwrap();
                state.writing = false;
                state.write_error = true;
            }
        }
        CopyCore::enqueue(this);
    }
}
