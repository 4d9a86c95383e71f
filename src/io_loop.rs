//! The reactor: one authoritative event-multiplexing thread per loop,
//! with thread-safe queues funneling all cross-thread work onto it.

use instance::IoInstance;
use reactor::{Backend, EventDesc};

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct LoopInner {
    backend: Backend,
    started: AtomicBool,
    running: AtomicBool,
    released: AtomicBool,
    /// fd -> instance; the only route from a backend event back to an
    /// instance. Unlinked during detach on the loop thread, so an event
    /// for an already-detached handle resolves to nothing.
    registry: Mutex<HashMap<i32, Arc<dyn IoInstance>>>,
    order: Mutex<VecDeque<Arc<dyn IoInstance>>>,
    closing: Mutex<VecDeque<Arc<dyn IoInstance>>>,
    /// Holds the final strong reference of detached instances until the
    /// next poll iteration that reports zero events.
    closed: Mutex<Vec<Arc<dyn IoInstance>>>,
    tasks: Mutex<VecDeque<Task>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

/// A cheaply cloneable handle to one reactor. All clones refer to the
/// same loop; `release()` dismantles it for all of them.
#[derive(Clone)]
pub struct IoLoop(Arc<LoopInner>);

lazy_static! {
    static ref DEFAULT_LOOP: IoLoop =
        IoLoop::with_start().expect("failed to create the default io loop");
}

impl IoLoop {
    /// Allocates the backend polling primitive and the wake mechanism.
    /// The poll thread is not spawned until `start()`.
    pub fn new() -> io::Result<IoLoop> {
        Ok(IoLoop(Arc::new(LoopInner {
            backend: Backend::new()?,
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            released: AtomicBool::new(false),
            registry: Mutex::new(HashMap::new()),
            order: Mutex::new(VecDeque::new()),
            closing: Mutex::new(VecDeque::new()),
            closed: Mutex::new(Vec::new()),
            tasks: Mutex::new(VecDeque::new()),
            thread: Mutex::new(None),
            thread_id: Mutex::new(None),
        })))
    }

    pub fn with_start() -> io::Result<IoLoop> {
        let lp = IoLoop::new()?;
        lp.start();
        Ok(lp)
    }

    /// The lazily created process-wide loop. It lives until process exit.
    pub fn default_loop() -> IoLoop {
        DEFAULT_LOOP.clone()
    }

    /// Spawns the poll thread. Starting twice is a no-op.
    pub fn start(&self) -> bool {
        if self.0.released.load(Ordering::SeqCst) {
            return false;
        }
        if self.0.started.swap(true, Ordering::SeqCst) {
            return true;
        }
        self.0.running.store(true, Ordering::SeqCst);
        let lp = self.clone();
        match thread::Builder::new()
            .name("streamio-loop".to_string())
            .spawn(move || lp.run_loop())
        {
            Ok(handle) => {
                debug!("io loop started");
                *self.0.thread_id.lock().unwrap() = Some(handle.thread().id());
                *self.0.thread.lock().unwrap() = Some(handle);
                true
            }
            Err(err) => {
                error!("failed to spawn the loop thread: {}", err);
                self.0.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stops and joins the poll thread, then drains every queue, closing
    /// all still-attached instances. Idempotent, callable from any thread
    /// except the loop's own; calling it from the loop thread is a
    /// programming error and panics.
    pub fn release(&self) {
        if self.is_loop_thread() {
            panic!("IoLoop::release called from the loop thread");
        }
        self.0.released.store(true, Ordering::SeqCst);
        if self.0.running.swap(false, Ordering::SeqCst) {
            self.0.backend.wake();
        }
        {
            // Joining under the thread slot's lock: a concurrent
            // `close_instance` that finds the slot locked or occupied
            // leaves its instance queued for this drain instead of
            // detaching while the loop thread may still be dispatching.
            let mut thread = self.0.thread.lock().unwrap();
            if let Some(handle) = thread.take() {
                let _ = handle.join();
            }
        }
        // Everything below runs with the loop thread gone.
        let closing = mem::replace(&mut *self.0.closing.lock().unwrap(), VecDeque::new());
        for inst in closing {
            self.detach(&inst);
        }
        let registry = mem::replace(&mut *self.0.registry.lock().unwrap(), HashMap::new());
        for (_, inst) in registry {
            inst.state().set_closing();
            self.0.backend.deregister(inst.state().handle());
            inst.close();
        }
        self.0.order.lock().unwrap().clear();
        self.0.tasks.lock().unwrap().clear();
        self.0.closed.lock().unwrap().clear();
        debug!("io loop released");
    }

    /// Registers the instance's handle with the backend for its interest
    /// mode. Fails if the handle is invalid, the instance is closing, or
    /// the loop has been released.
    pub fn attach_instance(&self, inst: Arc<dyn IoInstance>) -> bool {
        if self.0.released.load(Ordering::SeqCst) {
            return false;
        }
        let state = inst.state();
        if !state.is_open() || state.is_closing() {
            return false;
        }
        let fd = state.handle();
        if !self.0.backend.register(fd, state.mode()) {
            warn!("backend registration failed for fd {}", fd);
            return false;
        }
        self.0.registry.lock().unwrap().insert(fd, inst);
        true
    }

    /// Marks the instance closing (first call wins) and schedules detach
    /// and `close()` on the loop thread, so that in-flight dispatch can
    /// never race with the instance's destruction.
    pub fn close_instance(&self, inst: &Arc<dyn IoInstance>) {
        if !inst.state().set_closing() {
            return;
        }
        self.0.closing.lock().unwrap().push_back(inst.clone());
        if self.0.running.load(Ordering::SeqCst) {
            self.0.backend.wake();
            return;
        }
        // No loop thread to hand off to.
        self.drain_closing_off_loop();
    }

    /// Detaches queued instances on the caller's thread. Legal only once
    /// the loop thread is provably gone: the thread slot still holding a
    /// handle means a `release()` owns the join and will drain afterward.
    fn drain_closing_off_loop(&self) {
        if self.is_loop_thread() {
            // The loop is winding down; release() drains after the join.
            return;
        }
        let thread = self.0.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let closing = mem::replace(&mut *self.0.closing.lock().unwrap(), VecDeque::new());
        drop(thread);
        for inst in closing {
            self.detach(&inst);
        }
    }

    /// Queues the instance for a servicing pass and wakes the loop. An
    /// instance already queued is not queued twice.
    pub fn request_order(&self, inst: &Arc<dyn IoInstance>) {
        if inst.state().is_closing() {
            return;
        }
        if !inst.state().set_ordered() {
            return;
        }
        self.0.order.lock().unwrap().push_back(inst.clone());
        self.0.backend.wake();
    }

    /// Enqueues a callback for execution on the loop thread between poll
    /// iterations. The safe funnel for cross-thread work.
    pub fn add_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.0.released.load(Ordering::SeqCst) {
            return false;
        }
        self.0.tasks.lock().unwrap().push_back(Box::new(task));
        self.0.backend.wake();
        true
    }

    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    fn is_loop_thread(&self) -> bool {
        *self.0.thread_id.lock().unwrap() == Some(thread::current().id())
    }

    fn run_loop(&self) {
        let mut events: Vec<EventDesc> = Vec::with_capacity(128);
        while self.0.running.load(Ordering::SeqCst) {
            self.step_begin();
            self.0.backend.wait(&mut events);
            if events.is_empty() {
                // No completion events can still be in flight for handles
                // detached before the previous iteration.
                self.0.closed.lock().unwrap().clear();
            }
            for desc in &events {
                let inst = self.0.registry.lock().unwrap().get(&desc.fd).cloned();
                if let Some(inst) = inst {
                    if !inst.state().is_closing() && inst.on_event(desc) {
                        self.request_order(&inst);
                    }
                }
            }
            self.step_end();
        }
    }

    /// Drains posted tasks, then the order queue. The ordered flag is
    /// cleared before `on_order` so a request enqueued during `on_order`
    /// triggers a fresh cycle.
    fn step_begin(&self) {
        let tasks = mem::replace(&mut *self.0.tasks.lock().unwrap(), VecDeque::new());
        for task in tasks {
            task();
        }
        let order = mem::replace(&mut *self.0.order.lock().unwrap(), VecDeque::new());
        for inst in order {
            inst.state().clear_ordered();
            if inst.state().is_closing() {
                continue;
            }
            if inst.on_order() {
                self.request_order(&inst);
            }
        }
    }

    /// Drains the closing queue: detach from the backend, `close()`, then
    /// park in the closed queue until a zero-event iteration.
    fn step_end(&self) {
        loop {
            let inst = self.0.closing.lock().unwrap().pop_front();
            match inst {
                Some(inst) => {
                    self.detach(&inst);
                    self.0.closed.lock().unwrap().push(inst);
                }
                None => break,
            }
        }
    }

    fn detach(&self, inst: &Arc<dyn IoInstance>) {
        let fd = inst.state().handle();
        if fd != ::ffi::INVALID_FD {
            self.0.backend.deregister(fd);
            self.0.registry.lock().unwrap().remove(&fd);
        }
        inst.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_add_task_runs_on_loop_thread() {
        let lp = IoLoop::with_start().unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(lp.add_task(move || {
            tx.send(thread::current().name().map(|s| s.to_string())).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(name.as_ref().map(|s| s.as_str()), Some("streamio-loop"));
        lp.release();
    }

    #[test]
    fn test_release_is_idempotent() {
        let lp = IoLoop::with_start().unwrap();
        lp.release();
        lp.release();
        assert!(!lp.add_task(|| {}));
    }

    #[test]
    fn test_default_loop_is_shared() {
        let a = IoLoop::default_loop();
        let b = IoLoop::default_loop();
        assert!(Arc::ptr_eq(&a.0, &b.0));
        let (tx, rx) = mpsc::channel();
        assert!(a.add_task(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn test_start_twice_is_noop() {
        let lp = IoLoop::new().unwrap();
        assert!(lp.start());
        assert!(lp.start());
        lp.release();
    }
}
