//! Single-threaded event loop.
//!
//! [`IoLoop`] owns a current-thread tokio runtime. Readiness polling and timers are driven by
//! tokio's drivers; on top of them the loop keeps a FIFO callback queue, cancellable timeouts
//! and the `run_sync`/`start`/`stop` lifecycle.
//!
//! Every callback, timeout and spawned task executes on the thread that runs the loop.
//! [`LoopHandle::add_callback`] is the only entry point meant to be used from other threads:
//! it queues the callback and wakes the loop.
//!
//! # Iterations
//!
//! The callback queue is drained in batches. A batch holds exactly the callbacks that were
//! queued before the batch started; anything queued while the batch runs is picked up by the
//! next iteration. A panic escaping a callback is caught and logged, and the loop keeps going.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use gale_http::ioloop::IoLoop;
//!
//! let io_loop = IoLoop::new().expect("failed to build the event loop");
//! let handle = io_loop.handle();
//! let answer = io_loop.run_sync(|| async move {
//!     let (tx, rx) = futures::channel::oneshot::channel();
//!     handle.call_later(Duration::from_millis(10), move || {
//!         let _ = tx.send(42);
//!     });
//!     rx.await.unwrap_or_default()
//! });
//! assert_eq!(answer, 42);
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::{self, Runtime};
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, trace};

type Callback = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// The event loop itself. Not `Send`: it runs on the thread that created it.
pub struct IoLoop {
    runtime: Runtime,
    handle: LoopHandle,
}

impl fmt::Debug for IoLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoLoop").field("handle", &self.handle).finish_non_exhaustive()
    }
}

impl IoLoop {
    /// Builds a loop backed by a fresh current-thread runtime with I/O and time drivers enabled.
    pub fn new() -> io::Result<Self> {
        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let handle = LoopHandle::with_runtime(runtime.handle().clone());
        handle.ensure_driver();
        Ok(Self { runtime, handle })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Runs the loop until the future produced by `f` resolves, then stops and returns its output.
    ///
    /// `f` is invoked on the loop, so it may create timers and sockets right away.
    pub fn run_sync<F, Fut>(&self, f: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _current = self.handle.enter();
        self.runtime.block_on(async move { f().await })
    }

    /// Runs the loop until [`LoopHandle::stop`] is called.
    ///
    /// A `stop` issued before `start` makes `start` return immediately.
    pub fn start(&self) {
        let _current = self.handle.enter();
        debug!("event loop started");
        self.runtime.block_on(self.handle.inner.stop.notified());
        debug!("event loop stopped");
    }
}

/// A cheap, cloneable reference to a running (or runnable) loop.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: runtime::Handle,
    callbacks: Mutex<VecDeque<Callback>>,
    wakeup: Notify,
    stop: Notify,
    driver_started: AtomicBool,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.callbacks.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("LoopHandle").field("pending_callbacks", &pending).finish()
    }
}

impl LoopHandle {
    fn with_runtime(runtime: runtime::Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                callbacks: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                stop: Notify::new(),
                driver_started: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the loop installed on this thread by [`IoLoop::run_sync`] or [`IoLoop::start`].
    ///
    /// When code runs inside a plain tokio runtime instead, a fresh handle bound to that runtime
    /// is returned. Timers and spawned tasks behave the same on it, but every such handle has
    /// its own callback queue, so callbacks added through two of them are not ordered against
    /// each other. Use [`try_current`](Self::try_current) to tell the two cases apart.
    ///
    /// # Panics
    ///
    /// Panics when called outside of both an `IoLoop` and a tokio runtime.
    pub fn current() -> Self {
        Self::try_current().unwrap_or_else(|| Self::with_runtime(runtime::Handle::current()))
    }

    pub fn try_current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Schedules `callback` on the next loop iteration. Safe to call from any thread.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.callbacks.lock().unwrap_or_else(PoisonError::into_inner).push_back(Box::new(callback));
        self.ensure_driver();
        self.inner.wakeup.notify_one();
    }

    /// Runs `callback` once `deadline` has passed, unless the returned handle is removed first.
    pub fn add_timeout<F>(&self, deadline: Instant, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            run_guarded(Box::new(callback));
        });
        TimeoutHandle { deadline, task: task.abort_handle() }
    }

    pub fn call_later<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_timeout(self.time() + delay, callback)
    }

    /// Cancels a pending timeout. Removing a timeout that already fired does nothing.
    pub fn remove_timeout(&self, handle: &TimeoutHandle) {
        trace!(deadline = ?handle.deadline, "removing timeout");
        handle.task.abort();
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.runtime.spawn(future)
    }

    /// Asks [`IoLoop::start`] to return. Safe to call from any thread.
    pub fn stop(&self) {
        self.inner.stop.notify_one();
    }

    /// The loop's monotonic clock.
    pub fn time(&self) -> Instant {
        Instant::now()
    }

    fn enter(&self) -> CurrentGuard {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        CurrentGuard { previous }
    }

    fn ensure_driver(&self) {
        if !self.inner.driver_started.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(async move { inner.drive().await });
        }
    }
}

impl Inner {
    async fn drive(&self) {
        loop {
            let batch = mem::take(&mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner));
            if !batch.is_empty() {
                trace!(callbacks = batch.len(), "running callback batch");
            }
            for callback in batch {
                run_guarded(callback);
            }
            self.wakeup.notified().await;
        }
    }
}

fn run_guarded(callback: Callback) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(cause = panic_message(panic.as_ref()), "exception in callback");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

struct CurrentGuard {
    previous: Option<LoopHandle>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Handle to a scheduled timeout, see [`LoopHandle::add_timeout`].
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    deadline: Instant,
    task: AbortHandle,
}

impl TimeoutHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the timeout has fired or has been removed.
    pub fn is_done(&self) -> bool {
        self.task.is_finished()
    }
}
