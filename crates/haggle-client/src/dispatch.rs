//! Event dispatch loop
//!
//! Pulls events pushed by the daemon off the handle's event channel and
//! hands each one to the handler registered for its kind. The loop runs
//! either in the caller's task ([`EventLoop::run_foreground`]) or on a
//! spawned task ([`EventLoop::run_background`]); at most one of them is
//! active at a time because the running loop owns the channel receiver.
//!
//! Handlers are invoked one at a time, in delivery order. A handler that
//! returns an error or panics is logged and the loop moves on.

use haggle_protocol::{Event, EventKind};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives events of the kind it was registered for.
///
/// Runs on the dispatch task, which is not necessarily the task that
/// registered it. Blocking here stalls the loop.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: Event) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, event: Event) -> anyhow::Result<()> {
        self(event)
    }
}

type LoopCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    RunningForeground,
    RunningBackground,
    Stopped,
}

impl LoopState {
    pub fn is_running(self) -> bool {
        matches!(self, LoopState::RunningForeground | LoopState::RunningBackground)
    }
}

/// Counters kept by the loop over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub dropped: u64,
    pub faults: u64,
}

struct LoopInner {
    state: LoopState,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Set by `close`; no further runs may start
    closed: bool,
}

#[derive(Default)]
struct Callbacks {
    on_start: Option<LoopCallback>,
    on_stop: Option<LoopCallback>,
}

pub struct EventLoop {
    handlers: RwLock<HashMap<EventKind, Arc<dyn EventHandler>>>,
    inner: Mutex<LoopInner>,
    callbacks: RwLock<Callbacks>,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    faults: AtomicU64,
    finished: Notify,
}

impl EventLoop {
    pub fn new(events: mpsc::UnboundedReceiver<Event>) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            inner: Mutex::new(LoopInner {
                state: LoopState::Idle,
                events: Some(events),
                stop: CancellationToken::new(),
                task: None,
                closed: false,
            }),
            callbacks: RwLock::new(Callbacks::default()),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            finished: Notify::new(),
        })
    }

    /// Install `handler` for `kind`, replacing any previous one.
    ///
    /// Returns true if a handler was replaced.
    pub fn set_handler(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> bool {
        self.handlers
            .write()
            .unwrap()
            .insert(kind, handler)
            .is_some()
    }

    pub fn remove_handler(&self, kind: EventKind) -> bool {
        self.handlers.write().unwrap().remove(&kind).is_some()
    }

    /// Remove the handler for `kind` only if it is still `handler`.
    pub fn remove_handler_if(&self, kind: EventKind, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        match handlers.get(&kind) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                handlers.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn set_callbacks(&self, on_start: Option<LoopCallback>, on_stop: Option<LoopCallback>) {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.on_start = on_start;
        callbacks.on_stop = on_stop;
    }

    pub fn state(&self) -> LoopState {
        self.inner.lock().unwrap().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    /// Pump events in the calling task until stopped or the channel closes.
    ///
    /// Returns false without dispatching anything if a loop is already active.
    pub async fn run_foreground(&self) -> bool {
        let begun = Self::begin(&mut self.inner.lock().unwrap(), LoopState::RunningForeground);
        let Some((events, stop)) = begun else {
            return false;
        };
        let mut run = RunGuard::new(self, events);
        self.pump(&mut run, stop).await;
        true
    }

    /// Pump events on a spawned task.
    ///
    /// Returns false if a loop is already active or there is no tokio
    /// runtime to spawn on.
    pub fn run_background(self: &Arc<Self>) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Cannot start background event loop outside a tokio runtime");
            return false;
        };
        // Held until the task handle is stored so a fast exit cannot race it
        let mut inner = self.inner.lock().unwrap();
        let Some((events, stop)) = Self::begin(&mut inner, LoopState::RunningBackground) else {
            return false;
        };

        let this = Arc::clone(self);
        inner.task = Some(runtime.spawn(async move {
            let mut run = RunGuard::new(&this, events);
            this.pump(&mut run, stop).await;
        }));
        true
    }

    /// Ask the running loop to exit once the current handler returns.
    ///
    /// Safe to call from any thread, including from inside a handler.
    /// Returns false if no loop is running.
    pub fn stop(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_running() {
            return false;
        }
        inner.stop.cancel();
        true
    }

    /// Stop the running loop, if any, and refuse every later run.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.stop.cancel();
    }

    /// Wait until no loop is running.
    ///
    /// Covers both a background task and a foreground run owned by some
    /// other task. Does not stop anything by itself.
    pub async fn join(&self) {
        let task = self.inner.lock().unwrap().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Background event loop task failed: {}", e);
            }
        }

        loop {
            let finished = self.finished.notified();
            if !self.is_running() {
                return;
            }
            finished.await;
        }
    }

    /// Weak control handle suitable for capture inside handlers.
    pub fn control(self: &Arc<Self>) -> LoopControl {
        LoopControl {
            inner: Arc::downgrade(self),
        }
    }

    fn begin(
        inner: &mut LoopInner,
        mode: LoopState,
    ) -> Option<(mpsc::UnboundedReceiver<Event>, CancellationToken)> {
        if inner.closed {
            debug!("Event loop closed");
            return None;
        }
        if inner.state.is_running() {
            debug!(state = ?inner.state, "Event loop already running");
            return None;
        }
        let events = inner.events.take()?;
        inner.stop = CancellationToken::new();
        inner.state = mode;
        Some((events, inner.stop.clone()))
    }

    fn finish(&self, events: mpsc::UnboundedReceiver<Event>) {
        let on_stop = self.callbacks.read().unwrap().on_stop.clone();
        if let Some(cb) = on_stop {
            run_callback("stop", &cb);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.events = Some(events);
            inner.state = LoopState::Stopped;
        }
        self.finished.notify_waiters();
        debug!("Event loop stopped");
    }

    async fn pump(&self, run: &mut RunGuard<'_>, stop: CancellationToken) {
        let Some(events) = run.events.as_mut() else {
            return;
        };
        let on_start = self.callbacks.read().unwrap().on_start.clone();
        if let Some(cb) = on_start {
            run_callback("start", &cb);
        }
        debug!("Event loop started");

        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!("Event loop stop requested");
                    break;
                }
                next = events.recv() => match next {
                    Some(event) => event,
                    None => {
                        info!("Daemon connection closed, event loop exiting");
                        break;
                    }
                },
            };
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: Event) {
        let kind = event.kind();
        let handler = self.handlers.read().unwrap().get(&kind).cloned();
        let Some(handler) = handler else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(%kind, "No handler registered for event, dropping it");
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(Ok(())) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                warn!(%kind, error = %e, "Event handler failed");
            }
            Err(panic) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                warn!(%kind, panic = panic_message(&panic), "Event handler panicked");
            }
        }
    }
}

/// Owns the receiver for one run and hands it back on drop, so the loop
/// returns to `Stopped` even when a foreground run's future is cancelled.
struct RunGuard<'a> {
    owner: &'a EventLoop,
    events: Option<mpsc::UnboundedReceiver<Event>>,
}

impl<'a> RunGuard<'a> {
    fn new(owner: &'a EventLoop, events: mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            owner,
            events: Some(events),
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            self.owner.finish(events);
        }
    }
}

fn run_callback(which: &str, cb: &LoopCallback) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb())) {
        warn!(callback = which, panic = panic_message(&panic), "Event loop callback panicked");
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Stop/query access to a handle's event loop that does not keep it alive.
#[derive(Clone)]
pub struct LoopControl {
    inner: Weak<EventLoop>,
}

impl LoopControl {
    pub fn stop(&self) -> bool {
        self.inner.upgrade().map(|l| l.stop()).unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .upgrade()
            .map(|l| l.is_running())
            .unwrap_or(false)
    }
}
