//! The request thread's event loop
//!
//! Owns the registry of pending joins and the receiving end of the channel
//! backend threads post `JoinReady` events into. Continuations run here and
//! only here, so everything they touch is single-writer by construction.
//!
//! The loop is `!Send`: it and the pipelines it drives belong to
//! one thread.

use crate::config::GatewayConfig;
use crate::core::join::{JoinOutcome, JoinState, LoopEvent, OpCompletion};
use crate::backend::BackendError;
use crate::error::{GatewayError, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Continuation invoked once a join completes
pub type Continuation = Box<dyn FnOnce(JoinOutcome)>;

/// Process-wide drain flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    draining: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Clear the flag (fault-injection tests only)
    pub fn reset(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }
}

/// Counts backend timeouts inside a window and trips a drain past a threshold
#[derive(Debug)]
struct TimeoutWatchdog {
    threshold: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
    tripped: bool,
}

impl TimeoutWatchdog {
    fn new(threshold: u32, window: Duration) -> Self {
        TimeoutWatchdog {
            threshold,
            window,
            window_start: Instant::now(),
            count: 0,
            tripped: false,
        }
    }

    /// Returns true exactly once, when the threshold is reached
    fn record_timeout(&mut self, now: Instant) -> bool {
        if self.tripped {
            return false;
        }
        if now.duration_since(self.window_start) >= self.window {
            debug!("Resetting backend timeout window");
            self.count = 0;
        }
        self.count += 1;
        self.window_start = now;
        if self.count >= self.threshold {
            self.tripped = true;
            return true;
        }
        false
    }
}

enum Continuations {
    Split {
        on_success: Continuation,
        on_failed: Continuation,
    },
    Single(Continuation),
}

struct PendingJoin {
    state: Arc<JoinState>,
    label: String,
    continuations: Continuations,
}

/// Single-threaded dispatcher for join continuations
pub struct EventLoop {
    tx: Sender<LoopEvent>,
    rx: Receiver<LoopEvent>,
    pending: RefCell<HashMap<u64, PendingJoin>>,
    next_token: Cell<u64>,
    dispatched: Cell<u64>,
    wait_timeout: Duration,
    watchdog: RefCell<TimeoutWatchdog>,
    shutdown: ShutdownSignal,
}

impl EventLoop {
    pub fn new(config: &GatewayConfig, shutdown: ShutdownSignal) -> Self {
        let (tx, rx) = unbounded();
        EventLoop {
            tx,
            rx,
            pending: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            dispatched: Cell::new(0),
            wait_timeout: config.join_wait_timeout(),
            watchdog: RefCell::new(TimeoutWatchdog::new(
                config.backend.etimedout_max_threshold,
                Duration::from_secs(config.backend.etimedout_window_secs),
            )),
            shutdown,
        }
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Launch `n` backend operations as one join
    ///
    /// `setup` is called once per slot with that slot's completion and must
    /// hand it to exactly one backend call. Once all `n` have reported,
    /// `on_success` runs if at least one succeeded, otherwise `on_failed`.
    /// Neither runs before this call returns.
    ///
    /// # Panics
    /// Panics if `n` is 0
    pub fn launch<L, S, F>(&self, label: &str, n: usize, setup: L, on_success: S, on_failed: F)
    where
        L: FnMut(OpCompletion),
        S: FnOnce(JoinOutcome) + 'static,
        F: FnOnce(JoinOutcome) + 'static,
    {
        self.register(
            label,
            n,
            setup,
            Continuations::Split {
                on_success: Box::new(on_success),
                on_failed: Box::new(on_failed),
            },
        );
    }

    /// Like [`launch`](Self::launch) with one continuation that inspects the
    /// outcome itself
    pub fn launch_then<L, D>(&self, label: &str, n: usize, setup: L, on_done: D)
    where
        L: FnMut(OpCompletion),
        D: FnOnce(JoinOutcome) + 'static,
    {
        self.register(label, n, setup, Continuations::Single(Box::new(on_done)));
    }

    fn register<L>(&self, label: &str, n: usize, mut setup: L, continuations: Continuations)
    where
        L: FnMut(OpCompletion),
    {
        assert!(n > 0, "a join needs at least one operation");

        let token = self.next_token.get();
        self.next_token.set(token + 1);

        let state = Arc::new(JoinState::new(token, n, self.tx.clone()));
        self.pending.borrow_mut().insert(
            token,
            PendingJoin {
                state: state.clone(),
                label: label.to_string(),
                continuations,
            },
        );
        debug!("Launching join {} ({}) with {} ops", token, label, n);

        for index in 0..n {
            setup(OpCompletion::new(state.clone(), index));
        }
    }

    /// Queue `f` to run on the next dispatch, never inline
    pub fn defer<F>(&self, label: &str, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.launch_then(label, 1, |c| c.complete(Ok(None)), move |_| f());
    }

    /// Number of joins still waiting for completions
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Total continuations run so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched.get()
    }

    /// Run every ready continuation without blocking
    pub fn poll(&self) -> usize {
        let mut ran = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.dispatch(event);
            ran += 1;
        }
        ran
    }

    /// Block until no join is pending
    ///
    /// Fails with [`GatewayError::Stalled`] if no completion arrives within the
    /// configured wait while joins are outstanding.
    pub fn run_until_idle(&self) -> Result<usize> {
        let mut ran = self.poll();
        while self.pending() > 0 {
            match self.rx.recv_timeout(self.wait_timeout) {
                Ok(event) => {
                    self.dispatch(event);
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(GatewayError::Stalled {
                        pending: self.pending(),
                        waited_ms: self.wait_timeout.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(GatewayError::Internal("event channel closed".into()));
                }
            }
        }
        Ok(ran)
    }

    fn dispatch(&self, event: LoopEvent) {
        let LoopEvent::JoinReady(token) = event;
        // Drop the registry borrow before running user code; continuations launch joins.
        let Some(join) = self.pending.borrow_mut().remove(&token) else {
            error!("Join {} completed but is not registered", token);
            return;
        };
        self.dispatched.set(self.dispatched.get() + 1);

        let outcome = join.state.outcome();
        debug!(
            "Join {} ({}) done in {:?}: {} ops",
            token,
            join.label,
            outcome.elapsed(),
            outcome.len()
        );

        let timed_out = !outcome.any_succeeded()
            && matches!(outcome.first_error(), Some(BackendError::Timeout));

        match join.continuations {
            Continuations::Single(on_done) => on_done(outcome),
            Continuations::Split { on_success, .. } if outcome.any_succeeded() => {
                on_success(outcome)
            }
            Continuations::Split { on_failed, .. } => on_failed(outcome),
        }

        if timed_out && self.watchdog.borrow_mut().record_timeout(Instant::now()) {
            error!("Backend timeout count reached threshold; starting graceful drain");
            self.shutdown.begin_drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn event_loop() -> EventLoop {
        let config = GatewayConfig::default().with_join_wait_timeout(Duration::from_millis(500));
        EventLoop::new(&config, ShutdownSignal::new())
    }

    #[test]
    fn test_success_continuation_runs_on_loop_thread() {
        let lp = event_loop();
        let hits = Rc::new(Cell::new(0));
        let loop_thread = std::thread::current().id();

        let h = hits.clone();
        lp.launch(
            "test",
            4,
            |completion| {
                std::thread::spawn(move || completion.complete(Ok(None)));
            },
            move |outcome| {
                assert_eq!(std::thread::current().id(), loop_thread);
                assert!(outcome.all_succeeded());
                h.set(h.get() + 1);
            },
            |_| panic!("should not fail"),
        );

        assert_eq!(hits.get(), 0);
        lp.run_until_idle().unwrap();
        assert_eq!(hits.get(), 1);
        assert_eq!(lp.pending(), 0);
    }

    #[test]
    fn test_all_failed_runs_failure_continuation() {
        let lp = event_loop();
        let failed = Rc::new(Cell::new(false));
        let f = failed.clone();
        lp.launch(
            "test",
            2,
            |completion| completion.complete(Err(BackendError::NotFound)),
            |_| panic!("should not succeed"),
            move |outcome| {
                assert_eq!(outcome.first_error(), Some(&BackendError::NotFound));
                f.set(true);
            },
        );
        lp.run_until_idle().unwrap();
        assert!(failed.get());
    }

    #[test]
    fn test_continuation_may_launch_next_join() {
        let lp = Rc::new(event_loop());
        let order = Rc::new(RefCell::new(Vec::new()));

        let lp2 = lp.clone();
        let o1 = order.clone();
        lp.launch(
            "first",
            1,
            |c| c.complete(Ok(None)),
            move |_| {
                o1.borrow_mut().push("first");
                let o2 = o1.clone();
                lp2.launch(
                    "second",
                    1,
                    |c| c.complete(Ok(None)),
                    move |_| o2.borrow_mut().push("second"),
                    |_| {},
                );
            },
            |_| {},
        );
        lp.run_until_idle().unwrap();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_stall_reported_when_completion_withheld() {
        let lp = event_loop();
        let held = RefCell::new(Vec::new());
        lp.launch("stuck", 1, |c| held.borrow_mut().push(c), |_| {}, |_| {});
        assert!(matches!(
            lp.run_until_idle(),
            Err(GatewayError::Stalled { pending: 1, .. })
        ));
    }

    #[test]
    fn test_timeouts_trip_drain() {
        let config = GatewayConfig::default()
            .with_join_wait_timeout(Duration::from_millis(500))
            .with_etimedout_threshold(3, 60);
        let lp = EventLoop::new(&config, ShutdownSignal::new());

        for _ in 0..3 {
            assert!(!lp.shutdown_signal().is_draining());
            lp.launch(
                "timeout",
                1,
                |c| c.complete(Err(BackendError::Timeout)),
                |_| {},
                |_| {},
            );
            lp.run_until_idle().unwrap();
        }
        assert!(lp.shutdown_signal().is_draining());
    }

    #[test]
    fn test_watchdog_window_resets() {
        let mut dog = TimeoutWatchdog::new(2, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(!dog.record_timeout(t0));
        assert!(!dog.record_timeout(t0 + Duration::from_secs(11)));
        assert!(dog.record_timeout(t0 + Duration::from_secs(12)));
        assert!(!dog.record_timeout(t0 + Duration::from_secs(13)));
    }
}
