//! Suspendable, rollback-capable step pipeline
//!
//! A request runs as an ordered list of forward steps plus a separate list of
//! rollback steps. Each step returns a [`Flow`] telling the pipeline what to
//! do next:
//!
//! - `Next`: run the following step immediately
//! - `Suspend`: stop; a join continuation resumes later through a
//!   [`PipelineHandle`]
//! - `Rollback(err)`: drop the remaining forward steps and run the rollback
//!   list from its first entry
//! - `Done`: skip the remaining forward steps and complete
//!
//! Steps never call back into the pipeline synchronously, so the driver is a
//! plain loop and a long run of synchronous steps never grows the stack.
//!
//! Shutdown and client-disconnect checks happen only at forward step
//! boundaries. Once the host has been sent a response those checks stop,
//! since the remaining steps are cleanup the client no longer waits on.
//! Rollback steps are best-effort: a failing rollback step is logged and the
//! next one runs.

use crate::core::event_loop::ShutdownSignal;
use crate::error::{ErrorClass, GatewayError};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a step asks the pipeline to do next
#[derive(Debug)]
pub enum Flow {
    Next,
    Suspend,
    Rollback(GatewayError),
    Done,
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    RollingBack,
    Completed,
    RolledBack,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::RolledBack)
    }
}

/// Per-request client connection state, set by the protocol layer
#[derive(Debug, Clone)]
pub struct ClientConnection {
    connected: Arc<AtomicBool>,
}

impl Default for ClientConnection {
    fn default() -> Self {
        ClientConnection {
            connected: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl ClientConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A forward or rollback step
pub type Step<S> = Box<dyn FnMut(&mut Cx<'_, S>) -> Flow>;

type CompletionHook<S> = Box<dyn FnOnce(&mut S, Option<&GatewayError>)>;

/// Step execution context
pub struct Cx<'a, S> {
    pub state: &'a mut S,
    handle: PipelineHandle<S>,
    request_id: &'a str,
    response_sent: &'a mut bool,
    rollback_steps: &'a mut Vec<Step<S>>,
    rollback_open: bool,
}

impl<'a, S: 'static> Cx<'a, S> {
    /// Handle for join continuations to resume the pipeline
    pub fn handle(&self) -> PipelineHandle<S> {
        self.handle.clone()
    }

    pub fn request_id(&self) -> &str {
        self.request_id
    }

    /// Stop boundary checks; the remaining forward steps are cleanup
    pub fn mark_response_sent(&mut self) {
        *self.response_sent = true;
    }

    pub fn response_sent(&self) -> bool {
        *self.response_sent
    }

    /// Register a rollback step from inside a forward step
    pub fn add_rollback_step<F>(&mut self, step: F)
    where
        F: FnMut(&mut Cx<'_, S>) -> Flow + 'static,
    {
        if self.rollback_open {
            self.rollback_steps.push(Box::new(step));
        } else {
            warn!(
                "[{}] rollback step added after rollback began, ignoring",
                self.request_id
            );
        }
    }
}

struct Inner<S> {
    request_id: String,
    state: S,
    steps: Vec<Step<S>>,
    rollback_steps: Vec<Step<S>>,
    cursor: usize,
    phase: Phase,
    error: Option<GatewayError>,
    response_sent: bool,
    shutdown: ShutdownSignal,
    client: ClientConnection,
    on_complete: Option<CompletionHook<S>>,
}

impl<S> Inner<S> {
    fn boundary_error(&self) -> Option<GatewayError> {
        if self.response_sent {
            return None;
        }
        if self.shutdown.is_draining() {
            return Some(GatewayError::shutting_down());
        }
        if !self.client.is_connected() {
            return Some(GatewayError::ClientAbort);
        }
        None
    }

    fn begin_rollback(&mut self, err: GatewayError) {
        warn!("[{}] rolling back: {}", self.request_id, err);
        self.error = Some(err);
        self.steps.clear();
        self.cursor = 0;
        self.phase = Phase::RollingBack;
    }

    /// Tear down step lists and run the completion hook
    fn done(&mut self, phase: Phase) {
        debug!("[{}] pipeline finished: {:?}", self.request_id, phase);
        self.phase = phase;
        self.steps.clear();
        self.rollback_steps.clear();
        self.cursor = 0;
        if let Some(hook) = self.on_complete.take() {
            hook(&mut self.state, self.error.as_ref());
        }
    }
}

/// Owning handle of one request's pipeline
pub struct Pipeline<S> {
    inner: Rc<RefCell<Inner<S>>>,
}

/// Cloneable handle used by continuations to resume a suspended pipeline
pub struct PipelineHandle<S> {
    inner: Rc<RefCell<Inner<S>>>,
}

impl<S> Clone for PipelineHandle<S> {
    fn clone(&self) -> Self {
        PipelineHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<S: 'static> Pipeline<S> {
    pub fn new(
        request_id: impl Into<String>,
        state: S,
        shutdown: ShutdownSignal,
        client: ClientConnection,
    ) -> Self {
        Pipeline {
            inner: Rc::new(RefCell::new(Inner {
                request_id: request_id.into(),
                state,
                steps: Vec::new(),
                rollback_steps: Vec::new(),
                cursor: 0,
                phase: Phase::Idle,
                error: None,
                response_sent: false,
                shutdown,
                client,
                on_complete: None,
            })),
        }
    }

    /// Append a forward step; only before `start`
    pub fn add_step<F>(&self, step: F) -> &Self
    where
        F: FnMut(&mut Cx<'_, S>) -> Flow + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.phase == Phase::Idle {
            inner.steps.push(Box::new(step));
        } else {
            warn!("[{}] step added after start, ignoring", inner.request_id);
        }
        self
    }

    /// Append a rollback step; any time before rollback begins
    pub fn add_rollback_step<F>(&self, step: F) -> &Self
    where
        F: FnMut(&mut Cx<'_, S>) -> Flow + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.phase, Phase::Idle | Phase::Running) {
            inner.rollback_steps.push(Box::new(step));
        } else {
            warn!("[{}] rollback step added too late, ignoring", inner.request_id);
        }
        self
    }

    /// Hook run once when the pipeline reaches a terminal phase
    pub fn on_complete<F>(&self, hook: F) -> &Self
    where
        F: FnOnce(&mut S, Option<&GatewayError>) + 'static,
    {
        self.inner.borrow_mut().on_complete = Some(Box::new(hook));
        self
    }

    /// Run forward steps until the first suspension or terminal phase
    pub fn start(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.phase != Phase::Idle {
                warn!("[{}] pipeline already started", inner.request_id);
                return;
            }
            debug!(
                "[{}] starting pipeline with {} steps",
                inner.request_id,
                inner.steps.len()
            );
            inner.phase = Phase::Running;
        }
        self.handle().drive(Flow::Next);
    }

    /// Skip the forward list and run only the rollback list
    pub fn start_rollback(&self, err: GatewayError) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.phase != Phase::Idle {
                warn!("[{}] pipeline already started", inner.request_id);
                return;
            }
            inner.phase = Phase::Running;
        }
        self.handle().drive(Flow::Rollback(err));
    }

    pub fn handle(&self) -> PipelineHandle<S> {
        PipelineHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.borrow().phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase().is_terminal()
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.inner.borrow().error.as_ref().map(|e| e.class())
    }

    pub fn take_error(&self) -> Option<GatewayError> {
        self.inner.borrow_mut().error.take()
    }

    /// Read the pipeline state
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.inner.borrow().state)
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.borrow_mut().state)
    }
}

impl<S: 'static> PipelineHandle<S> {
    /// Resume with the next step of the current list
    pub fn next(&self) {
        self.drive(Flow::Next);
    }

    /// Abandon the forward list and roll back
    pub fn rollback(&self, err: GatewayError) {
        self.drive(Flow::Rollback(err));
    }

    /// Update state from a continuation, then resume as the closure decides
    pub fn resume_with<F>(&self, f: F)
    where
        F: FnOnce(&mut Cx<'_, S>) -> Flow,
    {
        let flow = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let rollback_open = inner.phase == Phase::Running;
            let mut cx = Cx {
                state: &mut inner.state,
                handle: self.clone(),
                request_id: &inner.request_id,
                response_sent: &mut inner.response_sent,
                rollback_steps: &mut inner.rollback_steps,
                rollback_open,
            };
            f(&mut cx)
        };
        self.drive(flow);
    }

    fn drive(&self, mut flow: Flow) {
        loop {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;

            match (inner.phase, flow) {
                (Phase::Running, Flow::Next) => {
                    if let Some(err) = inner.boundary_error() {
                        flow = Flow::Rollback(err);
                        continue;
                    }
                    if inner.cursor >= inner.steps.len() {
                        inner.done(Phase::Completed);
                        return;
                    }
                    let idx = inner.cursor;
                    inner.cursor += 1;
                    debug!("[{}] forward step {}", inner.request_id, idx);
                    let mut cx = Cx {
                        state: &mut inner.state,
                        handle: self.clone(),
                        request_id: &inner.request_id,
                        response_sent: &mut inner.response_sent,
                        rollback_steps: &mut inner.rollback_steps,
                        rollback_open: true,
                    };
                    flow = (inner.steps[idx])(&mut cx);
                }
                (Phase::Running, Flow::Rollback(err)) => {
                    inner.begin_rollback(err);
                    flow = Flow::Next;
                }
                (Phase::Running, Flow::Done) => {
                    inner.done(Phase::Completed);
                    return;
                }
                (Phase::RollingBack, Flow::Next) => {
                    if inner.cursor >= inner.rollback_steps.len() {
                        inner.done(Phase::RolledBack);
                        return;
                    }
                    let idx = inner.cursor;
                    inner.cursor += 1;
                    debug!("[{}] rollback step {}", inner.request_id, idx);
                    let mut closed = Vec::new();
                    let mut cx = Cx {
                        state: &mut inner.state,
                        handle: self.clone(),
                        request_id: &inner.request_id,
                        response_sent: &mut inner.response_sent,
                        rollback_steps: &mut closed,
                        rollback_open: false,
                    };
                    flow = (inner.rollback_steps[idx])(&mut cx);
                }
                (Phase::RollingBack, Flow::Rollback(err)) => {
                    warn!("[{}] rollback step failed: {}", inner.request_id, err);
                    flow = Flow::Next;
                }
                (Phase::RollingBack, Flow::Done) => {
                    inner.done(Phase::RolledBack);
                    return;
                }
                (_, Flow::Suspend) => return,
                (phase, flow) => {
                    warn!(
                        "[{}] ignoring {:?} in phase {:?}",
                        inner.request_id, flow, phase
                    );
                    return;
                }
            }
        }
    }
}
