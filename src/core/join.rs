//! Fan-out/fan-in of backend operations
//!
//! A join tracks N backend calls launched together. Each call carries an
//! [`OpCompletion`] tagged with its slot index; the backend consumes it on one
//! of its own threads. Completion records the slot under the join's lock and
//! bumps a shared counter. The completion that brings the counter to N posts a
//! single `JoinReady` event to the event loop, which runs the continuation on
//! the request thread.
//!
//! Backend threads touch nothing but their own slot and the counter.

use crate::backend::{BackendError, BackendResult, ListCallback, OpCallback, ValueCallback};
use crossbeam::channel::Sender;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Status of one launched operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Success,
    Failed,
}

/// Data returned by read operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Value(String),
    Entries(Vec<(String, String)>),
}

/// One element of a join's slot array
#[derive(Debug, Clone)]
pub struct OpSlot {
    pub status: OpStatus,
    pub error: Option<BackendError>,
    /// Errno-style backend code, 0 on success
    pub error_code: i32,
    pub message: String,
    pub payload: Option<Payload>,
}

impl OpSlot {
    fn pending() -> Self {
        OpSlot {
            status: OpStatus::Pending,
            error: None,
            error_code: 0,
            message: String::new(),
            payload: None,
        }
    }
}

/// Event delivered to the request thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    JoinReady(u64),
}

/// State shared between the request thread and backend threads
pub(crate) struct JoinState {
    token: u64,
    expected: usize,
    slots: Mutex<Vec<OpSlot>>,
    completed: CachePadded<AtomicUsize>,
    notify: Sender<LoopEvent>,
    started: Instant,
}

impl JoinState {
    pub(crate) fn new(token: u64, expected: usize, notify: Sender<LoopEvent>) -> Self {
        JoinState {
            token,
            expected,
            slots: Mutex::new(vec![OpSlot::pending(); expected]),
            completed: CachePadded::new(AtomicUsize::new(0)),
            notify,
            started: Instant::now(),
        }
    }

    /// Record one slot's result; runs on a backend thread
    fn record(&self, index: usize, result: BackendResult<Option<Payload>>) {
        {
            let mut slots = self.slots.lock();
            let slot = &mut slots[index];
            if slot.status != OpStatus::Pending {
                tracing::warn!("join {} slot {} completed twice, ignoring", self.token, index);
                return;
            }
            match result {
                Ok(payload) => {
                    slot.status = OpStatus::Success;
                    slot.message = "Success.".to_string();
                    slot.payload = payload;
                }
                Err(err) => {
                    slot.status = OpStatus::Failed;
                    slot.error_code = err.code();
                    slot.message = err.to_string();
                    slot.error = Some(err);
                }
            }
        }

        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if done == self.expected {
            // The loop may already be gone (process teardown); nothing to notify then.
            let _ = self.notify.send(LoopEvent::JoinReady(self.token));
        }
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Snapshot the slots once every operation has reported
    pub(crate) fn outcome(&self) -> JoinOutcome {
        JoinOutcome {
            slots: self.slots.lock().clone(),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Completion handle for one slot, handed to the backend
///
/// Consuming it records the result. Dropping it unconsumed records
/// [`BackendError::Cancelled`], so a join always reaches N.
pub struct OpCompletion {
    state: Option<Arc<JoinState>>,
    index: usize,
}

impl OpCompletion {
    pub(crate) fn new(state: Arc<JoinState>, index: usize) -> Self {
        OpCompletion {
            state: Some(state),
            index,
        }
    }

    /// Slot index within the join
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn complete(mut self, result: BackendResult<Option<Payload>>) {
        if let Some(state) = self.state.take() {
            state.record(self.index, result);
        }
    }

    /// Adapt into a status-only backend callback
    pub fn into_op_callback(self) -> OpCallback {
        Box::new(move |result| self.complete(result.map(|_| None)))
    }

    /// Adapt into a single-value read callback
    pub fn into_value_callback(self) -> ValueCallback {
        Box::new(move |result| self.complete(result.map(|v| Some(Payload::Value(v)))))
    }

    /// Adapt into a listing callback
    pub fn into_list_callback(self) -> ListCallback {
        Box::new(move |result| self.complete(result.map(|e| Some(Payload::Entries(e)))))
    }
}

impl Drop for OpCompletion {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.record(self.index, Err(BackendError::Cancelled));
        }
    }
}

/// Final status of every slot, observed by the continuation
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    slots: Vec<OpSlot>,
    elapsed: Duration,
}

impl JoinOutcome {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[OpSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> &OpSlot {
        &self.slots[index]
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn any_succeeded(&self) -> bool {
        self.slots.iter().any(|s| s.status == OpStatus::Success)
    }

    pub fn all_succeeded(&self) -> bool {
        self.slots.iter().all(|s| s.status == OpStatus::Success)
    }

    pub fn succeeded(&self, index: usize) -> bool {
        self.slots[index].status == OpStatus::Success
    }

    pub fn error(&self, index: usize) -> Option<&BackendError> {
        self.slots[index].error.as_ref()
    }

    /// First failure in slot order
    pub fn first_error(&self) -> Option<&BackendError> {
        self.slots.iter().find_map(|s| s.error.as_ref())
    }

    /// True if any slot failed before it could be launched
    pub fn launch_failed(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.error, Some(BackendError::LaunchFailed(_))))
    }

    /// Take the read payload of a slot
    pub fn take_payload(&mut self, index: usize) -> Option<Payload> {
        self.slots[index].payload.take()
    }

    /// Value returned by a `kv_get` slot
    pub fn value(&self, index: usize) -> Option<&str> {
        match &self.slots[index].payload {
            Some(Payload::Value(v)) => Some(v.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_last_completion_posts_once() {
        let (tx, rx) = unbounded();
        let state = Arc::new(JoinState::new(7, 3, tx));

        let completions: Vec<_> = (0..3).map(|i| OpCompletion::new(state.clone(), i)).collect();
        let mut iter = completions.into_iter();
        iter.next().unwrap().complete(Ok(None));
        iter.next().unwrap().complete(Err(BackendError::NotFound));
        assert!(rx.try_recv().is_err());
        iter.next().unwrap().complete(Ok(None));

        assert_eq!(rx.try_recv().unwrap(), LoopEvent::JoinReady(7));
        assert!(rx.try_recv().is_err());

        let outcome = state.outcome();
        assert!(outcome.any_succeeded());
        assert!(!outcome.all_succeeded());
        assert_eq!(outcome.slot(1).error_code, BackendError::NotFound.code());
    }

    #[test]
    fn test_dropped_completion_counts_as_cancelled() {
        let (tx, rx) = unbounded();
        let state = Arc::new(JoinState::new(1, 1, tx));
        drop(OpCompletion::new(state.clone(), 0));

        assert_eq!(rx.try_recv().unwrap(), LoopEvent::JoinReady(1));
        assert_eq!(state.outcome().error(0), Some(&BackendError::Cancelled));
    }

    #[test]
    fn test_value_callback_carries_payload() {
        let (tx, _rx) = unbounded();
        let state = Arc::new(JoinState::new(2, 1, tx));
        let cb = OpCompletion::new(state.clone(), 0).into_value_callback();
        cb(Ok("hello".to_string()));
        assert_eq!(state.outcome().value(0), Some("hello"));
    }

    #[test]
    fn test_completions_from_many_threads() {
        let (tx, rx) = unbounded();
        let n = 64;
        let state = Arc::new(JoinState::new(9, n, tx));

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let completion = OpCompletion::new(state.clone(), i);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        completion.complete(Ok(None));
                    } else {
                        completion.complete(Err(BackendError::Timeout));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(state.completed(), n);
        assert_eq!(rx.try_iter().count(), 1);
        let outcome = state.outcome();
        assert!(outcome.slots().iter().all(|s| s.status != OpStatus::Pending));
    }
}
