//! Matching of delivered actions against blocked replicators.
//!
//! `repl` registers a waiter under the action id it is about to send, hands
//! the fragments to the backend and blocks. When the delivery worker
//! reassembles one of our own actions it completes the waiter with the
//! assigned seqnos instead of enqueueing the action for `recv`.
//!
//! The table is shared between sender threads (register / remove) and the
//! delivery worker (complete / fail); a single lock over the map plus a
//! per-waiter condvar keeps senders and the worker from ever sharing a
//! mutable reference to a waiter record.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::types::Seqno;
use crate::GcsError;

// ============================================================================
// Completion Records
// ============================================================================

/// The result a completed replicator is woken with.
///
/// Both seqnos are drawn by the delivery worker at the moment it matches
/// the delivery, never by the woken caller: the worker is the only thread
/// that observes the wire order, so completions of concurrent `repl` calls
/// carry local seqnos in exactly that order no matter which caller the
/// scheduler resumes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplDone {
    /// Global seqno of the action; illegal for types without one.
    pub global: Seqno,
    /// Local seqno of the action; illegal when the completion hands no
    /// position to the caller (a state request that found no donor).
    pub local: Seqno,
    /// Donor index decided for a state request; −1 when no donor was
    /// available, `None` for ordinary replication.
    pub donor_idx: Option<i64>,
}

/// Why a waiter was completed without a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// The action was lost to a view change before it was ordered.
    NotOrdered,
    /// The connection is closing.
    Closed,
}

impl From<FailKind> for GcsError {
    fn from(kind: FailKind) -> Self {
        match kind {
            FailKind::NotOrdered => GcsError::NotOrdered,
            FailKind::Closed => GcsError::Closed,
        }
    }
}

#[derive(Debug)]
enum WaitState {
    Pending,
    Done(ReplDone),
    Failed(FailKind),
}

// ============================================================================
// Waiter
// ============================================================================

/// One blocked `repl` call.
#[derive(Debug)]
pub struct Waiter {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the delivery worker resolves this waiter.
    pub fn wait(&self) -> Result<ReplDone, FailKind> {
        let mut state = self.state.lock().expect("waiter lock poisoned");
        loop {
            match *state {
                WaitState::Pending => {
                    state = self.cond.wait(state).expect("waiter lock poisoned");
                }
                WaitState::Done(done) => return Ok(done),
                WaitState::Failed(kind) => return Err(kind),
            }
        }
    }

    fn resolve(&self, new_state: WaitState) {
        let mut state = self.state.lock().expect("waiter lock poisoned");
        if matches!(*state, WaitState::Pending) {
            *state = new_state;
            self.cond.notify_one();
        }
    }
}

// ============================================================================
// Outstanding-send Table
// ============================================================================

/// The table of in-flight `repl` calls, keyed by action id.
#[derive(Debug, Default)]
pub struct ReplMonitor {
    waiters: Mutex<HashMap<u64, Arc<Waiter>>>,
}

impl ReplMonitor {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `action_id`. Must happen before the first
    /// fragment is handed to the backend, or self-delivery could race past
    /// the registration.
    pub fn register(&self, action_id: u64) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter::new());
        let prev = self
            .waiters
            .lock()
            .expect("monitor lock poisoned")
            .insert(action_id, Arc::clone(&waiter));
        debug_assert!(prev.is_none(), "duplicate action id {action_id}");
        waiter
    }

    /// Completes the waiter for `action_id` with a delivery result.
    ///
    /// Returns false without invoking `make` if no waiter is registered,
    /// which is the `send` path: the caller then routes the action to the
    /// receive queue instead, and no seqno is drawn here. The closure runs
    /// under the table lock, so a result computed for a waiter (in
    /// particular its local seqno) is never produced and then dropped by a
    /// racing `fail_all`.
    pub fn complete_with(&self, action_id: u64, make: impl FnOnce() -> ReplDone) -> bool {
        let mut waiters = self.waiters.lock().expect("monitor lock poisoned");
        match waiters.remove(&action_id) {
            Some(waiter) => {
                waiter.resolve(WaitState::Done(make()));
                true
            }
            None => false,
        }
    }

    /// Fails the waiter for `action_id`, if any.
    pub fn fail(&self, action_id: u64, kind: FailKind) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("monitor lock poisoned")
            .remove(&action_id);
        match waiter {
            Some(waiter) => {
                waiter.resolve(WaitState::Failed(kind));
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding waiter; used on loss of the primary component
    /// and on close.
    pub fn fail_all(&self, kind: FailKind) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock().expect("monitor lock poisoned");
            waiters.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), ?kind, "failing outstanding replicators");
        }
        for (_, waiter) in drained {
            waiter.resolve(WaitState::Failed(kind));
        }
    }

    /// Drops the registration without waking anyone; used when the send
    /// itself failed and the caller reports that error instead.
    pub fn remove(&self, action_id: u64) {
        self.waiters
            .lock()
            .expect("monitor lock poisoned")
            .remove(&action_id);
    }

    /// Number of in-flight `repl` calls.
    pub fn outstanding(&self) -> usize {
        self.waiters.lock().expect("monitor lock poisoned").len()
    }
}
