//! Flow control between the fast group and a slow local applier.
//!
//! Each node watches the gap between the last ordered action it delivered
//! and the position its application reports as applied. Crossing the high
//! watermark emits a pause message to the group; falling back under the low
//! watermark emits a resume. Pause state is tracked per member, and `wait`
//! answers "does anyone currently have a slow queue" without blocking.
//!
//! Flow messages travel through the ordered stream like any other action but
//! are consumed here, never enqueued to the application. They are not
//! idempotent across reconfigurations: a paused node re-announces its state
//! after every configuration change, and pause entries of departed members
//! are dropped.
//!
//! The same bookkeeping derives the group-wide commit cut: every member
//! announces its applied position, and when the minimum over the whole
//! membership advances, a commit-cut action can be broadcast to let the
//! group truncate its logs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::types::Seqno;

#[derive(Debug)]
struct FlowState {
    /// Global seqno of the last ordered action enqueued locally.
    last_delivered: Seqno,
    /// Applied position last reported by the application.
    last_applied: Seqno,
    /// Whether we have an un-resumed pause outstanding.
    self_paused: bool,
    /// Members currently pausing the group (self included).
    paused: HashSet<String>,
    /// Last-applied announcements per member.
    applied: HashMap<String, Seqno>,
    /// Current membership, for commit cut completeness.
    members: Vec<String>,
    /// Last commit cut derived.
    commit_cut: Seqno,
}

/// Flow control state of one connection.
#[derive(Debug)]
pub struct FlowController {
    my_id: String,
    low: u64,
    high: u64,
    state: Mutex<FlowState>,
    /// Mirror of `!paused.is_empty()` for the non-blocking `wait` predicate.
    paused_any: AtomicBool,
}

impl FlowController {
    /// Creates a controller with the given watermarks for the member
    /// identified by `my_id`.
    pub fn new(my_id: String, low: u64, high: u64) -> Self {
        debug_assert!(low < high, "watermarks inverted");
        Self {
            my_id,
            low,
            high,
            state: Mutex::new(FlowState {
                last_delivered: Seqno::NIL,
                last_applied: Seqno::NIL,
                self_paused: false,
                paused: HashSet::new(),
                applied: HashMap::new(),
                members: Vec::new(),
                commit_cut: Seqno::NIL,
            }),
            paused_any: AtomicBool::new(false),
        }
    }

    fn lag(state: &FlowState) -> u64 {
        (state.last_delivered.as_i64() - state.last_applied.as_i64()).max(0) as u64
    }

    fn refresh_paused_any(&self, state: &FlowState) {
        self.paused_any
            .store(!state.paused.is_empty(), Ordering::Release);
    }

    /// Records delivery of an ordered action. Returns `Some(true)` when a
    /// pause message must be emitted.
    pub fn on_delivered(&self, global: Seqno) -> Option<bool> {
        let mut state = self.state.lock().expect("flow lock poisoned");
        if global > state.last_delivered {
            state.last_delivered = global;
        }
        if !state.self_paused && Self::lag(&state) >= self.high {
            state.self_paused = true;
            debug!(lag = Self::lag(&state), high = self.high, "applier lag, pausing group");
            return Some(true);
        }
        None
    }

    /// Records local applier progress. Returns `Some(false)` when a resume
    /// message must be emitted.
    pub fn on_applied(&self, seqno: Seqno) -> Option<bool> {
        let mut state = self.state.lock().expect("flow lock poisoned");
        if seqno > state.last_applied {
            state.last_applied = seqno;
        }
        if state.self_paused && Self::lag(&state) <= self.low {
            state.self_paused = false;
            debug!(lag = Self::lag(&state), low = self.low, "applier caught up, resuming group");
            return Some(false);
        }
        None
    }

    /// Consumes a delivered flow action.
    pub fn on_flow(&self, sender_id: &str, pause: bool) {
        let mut state = self.state.lock().expect("flow lock poisoned");
        if pause {
            state.paused.insert(sender_id.to_owned());
        } else {
            state.paused.remove(sender_id);
        }
        self.refresh_paused_any(&state);
    }

    /// Adjusts to a new configuration. Pause entries and applied
    /// announcements of departed members are dropped; returns `Some(true)`
    /// when this node is itself paused and must re-announce.
    pub fn on_conf(&self, members: &[String]) -> Option<bool> {
        let mut state = self.state.lock().expect("flow lock poisoned");
        state.members = members.to_vec();
        state
            .paused
            .retain(|id| members.iter().any(|m| m == id));
        state
            .applied
            .retain(|id, _| members.iter().any(|m| m == id));
        self.refresh_paused_any(&state);
        state.self_paused.then_some(true)
    }

    /// Records a member's applied-position announcement. Returns the new
    /// commit cut when the minimum over the full membership advanced.
    pub fn record_applied(&self, member_id: &str, seqno: Seqno) -> Option<Seqno> {
        let mut state = self.state.lock().expect("flow lock poisoned");
        let entry = state.applied.entry(member_id.to_owned()).or_insert(Seqno::NIL);
        if seqno > *entry {
            *entry = seqno;
        }

        // The cut needs a vote from every current member.
        if state.members.is_empty()
            || !state
                .members
                .iter()
                .all(|m| state.applied.contains_key(m))
        {
            return None;
        }
        let min = state
            .members
            .iter()
            .filter_map(|m| state.applied.get(m))
            .min()
            .copied()
            .unwrap_or(Seqno::NIL);
        if min > state.commit_cut {
            state.commit_cut = min;
            return Some(min);
        }
        None
    }

    /// The `wait` predicate: true if any member currently pauses the group.
    /// Never blocks.
    pub fn anyone_paused(&self) -> bool {
        self.paused_any.load(Ordering::Acquire)
    }

    /// Current applier lag in actions.
    pub fn current_lag(&self) -> u64 {
        let state = self.state.lock().expect("flow lock poisoned");
        Self::lag(&state)
    }
}
