//! Backend adapter: uniform interface to a virtually synchronous transport.
//!
//! The backend contract: within a primary component, all members deliver the
//! same messages in the same total order; across configuration changes the
//! backend delivers a view event that bounds which messages belong to which
//! view. The library builds everything else (fragmentation, seqnos, state
//! transfer) on top of that guarantee.
//!
//! Backends are selected by URL at connection creation
//! (see [`crate::BackendUrl`]); only the in-process `dummy` transport is
//! compiled into this crate, the network transports are external.

pub mod dummy;

use std::sync::{Arc, Mutex};

use crate::config::{BackendType, BackendUrl};
use crate::types::{GroupUuid, Member, Seqno};
use crate::{GcsError, GcsResult};

// ============================================================================
// Events
// ============================================================================

/// A message delivered by the transport, stamped with the sender's index in
/// the view it was delivered in.
#[derive(Debug, Clone)]
pub struct Delivered {
    /// Sender index in the current configuration.
    pub sender_idx: usize,
    /// Raw message bytes (one fragment, see [`crate::wire`]).
    pub bytes: Vec<u8>,
}

/// A membership change, delivered in total order with messages.
///
/// Carries each member's announced history position so the receiving node
/// can run the quorum computation without a further round trip.
#[derive(Debug, Clone)]
pub struct ViewEvent {
    /// Monotone view identifier assigned by the transport.
    pub view_id: i64,
    /// True if this view is a primary component.
    pub is_primary: bool,
    /// Index of the receiving node in `members`.
    pub my_idx: usize,
    /// Members in configuration order, with announced positions.
    pub members: Vec<Member>,
}

/// An event read from the transport.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A totally ordered message.
    Message(Delivered),
    /// A view change.
    View(ViewEvent),
}

// ============================================================================
// Position Announcement
// ============================================================================

/// The history position a node announces to the group.
///
/// The connection keeps this up to date as it delivers ordered actions; the
/// transport snapshots it when building view events, so every member's vote
/// in the quorum computation reflects its latest position.
#[derive(Debug)]
pub struct Announce {
    inner: Mutex<(GroupUuid, Seqno)>,
}

impl Announce {
    /// Creates an announcement at the given position.
    pub fn new(uuid: GroupUuid, seqno: Seqno) -> Self {
        Self {
            inner: Mutex::new((uuid, seqno)),
        }
    }

    /// Updates the announced position.
    pub fn set(&self, uuid: GroupUuid, seqno: Seqno) {
        *self.inner.lock().expect("announce lock poisoned") = (uuid, seqno);
    }

    /// Reads the announced position.
    pub fn get(&self) -> (GroupUuid, Seqno) {
        *self.inner.lock().expect("announce lock poisoned")
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Uniform interface over a virtually synchronous transport.
pub trait Backend: Send + Sync {
    /// Submits one message for totally ordered delivery to the group,
    /// including the sender itself.
    fn send_message(&self, bytes: Vec<u8>) -> GcsResult<()>;

    /// Blocks until the next event is available.
    ///
    /// Returns [`GcsError::Closed`] once the backend has been closed and all
    /// previously delivered events have been drained.
    fn recv_event(&self) -> GcsResult<BackendEvent>;

    /// Leaves the channel. Idempotent.
    fn close(&self) -> GcsResult<()>;

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Joins `channel` over the transport named by `url`.
///
/// `member_id` is this node's identifier within the channel and `announce`
/// is the position handle the transport snapshots at view boundaries.
pub fn connect(
    url: &BackendUrl,
    channel: &str,
    member_id: String,
    announce: Arc<Announce>,
) -> GcsResult<Box<dyn Backend>> {
    match url.backend {
        BackendType::Dummy => Ok(Box::new(dummy::DummyBackend::join(
            channel, member_id, announce,
        ))),
        BackendType::Spread | BackendType::Gcomm => {
            Err(GcsError::UnsupportedBackend(url.backend.to_string()))
        }
    }
}
