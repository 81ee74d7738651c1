//! In-process loopback transport.
//!
//! All connections in the process that join the same channel name form one
//! group. Total order is imposed trivially: every send and every membership
//! change happens under the channel lock and is appended to every member's
//! event queue before the lock is released, so all members observe the same
//! sequence of events. Views are always primary components.
//!
//! This is the transport used by the test suite; it exercises the whole
//! library above the adapter with real concurrency but no network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex, OnceLock};

use tracing::{debug, trace};

use crate::types::Member;
use crate::{GcsError, GcsResult};

use super::{Announce, Backend, BackendEvent, Delivered, ViewEvent};

// ============================================================================
// Process-wide Hub
// ============================================================================

/// Registry of loopback channels, shared by all dummy backends in the
/// process.
struct Hub {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

fn hub() -> &'static Hub {
    static HUB: OnceLock<Hub> = OnceLock::new();
    HUB.get_or_init(|| Hub {
        channels: Mutex::new(HashMap::new()),
    })
}

/// Source of process-unique member tokens.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Channels
// ============================================================================

struct Channel {
    name: String,
    inner: Mutex<ChannelInner>,
}

struct ChannelInner {
    next_view_id: i64,
    slots: Vec<Slot>,
}

struct Slot {
    token: u64,
    id: String,
    announce: Arc<Announce>,
    tx: Sender<BackendEvent>,
}

impl Channel {
    /// Broadcasts the current membership to every member.
    ///
    /// Must be called with the channel lock held so the view lands in every
    /// queue at the same point of the total order.
    fn broadcast_view(&self, inner: &ChannelInner) {
        let members: Vec<Member> = inner
            .slots
            .iter()
            .map(|slot| {
                let (uuid, seqno) = slot.announce.get();
                Member {
                    id: slot.id.clone(),
                    uuid,
                    seqno,
                }
            })
            .collect();

        debug!(
            channel = %self.name,
            view_id = inner.next_view_id,
            memb_num = members.len(),
            "loopback view change"
        );

        for (idx, slot) in inner.slots.iter().enumerate() {
            let event = BackendEvent::View(ViewEvent {
                view_id: inner.next_view_id,
                is_primary: true,
                my_idx: idx,
                members: members.clone(),
            });
            // A member that left concurrently just misses the view.
            let _ = slot.tx.send(event);
        }
    }
}

// ============================================================================
// Dummy Backend
// ============================================================================

/// One member's handle on a loopback channel.
pub struct DummyBackend {
    channel: Arc<Channel>,
    token: u64,
    rx: Mutex<Receiver<BackendEvent>>,
    closed: AtomicBool,
}

impl DummyBackend {
    /// Joins `channel`, creating it if it does not exist yet.
    ///
    /// The join itself is the first view change the new member observes.
    pub fn join(channel: &str, member_id: String, announce: Arc<Announce>) -> Self {
        let channel = {
            let mut channels = hub().channels.lock().expect("hub lock poisoned");
            Arc::clone(channels.entry(channel.to_owned()).or_insert_with(|| {
                Arc::new(Channel {
                    name: channel.to_owned(),
                    inner: Mutex::new(ChannelInner {
                        next_view_id: 0,
                        slots: Vec::new(),
                    }),
                })
            }))
        };

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();

        {
            let mut inner = channel.inner.lock().expect("channel lock poisoned");
            inner.slots.push(Slot {
                token,
                id: member_id,
                announce,
                tx,
            });
            inner.next_view_id += 1;
            channel.broadcast_view(&inner);
        }

        Self {
            channel,
            token,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

impl Backend for DummyBackend {
    fn send_message(&self, bytes: Vec<u8>) -> GcsResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GcsError::Closed);
        }

        let inner = self.channel.inner.lock().expect("channel lock poisoned");
        let sender_idx = inner
            .slots
            .iter()
            .position(|slot| slot.token == self.token)
            .ok_or(GcsError::Closed)?;

        trace!(
            channel = %self.channel.name,
            sender_idx,
            len = bytes.len(),
            "loopback send"
        );

        for slot in &inner.slots {
            let _ = slot.tx.send(BackendEvent::Message(Delivered {
                sender_idx,
                bytes: bytes.clone(),
            }));
        }
        Ok(())
    }

    fn recv_event(&self) -> GcsResult<BackendEvent> {
        let rx = self.rx.lock().expect("receiver lock poisoned");
        // Queued events stay receivable after close until drained.
        rx.recv().map_err(|_| GcsError::Closed)
    }

    fn close(&self) -> GcsResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut inner = self.channel.inner.lock().expect("channel lock poisoned");
        if let Some(pos) = inner.slots.iter().position(|slot| slot.token == self.token) {
            inner.slots.remove(pos);
            inner.next_view_id += 1;
            if inner.slots.is_empty() {
                // Last member out removes the channel from the hub.
                let mut channels = hub().channels.lock().expect("hub lock poisoned");
                channels.remove(&self.channel.name);
            } else {
                self.channel.broadcast_view(&inner);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
