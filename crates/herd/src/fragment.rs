//! Fragmentation of outbound actions and per-sender reassembly of inbound
//! messages.
//!
//! An action of arbitrary size is split into `ceil(size / budget)` messages
//! (at least one, so zero-length actions still travel), where the budget is
//! the packet size minus the fragment header. The transport orders whole
//! messages, and one sender's fragments are submitted back-to-back, so a
//! receiver always sees each sender's fragments contiguously *per sender*;
//! fragments of different senders may interleave and are kept apart by the
//! per-sender reassembly table.
//!
//! Reassembly never crosses a view boundary: partials from senders that are
//! not in the new view are discarded by [`Defragmenter::drop_missing`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::types::ActionType;
use crate::wire::{FragmentHeader, WireError, FRAG_HEADER_SIZE};

// ============================================================================
// Fragmenter
// ============================================================================

/// Splits outbound actions into wire messages.
///
/// Also the allocator of sender-local action ids; ids are unique and
/// monotonic for the lifetime of a connection.
#[derive(Debug, Default)]
pub struct Fragmenter {
    next_id: AtomicU64,
}

impl Fragmenter {
    /// Creates a fragmenter with ids starting at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates the next action id.
    pub fn next_action_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Splits `buf` into encoded messages of at most `pkt_size` bytes.
    ///
    /// # Panics
    ///
    /// Debug-panics if `pkt_size` leaves no payload room; the connection
    /// validates packet sizes before they reach this point.
    pub fn split(&self, action_id: u64, kind: ActionType, buf: &[u8], pkt_size: usize) -> Vec<Vec<u8>> {
        debug_assert!(pkt_size > FRAG_HEADER_SIZE, "packet size below header overhead");
        let budget = pkt_size - FRAG_HEADER_SIZE;

        let frag_count = buf.len().div_ceil(budget).max(1) as u32;
        let mut messages = Vec::with_capacity(frag_count as usize);

        for (frag_index, chunk) in split_chunks(buf, budget, frag_count).enumerate() {
            let header = FragmentHeader {
                action_id,
                frag_index: frag_index as u32,
                frag_count,
                total_size: buf.len() as u64,
                kind,
            };
            messages.push(header.encode(chunk));
        }

        debug_assert_eq!(messages.len(), frag_count as usize);
        messages
    }
}

/// Chunks `buf` into `frag_count` pieces of at most `budget` bytes; yields a
/// single empty chunk for an empty buffer.
fn split_chunks(buf: &[u8], budget: usize, frag_count: u32) -> impl Iterator<Item = &[u8]> {
    (0..frag_count as usize).map(move |i| {
        let start = i * budget;
        let end = ((i + 1) * budget).min(buf.len());
        &buf[start..end]
    })
}

// ============================================================================
// Defragmenter
// ============================================================================

/// A whole action reassembled from one sender's fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WholeAction {
    /// Identifier of the sending member.
    pub sender: String,
    /// The sender-local action id.
    pub action_id: u64,
    /// Action classification.
    pub kind: ActionType,
    /// The reassembled payload.
    pub buf: Vec<u8>,
}

/// An in-progress action of one sender.
#[derive(Debug)]
struct Partial {
    action_id: u64,
    kind: ActionType,
    total_size: u64,
    frag_count: u32,
    next_index: u32,
    buf: Vec<u8>,
}

/// Per-sender reassembly of inbound fragments.
///
/// Touched only by the delivery worker, so it needs no locking.
#[derive(Debug, Default)]
pub struct Defragmenter {
    partials: HashMap<String, Partial>,
}

impl Defragmenter {
    /// Creates an empty reassembly table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one delivered message; returns a whole action once the last
    /// fragment of it has arrived.
    pub fn push(&mut self, sender: &str, bytes: &[u8]) -> Result<Option<WholeAction>, WireError> {
        let (header, payload) = FragmentHeader::decode(bytes)?;

        if header.frag_index == 0 {
            if let Some(stale) = self.partials.remove(sender) {
                // The transport is ordered, so a new first fragment means the
                // previous action of this sender can never complete.
                warn!(
                    sender,
                    stale_action_id = stale.action_id,
                    "discarding incomplete action"
                );
            }
            let mut partial = Partial {
                action_id: header.action_id,
                kind: header.kind,
                total_size: header.total_size,
                frag_count: header.frag_count,
                next_index: 1,
                buf: Vec::with_capacity(header.total_size as usize),
            };
            partial.buf.extend_from_slice(payload);
            return Ok(self.try_complete(sender, partial));
        }

        let Some(mut partial) = self.partials.remove(sender) else {
            // First fragments were lost to a view change; nothing to attach to.
            warn!(sender, action_id = header.action_id, "orphan fragment dropped");
            return Ok(None);
        };

        if partial.action_id != header.action_id || partial.next_index != header.frag_index {
            warn!(
                sender,
                expected_id = partial.action_id,
                got_id = header.action_id,
                expected_index = partial.next_index,
                got_index = header.frag_index,
                "fragment sequence broken, discarding"
            );
            return Ok(None);
        }

        partial.buf.extend_from_slice(payload);
        partial.next_index += 1;
        Ok(self.try_complete(sender, partial))
    }

    fn try_complete(&mut self, sender: &str, partial: Partial) -> Option<WholeAction> {
        if partial.next_index < partial.frag_count {
            self.partials.insert(sender.to_owned(), partial);
            return None;
        }

        debug_assert_eq!(
            partial.buf.len() as u64,
            partial.total_size,
            "reassembled size mismatch"
        );

        Some(WholeAction {
            sender: sender.to_owned(),
            action_id: partial.action_id,
            kind: partial.kind,
            buf: partial.buf,
        })
    }

    /// Discards partials whose sender is not in the new view.
    ///
    /// Returns the dropped `(sender, action_id)` pairs so the caller can
    /// fail any local waiter whose action just became undeliverable.
    pub fn drop_missing(&mut self, current_members: &[String]) -> Vec<(String, u64)> {
        let mut dropped = Vec::new();
        self.partials.retain(|sender, partial| {
            if current_members.iter().any(|m| m == sender) {
                true
            } else {
                dropped.push((sender.clone(), partial.action_id));
                false
            }
        });
        dropped
    }

    /// Number of in-progress actions.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
