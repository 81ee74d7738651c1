//! Global and local sequence number assignment.
//!
//! Global seqnos advance by one for every ordered action delivered in a
//! primary component; they are assigned by the delivery worker from the
//! totally ordered stream, so every member computes identical values without
//! coordination. Local seqnos advance by one for every action handed to the
//! application layer, with no gaps across view changes; they are drawn in
//! hand-off order by `recv` returns and `repl` completions, which is why
//! many threads assign them and the counters are atomic.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::types::Seqno;

/// Seqno state of one connection.
#[derive(Debug)]
pub struct Sequencer {
    global: AtomicI64,
    local: AtomicI64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// Creates a sequencer at the empty history position.
    pub fn new() -> Self {
        Self {
            global: AtomicI64::new(Seqno::NIL.as_i64()),
            local: AtomicI64::new(Seqno::NIL.as_i64()),
        }
    }

    /// Rebases the global counter onto the quorum-determined group seqno.
    ///
    /// Called at every primary configuration; the local counter is never
    /// rebased.
    pub fn reset_global(&self, seqno: Seqno) {
        self.global.store(seqno.as_i64(), Ordering::Release);
    }

    /// Assigns the next global seqno.
    pub fn next_global(&self) -> Seqno {
        Seqno::new(self.global.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Assigns the next local seqno.
    pub fn next_local(&self) -> Seqno {
        Seqno::new(self.local.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// The last assigned global seqno.
    pub fn global(&self) -> Seqno {
        Seqno::new(self.global.load(Ordering::Acquire))
    }

    /// The last assigned local seqno.
    pub fn local(&self) -> Seqno {
        Seqno::new(self.local.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_nil() {
        let seq = Sequencer::new();
        assert_eq!(seq.global(), Seqno::NIL);
        assert_eq!(seq.local(), Seqno::NIL);
    }

    #[test]
    fn first_assignments_are_first() {
        let seq = Sequencer::new();
        assert_eq!(seq.next_global(), Seqno::FIRST);
        assert_eq!(seq.next_local(), Seqno::FIRST);
        assert_eq!(seq.next_local(), Seqno::new(2));
    }

    #[test]
    fn reset_rebases_global_only() {
        let seq = Sequencer::new();
        seq.next_local();
        seq.reset_global(Seqno::new(5));

        assert_eq!(seq.next_global(), Seqno::new(6));
        // Local continues gaplessly.
        assert_eq!(seq.next_local(), Seqno::new(2));
    }
}
