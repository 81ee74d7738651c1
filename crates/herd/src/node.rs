//! Node lifecycle: configurations, state transfer, synchronization.
//!
//! A pure state machine driven by the delivery worker. Inputs are view
//! events from the backend and delivered join / sync / state-request
//! actions; outputs are configuration snapshots and state transitions. All
//! I/O (sending, enqueueing) stays with the caller, which keeps every
//! transition unit-testable without a transport.
//!
//! ```text
//! Open ──CONF(non-primary)──────────► NonPrimary
//! Open ──CONF(primary, no gap)──────► Joined ──SYNC(self)──► Synced
//! Open ──CONF(primary, seqno gap)───► Joiner ─┐
//!                                             │ STATE_REQ ordered,
//!                                             │ donor selected
//! Joined/Synced ──selected as donor─► Donor ──┤
//!                                             │ JOIN(status ≥ 0)
//!                                             └─────────────► Joined
//! any ──CONF(non-primary)───────────► NonPrimary
//! any ──close───────────────────────► Closed
//! ```
//!
//! At every view boundary the group uuid and seqno are decided by quorum:
//! members vote with their announced positions, the dominant non-nil uuid
//! wins (most holders, ties broken by highest seqno, then by uuid bytes),
//! and the group seqno is the highest seqno on the winning uuid. Members
//! whose position does not reach it must request state transfer. A fully
//! fresh group derives a new uuid from data every member shares.

use tracing::{debug, info, warn};

use crate::backend::ViewEvent;
use crate::types::{ActionType, ConfView, GroupUuid, Seqno};
use crate::{GcsError, GcsResult};

// ============================================================================
// States
// ============================================================================

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Connection exists but no channel is joined.
    Closed,
    /// Channel joined, first configuration not yet delivered.
    Open,
    /// Member of a non-primary component; ordering is impossible.
    NonPrimary,
    /// Member of a primary component with a history gap; must request
    /// state transfer before acting.
    Joiner,
    /// Serving a state transfer to a joiner.
    Donor,
    /// Full member with complete history.
    Joined,
    /// Full member, caught up with the group.
    Synced,
}

impl NodeState {
    /// Returns true if the node participates in a primary component.
    pub fn in_primary(&self) -> bool {
        matches!(
            self,
            NodeState::Joiner | NodeState::Donor | NodeState::Joined | NodeState::Synced
        )
    }
}

// ============================================================================
// Members
// ============================================================================

/// A configuration member with its quorum vote and the resulting verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Member identifier.
    pub id: String,
    /// Announced history uuid.
    pub uuid: GroupUuid,
    /// Announced history seqno.
    pub seqno: Seqno,
    /// True if this member's history does not reach the group seqno.
    pub st_required: bool,
}

/// A state transfer in progress somewhere in the group.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingTransfer {
    joiner: String,
    donor: String,
    donor_idx: usize,
}

// ============================================================================
// Node
// ============================================================================

/// The membership / state-transfer state machine of one connection.
#[derive(Debug)]
pub struct Node {
    my_id: String,
    channel: String,
    state: NodeState,

    /// History position this node actually holds.
    history_uuid: GroupUuid,
    history_seqno: Seqno,

    /// Current configuration.
    group_uuid: GroupUuid,
    conf_id: i64,
    members: Vec<MemberInfo>,
    my_idx: usize,
    st_required: bool,

    pending_st: Option<PendingTransfer>,
    sync_sent: bool,
}

impl Node {
    /// Creates the state machine at channel-join time, optionally seeded
    /// with a persisted history position.
    pub fn new(my_id: String, channel: String, uuid: GroupUuid, seqno: Seqno) -> Self {
        Self {
            my_id,
            channel,
            state: NodeState::Open,
            history_uuid: uuid,
            history_seqno: seqno,
            group_uuid: GroupUuid::NIL,
            conf_id: -1,
            members: Vec::new(),
            my_idx: 0,
            st_required: false,
            pending_st: None,
            sync_sent: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// This node's identifier.
    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    /// This node's index in the current configuration.
    pub fn my_idx(&self) -> usize {
        self.my_idx
    }

    /// The history position to announce to the group.
    pub fn announced_position(&self) -> (GroupUuid, Seqno) {
        (self.history_uuid, self.history_seqno)
    }

    /// Identifier of the member at `idx` in the current configuration.
    pub fn member_id(&self, idx: usize) -> Option<&str> {
        self.members.get(idx).map(|m| m.id.as_str())
    }

    /// Index of the member with identifier `id` in the current
    /// configuration.
    pub fn member_idx(&self, id: &str) -> Option<usize> {
        self.members.iter().position(|m| m.id == id)
    }

    /// Identifiers of the current members, in configuration order.
    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Returns true if the current configuration is a primary component.
    pub fn is_primary(&self) -> bool {
        self.conf_id >= 0
    }

    // ------------------------------------------------------------------
    // View handling
    // ------------------------------------------------------------------

    /// Applies a backend view event and returns the configuration snapshot
    /// to deliver to the application.
    pub fn handle_view(&mut self, view: &ViewEvent) -> ConfView {
        self.sync_sent = false;

        if !view.is_primary {
            info!(view_id = view.view_id, "entering non-primary component");
            self.state = NodeState::NonPrimary;
            self.conf_id = -1;
            self.st_required = false;
            self.my_idx = view.my_idx;
            self.members = view
                .members
                .iter()
                .map(|m| MemberInfo {
                    id: m.id.clone(),
                    uuid: m.uuid,
                    seqno: m.seqno,
                    st_required: false,
                })
                .collect();
            self.pending_st = None;
            return self.conf_view(self.history_seqno, self.history_uuid);
        }

        // Quorum: dominant non-nil uuid wins, group seqno is the highest
        // seqno on it.
        let (group_uuid, group_seqno) = match dominant_position(view) {
            Some(position) => position,
            None => {
                let uuid = GroupUuid::derive(&self.channel, view.view_id);
                info!(view_id = view.view_id, %uuid, "forming new group");
                (uuid, Seqno::NIL)
            }
        };

        self.group_uuid = group_uuid;
        self.conf_id = view.view_id;
        self.my_idx = view.my_idx;
        self.members = view
            .members
            .iter()
            .map(|m| MemberInfo {
                id: m.id.clone(),
                uuid: m.uuid,
                seqno: m.seqno,
                st_required: needs_state_transfer(m.uuid, m.seqno, group_uuid, group_seqno),
            })
            .collect();
        self.st_required = self.members[self.my_idx].st_required;

        // A transfer does not survive losing either of its parties.
        if let Some(st) = &self.pending_st {
            let joiner_here = self.members.iter().any(|m| m.id == st.joiner);
            let donor_here = self.members.iter().any(|m| m.id == st.donor);
            if !joiner_here || !donor_here {
                debug!(joiner = %st.joiner, donor = %st.donor, "state transfer lost to view change");
                self.pending_st = None;
            }
        }

        let donor_busy = self
            .pending_st
            .as_ref()
            .is_some_and(|st| st.donor == self.my_id);

        self.state = if self.st_required {
            NodeState::Joiner
        } else if donor_busy {
            NodeState::Donor
        } else if self.state == NodeState::Synced {
            NodeState::Synced
        } else {
            NodeState::Joined
        };

        if !self.st_required {
            self.history_uuid = group_uuid;
            self.history_seqno = group_seqno;
        }

        info!(
            conf_id = self.conf_id,
            memb_num = self.members.len(),
            my_idx = self.my_idx,
            st_required = self.st_required,
            state = ?self.state,
            "primary configuration"
        );

        self.conf_view(group_seqno, group_uuid)
    }

    fn conf_view(&self, seqno: Seqno, uuid: GroupUuid) -> ConfView {
        ConfView {
            seqno,
            conf_id: self.conf_id,
            group_uuid: uuid,
            st_required: self.st_required,
            my_idx: self.my_idx,
            members: self.member_ids(),
        }
    }

    // ------------------------------------------------------------------
    // Delivered coordination actions
    // ------------------------------------------------------------------

    /// Records delivery of an ordered action; the node's history advances
    /// with the group as long as it has no gap.
    pub fn on_ordered_delivered(&mut self, global: Seqno) {
        if !self.st_required {
            self.history_seqno = global;
        }
    }

    /// Handles an ordered state-transfer request from `sender_id`.
    ///
    /// Every member runs the same deterministic donor policy on the same
    /// stream: the first member in configuration order with full history
    /// that is not the requester, provided no transfer is already running.
    /// Returns the donor index, or −1 if no donor is available.
    pub fn handle_state_request(&mut self, sender_id: &str) -> i64 {
        if self.pending_st.is_some() {
            debug!(requester = sender_id, "state transfer already in progress");
            return -1;
        }

        let donor = self
            .members
            .iter()
            .enumerate()
            .find(|(_, m)| !m.st_required && m.id != sender_id);

        let Some((donor_idx, donor)) = donor else {
            debug!(requester = sender_id, "no suitable donor");
            return -1;
        };

        let donor_id = donor.id.clone();
        self.pending_st = Some(PendingTransfer {
            joiner: sender_id.to_owned(),
            donor: donor_id.clone(),
            donor_idx,
        });

        if donor_id == self.my_id {
            info!(joiner = sender_id, "selected as state transfer donor");
            self.state = NodeState::Donor;
        }

        donor_idx as i64
    }

    /// Handles a delivered join action: the donor's verdict on a finished
    /// state transfer.
    pub fn handle_join(&mut self, sender_id: &str, status: Seqno) {
        let Some(st) = self.pending_st.take() else {
            warn!(sender = sender_id, "join without a pending state transfer");
            return;
        };
        if st.donor != sender_id {
            warn!(sender = sender_id, donor = %st.donor, "join from non-donor ignored");
            self.pending_st = Some(st);
            return;
        }

        let success = !status.is_illegal();
        info!(joiner = %st.joiner, donor = %st.donor, %status, success, "state transfer finished");

        if success {
            if let Some(member) = self.members.iter_mut().find(|m| m.id == st.joiner) {
                member.st_required = false;
                member.uuid = self.group_uuid;
                member.seqno = status;
            }
            if st.joiner == self.my_id {
                self.state = NodeState::Joined;
                self.st_required = false;
                self.history_uuid = self.group_uuid;
                self.history_seqno = status;
                self.sync_sent = false;
            }
        }

        if st.donor == self.my_id {
            // Donor rejoins the flock whatever the outcome.
            self.state = NodeState::Joined;
            self.sync_sent = false;
        }
    }

    /// Handles a delivered sync action.
    pub fn handle_sync(&mut self, sender_id: &str) {
        if sender_id == self.my_id && self.state == NodeState::Joined {
            info!("synchronized with group");
            self.state = NodeState::Synced;
        }
    }

    /// Decides whether this node should announce itself synchronized.
    ///
    /// Called whenever the node may have just become Joined or its applier
    /// may have just caught up. Announces at most once per configuration.
    pub fn should_send_sync(&mut self, lag: u64, low_watermark: u64) -> bool {
        if self.state == NodeState::Joined && !self.sync_sent && lag <= low_watermark {
            self.sync_sent = true;
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Send gating
    // ------------------------------------------------------------------

    /// Checks whether the application may submit an action of `kind` in the
    /// current state.
    pub fn check_send(&self, kind: ActionType) -> GcsResult<()> {
        if !kind.is_app_sendable() {
            return Err(GcsError::SendType(kind));
        }
        match self.state {
            NodeState::Closed | NodeState::Open | NodeState::NonPrimary => {
                Err(GcsError::NotPrimary)
            }
            NodeState::Joiner => {
                // A joiner may only ask for state transfer.
                if kind == ActionType::StateRequest {
                    Ok(())
                } else {
                    Err(GcsError::NotPrimary)
                }
            }
            NodeState::Donor | NodeState::Joined | NodeState::Synced => Ok(()),
        }
    }
}

/// Decides whether a member's position requires state transfer to reach the
/// group position.
///
/// A member on the group's history line needs transfer iff it is behind. A
/// member with no history at all can adopt an empty history line for free,
/// but needs transfer as soon as the group has ordered anything. A member on
/// a foreign history line always needs transfer.
fn needs_state_transfer(
    uuid: GroupUuid,
    seqno: Seqno,
    group_uuid: GroupUuid,
    group_seqno: Seqno,
) -> bool {
    if uuid == group_uuid {
        seqno < group_seqno
    } else if uuid.is_nil() {
        !group_seqno.is_nil()
    } else {
        true
    }
}

/// Computes the dominant `(uuid, seqno)` of a view, or `None` when no
/// member has any history.
fn dominant_position(view: &ViewEvent) -> Option<(GroupUuid, Seqno)> {
    let mut candidates: Vec<(GroupUuid, usize, Seqno)> = Vec::new();
    for member in view.members.iter().filter(|m| !m.uuid.is_nil()) {
        match candidates.iter_mut().find(|(uuid, ..)| *uuid == member.uuid) {
            Some((_, count, max_seqno)) => {
                *count += 1;
                if member.seqno > *max_seqno {
                    *max_seqno = member.seqno;
                }
            }
            None => candidates.push((member.uuid, 1, member.seqno)),
        }
    }

    candidates
        .into_iter()
        .max_by(|(uuid_a, count_a, seqno_a), (uuid_b, count_b, seqno_b)| {
            (count_a, seqno_a, uuid_a.as_bytes()).cmp(&(count_b, seqno_b, uuid_b.as_bytes()))
        })
        .map(|(uuid, _, seqno)| (uuid, seqno))
}
