//! Core types of the action stream.
//!
//! This module defines the fundamental vocabulary used throughout the crate:
//! - [`Seqno`] - signed 64-bit sequence number with sentinel values
//! - [`GroupUuid`] - 16-byte identifier of a history line
//! - [`ActionType`] - classification of replicated and library-generated actions
//! - [`Action`] - a delivered action with its metadata
//! - [`ConfView`] - a configuration (membership) snapshot delivered in-band

use std::fmt::{Debug, Display};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// Length of a group UUID in bytes.
pub const UUID_LEN: usize = 16;

/// Maximum member identifier length, including the terminating NUL.
pub const MEMBER_NAME_MAX: usize = 40;

/// Default desired network packet size in bytes.
///
/// 43 ethernet frames, enough to carry a maximum-size IP packet. For best
/// results the configured value should be a multiple of the path MTU.
pub const DEFAULT_PKT_SIZE: usize = 64_500;

// ============================================================================
// Sequence Numbers
// ============================================================================

/// A sequence number in the group history.
///
/// Global seqnos are group-wide monotonic identifiers of ordered actions.
/// Local seqnos are per-node gapless counters over everything a node
/// delivers, usable by the application to serialize critical sections.
///
/// # Sentinels
///
/// - [`Seqno::ILLEGAL`] (−1): the action was not serialized
/// - [`Seqno::NIL`] (0): empty history, nothing applied
/// - [`Seqno::FIRST`] (1): the first position of a history
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Seqno(i64);

impl Seqno {
    /// Action not serialized; never appears on the wire.
    pub const ILLEGAL: Seqno = Seqno(-1);
    /// Empty history.
    pub const NIL: Seqno = Seqno(0);
    /// Start of the sequence.
    pub const FIRST: Seqno = Seqno(1);

    /// Creates a seqno from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the next seqno.
    pub fn next(&self) -> Self {
        Seqno(self.0.saturating_add(1))
    }

    /// Returns true for the [`Seqno::ILLEGAL`] sentinel.
    pub fn is_illegal(&self) -> bool {
        self.0 < 0
    }

    /// Returns true for the [`Seqno::NIL`] sentinel.
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Seqno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Seqno {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Seqno> for i64 {
    fn from(seqno: Seqno) -> Self {
        seqno.0
    }
}

// ============================================================================
// Group UUID
// ============================================================================

/// A 16-byte identifier tagging a history line.
///
/// Two nodes agree on `(uuid, seqno)` iff they share history up to `seqno`.
/// The nil uuid marks a node with no history at all.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct GroupUuid([u8; UUID_LEN]);

impl GroupUuid {
    /// The nil uuid: no history.
    pub const NIL: GroupUuid = GroupUuid([0; UUID_LEN]);

    /// Creates a uuid from raw bytes.
    pub fn from_bytes(bytes: [u8; UUID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the uuid as a byte array.
    pub fn as_bytes(&self) -> &[u8; UUID_LEN] {
        &self.0
    }

    /// Returns true for the nil uuid.
    pub fn is_nil(&self) -> bool {
        self.0 == [0; UUID_LEN]
    }

    /// Generates a fresh random uuid.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn generate() -> Self {
        let mut bytes = [0u8; UUID_LEN];
        getrandom::fill(&mut bytes).expect("CSPRNG failure is catastrophic");
        Self(bytes)
    }

    /// Derives a uuid deterministically from a channel name and a salt.
    ///
    /// All members of a freshly formed group must agree on the new group
    /// uuid without a round trip, so it is derived from data every member
    /// already shares.
    pub fn derive(channel: &str, salt: i64) -> Self {
        let digest = herd_util::fnv128a_seeded(
            &salt.to_be_bytes(),
            herd_util::fnv128a(channel.as_bytes()),
        );
        Self(digest.to_be_bytes())
    }
}

impl Debug for GroupUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GroupUuid({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl Display for GroupUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Action Types
// ============================================================================

/// Classification of an action.
///
/// The application can send only [`ActionType::Ordered`],
/// [`ActionType::CommitCut`] and [`ActionType::StateRequest`]; the remaining
/// types are generated by the library and delivered in-band.
///
/// `Ordered` and `CommitCut` actions are assigned global seqnos. A
/// `StateRequest` occupies a position in the totally ordered stream and
/// receives a local seqno on every node (the position the requester must
/// skip), but no global seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    /// A state change; will be assigned a global seqno.
    Ordered,
    /// Group-wide commit cut; enables log truncation downstream.
    CommitCut,
    /// Request for state transfer.
    StateRequest,
    /// New configuration, synthesized at each view boundary.
    Conf,
    /// State transfer status, broadcast by the donor.
    Join,
    /// Node declares itself synchronized with the group.
    Sync,
    /// Flow control pause/resume.
    Flow,
    /// Library-internal service traffic (last-applied announcements).
    Service,
    /// An error happened while receiving an action.
    Error,
    /// Undefined or unrecognized action type.
    Unknown,
}

impl ActionType {
    /// Returns true if actions of this type receive a global seqno.
    pub fn is_ordered(&self) -> bool {
        matches!(self, ActionType::Ordered | ActionType::CommitCut)
    }

    /// Returns true if the application is allowed to send this type.
    pub fn is_app_sendable(&self) -> bool {
        matches!(
            self,
            ActionType::Ordered | ActionType::CommitCut | ActionType::StateRequest
        )
    }

    /// Wire representation.
    pub fn as_u8(&self) -> u8 {
        match self {
            ActionType::Ordered => 0,
            ActionType::CommitCut => 1,
            ActionType::StateRequest => 2,
            ActionType::Conf => 3,
            ActionType::Join => 4,
            ActionType::Sync => 5,
            ActionType::Flow => 6,
            ActionType::Service => 7,
            ActionType::Error => 8,
            ActionType::Unknown => 9,
        }
    }

    /// Decodes the wire representation; anything unrecognized maps to
    /// [`ActionType::Unknown`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ActionType::Ordered,
            1 => ActionType::CommitCut,
            2 => ActionType::StateRequest,
            3 => ActionType::Conf,
            4 => ActionType::Join,
            5 => ActionType::Sync,
            6 => ActionType::Flow,
            7 => ActionType::Service,
            8 => ActionType::Error,
            _ => ActionType::Unknown,
        }
    }
}

impl Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionType::Ordered => "ordered",
            ActionType::CommitCut => "commit-cut",
            ActionType::StateRequest => "state-request",
            ActionType::Conf => "conf",
            ActionType::Join => "join",
            ActionType::Sync => "sync",
            ActionType::Flow => "flow",
            ActionType::Service => "service",
            ActionType::Error => "error",
            ActionType::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Delivered Action
// ============================================================================

/// A whole action as handed to the application.
///
/// The buffer is owned by the application from the moment `recv` returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Action classification.
    pub kind: ActionType,
    /// The reassembled payload.
    pub buf: Vec<u8>,
    /// Global seqno; [`Seqno::ILLEGAL`] for types without one.
    pub global_seqno: Seqno,
    /// Local seqno; gapless and strictly increasing per node.
    pub local_seqno: Seqno,
    /// Index of the sender in the configuration the action was delivered in.
    ///
    /// `None` for actions synthesized locally (configuration and error
    /// actions).
    pub sender_idx: Option<usize>,
}

impl Action {
    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }
}

// ============================================================================
// Members and Configuration Views
// ============================================================================

/// A group member together with its announced history position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Opaque member identifier, shorter than [`MEMBER_NAME_MAX`].
    pub id: String,
    /// The history line the member claims.
    pub uuid: GroupUuid,
    /// The last seqno of that history the member holds.
    pub seqno: Seqno,
}

/// A configuration snapshot, delivered to the application as the payload of
/// a [`ActionType::Conf`] action at every view boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfView {
    /// Last global seqno applied by this group (quorum-determined).
    pub seqno: Seqno,
    /// Configuration id; −1 for a non-primary component.
    pub conf_id: i64,
    /// Group uuid of the history line (quorum-determined).
    pub group_uuid: GroupUuid,
    /// True if this node has a seqno gap and must request state transfer.
    pub st_required: bool,
    /// Index of this node in `members`.
    pub my_idx: usize,
    /// Member identifiers in configuration order.
    pub members: Vec<String>,
}

impl ConfView {
    /// Returns true if the configuration is a primary component.
    pub fn is_primary(&self) -> bool {
        self.conf_id >= 0
    }

    /// Returns the number of members.
    pub fn memb_num(&self) -> usize {
        self.members.len()
    }

    /// Encodes the view into the configuration action payload.
    ///
    /// Layout: `seqno:i64 | conf_id:i64 | uuid:16B | st_required:u8 |
    /// memb_num:u32 | my_idx:u32` (big-endian) followed by `memb_num`
    /// NUL-terminated member identifiers.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(42 + self.members.len() * MEMBER_NAME_MAX);
        buf.put_i64(self.seqno.as_i64());
        buf.put_i64(self.conf_id);
        buf.put_slice(self.group_uuid.as_bytes());
        buf.put_u8(u8::from(self.st_required));
        buf.put_u32(self.members.len() as u32);
        buf.put_u32(self.my_idx as u32);
        for id in &self.members {
            if id.len() >= MEMBER_NAME_MAX || id.as_bytes().contains(&0) {
                return Err(WireError::BadMemberId { len: id.len() });
            }
            buf.put_slice(id.as_bytes());
            buf.put_u8(0);
        }
        Ok(buf)
    }

    /// Decodes a configuration action payload.
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        const FIXED: usize = 8 + 8 + UUID_LEN + 1 + 4 + 4;
        if buf.len() < FIXED {
            return Err(WireError::Truncated {
                have: buf.len(),
                need: FIXED,
            });
        }
        let seqno = Seqno::new(buf.get_i64());
        let conf_id = buf.get_i64();
        let mut uuid = [0u8; UUID_LEN];
        buf.copy_to_slice(&mut uuid);
        let st_required = buf.get_u8() != 0;
        let memb_num = buf.get_u32() as usize;
        let my_idx = buf.get_u32() as usize;

        let mut members = Vec::with_capacity(memb_num);
        for _ in 0..memb_num {
            let end = buf
                .iter()
                .position(|&b| b == 0)
                .ok_or(WireError::Truncated {
                    have: buf.len(),
                    need: buf.len() + 1,
                })?;
            if end >= MEMBER_NAME_MAX {
                return Err(WireError::BadMemberId { len: end });
            }
            let id = std::str::from_utf8(&buf[..end])
                .map_err(|_| WireError::BadMemberId { len: end })?
                .to_owned();
            members.push(id);
            buf.advance(end + 1);
        }

        Ok(Self {
            seqno,
            conf_id,
            group_uuid: GroupUuid::from_bytes(uuid),
            st_required,
            my_idx,
            members,
        })
    }
}
