//! # herd: group communication client
//!
//! This crate implements a client library for a virtually synchronous group
//! communication backend. It joins a named channel and exposes to the host
//! application a stream of *actions*: arbitrarily large, totally ordered
//! units of replicated information, together with the membership-change and
//! state-transfer coordination events needed to run a replicated state
//! machine on top.
//!
//! ## Overview
//!
//! The transport delivers *messages*, elementary units bounded by the packet
//! size. The application deals only in *actions* of arbitrary size; the
//! library fragments them into messages on send and reassembles them on
//! receipt. The best analogy for the action/message split is word/letter.
//!
//! ```text
//! Application
//!     │ send / repl                              recv ▲
//!     ▼                                               │
//! ┌───────────┐   fragment   ┌─────────┐        ┌───────────┐
//! │ Connection│ ───────────► │ Backend │ ─────► │ RecvQueue │
//! └───────────┘              └────┬────┘        └───────────┘
//!                                 │ deliver (total order)     ▲
//!                                 ▼                           │
//!                    defragment → sequence → match ───────────┘
//!                                 │
//!                                 ▼
//!                      node state machine (views,
//!                      state transfer, flow control)
//! ```
//!
//! ## Key components
//!
//! - [`backend`]: uniform interface over the transport ([`backend::Backend`]);
//!   the `dummy` variant is an in-process loopback used for testing
//! - [`fragment`]: splitting and per-sender reassembly of actions
//! - [`sequencer`]: global (group-wide) and local (per-node gapless) seqnos
//! - [`repl`]: matching delivered actions against blocked replicators
//! - [`recv_queue`]: bounded handoff to the application's `recv` calls
//! - [`flow`]: pausing producers when an applier falls behind
//! - [`node`]: the membership / state-transfer state machine
//! - [`conn`]: the public connection facade
//!
//! ## Ordering guarantees
//!
//! 1. Any two ordered actions are observed in the same order with the same
//!    global seqnos on every member of the delivering primary component.
//! 2. Local seqnos are gapless and strictly increasing over all `recv`
//!    results and `repl` completions combined.
//! 3. Fragments of one action from one sender reassemble contiguously;
//!    reassembly never crosses a view boundary.
//! 4. Configuration actions are delivered at the exact boundary between two
//!    views, in order with the action stream.
//!
//! ## Example
//!
//! ```no_run
//! use herd::{ActionType, Connection};
//!
//! let conn = Connection::create("dummy://")?;
//! conn.open("my-channel")?;
//!
//! // Replicate: blocks until our own action comes back ordered.
//! let (global, local) = conn.repl(b"hello".to_vec(), ActionType::Ordered)?;
//! assert!(global.as_i64() >= 1 && local.as_i64() >= 1);
//!
//! conn.close()?;
//! # Ok::<(), herd::GcsError>(())
//! ```

pub mod backend;
pub mod config;
pub mod conn;
pub mod flow;
pub mod fragment;
pub mod node;
pub mod recv_queue;
pub mod repl;
pub mod sequencer;
pub mod types;
pub mod wire;

pub use config::{BackendUrl, ConnectionConfig};
pub use conn::Connection;
pub use node::NodeState;
pub use types::{
    Action, ActionType, ConfView, GroupUuid, Member, Seqno, DEFAULT_PKT_SIZE, MEMBER_NAME_MAX,
    UUID_LEN,
};
pub use wire::WireError;

// ============================================================================
// Error Types
// ============================================================================

/// POSIX-style error numbers used by [`GcsError::errno`].
mod errno {
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EPROTO: i32 = 71;
    pub const EBADFD: i32 = 77;
    pub const EPROTONOSUPPORT: i32 = 93;
    pub const ECONNABORTED: i32 = 103;
    pub const ECONNRESET: i32 = 104;
    pub const ENOTCONN: i32 = 107;
}

/// Errors surfaced by the connection API.
///
/// The taxonomy follows the classic split: transient errors are retryable
/// without side effects, state errors indicate a wrong lifecycle state,
/// view-change errors mean the action was lost to a reconfiguration and may
/// be resubmitted after the next primary configuration.
#[derive(Debug, thiserror::Error)]
pub enum GcsError {
    /// No suitable peer right now; retry later.
    #[error("temporarily unavailable, retry later")]
    Again,

    /// The call is not valid while the connection is open.
    #[error("connection is open")]
    Busy,

    /// The connection was never opened.
    #[error("connection is not open")]
    BadFd,

    /// The connection has been closed; for `recv` this is end-of-stream.
    #[error("connection closed")]
    Closed,

    /// The node is not part of a primary component; ordering is impossible.
    #[error("not in a primary component")]
    NotPrimary,

    /// The action was lost to a view change before it could be ordered.
    #[error("action not ordered: lost to a view change")]
    NotOrdered,

    /// The backend URL could not be parsed.
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),

    /// The backend type is recognized but not compiled in.
    #[error("backend type not supported: {0}")]
    UnsupportedBackend(String),

    /// The requested packet size cannot fit a fragment header plus payload.
    #[error("invalid packet size {requested} (minimum {min})")]
    InvalidPacketSize { requested: usize, min: usize },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The application tried to send a library-generated action type.
    #[error("action type {0:?} cannot be sent by the application")]
    SendType(ActionType),

    /// A message failed to encode or decode.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The transport failed unrecoverably.
    #[error("backend error: {0}")]
    Backend(String),
}

impl GcsError {
    /// Maps the error onto a negative POSIX-style error number, for
    /// embedders exposing a C-flavoured surface.
    pub fn errno(&self) -> i32 {
        match self {
            GcsError::Again => -errno::EAGAIN,
            GcsError::Busy => -errno::EBUSY,
            GcsError::BadFd => -errno::EBADFD,
            GcsError::Closed => -errno::ECONNABORTED,
            GcsError::NotPrimary => -errno::ENOTCONN,
            GcsError::NotOrdered => -errno::ECONNRESET,
            GcsError::InvalidUrl(_)
            | GcsError::InvalidPacketSize { .. }
            | GcsError::InvalidConfig(_)
            | GcsError::SendType(_) => -errno::EINVAL,
            GcsError::UnsupportedBackend(_) => -errno::EPROTONOSUPPORT,
            GcsError::Wire(_) => -errno::EPROTO,
            GcsError::Backend(_) => -errno::EIO,
        }
    }

    /// Returns true if the caller may retry the same call later.
    pub fn is_transient(&self) -> bool {
        matches!(self, GcsError::Again)
    }
}

/// Result type for connection operations.
pub type GcsResult<T> = Result<T, GcsError>;
