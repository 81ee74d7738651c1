//! The public connection facade and its delivery worker.
//!
//! A [`Connection`] is created closed, optionally seeded with a persisted
//! history position, and opened onto a channel. Opening spawns the delivery
//! worker: a dedicated thread that reads backend events, reassembles
//! fragments, assigns global seqnos, matches self-deliveries against
//! blocked replicators and feeds everything else to the receive queue.
//!
//! ```text
//! app threads                    delivery worker
//! ───────────                    ───────────────
//! repl ──register waiter──┐      recv_event
//!      ──fragment, send──►│         │ defragment
//!      ──block────────────┤         │ seqno / view handling
//!                         │◄──wake──┤ match own action
//! recv ◄──────────────────┴─────────┤ enqueue remote action
//! ```
//!
//! Local seqnos are drawn at hand-off, so the merged sequence the
//! application observes is gapless from 1: `recv` stamps under the consumer
//! lock as it pops, and `repl` completions are stamped by the delivery
//! worker at match time, which keeps them in delivery order however the
//! scheduler wakes the blocked callers.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{self, Announce, Backend, BackendEvent, ViewEvent};
use crate::config::{validate_pkt_size, BackendUrl, ConnectionConfig};
use crate::flow::FlowController;
use crate::fragment::{Defragmenter, Fragmenter, WholeAction};
use crate::node::{Node, NodeState};
use crate::recv_queue::RecvQueue;
use crate::repl::{FailKind, ReplDone, ReplMonitor};
use crate::sequencer::Sequencer;
use crate::types::{Action, ActionType, GroupUuid, Seqno};
use crate::wire;
use crate::{GcsError, GcsResult};

// ============================================================================
// Connection
// ============================================================================

/// A connection handle to a group communication channel.
///
/// All methods take `&self`; the handle can be shared across threads.
/// Dropping the handle closes it.
pub struct Connection {
    url: BackendUrl,
    config: ConnectionConfig,
    pkt_size: Arc<AtomicUsize>,
    /// Seeded or preserved history position, applied at the next `open`.
    seed: Mutex<(GroupUuid, Seqno)>,
    core: Mutex<Option<Arc<Core>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    was_open: AtomicBool,
}

impl Connection {
    /// Creates a closed connection for the backend named by `url`
    /// (`type://address`).
    pub fn create(url: &str) -> GcsResult<Self> {
        Self::create_with_config(url, ConnectionConfig::default())
    }

    /// Creates a closed connection with explicit tunables.
    pub fn create_with_config(url: &str, config: ConnectionConfig) -> GcsResult<Self> {
        let url: BackendUrl = url.parse()?;
        config.validate()?;
        let pkt_size = Arc::new(AtomicUsize::new(config.pkt_size));
        Ok(Self {
            url,
            config,
            pkt_size,
            seed: Mutex::new((GroupUuid::NIL, Seqno::NIL)),
            core: Mutex::new(None),
            worker: Mutex::new(None),
            was_open: AtomicBool::new(false),
        })
    }

    /// Seeds the history position (e.g. recovered from persistent storage).
    ///
    /// The values are a hint for the group; the actual position is decided
    /// by quorum and returned in the first configuration action. Valid only
    /// while the connection is closed.
    pub fn init(&self, seqno: Seqno, uuid: GroupUuid) -> GcsResult<()> {
        if self.core.lock().expect("core lock poisoned").is_some() {
            return Err(GcsError::Busy);
        }
        *self.seed.lock().expect("seed lock poisoned") = (uuid, seqno);
        Ok(())
    }

    /// Joins `channel` and starts the delivery worker. Opening an already
    /// open connection is a no-op.
    pub fn open(&self, channel: &str) -> GcsResult<()> {
        let mut slot = self.core.lock().expect("core lock poisoned");
        if slot.is_some() {
            return Ok(());
        }

        validate_pkt_size(self.pkt_size.load(Ordering::Acquire))?;
        let (uuid, seqno) = *self.seed.lock().expect("seed lock poisoned");
        let member_id = generate_member_id();

        let announce = Arc::new(Announce::new(uuid, seqno));
        let backend: Arc<dyn Backend> = Arc::from(backend::connect(
            &self.url,
            channel,
            member_id.clone(),
            Arc::clone(&announce),
        )?);

        let core = Arc::new(Core {
            backend,
            node: Mutex::new(Node::new(
                member_id.clone(),
                channel.to_owned(),
                uuid,
                seqno,
            )),
            seq: Sequencer::new(),
            monitor: ReplMonitor::new(),
            queue: RecvQueue::new(self.config.recv_queue_depth),
            flow: FlowController::new(
                member_id.clone(),
                self.config.fc_low_watermark,
                self.config.fc_high_watermark,
            ),
            frag: Fragmenter::new(),
            announce,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
            state_cond: Condvar::new(),
            pkt_size: Arc::clone(&self.pkt_size),
            low_watermark: self.config.fc_low_watermark,
        });

        let handle = thread::Builder::new()
            .name("herd-delivery".into())
            .spawn({
                let core = Arc::clone(&core);
                move || run_worker(&core)
            })
            .map_err(|e| GcsError::Backend(e.to_string()))?;

        // Open blocks until the backend confirms the transition: the first
        // view must be in before send gating means anything.
        {
            let mut node = core.node();
            while node.state() == NodeState::Open {
                let (guard, timeout) = core
                    .state_cond
                    .wait_timeout(node, Duration::from_secs(5))
                    .expect("node lock poisoned");
                node = guard;
                if timeout.timed_out() {
                    warn!("no configuration from backend yet");
                    break;
                }
            }
        }

        info!(
            channel,
            member_id = %member_id,
            backend = core.backend.name(),
            self_tstamp = self.config.self_tstamp,
            debug = self.config.debug,
            "connection opened"
        );

        *self.worker.lock().expect("worker lock poisoned") = Some(handle);
        *slot = Some(core);
        self.was_open.store(true, Ordering::Release);
        Ok(())
    }

    /// Leaves the channel.
    ///
    /// Cancels every outstanding `repl` with [`GcsError::Closed`], lets
    /// `recv` drain queued actions and then report end-of-stream, and stops
    /// the delivery worker. Closing a closed connection is a no-op.
    pub fn close(&self) -> GcsResult<()> {
        let core = self.core.lock().expect("core lock poisoned").take();
        let Some(core) = core else {
            return Ok(());
        };

        core.monitor.fail_all(FailKind::Closed);
        core.queue.close();
        let _ = core.backend.close();

        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }

        // Preserve the reached position so a later open announces it.
        *self.seed.lock().expect("seed lock poisoned") = core.announce.get();
        info!("connection closed");
        Ok(())
    }

    /// Sends an action without waiting for its delivery.
    ///
    /// The buffer is owned by the library from this point; the action will
    /// come back through `recv` once ordered. Returns the action size.
    pub fn send(&self, buf: Vec<u8>, kind: ActionType) -> GcsResult<usize> {
        let core = self.core()?;
        core.node().check_send(kind)?;

        let size = buf.len();
        let action_id = core.frag.next_action_id();
        core.transmit(action_id, kind, &buf)?;
        Ok(size)
    }

    /// Replicates an action: sends it and blocks until it comes back through
    /// the totally ordered stream.
    ///
    /// On success returns the assigned `(global, local)` seqnos; the action
    /// is not additionally delivered through `recv`.
    pub fn repl(&self, buf: Vec<u8>, kind: ActionType) -> GcsResult<(Seqno, Seqno)> {
        let core = self.core()?;
        core.node().check_send(kind)?;

        let action_id = core.frag.next_action_id();
        let waiter = core.monitor.register(action_id);
        if let Err(err) = core.transmit(action_id, kind, &buf) {
            core.monitor.remove(action_id);
            return Err(err);
        }

        match waiter.wait() {
            Ok(done) => Ok((done.global, done.local)),
            Err(kind) => Err(kind.into()),
        }
    }

    /// Receives the next action, blocking while none is available.
    ///
    /// The returned buffer is owned by the caller. After `close`, queued
    /// actions drain first and then every call reports [`GcsError::Closed`].
    pub fn recv(&self) -> GcsResult<Action> {
        let core = self.core()?;
        // Hand-off order defines local seqno order, so pop and stamp under
        // one consumer lock.
        let _guard = core.recv_lock.lock().expect("recv lock poisoned");
        let mut action = core.queue.pop()?;
        action.local_seqno = core.seq.next_local();
        Ok(action)
    }

    /// Broadcasts a state transfer request.
    ///
    /// Blocks until the request has been ordered. Returns the selected donor
    /// index and the local seqno at which the request was ordered; the
    /// caller must skip that position in its applier and resume at the next
    /// one once the transfer completes. Returns [`GcsError::Again`] when no
    /// donor is currently suitable.
    pub fn request_state_transfer(&self, req: Vec<u8>) -> GcsResult<(usize, Seqno)> {
        let core = self.core()?;
        core.node().check_send(ActionType::StateRequest)?;

        let action_id = core.frag.next_action_id();
        let waiter = core.monitor.register(action_id);
        if let Err(err) = core.transmit(action_id, ActionType::StateRequest, &req) {
            core.monitor.remove(action_id);
            return Err(err);
        }

        match waiter.wait() {
            Ok(done) => match done.donor_idx {
                Some(idx) if idx >= 0 => Ok((idx as usize, done.local)),
                _ => Err(GcsError::Again),
            },
            Err(kind) => Err(kind.into()),
        }
    }

    /// Announces the outcome of a state transfer on behalf of the donor.
    ///
    /// A non-negative `status` is the seqno of the transferred state and
    /// completes the joiner; a negative status leaves it a joiner.
    pub fn join(&self, status: Seqno) -> GcsResult<()> {
        let core = self.core()?;
        if !core.node().state().in_primary() {
            return Err(GcsError::NotPrimary);
        }
        let action_id = core.frag.next_action_id();
        core.transmit(action_id, ActionType::Join, &wire::encode_seqno(status))
    }

    /// The flow control predicate: returns true when some member currently
    /// pauses the group and new work should be deferred. Never blocks.
    pub fn wait(&self) -> GcsResult<bool> {
        Ok(self.core()?.flow.anyone_paused())
    }

    /// Returns the local seqno every effect visible to this caller is
    /// ordered before. Bound to this connection handle.
    pub fn caused(&self) -> GcsResult<Seqno> {
        Ok(self.core()?.seq.local())
    }

    /// Reports applier progress, feeding flow control and the group-wide
    /// commit cut.
    pub fn set_last_applied(&self, seqno: Seqno) -> GcsResult<()> {
        let core = self.core()?;

        if let Some(pause) = core.flow.on_applied(seqno) {
            let action_id = core.frag.next_action_id();
            core.transmit(action_id, ActionType::Flow, &wire::encode_flow(pause))?;
        }

        let action_id = core.frag.next_action_id();
        core.transmit(action_id, ActionType::Service, &wire::encode_seqno(seqno))?;

        core.maybe_send_sync();
        Ok(())
    }

    /// Changes the desired packet size; takes effect for subsequent sends.
    pub fn set_pkt_size(&self, pkt_size: usize) -> GcsResult<()> {
        validate_pkt_size(pkt_size)?;
        self.pkt_size.store(pkt_size, Ordering::Release);
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        match self.core() {
            Ok(core) => core.node().state(),
            Err(_) => NodeState::Closed,
        }
    }

    fn core(&self) -> GcsResult<Arc<Core>> {
        match &*self.core.lock().expect("core lock poisoned") {
            Some(core) => Ok(Arc::clone(core)),
            None if self.was_open.load(Ordering::Acquire) => Err(GcsError::Closed),
            None => Err(GcsError::BadFd),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}

fn generate_member_id() -> String {
    let mut bytes = [0u8; 6];
    getrandom::fill(&mut bytes).expect("CSPRNG failure is catastrophic");
    bytes.iter().fold(String::with_capacity(12), |mut id, b| {
        let _ = write!(id, "{b:02x}");
        id
    })
}

// ============================================================================
// Core (shared with the delivery worker)
// ============================================================================

struct Core {
    backend: Arc<dyn Backend>,
    node: Mutex<Node>,
    seq: Sequencer,
    monitor: ReplMonitor,
    queue: RecvQueue,
    flow: FlowController,
    frag: Fragmenter,
    announce: Arc<Announce>,
    /// Serializes senders so the fragments of one action reach the backend
    /// back-to-back.
    send_lock: Mutex<()>,
    /// Serializes consumers so local seqno stamping matches pop order.
    recv_lock: Mutex<()>,
    /// Signals node state changes, paired with the `node` lock; `open`
    /// waits on it for the first configuration.
    state_cond: Condvar,
    pkt_size: Arc<AtomicUsize>,
    low_watermark: u64,
}

impl Core {
    fn node(&self) -> MutexGuard<'_, Node> {
        self.node.lock().expect("node lock poisoned")
    }

    /// Fragments and submits one action under the send lock.
    fn transmit(&self, action_id: u64, kind: ActionType, buf: &[u8]) -> GcsResult<()> {
        let pkt_size = self.pkt_size.load(Ordering::Acquire);
        let messages = self.frag.split(action_id, kind, buf, pkt_size);

        let _guard = self.send_lock.lock().expect("send lock poisoned");
        for message in messages {
            self.backend.send_message(message)?;
        }
        Ok(())
    }

    /// Transmit for library-generated traffic, where there is no caller to
    /// report an error to.
    fn send_library(&self, kind: ActionType, buf: &[u8]) {
        let action_id = self.frag.next_action_id();
        if let Err(err) = self.transmit(action_id, kind, buf) {
            warn!(%kind, %err, "library action send failed");
        }
    }

    fn update_announce(&self) {
        let (uuid, seqno) = self.node().announced_position();
        self.announce.set(uuid, seqno);
    }

    /// Announces synchronization once the node is joined and caught up.
    fn maybe_send_sync(&self) {
        let lag = self.flow.current_lag();
        let should = self.node().should_send_sync(lag, self.low_watermark);
        if should {
            self.send_library(ActionType::Sync, &[]);
        }
    }
}

// ============================================================================
// Delivery Worker
// ============================================================================

fn run_worker(core: &Core) {
    let mut defrag = Defragmenter::new();
    debug!("delivery worker started");

    loop {
        match core.backend.recv_event() {
            Ok(BackendEvent::View(view)) => {
                if on_view(core, &mut defrag, &view).is_err() {
                    break;
                }
            }
            Ok(BackendEvent::Message(message)) => {
                let sender = core
                    .node()
                    .member_id(message.sender_idx)
                    .map(str::to_owned);
                let Some(sender) = sender else {
                    warn!(sender_idx = message.sender_idx, "message from unknown member");
                    continue;
                };
                match defrag.push(&sender, &message.bytes) {
                    Ok(Some(whole)) => {
                        if on_whole(core, whole).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(sender = %sender, %err, "undecodable message dropped"),
                }
            }
            Err(GcsError::Closed) => break,
            Err(err) => {
                // Unrecoverable transport failure: surface an error action,
                // then shut the stream down.
                warn!(%err, "transport failure, stopping delivery");
                let _ = core.queue.push(Action {
                    kind: ActionType::Error,
                    buf: err.to_string().into_bytes(),
                    global_seqno: Seqno::ILLEGAL,
                    local_seqno: Seqno::ILLEGAL,
                    sender_idx: None,
                });
                break;
            }
        }
    }

    core.queue.close();
    core.monitor.fail_all(FailKind::Closed);
    debug!("delivery worker stopped");
}

/// Handles a view change: quorum, reassembly cleanup, waiter failures, flow
/// re-announcement and the in-band configuration action.
fn on_view(core: &Core, defrag: &mut Defragmenter, view: &ViewEvent) -> GcsResult<()> {
    let (conf, my_id) = {
        let mut node = core.node();
        let conf = node.handle_view(view);
        (conf, node.my_id().to_owned())
    };
    core.state_cond.notify_all();

    // Reassembly never crosses a view boundary: partials of lost senders are
    // gone, and if one of them was ours, its replicator must learn that the
    // action will never be ordered.
    for (sender, action_id) in defrag.drop_missing(&conf.members) {
        if sender == my_id {
            core.monitor.fail(action_id, FailKind::NotOrdered);
        }
    }

    if conf.is_primary() {
        core.seq.reset_global(conf.seqno);
    } else {
        // No ordering is possible any more; nothing in flight can complete.
        core.monitor.fail_all(FailKind::NotOrdered);
    }

    core.update_announce();

    // Flow pause state does not survive a reconfiguration; a paused node
    // must speak up again.
    if let Some(pause) = core.flow.on_conf(&conf.members) {
        core.send_library(ActionType::Flow, &wire::encode_flow(pause));
    }

    core.maybe_send_sync();

    let buf = match conf.encode() {
        Ok(buf) => buf,
        Err(err) => {
            warn!(%err, "configuration action encoding failed");
            return Ok(());
        }
    };
    core.queue.push(Action {
        kind: ActionType::Conf,
        buf,
        global_seqno: Seqno::ILLEGAL,
        local_seqno: Seqno::ILLEGAL,
        sender_idx: None,
    })
}

/// Routes one reassembled action.
fn on_whole(core: &Core, whole: WholeAction) -> GcsResult<()> {
    let (is_self, sender_idx) = {
        let node = core.node();
        (whole.sender == node.my_id(), node.member_idx(&whole.sender))
    };

    match whole.kind {
        ActionType::Flow => {
            match wire::decode_flow(&whole.buf) {
                Ok(pause) => core.flow.on_flow(&whole.sender, pause),
                Err(err) => warn!(sender = %whole.sender, %err, "bad flow action"),
            }
            Ok(())
        }

        ActionType::Service => {
            match wire::decode_seqno(&whole.buf) {
                Ok(applied) => {
                    if let Some(cut) = core.flow.record_applied(&whole.sender, applied) {
                        // One deterministic broadcaster is enough: the member
                        // at configuration index zero announces the cut.
                        if core.node().my_idx() == 0 {
                            core.send_library(ActionType::CommitCut, &wire::encode_seqno(cut));
                        }
                    }
                }
                Err(err) => warn!(sender = %whole.sender, %err, "bad service action"),
            }
            Ok(())
        }

        ActionType::Sync => {
            core.node().handle_sync(&whole.sender);
            core.queue.push(Action {
                kind: ActionType::Sync,
                buf: whole.buf,
                global_seqno: Seqno::ILLEGAL,
                local_seqno: Seqno::ILLEGAL,
                sender_idx,
            })
        }

        ActionType::Join => {
            match wire::decode_seqno(&whole.buf) {
                Ok(status) => {
                    core.node().handle_join(&whole.sender, status);
                    core.update_announce();
                    core.maybe_send_sync();
                }
                Err(err) => warn!(sender = %whole.sender, %err, "bad join action"),
            }
            core.queue.push(Action {
                kind: ActionType::Join,
                buf: whole.buf,
                global_seqno: Seqno::ILLEGAL,
                local_seqno: Seqno::ILLEGAL,
                sender_idx,
            })
        }

        ActionType::StateRequest => {
            let donor_idx = core.node().handle_state_request(&whole.sender);
            if is_self {
                // The requester gets the verdict through its blocked call
                // and must skip this position locally. A request that found
                // no donor hands the caller no position, so it draws none.
                core.monitor.complete_with(whole.action_id, || {
                    let local = if donor_idx >= 0 {
                        core.seq.next_local()
                    } else {
                        Seqno::ILLEGAL
                    };
                    ReplDone {
                        global: Seqno::ILLEGAL,
                        local,
                        donor_idx: Some(donor_idx),
                    }
                });
                Ok(())
            } else {
                // Everyone else sees the request in-band; the donor's
                // application acts on it.
                core.queue.push(Action {
                    kind: ActionType::StateRequest,
                    buf: whole.buf,
                    global_seqno: Seqno::ILLEGAL,
                    local_seqno: Seqno::ILLEGAL,
                    sender_idx,
                })
            }
        }

        ActionType::Ordered | ActionType::CommitCut => {
            let primary = core.node().is_primary();
            let global = if primary {
                core.seq.next_global()
            } else {
                Seqno::ILLEGAL
            };

            if primary {
                core.node().on_ordered_delivered(global);
                core.update_announce();
                if let Some(pause) = core.flow.on_delivered(global) {
                    core.send_library(ActionType::Flow, &wire::encode_flow(pause));
                }
            }

            if is_self
                && core.monitor.complete_with(whole.action_id, || ReplDone {
                    global,
                    local: core.seq.next_local(),
                    donor_idx: None,
                })
            {
                // repl path: the blocked caller returns the delivery, with
                // both seqnos drawn here so completions carry local seqnos
                // in delivery order.
                return Ok(());
            }

            core.queue.push(Action {
                kind: whole.kind,
                buf: whole.buf,
                global_seqno: global,
                local_seqno: Seqno::ILLEGAL,
                sender_idx,
            })
        }

        ActionType::Conf | ActionType::Error | ActionType::Unknown => {
            warn!(kind = %whole.kind, sender = %whole.sender, "unexpected action type on wire");
            Ok(())
        }
    }
}
