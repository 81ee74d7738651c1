//! End-to-end scenarios over the in-process loopback backend.
//!
//! Several connections in one process join the same channel and exercise
//! the full pipeline: fragmentation, total order, seqno assignment,
//! replication matching, state transfer and flow control. Channel names are
//! unique per test because the loopback hub is process-wide.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use herd::{Action, ActionType, ConfView, Connection, ConnectionConfig, GroupUuid, NodeState, Seqno};

// ============================================================================
// Helpers
// ============================================================================

fn open(channel: &str) -> Connection {
    let conn = Connection::create("dummy://").unwrap();
    conn.open(channel).unwrap();
    conn
}

fn open_with(channel: &str, config: ConnectionConfig) -> Connection {
    let conn = Connection::create_with_config("dummy://", config).unwrap();
    conn.open(channel).unwrap();
    conn
}

/// Receives until an action of `kind` arrives, discarding coordination
/// actions on the way.
fn recv_kind(conn: &Connection, kind: ActionType) -> Action {
    loop {
        let action = conn.recv().unwrap();
        if action.kind == kind {
            return action;
        }
    }
}

/// Polls `predicate` until it holds or the deadline passes.
fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn replicate_one_on_single_node() {
    let conn = open("lb-repl-one");

    let (global, local) = conn.repl(b"hello".to_vec(), ActionType::Ordered).unwrap();
    assert_eq!(global, Seqno::FIRST);
    // No prior hand-off happened, so the completion draws local seqno 1.
    assert_eq!(local, Seqno::FIRST);

    // The coordination actions are still in-band, after the completion.
    let conf = recv_kind(&conn, ActionType::Conf);
    assert_eq!(conf.local_seqno, Seqno::new(2));
    let view = ConfView::decode(&conf.buf).unwrap();
    assert!(view.is_primary());
    assert_eq!(view.memb_num(), 1);
    assert!(!view.st_required);

    conn.close().unwrap();
}

#[test]
fn send_comes_back_through_recv() {
    let conn = open("lb-send-recv");

    let size = conn.send(b"fire and forget".to_vec(), ActionType::Ordered).unwrap();
    assert_eq!(size, 15);

    let action = recv_kind(&conn, ActionType::Ordered);
    assert_eq!(action.buf, b"fire and forget");
    assert_eq!(action.global_seqno, Seqno::FIRST);
    assert_eq!(action.sender_idx, Some(0));

    conn.close().unwrap();
}

#[test]
fn fragmentation_across_two_nodes() {
    let config = ConnectionConfig {
        pkt_size: 100,
        ..ConnectionConfig::default()
    };
    let a = open_with("lb-frag", config.clone());
    let b = open_with("lb-frag", config);

    let mut rng = SmallRng::seed_from_u64(7);
    let payload: Vec<u8> = (0..250).map(|_| rng.gen()).collect();

    let (global, _) = a.repl(payload.clone(), ActionType::Ordered).unwrap();
    assert_eq!(global, Seqno::FIRST);

    let action = recv_kind(&b, ActionType::Ordered);
    assert_eq!(action.buf, payload);
    assert_eq!(action.global_seqno, Seqno::FIRST);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn large_action_round_trips_default_packets() {
    let a = open("lb-large");
    let b = open("lb-large");
    let mut rng = SmallRng::seed_from_u64(11);
    let payload: Vec<u8> = (0..300_000).map(|_| rng.gen()).collect();

    let (global, _) = a.repl(payload.clone(), ActionType::Ordered).unwrap();
    assert_eq!(global, Seqno::FIRST);

    let action = recv_kind(&b, ActionType::Ordered);
    assert_eq!(action.buf.len(), payload.len());
    assert_eq!(action.buf, payload);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn two_senders_agree_on_global_order() {
    let a = Arc::new(open("lb-interleave"));
    let b = Arc::new(open("lb-interleave"));

    let spawn_sender = |conn: &Arc<Connection>, tag: u8| {
        let conn = Arc::clone(conn);
        thread::spawn(move || -> Vec<(Vec<u8>, Seqno)> {
            (0..3)
                .map(|i| {
                    let payload = vec![tag, i];
                    let (global, _) = conn.repl(payload.clone(), ActionType::Ordered).unwrap();
                    (payload, global)
                })
                .collect()
        })
    };

    let ta = spawn_sender(&a, b'a');
    let tb = spawn_sender(&b, b'b');
    let sent_a = ta.join().unwrap();
    let sent_b = tb.join().unwrap();

    // Each node receives the other's three actions.
    let recv_remote = |conn: &Connection| -> Vec<(Vec<u8>, Seqno)> {
        (0..3)
            .map(|_| {
                let action = recv_kind(conn, ActionType::Ordered);
                (action.buf.clone(), action.global_seqno)
            })
            .collect()
    };
    let a_saw = recv_remote(&a);
    let b_saw = recv_remote(&b);

    // Six distinct globals covering 1..=6.
    let mut globals: Vec<i64> = sent_a
        .iter()
        .chain(&sent_b)
        .map(|(_, g)| g.as_i64())
        .collect();
    globals.sort_unstable();
    assert_eq!(globals, vec![1, 2, 3, 4, 5, 6]);

    // repl agreement: the sender's view of its own action matches the
    // receiver's view of the same payload.
    for (payload, global) in &sent_a {
        let observed = b_saw.iter().find(|(p, _)| p == payload).unwrap();
        assert_eq!(observed.1, *global, "payload {payload:?}");
    }
    for (payload, global) in &sent_b {
        let observed = a_saw.iter().find(|(p, _)| p == payload).unwrap();
        assert_eq!(observed.1, *global, "payload {payload:?}");
    }

    // Remote actions arrive in global order on both nodes.
    assert!(a_saw.windows(2).all(|w| w[0].1 < w[1].1));
    assert!(b_saw.windows(2).all(|w| w[0].1 < w[1].1));

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn concurrent_replicators_follow_delivery_order() {
    let a = Arc::new(open("lb-concurrent-repl"));

    // Four preemptively scheduled replicators on one connection; nothing
    // calls recv, so every local seqno below is drawn at completion.
    let handles: Vec<_> = (0..4u8)
        .map(|tag| {
            let a = Arc::clone(&a);
            thread::spawn(move || {
                (0..5u8)
                    .map(|i| a.repl(vec![tag, i], ActionType::Ordered).unwrap())
                    .collect::<Vec<(Seqno, Seqno)>>()
            })
        })
        .collect();
    let mut pairs: Vec<(Seqno, Seqno)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    // Twenty ordered actions: globals 1..=20.
    pairs.sort_by_key(|(global, _)| *global);
    let globals: Vec<i64> = pairs.iter().map(|(g, _)| g.as_i64()).collect();
    assert_eq!(globals, (1..=20).collect::<Vec<_>>());

    // Order correspondence, not just gaplessness: sorted by global (the
    // delivery order), the locals must come out 1..=20 in the same order,
    // however the scheduler resumed the twenty blocked callers.
    let locals: Vec<i64> = pairs.iter().map(|(_, l)| l.as_i64()).collect();
    assert_eq!(locals, (1..=20).collect::<Vec<_>>());

    assert_eq!(a.caused().unwrap(), Seqno::new(20));
    a.close().unwrap();
}

#[test]
fn local_seqnos_are_gapless_across_recv_and_repl() {
    let a = Arc::new(open("lb-gapless"));
    let b = Arc::new(open("lb-gapless"));

    let sender = {
        let a = Arc::clone(&a);
        thread::spawn(move || {
            let mut locals = Vec::new();
            for i in 0..5u8 {
                let (_, local) = a.repl(vec![i], ActionType::Ordered).unwrap();
                locals.push(local.as_i64());
            }
            locals
        })
    };

    let mut locals = sender.join().unwrap();
    // Drain everything that reached a's queue so far: confs, syncs, and
    // nothing of our own ordered actions (those completed via repl).
    for _ in 0..2 {
        locals.push(a.recv().unwrap().local_seqno.as_i64());
    }

    // Every hand-off so far drew a distinct, contiguous local seqno. (The
    // sort checks uniqueness and gaplessness across the recv/repl mix;
    // order correspondence is covered by
    // concurrent_replicators_follow_delivery_order.)
    locals.sort_unstable();
    let expected: Vec<i64> = (1..=locals.len() as i64).collect();
    assert_eq!(locals, expected);

    assert_eq!(a.caused().unwrap(), Seqno::new(locals.len() as i64));

    a.close().unwrap();
    b.close().unwrap();
}

// ============================================================================
// Membership
// ============================================================================

#[test]
fn member_leave_shrinks_configuration() {
    let a = open("lb-leave");
    let b = open("lb-leave");
    let c = open("lb-leave");

    // Drain a's configurations up to the three-member view.
    loop {
        let conf = recv_kind(&a, ActionType::Conf);
        if ConfView::decode(&conf.buf).unwrap().memb_num() == 3 {
            break;
        }
    }

    c.close().unwrap();

    let view = loop {
        let conf = recv_kind(&a, ActionType::Conf);
        let view = ConfView::decode(&conf.buf).unwrap();
        if view.memb_num() == 2 {
            break view;
        }
    };
    assert!(view.is_primary());
    assert_eq!(view.my_idx, 0);

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn member_killed_mid_replication_leaves_survivors_consistent() {
    // Tiny packets make the big action below tens of thousands of
    // fragments, so the kill lands while they are still being submitted
    // and the survivors face a partial action at the view boundary.
    let config = ConnectionConfig {
        pkt_size: 64,
        ..ConnectionConfig::default()
    };
    let a = open_with("lb-kill", config.clone());
    let b = open_with("lb-kill", config.clone());
    let c = Arc::new(open_with("lb-kill", config));

    let sender = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.repl(vec![0xCD; 1 << 20], ActionType::Ordered))
    };
    thread::sleep(Duration::from_millis(2));
    c.close().unwrap();

    // The dying member's own replicator never completes normally: its
    // waiter is cancelled by the close (it would have seen the view-change
    // error had the node merely been expelled).
    let c_result = sender.join().unwrap();

    // Survivors watch the membership grow to three and shrink back to two.
    loop {
        let conf = recv_kind(&a, ActionType::Conf);
        if ConfView::decode(&conf.buf).unwrap().memb_num() == 3 {
            break;
        }
    }
    loop {
        let conf = recv_kind(&a, ActionType::Conf);
        if ConfView::decode(&conf.buf).unwrap().memb_num() == 2 {
            break;
        }
    }

    let (global_after, _) = a.repl(b"after".to_vec(), ActionType::Ordered).unwrap();

    // Whether the kill interrupted the submission decides what the group
    // history contains; either way the survivors agree on it.
    let first = recv_kind(&b, ActionType::Ordered);
    if first.buf == b"after" {
        // The partial action crossed the view boundary and was discarded:
        // the history holds only the survivor's write, at global 1.
        assert_eq!(first.global_seqno, Seqno::FIRST);
        assert_eq!(global_after, Seqno::FIRST);
        assert!(c_result.is_err());
    } else {
        // The close lost the race and every fragment made it out; the
        // whole action is then delivered everywhere, ahead of ours.
        assert_eq!(first.buf.len(), 1 << 20);
        assert_eq!(first.global_seqno, Seqno::FIRST);
        assert_eq!(global_after, Seqno::new(2));
        let after = recv_kind(&b, ActionType::Ordered);
        assert_eq!(after.buf, b"after");
        assert_eq!(after.global_seqno, Seqno::new(2));
    }

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn repl_after_close_reports_closed() {
    let conn = open("lb-closed-repl");
    conn.close().unwrap();
    assert!(conn.repl(vec![1], ActionType::Ordered).is_err());
    assert!(conn.recv().is_err());
}

// ============================================================================
// State Transfer
// ============================================================================

#[test]
fn state_transfer_between_seeded_and_fresh_node() {
    let history = GroupUuid::generate();

    let a = Connection::create("dummy://").unwrap();
    a.init(Seqno::new(5), history).unwrap();
    a.open("lb-st").unwrap();
    wait_until("donor synced", || a.state() == NodeState::Synced);

    let b = open("lb-st");

    // The fresh node learns it has a gap.
    let conf = recv_kind(&b, ActionType::Conf);
    let view = ConfView::decode(&conf.buf).unwrap();
    assert!(view.st_required);
    assert_eq!(view.seqno, Seqno::new(5));
    assert_eq!(view.group_uuid, history);
    assert_eq!(view.memb_num(), 2);
    assert_eq!(view.my_idx, 1);
    assert_eq!(b.state(), NodeState::Joiner);

    // Ordinary replication is refused until the gap is closed.
    assert!(b.repl(vec![0], ActionType::Ordered).is_err());

    // Request a donor; the only full member is a, at index 0.
    let (donor_idx, local) = b.request_state_transfer(b"snapshot please".to_vec()).unwrap();
    assert_eq!(donor_idx, 0);
    assert!(local >= Seqno::FIRST);

    // The donor's application receives the request in-band.
    let request = recv_kind(&a, ActionType::StateRequest);
    assert_eq!(request.buf, b"snapshot please");
    assert_eq!(request.sender_idx, Some(1));
    assert_eq!(a.state(), NodeState::Donor);

    // Out-of-band transfer happens here; then the donor reports success.
    a.join(Seqno::new(5)).unwrap();

    wait_until("joiner joined", || {
        matches!(b.state(), NodeState::Joined | NodeState::Synced)
    });

    // The next write continues the history at global seqno 6, on both ends.
    let (global, _) = a.repl(b"after transfer".to_vec(), ActionType::Ordered).unwrap();
    assert_eq!(global, Seqno::new(6));

    let delivered = recv_kind(&b, ActionType::Ordered);
    assert_eq!(delivered.buf, b"after transfer");
    assert_eq!(delivered.global_seqno, Seqno::new(6));

    a.close().unwrap();
    b.close().unwrap();
}

#[test]
fn state_transfer_without_donor_is_transient() {
    // Two seeded nodes on different histories: the dominant side has no
    // second member to serve as donor for the minority one.
    let a = Connection::create("dummy://").unwrap();
    a.init(Seqno::new(9), GroupUuid::generate()).unwrap();
    a.open("lb-st-nodonor").unwrap();
    wait_until("seed synced", || a.state() == NodeState::Synced);

    let b = open("lb-st-nodonor");
    wait_until("fresh node is joiner", || b.state() == NodeState::Joiner);

    let c = open("lb-st-nodonor");
    wait_until("second fresh node is joiner", || c.state() == NodeState::Joiner);

    // b takes the only donor.
    let (donor_idx, _) = b.request_state_transfer(vec![]).unwrap();
    assert_eq!(donor_idx, 0);

    // c must come back later.
    let err = c.request_state_transfer(vec![]).unwrap_err();
    assert!(err.is_transient());

    a.close().unwrap();
    b.close().unwrap();
    c.close().unwrap();
}

// ============================================================================
// Flow Control
// ============================================================================

#[test]
fn slow_applier_pauses_and_resumes_group() {
    let config = ConnectionConfig {
        fc_low_watermark: 2,
        fc_high_watermark: 5,
        ..ConnectionConfig::default()
    };
    let a = open_with("lb-flow", config.clone());
    let b = open_with("lb-flow", config);

    // Nobody applies anything; five ordered actions push the lag to the
    // high watermark on both nodes.
    for i in 0..5u8 {
        a.repl(vec![i], ActionType::Ordered).unwrap();
    }

    wait_until("group paused", || {
        a.wait().unwrap() && b.wait().unwrap()
    });

    // Appliers catch up; both nodes resume the group.
    a.set_last_applied(Seqno::new(5)).unwrap();
    b.set_last_applied(Seqno::new(5)).unwrap();

    wait_until("group resumed", || {
        !a.wait().unwrap() && !b.wait().unwrap()
    });

    // With every member reporting 5 applied, the commit cut is broadcast.
    let cut = recv_kind(&b, ActionType::CommitCut);
    assert_eq!(cut.buf, 5i64.to_be_bytes());
    assert!(cut.global_seqno >= Seqno::FIRST);

    a.close().unwrap();
    b.close().unwrap();
}

// ============================================================================
// Reconnection
// ============================================================================

#[test]
fn reopen_preserves_history_position() {
    let a = open("lb-reopen");
    a.repl(b"one".to_vec(), ActionType::Ordered).unwrap();
    a.repl(b"two".to_vec(), ActionType::Ordered).unwrap();
    a.close().unwrap();

    // The same handle rejoins announcing seqno 2; alone on the channel it
    // remains the authority on its own history.
    a.open("lb-reopen").unwrap();
    let conf = recv_kind(&a, ActionType::Conf);
    let view = ConfView::decode(&conf.buf).unwrap();
    assert_eq!(view.seqno, Seqno::new(2));
    assert!(!view.st_required);

    let (global, _) = a.repl(b"three".to_vec(), ActionType::Ordered).unwrap();
    assert_eq!(global, Seqno::new(3));

    a.close().unwrap();
}
