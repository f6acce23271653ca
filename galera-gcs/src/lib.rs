//! GCS contract consumed by the core (§4.7): atomic broadcast with
//! self-delivery, fire-and-forget send, an ordered receive queue, flow
//! control, and membership join — plus an in-memory reference transport for
//! testing everything above it without a real transport.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use galera_base::Result;
use galera_wire::SEQNO_UNDEFINED;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ActionKind {
    Data,
    CommitCut,
    Conf,
    Snapshot,
}

/// One delivered action: `seqno_local` is contiguous across everything this
/// node receives; `seqno_global` is contiguous for `Data` actions and
/// `SEQNO_UNDEFINED` for some non-data actions (§4.7).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Delivery {
    pub action: ActionKind,
    pub payload: Vec<u8>,
    pub seqno_global: i64,
    pub seqno_local: i64,
}

/// The GCS contract the replication core depends on. Implementations are
/// opaque to WS/CC contents — everything here moves as bytes.
pub trait Gcs: Send + Sync {
    /// Atomic broadcast: returns once this process has delivered its own
    /// message, with both the global and local seqno it was delivered at.
    fn repl(&self, bytes: Vec<u8>) -> Result<(i64, i64)>;

    /// Fire-and-forget broadcast, used for small signalling.
    fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Dequeues the next delivered action, blocking if none is ready.
    fn recv(&self) -> Result<Delivery>;

    /// Informs peers of this node's last-applied seqno.
    fn set_last_applied(&self, seqno: i64) -> Result<()>;

    /// Informs the group that this node has state and accepts flow-control
    /// accounting.
    fn join(&self) -> Result<()>;

    /// Whether the channel has asked this node to pause sending (§4.6.4
    /// flow-control contract).
    fn flow_control_paused(&self) -> bool;
}

struct State {
    next_global: i64,
    next_local: Vec<i64>,
    inboxes: Vec<VecDeque<Delivery>>,
    last_applied: Vec<i64>,
    joined: Vec<bool>,
    paused: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// A group of nodes sharing one in-process broadcast medium: every `repl`
/// and `send` call is visible to every node's `recv` queue in a single
/// total order, which is all the core needs from a GCS for testing.
pub struct InMemoryGcsGroup {
    shared: Arc<Shared>,
}

impl InMemoryGcsGroup {
    /// Creates a group of `n` connected handles.
    pub fn new(n: usize) -> Vec<InMemoryGcs> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                next_global: 0,
                next_local: vec![0; n],
                inboxes: (0..n).map(|_| VecDeque::new()).collect(),
                last_applied: vec![SEQNO_UNDEFINED; n],
                joined: vec![false; n],
                paused: false,
            }),
            cv: Condvar::new(),
        });
        (0..n).map(|node| InMemoryGcs { shared: Arc::clone(&shared), node }).collect()
    }
}

/// One node's handle onto an [`InMemoryGcsGroup`].
pub struct InMemoryGcs {
    shared: Arc<Shared>,
    node: usize,
}

impl InMemoryGcs {
    fn broadcast(&self, action: ActionKind, payload: Vec<u8>, assign_global: bool) -> (i64, i64) {
        let mut g = self.shared.state.lock();
        let seqno_global = if assign_global {
            let s = g.next_global;
            g.next_global += 1;
            s
        } else {
            SEQNO_UNDEFINED
        };
        let mut own_seqno_local = 0;
        for node in 0..g.inboxes.len() {
            let seqno_local = g.next_local[node];
            g.next_local[node] += 1;
            if node == self.node {
                own_seqno_local = seqno_local;
            }
            g.inboxes[node].push_back(Delivery {
                action,
                payload: payload.clone(),
                seqno_global,
                seqno_local,
            });
        }
        self.shared.cv.notify_all();
        (seqno_global, own_seqno_local)
    }

    /// Test hook: toggles whether [`Gcs::flow_control_paused`] reports true.
    pub fn set_paused(&self, paused: bool) {
        self.shared.state.lock().paused = paused;
    }

    pub fn last_applied_of(&self, node: usize) -> i64 {
        self.shared.state.lock().last_applied[node]
    }
}

impl Gcs for InMemoryGcs {
    fn repl(&self, bytes: Vec<u8>) -> Result<(i64, i64)> {
        let (g, l) = self.broadcast(ActionKind::Data, bytes, true);
        trace!(node = self.node, seqno_global = g, seqno_local = l, "repl delivered");
        Ok((g, l))
    }

    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.broadcast(ActionKind::Data, bytes, false);
        Ok(())
    }

    fn recv(&self) -> Result<Delivery> {
        let mut g = self.shared.state.lock();
        loop {
            if let Some(d) = g.inboxes[self.node].pop_front() {
                return Ok(d);
            }
            self.shared.cv.wait(&mut g);
        }
    }

    fn set_last_applied(&self, seqno: i64) -> Result<()> {
        self.shared.state.lock().last_applied[self.node] = seqno;
        Ok(())
    }

    fn join(&self) -> Result<()> {
        let mut g = self.shared.state.lock();
        g.joined[self.node] = true;
        drop(g);
        self.broadcast(ActionKind::Conf, Vec::new(), false);
        Ok(())
    }

    fn flow_control_paused(&self) -> bool {
        self.shared.state.lock().paused
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn repl_self_delivers_before_returning() {
        let mut nodes = InMemoryGcsGroup::new(1);
        let n0 = nodes.remove(0);
        let (g, l) = n0.repl(b"hello".to_vec()).unwrap();
        assert_eq!(g, 0);
        assert_eq!(l, 0);
        let d = n0.recv().unwrap();
        assert_eq!(d.payload, b"hello");
        assert_eq!(d.seqno_global, 0);
    }

    #[test]
    fn repl_is_visible_to_every_node_in_the_same_order() {
        let nodes = InMemoryGcsGroup::new(3);
        nodes[0].repl(b"a".to_vec()).unwrap();
        nodes[1].repl(b"b".to_vec()).unwrap();

        for n in &nodes {
            let d1 = n.recv().unwrap();
            let d2 = n.recv().unwrap();
            assert_eq!(d1.payload, b"a");
            assert_eq!(d1.seqno_global, 0);
            assert_eq!(d2.payload, b"b");
            assert_eq!(d2.seqno_global, 1);
        }
    }

    #[test]
    fn send_does_not_assign_a_global_seqno() {
        let mut nodes = InMemoryGcsGroup::new(1);
        let n0 = nodes.remove(0);
        n0.send(b"ping".to_vec()).unwrap();
        let d = n0.recv().unwrap();
        assert_eq!(d.seqno_global, SEQNO_UNDEFINED);
    }

    #[test]
    fn join_broadcasts_a_conf_action() {
        let nodes = InMemoryGcsGroup::new(2);
        nodes[0].join().unwrap();
        let d1 = nodes[1].recv().unwrap();
        assert_eq!(d1.action, ActionKind::Conf);
    }

    #[test]
    fn flow_control_pause_is_observable() {
        let mut nodes = InMemoryGcsGroup::new(1);
        let n0 = nodes.remove(0);
        assert!(!n0.flow_control_paused());
        n0.set_paused(true);
        assert!(n0.flow_control_paused());
    }

    #[test]
    fn set_last_applied_is_recorded_per_node() {
        let nodes = InMemoryGcsGroup::new(2);
        nodes[0].set_last_applied(42).unwrap();
        assert_eq!(nodes[0].last_applied_of(0), 42);
        assert_eq!(nodes[0].last_applied_of(1), SEQNO_UNDEFINED);
    }
}
