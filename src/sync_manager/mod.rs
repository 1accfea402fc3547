// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The sync control plane: whether to sync, whom to call, when to create an
//! event, and when the node has fallen behind.

mod fallen_behind;

pub use fallen_behind::FallenBehindTracker;

use crate::address_book::MemberId;
use crate::comms::ConnectionGraph;
use crate::config::{
    Config, MAXIMUM_NEIGHBORS_TO_QUERY, TRANS_THROTTLE_EMPTY_SYNCS,
    TRANS_THROTTLE_INITIAL_CALLS_NUM,
};
use crate::event_flow::{FreezeControl, TransLists};
use crate::quorum::QuorumTracker;
use crate::signed_state::SigCollector;

use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A freeze window starting within this horizon counts as imminent.
const FREEZE_LOOKAHEAD: Duration = Duration::from_secs(60);

/// What a finished sync reports back to the control plane.
#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    /// True when this node initiated the sync.
    pub caller: bool,
    /// The peer.
    pub other_id: MemberId,
    /// Events pulled in.
    pub events_read: u64,
    /// Events pushed out.
    pub events_written: u64,
}

impl SyncOutcome {
    fn is_empty(&self) -> bool {
        self.events_read == 0 && self.events_written == 0
    }
}

/// Decisions about initiating, accepting and following up on syncs.
pub struct SyncManager {
    config: Arc<Config>,
    self_id: MemberId,
    committee_size: usize,
    topology: Arc<ConnectionGraph>,
    quorum: Arc<QuorumTracker>,
    trans: Arc<TransLists>,
    freeze: Arc<FreezeControl>,
    collector: Arc<SigCollector>,
    fallen_behind: FallenBehindTracker,
    intake_depth: Arc<AtomicUsize>,
    consecutive_empty_syncs: AtomicU32,
    calls_since_start: AtomicU32,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("self_id", &self.self_id)
            .field("intake_depth", &self.intake_depth.load(Ordering::Relaxed))
            .finish()
    }
}

impl SyncManager {
    /// New control plane for `self_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        self_id: MemberId,
        committee_size: usize,
        topology: Arc<ConnectionGraph>,
        quorum: Arc<QuorumTracker>,
        trans: Arc<TransLists>,
        freeze: Arc<FreezeControl>,
        collector: Arc<SigCollector>,
        intake_depth: Arc<AtomicUsize>,
    ) -> Self {
        let fallen_behind = FallenBehindTracker::new(
            topology.neighbors(self_id),
            config.fallen_behind_threshold,
        );
        Self {
            config,
            self_id,
            committee_size,
            topology,
            quorum,
            trans,
            freeze,
            collector,
            fallen_behind,
            intake_depth,
            consecutive_empty_syncs: AtomicU32::new(0),
            calls_since_start: AtomicU32::new(0),
        }
    }

    /// The fallen-behind bookkeeping.
    pub fn fallen_behind(&self) -> &FallenBehindTracker {
        &self.fallen_behind
    }

    /// Whether to serve an inbound sync request.
    pub fn should_accept_sync(&self) -> bool {
        self.intake_depth.load(Ordering::Relaxed) <= self.config.event_intake_queue_throttle_size
    }

    /// Whether to start an outbound sync.
    pub fn should_initiate_sync(&self) -> bool {
        self.should_accept_sync()
    }

    /// Whom to call next.
    ///
    /// While fallen-behind is suspected, the neighbours that have not yet
    /// weighed in, shuffled. Otherwise up to ten random neighbours are
    /// sampled and the first critical-quorum member wins; failing that, the
    /// last one sampled.
    pub fn neighbors_to_call(&self) -> Vec<MemberId> {
        if self.fallen_behind.is_suspected() {
            return self.fallen_behind.not_yet_reported();
        }
        let mut rng = rand::thread_rng();
        let mut last = None;
        for _ in 0..MAXIMUM_NEIGHBORS_TO_QUERY {
            let candidate = match self.topology.random_neighbor(self.self_id, &mut rng) {
                Some(id) => id,
                None => return Vec::new(),
            };
            if self.quorum.is_in_critical_quorum(candidate) {
                return vec![candidate];
            }
            last = Some(candidate);
        }
        last.map(|id| vec![id]).unwrap_or_default()
    }

    /// Should gossip keep running? False only when every reason to talk has
    /// gone quiet.
    pub fn trans_throttle(&self) -> bool {
        if self.trans.pending_user_transactions() > 0 {
            return true;
        }
        let now = SystemTime::now();
        let freeze_engaged = self.freeze.stage() != crate::event_flow::FreezeStage::NotInFreeze
            || self.freeze.is_in_freeze_period(now)
            || self.freeze.is_in_freeze_period(now + FREEZE_LOOKAHEAD);
        if freeze_engaged {
            return true;
        }
        if self.collector.has_unfinished_state() {
            return true;
        }
        if self.consecutive_empty_syncs.load(Ordering::Relaxed) < TRANS_THROTTLE_EMPTY_SYNCS {
            return true;
        }
        self.calls_since_start.load(Ordering::Relaxed) < TRANS_THROTTLE_INITIAL_CALLS_NUM
    }

    /// Folds a finished sync into the counters and the fallen-behind state.
    pub fn sync_done(&self, outcome: &SyncOutcome) {
        if outcome.caller {
            let _ = self.calls_since_start.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.is_empty() {
            let _ = self.consecutive_empty_syncs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_empty_syncs.store(0, Ordering::Relaxed);
        }
        // the peer served us without reporting us behind
        self.fallen_behind.report_synced(outcome.other_id);
    }

    /// Clears the boot/reconnect call counter; used after a reconnect so the
    /// initial-calls clause of the throttle re-arms.
    pub fn reset_calls_since_start(&self) {
        self.calls_since_start.store(0, Ordering::Relaxed);
        self.consecutive_empty_syncs.store(0, Ordering::Relaxed);
    }

    /// Whether to create a self event after this sync.
    pub fn should_create_event(&self, outcome: &SyncOutcome) -> bool {
        // the freeze manager's veto is absolute
        if !self.freeze.should_create_event() {
            return false;
        }
        let chain = if self.trans.pending_freeze_transactions() > 0 {
            true
        } else {
            self.quorum.is_in_critical_quorum(self.self_id)
                || self.quorum.is_in_critical_quorum(outcome.other_id)
                || self.random_event_override()
        };
        if !chain {
            return false;
        }
        // stale prevention: a sync that read a flood of events means our
        // event would land far behind the tips
        let stale_bound =
            self.config.stale_event_prevention_threshold * self.committee_size as u64;
        if self.config.stale_event_prevention_threshold > 0 && outcome.events_read > stale_bound {
            return false;
        }
        true
    }

    fn random_event_override(&self) -> bool {
        let p = self.config.random_event_probability;
        p > 0 && rand::thread_rng().gen_range(0, p) == 0
    }

    /// Current gossip intake depth gauge, shared with the intake task.
    pub fn intake_depth(&self) -> &Arc<AtomicUsize> {
        &self.intake_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::{AddressBook, Member};
    use ed25519_dalek::Keypair;
    use rand::rngs::OsRng;

    fn book(n: usize) -> Arc<AddressBook> {
        let members = (0..n)
            .map(|id| Member {
                id: id as MemberId,
                nickname: format!("m{id}"),
                public_key: Keypair::generate(&mut OsRng).public,
                internal_addr: "127.0.0.1:0".parse().expect("addr"),
                external_addr: "127.0.0.1:0".parse().expect("addr"),
                stake: 1,
            })
            .collect();
        Arc::new(AddressBook::new(members))
    }

    fn manager(config: Config, n: usize) -> SyncManager {
        let config = Arc::new(config);
        let book = book(n);
        SyncManager::new(
            config.clone(),
            0,
            n,
            Arc::new(ConnectionGraph::complete(n)),
            Arc::new(QuorumTracker::stake_based(&book, false)),
            Arc::new(TransLists::new(
                config.throttle_transaction_queue_size,
                config.max_transaction_bytes_per_event,
                false,
            )),
            Arc::new(FreezeControl::new()),
            Arc::new(SigCollector::new(book, 10)),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    fn outcome(read: u64, written: u64) -> SyncOutcome {
        SyncOutcome {
            caller: true,
            other_id: 1,
            events_read: read,
            events_written: written,
        }
    }

    #[test]
    fn intake_depth_gates_syncing() {
        let mut config = Config::default();
        config.event_intake_queue_throttle_size = 5;
        let manager = manager(config, 4);
        assert!(manager.should_accept_sync());
        manager.intake_depth().store(6, Ordering::Relaxed);
        assert!(!manager.should_accept_sync());
        assert!(!manager.should_initiate_sync());
    }

    #[test]
    fn throttle_goes_quiet_only_when_every_reason_does() {
        let manager = manager(Config::default(), 4);
        // fresh boot: initial-calls clause keeps gossip running
        assert!(manager.trans_throttle());

        // burn through the initial calls and the empty-sync budget
        for _ in 0..TRANS_THROTTLE_INITIAL_CALLS_NUM.max(TRANS_THROTTLE_EMPTY_SYNCS) {
            manager.sync_done(&outcome(0, 0));
        }
        assert!(!manager.trans_throttle());

        // pending user work re-arms it
        manager
            .trans
            .offer(crate::event::Transaction::User(bytes::Bytes::from_static(
                b"tx",
            )))
            .expect("accepted");
        assert!(manager.trans_throttle());
        let _ = manager.trans.poll_trans_for_event();
        // polling moved it out of the event queue
        assert!(!manager.trans_throttle());

        // a non-empty sync resets the empty-sync streak
        manager.sync_done(&outcome(3, 0));
        assert!(manager.trans_throttle());

        // a freeze transition re-arms it too
        for _ in 0..TRANS_THROTTLE_EMPTY_SYNCS {
            manager.sync_done(&outcome(0, 0));
        }
        assert!(!manager.trans_throttle());
        manager.freeze.freeze_started().expect("transition");
        assert!(manager.trans_throttle());
    }

    #[test]
    fn freeze_vetoes_event_creation_but_not_sync() {
        let manager = manager(Config::default(), 4);
        assert!(manager.should_create_event(&outcome(1, 1)));
        manager.freeze.freeze_started().expect("transition");
        assert!(!manager.should_create_event(&outcome(1, 1)));
        assert!(manager.freeze.should_sync());
    }

    #[test]
    fn stale_prevention_skips_event_creation() {
        let mut config = Config::default();
        config.stale_event_prevention_threshold = 2;
        let manager = manager(config, 4);
        assert!(manager.should_create_event(&outcome(8, 0)));
        assert!(!manager.should_create_event(&outcome(9, 0)));
    }

    #[test]
    fn neighbors_to_call_prefers_outstanding_reporters_when_suspected() {
        let manager = manager(Config::default(), 4);
        let picked = manager.neighbors_to_call();
        assert_eq!(picked.len(), 1);
        assert_ne!(picked[0], 0);

        manager.fallen_behind().report_fallen_behind(1);
        let mut outstanding = manager.neighbors_to_call();
        outstanding.sort_unstable();
        assert_eq!(outstanding, vec![2, 3]);
    }
}
