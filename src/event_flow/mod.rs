// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The event flow pipeline: multi-queue handoff between gossip intake, the
//! pre-consensus state, the consensus state and signed-state hashing.

pub mod freeze;
mod trans_lists;

pub use freeze::{FreezeControl, FreezeStage};
pub use trans_lists::TransLists;

use crate::address_book::MemberId;
use crate::config::{Config, JOIN_WAIT_MS};
use crate::consensus::{ConsensusOracle, Round};
use crate::error::{Error, Result};
use crate::event::{Event, SystemTxKind, Transaction};
use crate::shadow_graph::ShadowGraph;
use crate::signed_state::{self, SigCollector, SignedState};
use crate::LogMarker;

use bytes::Bytes;
use ed25519_dalek::{Keypair, Signature};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

const PIPELINE_QUEUE_DEPTH: usize = 1024;

/// The application state machine, opaque to the core.
///
/// One instance serves as the pre-consensus "current" state, another as the
/// consensus state; the trait collapses the original virtual hierarchy into
/// the two hooks the pipeline actually drives.
pub trait ApplicationState: Send + 'static {
    /// An event has arrived over gossip, before any order is decided.
    fn handle_pre_consensus(&mut self, event: &Event);

    /// An event has reached consensus, delivered in consensus order.
    fn handle_consensus(&mut self, event: &Event);

    /// A staged transaction, for immediate feedback to the submitter.
    fn handle_transaction(&mut self, _tx: &Transaction) {}

    /// Serialized copy of the state, for hashing and signing.
    fn snapshot(&self) -> Bytes;
}

/// What travels on the `for_curr` queue. The no-event token unblocks a
/// waiting consumer when a transaction arrives but no event is available
/// yet.
#[derive(Debug)]
pub enum IntakeItem {
    /// A gossiped event for the pre-consensus state.
    Event(Arc<Event>),
    /// Wake-up only.
    NoEvent,
}

/// Everything the consensus-side consumer needs.
struct ConsContext {
    state: Box<dyn ApplicationState>,
    oracle: Arc<dyn ConsensusOracle>,
    collector: Arc<SigCollector>,
    trans: Arc<TransLists>,
    graph: Arc<RwLock<ShadowGraph>>,
    to_hash_sign: mpsc::Sender<SignedState>,
    signed_state_freq: u64,
    last_snapshot_round: Round,
}

/// The running pipeline: four bounded queues, one consumer task each.
pub struct EventFlow {
    trans: Arc<TransLists>,
    freeze: Arc<FreezeControl>,
    collector: Arc<SigCollector>,
    for_curr: mpsc::Sender<IntakeItem>,
    for_cons: mpsc::Sender<Arc<Event>>,
    running_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EventFlow")
            .field("running", &*self.running_tx.borrow())
            .finish()
    }
}

impl EventFlow {
    /// Spawns the pipeline consumers and the hash-sign worker.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: &Config,
        self_id: MemberId,
        keypair: Arc<Keypair>,
        oracle: Arc<dyn ConsensusOracle>,
        graph: Arc<RwLock<ShadowGraph>>,
        collector: Arc<SigCollector>,
        trans: Arc<TransLists>,
        freeze: Arc<FreezeControl>,
        curr_state: Box<dyn ApplicationState>,
        cons_state: Box<dyn ApplicationState>,
    ) -> Self {
        let (for_curr_tx, for_curr_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let (for_cons_tx, for_cons_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let (for_sigs_tx, for_sigs_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let (to_hash_sign_tx, to_hash_sign_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let (running_tx, running_rx) = watch::channel(true);

        let mut handles = Vec::new();

        handles.push(tokio::spawn(run_curr(
            for_curr_rx,
            curr_state,
            trans.clone(),
            running_rx.clone(),
        )));

        let cons = ConsContext {
            state: cons_state,
            oracle,
            collector: collector.clone(),
            trans: trans.clone(),
            graph,
            to_hash_sign: to_hash_sign_tx,
            signed_state_freq: config.signed_state_freq.max(1),
            last_snapshot_round: -1,
        };
        handles.push(tokio::spawn(run_cons(for_cons_rx, cons, running_rx.clone())));

        handles.push(tokio::spawn(signed_state::run_hash_sign_worker(
            to_hash_sign_rx,
            keypair,
            for_sigs_tx,
            running_rx.clone(),
        )));

        handles.push(tokio::spawn(run_sigs(
            for_sigs_rx,
            self_id,
            collector.clone(),
            trans.clone(),
            freeze.clone(),
            running_rx,
        )));

        Self {
            trans,
            freeze,
            collector,
            for_curr: for_curr_tx,
            for_cons: for_cons_tx,
            running_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Hands a gossiped event to the pre-consensus state.
    pub async fn ingest_event(&self, event: Arc<Event>) -> Result<()> {
        self.for_curr
            .send(IntakeItem::Event(event))
            .await
            .map_err(|_| Error::PipelineClosed)
    }

    /// Hands a consensus-ordered event to the consensus state. Called by the
    /// consensus oracle's feed, in consensus order.
    pub async fn consensus_event(&self, event: Arc<Event>) -> Result<()> {
        self.for_cons
            .send(event)
            .await
            .map_err(|_| Error::PipelineClosed)
    }

    /// Stages a transaction and pokes a blocked pre-consensus consumer.
    pub fn offer_transaction(&self, tx: Transaction) -> Result<()> {
        self.trans.offer(tx)?;
        // best effort: a full queue means the consumer is busy anyway
        let _ = self.for_curr.try_send(IntakeItem::NoEvent);
        Ok(())
    }

    /// The staged transaction queues.
    pub fn trans(&self) -> &Arc<TransLists> {
        &self.trans
    }

    /// The freeze state machine.
    pub fn freeze(&self) -> &Arc<FreezeControl> {
        &self.freeze
    }

    /// The signature collector.
    pub fn collector(&self) -> &Arc<SigCollector> {
        &self.collector
    }

    /// Stops every consumer, drains and clears the queues. Afterwards the
    /// node may rebuild its states (`load_graph_from_signed_state`, then a
    /// fresh `start`).
    pub async fn stop_and_clear(&self) {
        let _ = self.running_tx.send(false);
        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("pipeline lock poisoned")
            .drain(..)
            .collect();
        let joins = handles.into_iter().map(|mut handle| async move {
            if tokio::time::timeout(Duration::from_millis(JOIN_WAIT_MS), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        });
        let _ = futures::future::join_all(joins).await;
        self.trans.clear();
        info!("{}", LogMarker::PipelineStopped);
    }
}

/// Restores the non-ancient shadow graph from a signed state's event
/// history. Events may be recorded in any order.
pub fn load_graph_from_signed_state(state: &SignedState, graph: &mut ShadowGraph) -> usize {
    if let Some((_, min_gen)) = state.min_gen_info.last() {
        graph.expire_below(*min_gen);
    }
    graph.insert_many(state.events.clone())
}

async fn run_curr(
    mut rx: mpsc::Receiver<IntakeItem>,
    mut state: Box<dyn ApplicationState>,
    trans: Arc<TransLists>,
    mut running: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
                continue;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        if let IntakeItem::Event(event) = item {
            state.handle_pre_consensus(&event);
        }
        while let Some(tx) = trans.poll_curr() {
            state.handle_transaction(&tx);
        }
        tokio::task::yield_now().await;
    }
    drain(&mut rx);
    trace!("{} for_curr", LogMarker::PipelineCleared);
}

async fn run_cons(
    mut rx: mpsc::Receiver<Arc<Event>>,
    mut ctx: ConsContext,
    mut running: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
                continue;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        ctx.state.handle_consensus(&event);
        while let Some(tx) = ctx.trans.poll_cons() {
            ctx.state.handle_transaction(&tx);
        }
        // route committee state signatures to the collector
        for tx in event.transactions() {
            if let Transaction::System {
                kind: SystemTxKind::StateSig | SystemTxKind::StateSigFreeze,
                payload,
            } = tx
            {
                if let Err(err) = ctx
                    .collector
                    .record_member_sig(event.creator_id(), payload.clone())
                {
                    debug!(
                        "discarding state signature from {}: {err}",
                        event.creator_id()
                    );
                }
            }
        }
        maybe_snapshot(&mut ctx, &event).await;
        tokio::task::yield_now().await;
    }
    drain(&mut rx);
    trace!("{} for_cons", LogMarker::PipelineCleared);
}

async fn maybe_snapshot(ctx: &mut ConsContext, event: &Event) {
    let round = ctx.oracle.round_created(event);
    if round < 0 || round < ctx.last_snapshot_round + ctx.signed_state_freq as Round {
        return;
    }
    ctx.last_snapshot_round = round;
    let events = { ctx.graph.read().await.forest_dfs(None) };
    let state = SignedState {
        round,
        min_gen_info: vec![(round, ctx.oracle.min_gen_of_round(round))],
        app_snapshot: ctx.state.snapshot(),
        events,
        hash: None,
    };
    if ctx.to_hash_sign.send(state).await.is_err() {
        trace!("hash-sign queue closed; dropping snapshot of round {round}");
    }
}

async fn run_sigs(
    mut rx: mpsc::Receiver<(SignedState, Signature)>,
    self_id: MemberId,
    collector: Arc<SigCollector>,
    trans: Arc<TransLists>,
    freeze: Arc<FreezeControl>,
    mut running: watch::Receiver<bool>,
) {
    loop {
        let (state, sig) = tokio::select! {
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
                continue;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let round = state.round;
        let hash = state.hash.unwrap_or_else(|| state.compute_hash());
        collector.record_own(Arc::new(state), self_id, sig);

        let kind = if freeze.stage() == FreezeStage::InFreeze {
            SystemTxKind::StateSigFreeze
        } else {
            SystemTxKind::StateSig
        };
        let tx = Transaction::System {
            kind,
            payload: signed_state::encode_state_sig(round, &hash, &sig),
        };
        if let Err(err) = trans.offer(tx) {
            warn!("could not stage state signature for round {round}: {err}");
        }
        tokio::task::yield_now().await;
    }
    drain(&mut rx);
    trace!("{} for_sigs", LogMarker::PipelineCleared);
}

fn drain<T>(rx: &mut mpsc::Receiver<T>) {
    while rx.try_recv().is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::{AddressBook, Member};
    use crate::consensus::FixedOracle;
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingState {
        pre: Arc<AtomicUsize>,
        cons: Arc<AtomicUsize>,
        txs: Arc<AtomicUsize>,
    }

    impl ApplicationState for CountingState {
        fn handle_pre_consensus(&mut self, _event: &Event) {
            let _ = self.pre.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_consensus(&mut self, _event: &Event) {
            let _ = self.cons.fetch_add(1, Ordering::SeqCst);
        }
        fn handle_transaction(&mut self, _tx: &Transaction) {
            let _ = self.txs.fetch_add(1, Ordering::SeqCst);
        }
        fn snapshot(&self) -> Bytes {
            Bytes::from(format!("{}", self.cons.load(Ordering::SeqCst)))
        }
    }

    fn single_member_book(keypair: &Keypair) -> Arc<AddressBook> {
        Arc::new(AddressBook::new(vec![Member {
            id: 0,
            nickname: "m0".to_string(),
            public_key: keypair.public,
            internal_addr: "127.0.0.1:0".parse().expect("addr"),
            external_addr: "127.0.0.1:0".parse().expect("addr"),
            stake: 1,
        }]))
    }

    fn start_flow(
        keypair: Keypair,
        curr: CountingState,
        cons: CountingState,
    ) -> (EventFlow, Arc<SigCollector>) {
        let config = Config::default();
        let book = single_member_book(&keypair);
        let collector = Arc::new(SigCollector::new(book, 10));
        let trans = Arc::new(TransLists::new(
            config.throttle_transaction_queue_size,
            config.max_transaction_bytes_per_event,
            false,
        ));
        let flow = EventFlow::start(
            &config,
            0,
            Arc::new(keypair),
            Arc::new(FixedOracle::default()),
            Arc::new(RwLock::new(ShadowGraph::new())),
            collector.clone(),
            trans,
            Arc::new(FreezeControl::new()),
            Box::new(curr),
            Box::new(cons),
        );
        (flow, collector)
    }

    #[tokio::test]
    async fn events_flow_to_both_states_and_states_get_signed() {
        let keypair = Keypair::generate(&mut OsRng);
        let curr = CountingState::default();
        let cons = CountingState::default();
        let pre_count = curr.pre.clone();
        let cons_count = cons.cons.clone();

        let mut builder =
            crate::event::test_utils::EventBuilder::new(0, Keypair::generate(&mut OsRng));
        let event = Arc::new(builder.next_with_payload(b"tx"));

        let (flow, collector) = start_flow(keypair, curr, cons);

        flow.ingest_event(event.clone()).await.expect("ingests");
        flow.consensus_event(event).await.expect("delivers");

        // the consensus event triggers a snapshot at round 0, which the
        // worker hashes and self-signs
        tokio::time::timeout(Duration::from_secs(5), async {
            while collector.last_complete_round() < 0 || pre_count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("state reaches supermajority of one");

        assert_eq!(pre_count.load(Ordering::SeqCst), 1);
        assert_eq!(cons_count.load(Ordering::SeqCst), 1);
        // the self signature rode back in as a staged system transaction
        assert!(flow.trans().pending_freeze_transactions() == 0);
        flow.stop_and_clear().await;
    }

    #[tokio::test]
    async fn no_event_token_unblocks_transaction_feedback() {
        let keypair = Keypair::generate(&mut OsRng);
        let curr = CountingState::default();
        let cons = CountingState::default();
        let tx_count = curr.txs.clone();
        let (flow, _collector) = start_flow(keypair, curr, cons);

        // no event in sight, the token alone must wake the consumer
        flow.offer_transaction(Transaction::User(Bytes::from_static(b"ping")))
            .expect("accepted");

        // fast-copy model: trans_curr is unused, so feedback count stays
        // zero but the pipeline must stay healthy
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tx_count.load(Ordering::SeqCst), 0);
        flow.stop_and_clear().await;
    }

    #[test]
    fn reload_graph_from_a_signed_state() {
        use crate::event::test_utils::EventBuilder;
        let mut builder = EventBuilder::new(0, Keypair::generate(&mut OsRng));
        let mut events: Vec<Arc<Event>> = (0..4)
            .map(|ix| Arc::new(builder.next_with_payload(format!("{ix}").as_bytes())))
            .collect();
        // any on-disk order must restore
        events.reverse();
        let state = SignedState {
            round: 3,
            min_gen_info: vec![(3, 1)],
            app_snapshot: Bytes::from_static(b"app"),
            events,
            hash: None,
        };
        let mut graph = ShadowGraph::new();
        let restored = load_graph_from_signed_state(&state, &mut graph);
        // the generation-zero event is below the restored ancient floor
        assert_eq!(restored, 3);
        assert_eq!(graph.expired_floor(), 1);
        assert_eq!(graph.tips().len(), 1);
    }

    #[tokio::test]
    async fn stop_and_clear_clears_staging() {
        let keypair = Keypair::generate(&mut OsRng);
        let (flow, _) = start_flow(keypair, CountingState::default(), CountingState::default());
        flow.offer_transaction(Transaction::User(Bytes::from_static(b"pending")))
            .expect("accepted");
        flow.stop_and_clear().await;
        assert_eq!(flow.trans().pending_user_transactions(), 0);
        // producers now observe a closed pipeline
        let mut builder =
            crate::event::test_utils::EventBuilder::new(0, Keypair::generate(&mut OsRng));
        let event = Arc::new(builder.next_with_payload(b"late"));
        assert!(flow.ingest_event(event).await.is_err());
    }
}
