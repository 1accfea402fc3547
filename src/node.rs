// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! One gossiping committee member, wired together.

use crate::address_book::{AddressBook, MemberId};
use crate::comms::{Comm, ConnectionGraph};
use crate::config::Config;
use crate::consensus::ConsensusOracle;
use crate::error::Result;
use crate::event::Transaction;
use crate::event_flow::{ApplicationState, EventFlow, FreezeControl, TransLists};
use crate::gossip::{self, SyncContext};
use crate::quorum::QuorumTracker;
use crate::shadow_graph::ShadowGraph;
use crate::signed_state::SigCollector;
use crate::stats::NodeStats;
use crate::sync_manager::{SyncManager, SyncOutcome};

use bytes::Bytes;
use ed25519_dalek::Keypair;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};

const INBOUND_CONNECTION_BACKLOG: usize = 64;

/// A running node: comms, gossip loops, event flow and their shared state.
pub struct Node {
    ctx: Arc<SyncContext>,
    comm: Arc<Comm>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("self_id", &self.ctx.self_id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Node {
    /// Starts the full stack on an already-bound listener.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: Config,
        book: AddressBook,
        topology: ConnectionGraph,
        self_id: MemberId,
        keypair: Keypair,
        oracle: Arc<dyn ConsensusOracle>,
        curr_state: Box<dyn ApplicationState>,
        cons_state: Box<dyn ApplicationState>,
        listener: TcpListener,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let config = Arc::new(config);
        let book = Arc::new(book);
        let topology = Arc::new(topology);
        let keypair = Arc::new(keypair);
        let graph = Arc::new(RwLock::new(ShadowGraph::new()));
        let stats = NodeStats::new();

        let trans = Arc::new(TransLists::new(
            config.throttle_transaction_queue_size,
            config.max_transaction_bytes_per_event,
            false,
        ));
        let freeze = Arc::new(FreezeControl::new());
        let collector = Arc::new(SigCollector::new(
            book.clone(),
            config.maximum_virtual_map_size,
        ));
        let quorum = Arc::new(QuorumTracker::stake_based(
            &book,
            config.enable_beta_mirror,
        ));
        let manager = Arc::new(SyncManager::new(
            config.clone(),
            self_id,
            book.len(),
            topology.clone(),
            quorum.clone(),
            trans.clone(),
            freeze.clone(),
            collector.clone(),
            Arc::new(AtomicUsize::new(0)),
        ));

        let flow = Arc::new(EventFlow::start(
            &config,
            self_id,
            keypair.clone(),
            oracle.clone(),
            graph.clone(),
            collector,
            trans,
            freeze,
            curr_state,
            cons_state,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let intake_bound = config.event_intake_queue_throttle_size.max(1) * 2;
        let (intake_tx, intake_rx) = mpsc::channel(intake_bound);

        let ctx = Arc::new(SyncContext {
            config: config.clone(),
            book: book.clone(),
            self_id,
            keypair,
            graph,
            oracle,
            manager,
            quorum,
            flow,
            stats,
            intake_tx,
            shutdown: shutdown_rx.clone(),
        });

        let comm = Arc::new(Comm::new(self_id, book, topology, config));

        let verifier = gossip::verification_pool(&ctx.config)?;
        let _ = tokio::spawn(gossip::run_intake(ctx.clone(), intake_rx, verifier));

        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CONNECTION_BACKLOG);
        let _ = tokio::spawn(comm.clone().run_accept_loop(
            listener,
            inbound_tx,
            shutdown_rx.clone(),
        ));
        {
            let ctx = ctx.clone();
            let _ = tokio::spawn(async move {
                while let Some(conn) = inbound_rx.recv().await {
                    let _ = tokio::spawn(gossip::serve_connection(ctx.clone(), conn));
                }
            });
        }
        let _ = tokio::spawn(gossip::run_caller_loop(ctx.clone(), comm.clone()));

        Ok(Self {
            ctx,
            comm,
            local_addr,
            shutdown_tx,
        })
    }

    /// Our member id.
    pub fn id(&self) -> MemberId {
        self.ctx.self_id
    }

    /// Where the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gossip and pipeline internals; what tests and tooling poke at.
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Connection registry and dialling.
    pub fn comm(&self) -> &Arc<Comm> {
        &self.comm
    }

    /// Node counters.
    pub fn stats(&self) -> &NodeStats {
        &self.ctx.stats
    }

    /// Submits a user transaction for inclusion in a future self event.
    pub fn submit_transaction(&self, payload: Bytes) -> Result<()> {
        self.ctx.flow.offer_transaction(Transaction::User(payload))
    }

    /// Synchronously triggers one outbound sync; the heartbeat loop does
    /// this on its own, this is for tooling and tests.
    pub async fn sync_with(&self, peer: MemberId) -> Result<SyncOutcome> {
        let conn = self.comm.get_or_connect(peer).await?;
        gossip::initiate_sync(&self.ctx, &conn).await
    }

    /// Creates a self event outside the usual post-sync path.
    pub async fn create_event(&self, other_creator: Option<MemberId>) -> Result<()> {
        let _ = gossip::create_event(&self.ctx, other_creator).await?;
        Ok(())
    }

    /// Stops gossip loops and the pipeline, drops connections.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.ctx.flow.stop_and_clear().await;
        for member in self.ctx.book.members() {
            self.comm.disconnect(member.id);
        }
    }
}
