// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Gossip: the sync engine plus the loops that drive it.

mod sync;

pub use sync::run_sync;

use crate::address_book::{AddressBook, MemberId};
use crate::comms::{Comm, Connection};
use crate::config::Config;
use crate::consensus::ConsensusOracle;
use crate::error::{Error, Result};
use crate::event::{Event, EventData, NO_OTHER_PARENT, NO_PARENT_GEN};
use crate::event_flow::EventFlow;
use crate::quorum::QuorumTracker;
use crate::shadow_graph::ShadowGraph;
use crate::stats::NodeStats;
use crate::sync_manager::SyncManager;
use crate::LogMarker;

use ed25519_dalek::Keypair;
use rand::Rng;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, watch, RwLock};

// Negotiation bytes ahead of phase 1.
const SYNC_REQUEST: u8 = 0x4e;
const SYNC_ACCEPT: u8 = 0x4f;
const SYNC_REJECT: u8 = 0x50;

/// Shared handles every gossip task works against.
pub struct SyncContext {
    /// Node configuration.
    pub config: Arc<Config>,
    /// The committee.
    pub book: Arc<AddressBook>,
    /// Our id.
    pub self_id: MemberId,
    /// Our signing key.
    pub keypair: Arc<Keypair>,
    /// The shadow graph.
    pub graph: Arc<RwLock<ShadowGraph>>,
    /// The consensus collaborator.
    pub oracle: Arc<dyn ConsensusOracle>,
    /// The control plane.
    pub manager: Arc<SyncManager>,
    /// Per-round event statistics.
    pub quorum: Arc<QuorumTracker>,
    /// The event pipeline.
    pub flow: Arc<EventFlow>,
    /// Node counters.
    pub stats: NodeStats,
    /// Where gossiped events go for verification and insertion.
    pub intake_tx: mpsc::Sender<Arc<Event>>,
    /// Cooperative shutdown flag.
    pub shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("self_id", &self.self_id)
            .finish()
    }
}

/// Caller side of the negotiation, then the sync itself.
pub async fn initiate_sync(
    ctx: &SyncContext,
    conn: &Arc<Connection>,
) -> Result<crate::sync_manager::SyncOutcome> {
    {
        let mut writer = conn.writer.lock().await;
        writer.write_frame(&[SYNC_REQUEST]).await?;
    }
    let answer = {
        let mut reader = conn.reader.lock().await;
        reader.read_frame().await?
    };
    match answer.first().copied() {
        Some(SYNC_ACCEPT) => run_sync(ctx, conn, true).await,
        Some(SYNC_REJECT) => {
            trace!("{} by {}", LogMarker::SyncRejected, conn.other_id);
            Err(Error::SyncRejected)
        }
        other => Err(Error::UnexpectedFrameTag(other.unwrap_or(0))),
    }
}

/// Serves one inbound connection: answer sync requests until the socket or
/// the node goes away. The connection belongs to this task alone and closes
/// with it.
pub async fn serve_connection(ctx: Arc<SyncContext>, conn: Arc<Connection>) {
    loop {
        if *ctx.shutdown.borrow() {
            break;
        }
        let request = {
            let mut reader = conn.reader.lock().await;
            reader.read_frame().await
        };
        let tag = match request {
            Ok(frame) => frame.first().copied(),
            // idle listeners see timeouts between requests; keep waiting
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::TimedOut => continue,
            Err(err) => {
                debug!("listener to {} closing: {}", conn.other_id, err);
                break;
            }
        };
        if tag != Some(SYNC_REQUEST) {
            debug!(
                "listener to {} got unexpected tag {:?}; closing",
                conn.other_id, tag
            );
            break;
        }
        let accept = ctx.manager.should_accept_sync() && ctx.flow.freeze().should_sync();
        let answer = if accept { SYNC_ACCEPT } else { SYNC_REJECT };
        {
            let mut writer = conn.writer.lock().await;
            if let Err(err) = writer.write_frame(&[answer]).await {
                debug!("listener to {} closing: {}", conn.other_id, err);
                break;
            }
        }
        if !accept {
            trace!("{} from {}", LogMarker::SyncRejected, conn.other_id);
            continue;
        }
        match run_sync(&ctx, &conn, false).await {
            Ok(outcome) => {
                if ctx.manager.should_create_event(&outcome) {
                    if let Err(err) = create_event(&ctx, Some(conn.other_id)).await {
                        warn!("could not create event after sync: {err}");
                    }
                }
            }
            Err(Error::FallenBehind) => continue,
            Err(err) => {
                if err.is_protocol() {
                    warn!("peer {} broke protocol: {err}", conn.other_id);
                }
                break;
            }
        }
    }
    debug!("{} listener to {}", LogMarker::ConnectionClosed, conn.other_id);
}

/// The heartbeat caller loop: pick a neighbour, sync, maybe create an
/// event; reconnect when fallen behind.
pub async fn run_caller_loop(ctx: Arc<SyncContext>, comm: Arc<Comm>) {
    loop {
        tokio::time::sleep(ctx.config.sleep_heartbeat).await;
        if *ctx.shutdown.borrow() {
            break;
        }
        if ctx.manager.fallen_behind().has_fallen_behind() {
            reconnect(&ctx, &comm).await;
            continue;
        }
        if !ctx.manager.should_initiate_sync() || !ctx.manager.trans_throttle() {
            continue;
        }
        for target in ctx.manager.neighbors_to_call() {
            let conn = match comm.get_or_connect(target).await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!("cannot reach {target}: {err}");
                    comm.disconnect(target);
                    continue;
                }
            };
            match initiate_sync(&ctx, &conn).await {
                Ok(outcome) => {
                    if ctx.manager.should_create_event(&outcome) {
                        if let Err(err) = create_event(&ctx, Some(target)).await {
                            warn!("could not create event after sync: {err}");
                        }
                    }
                    break;
                }
                Err(Error::SyncRejected) | Err(Error::FallenBehind) => break,
                Err(err) => {
                    debug!("sync with {target} failed: {err}");
                    comm.disconnect(target);
                    if err.is_protocol() {
                        // do not immediately re-dial a peer that broke protocol
                        break;
                    }
                }
            }
        }
    }
}

/// Fallen behind for real: drop current gossip state and start over against
/// the members that reported us. Reloading a signed state is the state
/// manager's job; gossip resets its own trackers and connections.
async fn reconnect(ctx: &SyncContext, comm: &Arc<Comm>) {
    let targets = ctx.manager.fallen_behind().neighbors_for_reconnect();
    warn!("{} via {:?}", LogMarker::Reconnecting, targets);
    for member in ctx.book.members() {
        comm.disconnect(member.id);
    }
    ctx.manager.fallen_behind().reset();
    ctx.manager.reset_calls_since_start();
    for target in targets {
        if comm.get_or_connect(target).await.is_ok() {
            break;
        }
    }
}

/// The intake task: verify signatures on the worker pool, insert into the
/// shadow graph, feed the pipeline and the round statistics.
pub async fn run_intake(
    ctx: Arc<SyncContext>,
    mut rx: mpsc::Receiver<Arc<Event>>,
    verifier: Arc<rayon::ThreadPool>,
) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let _ = ctx
            .manager
            .intake_depth()
            .fetch_sub(1, Ordering::Relaxed);

        let book = ctx.book.clone();
        let checked = {
            let event = event.clone();
            verifier.install(move || event.check_well_formed(&book))
        };
        if let Err(err) = checked {
            warn!("discarding event from {}: {err}", event.creator_id());
            continue;
        }

        let inserted = {
            let mut graph = ctx.graph.write().await;
            graph.expire_below(ctx.oracle.min_generation_non_ancient());
            graph.insert(event.clone())
        };
        match inserted {
            Ok(true) => {
                ctx.quorum
                    .record_event(event.creator_id(), ctx.oracle.round_created(&event));
                if ctx.flow.ingest_event(event).await.is_err() {
                    trace!("pipeline closed; intake stopping");
                    break;
                }
            }
            Ok(false) => {} // ancient on arrival
            Err(Error::DuplicateEvent) => ctx.stats.duplicate_event(),
            Err(err) => {
                warn!("discarding event: {err}");
            }
        }
        tokio::task::yield_now().await;
    }
    trace!("intake task stopping");
}

/// Creates, signs and ingests a self event, with the freshest event of
/// `other_creator` as other-parent.
pub async fn create_event(ctx: &SyncContext, other_creator: Option<MemberId>) -> Result<Arc<Event>> {
    let transactions = ctx.flow.trans().poll_trans_for_event();
    let (self_parent, other_parent) = {
        let graph = ctx.graph.read().await;
        let self_parent = latest_of(&graph, ctx.self_id);
        let other = pick_other_parent(ctx, &graph, other_creator);
        (self_parent, other)
    };

    let (self_parent_hash, self_parent_gen, creator_seq, parent_time) = match &self_parent {
        Some(parent) => (
            Some(*parent.hash()),
            parent.generation() as i64,
            parent.creator_seq() + 1,
            Some(parent.time_created()),
        ),
        None => (None, NO_PARENT_GEN, 0, None),
    };
    let (other_id, other_seq, other_parent_hash, other_parent_gen) = match &other_parent {
        Some(parent) => (
            parent.creator_id() as i64,
            parent.creator_seq() as i64,
            Some(*parent.hash()),
            parent.generation() as i64,
        ),
        None => (NO_OTHER_PARENT, -1, None, NO_PARENT_GEN),
    };

    // time must not run backwards along the self-parent chain
    let mut time_created = SystemTime::now();
    if let Some(parent_time) = parent_time {
        if time_created <= parent_time {
            time_created = parent_time + std::time::Duration::from_nanos(1);
        }
    }

    let data = EventData {
        creator_id: ctx.self_id,
        creator_seq,
        other_id,
        other_seq,
        self_parent_hash,
        other_parent_hash,
        self_parent_gen,
        other_parent_gen,
        time_created,
        transactions,
    };
    let event = Arc::new(Event::new_signed(data, &ctx.keypair));

    {
        let mut graph = ctx.graph.write().await;
        let _ = graph.insert(event.clone())?;
    }
    ctx.quorum
        .record_event(ctx.self_id, ctx.oracle.round_created(&event));
    ctx.stats.event_created();
    debug!("{} {} seq={}", LogMarker::EventCreated, event.hash(), event.creator_seq());
    ctx.flow.ingest_event(event.clone()).await?;
    Ok(event)
}

fn latest_of(graph: &ShadowGraph, creator: MemberId) -> Option<Arc<Event>> {
    graph
        .tips()
        .iter()
        .filter(|shadow| shadow.event().creator_id() == creator)
        .max_by_key(|shadow| shadow.event().creator_seq())
        .map(|shadow| shadow.event().clone())
}

/// Normally the sync partner's freshest event; occasionally a childless
/// event from elsewhere gets rescued instead, so no chain starves.
fn pick_other_parent(
    ctx: &SyncContext,
    graph: &ShadowGraph,
    other_creator: Option<MemberId>,
) -> Option<Arc<Event>> {
    let mut rng = rand::thread_rng();
    let rescue_p = ctx.config.rescue_childless_inverse_probability;
    if rescue_p > 0 && rng.gen_range(0, rescue_p) == 0 {
        let childless: Vec<Arc<Event>> = graph
            .tips()
            .iter()
            .filter(|shadow| {
                let id = shadow.event().creator_id();
                id != ctx.self_id && Some(id) != other_creator
            })
            .map(|shadow| shadow.event().clone())
            .collect();
        if !childless.is_empty() {
            let pick = rng.gen_range(0, childless.len());
            return Some(childless[pick].clone());
        }
    }
    other_creator.and_then(|creator| latest_of(graph, creator))
}

/// Spawns the rayon pool for signature verification.
pub fn verification_pool(config: &Config) -> Result<Arc<rayon::ThreadPool>> {
    let threads = if config.verification_pool_size == 0 {
        num_cpus::get_physical()
    } else {
        config.verification_pool_size
    };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|ix| format!("sig-verify-{ix}"))
        .build()
        .map(Arc::new)
        .map_err(|err| Error::Io(io::Error::new(io::ErrorKind::Other, err)))
}

#[allow(unused_imports)]
pub(crate) use sync::{TAG_DONE, TAG_EVENT, TAG_PADDING};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_bytes_are_distinct() {
        // protocol constants must not collide with the stream tags
        let all = [
            SYNC_REQUEST,
            SYNC_ACCEPT,
            SYNC_REJECT,
            TAG_DONE,
            TAG_EVENT,
            TAG_PADDING,
        ];
        for (ix, a) in all.iter().enumerate() {
            for b in &all[ix + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
