// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! End-to-end gossip scenarios: committees of real nodes syncing over
//! loopback TCP.

use bytes::Bytes;
use ed25519_dalek::Keypair;
use eyre::Result;
use hashmesh::comms::ConnectionGraph;
use hashmesh::consensus::{ConsensusOracle, Round};
use hashmesh::event::Event;
use hashmesh::event_flow::ApplicationState;
use hashmesh::{AddressBook, Config, Error, Member, Node, Transaction};
use rand::rngs::OsRng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Default)]
struct TestOracle {
    floor: AtomicU64,
}

impl ConsensusOracle for TestOracle {
    fn round_created(&self, event: &Event) -> Round {
        event.generation() as Round
    }

    fn max_round(&self) -> Round {
        0
    }

    fn min_generation_non_ancient(&self) -> u64 {
        self.floor.load(Ordering::Relaxed)
    }
}

struct NullState;

impl ApplicationState for NullState {
    fn handle_pre_consensus(&mut self, _event: &Event) {}
    fn handle_consensus(&mut self, _event: &Event) {}
    fn snapshot(&self) -> Bytes {
        Bytes::from_static(b"state")
    }
}

struct TestNet {
    nodes: Vec<Node>,
    oracles: Vec<Arc<TestOracle>>,
}

impl TestNet {
    async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// A config that keeps the background heartbeat out of the way so tests can
/// drive syncs deterministically.
fn quiet_config() -> Config {
    Config {
        sleep_heartbeat: Duration::from_secs(3600),
        rescue_childless_inverse_probability: 0,
        ..Config::default()
    }
}

async fn start_committee(stakes: &[u64], config: Config) -> Result<TestNet> {
    hashmesh::testing::init_test_logger();
    let mut listeners = Vec::new();
    for _ in stakes {
        listeners.push(TcpListener::bind("127.0.0.1:0").await?);
    }
    let keypairs: Vec<Keypair> = stakes.iter().map(|_| Keypair::generate(&mut OsRng)).collect();
    let members: Vec<Member> = stakes
        .iter()
        .zip(keypairs.iter())
        .zip(listeners.iter())
        .enumerate()
        .map(|(id, ((stake, keypair), listener))| {
            let addr = listener.local_addr().expect("bound");
            Member {
                id: id as u64,
                nickname: format!("node{id}"),
                public_key: keypair.public,
                internal_addr: addr,
                external_addr: addr,
                stake: *stake,
            }
        })
        .collect();
    let book = AddressBook::new(members);
    let topology = ConnectionGraph::complete(stakes.len());

    let mut nodes = Vec::new();
    let mut oracles = Vec::new();
    for (id, (keypair, listener)) in keypairs.into_iter().zip(listeners).enumerate() {
        let oracle = Arc::new(TestOracle::default());
        oracles.push(oracle.clone());
        nodes.push(
            Node::start(
                config.clone(),
                book.clone(),
                topology.clone(),
                id as u64,
                keypair,
                oracle,
                Box::new(NullState),
                Box::new(NullState),
                listener,
            )
            .await?,
        );
    }
    Ok(TestNet { nodes, oracles })
}

async fn graph_len(node: &Node) -> usize {
    node.context().graph.read().await.len()
}

async fn wait_for_graph_len(node: &Node, want: usize) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while graph_len(node).await < want {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_gossip_transfers_the_chain() -> Result<()> {
    let net = start_committee(&[1, 1], quiet_config()).await?;

    // node 0 creates a two-event chain
    net.nodes[0].create_event(None).await?;
    net.nodes[0].create_event(None).await?;
    assert_eq!(graph_len(&net.nodes[0]).await, 2);

    // node 1 pulls it over
    let outcome = net.nodes[1].sync_with(0).await?;
    assert_eq!(outcome.events_read, 2);
    assert_eq!(outcome.events_written, 0);

    wait_for_graph_len(&net.nodes[1], 2).await?;

    // parent wiring survived the transfer on the receiving side
    let tips: Vec<_> = {
        let graph = net.nodes[1].context().graph.read().await;
        graph
            .tips()
            .iter()
            .map(|s| (*s.event().hash(), s.event().creator_seq()))
            .collect()
    };
    assert_eq!(tips.len(), 1);
    assert_eq!(tips[0].1, 1);

    net.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tip_dedup_sends_only_the_new_event() -> Result<()> {
    let net = start_committee(&[1, 1], quiet_config()).await?;

    // freeze the serving node so it does not append a post-sync event of
    // its own between the two measured syncs
    net.nodes[0]
        .context()
        .flow
        .freeze()
        .freeze_started()
        .expect("transition");

    net.nodes[0].create_event(None).await?;
    let first = net.nodes[1].sync_with(0).await?;
    assert_eq!(first.events_read, 1);
    wait_for_graph_len(&net.nodes[1], 1).await?;

    // a shared tip now exists; only the fresh event should travel
    net.nodes[0].create_event(None).await?;
    let second = net.nodes[1].sync_with(0).await?;
    assert_eq!(second.events_read, 1);
    assert_eq!(second.events_written, 0);
    wait_for_graph_len(&net.nodes[1], 2).await?;

    net.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn throttle7_pads_a_quiet_sync() -> Result<()> {
    let config = Config {
        throttle7: true,
        throttle7_max_bytes: 10_000,
        throttle7_extra: 0.1,
        throttle7_threshold: 1.0,
        ..quiet_config()
    };
    let padding_budget = 1_000; // max_bytes * extra
    let net = start_committee(&[1, 1], config).await?;

    // zero event bytes moved is below threshold x max, so padding engages
    let outcome = net.nodes[1].sync_with(0).await?;
    assert_eq!(outcome.events_read, 0);
    assert_eq!(outcome.events_written, 0);

    let conn = net.nodes[1]
        .comm()
        .get(0)
        .expect("connection still registered");
    assert!(
        conn.bytes_written() >= padding_budget,
        "caller wrote {} bytes, padding budget is {padding_budget}",
        conn.bytes_written()
    );

    net.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fallen_behind_is_reported_over_the_wire() -> Result<()> {
    let net = start_committee(&[1, 1], quiet_config()).await?;

    // node 1 has an old chain; node 0's ancient floor then leaps ahead
    net.nodes[1].create_event(None).await?;
    net.oracles[0].floor.store(100, Ordering::Relaxed);

    let err = net.nodes[1].sync_with(0).await.expect_err("behind");
    assert!(matches!(err, Error::FallenBehind), "{err:?}");
    assert!(net.nodes[1].context().manager.fallen_behind().is_suspected());

    net.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fallen_behind_threshold_and_reset() -> Result<()> {
    let config = Config {
        fallen_behind_threshold: 0.5,
        ..quiet_config()
    };
    let net = start_committee(&[1, 1, 1, 1], config).await?;
    let tracker = net.nodes[0].context().manager.fallen_behind();

    for reporter in [1u64, 2, 3] {
        tracker.report_fallen_behind(reporter);
    }
    assert!(tracker.has_fallen_behind());
    let mut reconnect = tracker.neighbors_for_reconnect();
    reconnect.sort_unstable();
    assert_eq!(reconnect, vec![1, 2, 3]);

    tracker.reset();
    assert!(!tracker.has_fallen_behind());

    net.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn freeze_vetoes_event_creation_but_sync_continues() -> Result<()> {
    let net = start_committee(&[1, 1], quiet_config()).await?;
    let ctx = net.nodes[0].context();

    ctx.flow.freeze().freeze_started().expect("transition");
    let outcome = hashmesh::sync_manager::SyncOutcome {
        caller: true,
        other_id: 1,
        events_read: 1,
        events_written: 1,
    };
    assert!(!ctx.manager.should_create_event(&outcome));
    assert!(ctx.flow.freeze().should_sync());

    // gossip still works while frozen
    let synced = net.nodes[1].sync_with(0).await?;
    assert_eq!(synced.events_read, 0);

    net.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn transactions_ride_created_events_across_the_wire() -> Result<()> {
    let net = start_committee(&[1, 1], quiet_config()).await?;

    net.nodes[0].submit_transaction(Bytes::from_static(b"hello ledger"))?;
    net.nodes[0].create_event(None).await?;

    let outcome = net.nodes[1].sync_with(0).await?;
    assert_eq!(outcome.events_read, 1);
    wait_for_graph_len(&net.nodes[1], 1).await?;

    let carried = {
        let graph = net.nodes[1].context().graph.read().await;
        let tips = graph.tips();
        tips[0].event().transactions().to_vec()
    };
    assert_eq!(
        carried,
        vec![Transaction::User(Bytes::from_static(b"hello ledger"))]
    );

    net.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bidirectional_sync_converges_disjoint_extensions() -> Result<()> {
    let net = start_committee(&[1, 1], quiet_config()).await?;

    // both sides extend independently
    for _ in 0..3 {
        net.nodes[0].create_event(None).await?;
    }
    for _ in 0..2 {
        net.nodes[1].create_event(None).await?;
    }

    let outcome = net.nodes[1].sync_with(0).await?;
    assert_eq!(outcome.events_read, 3);
    assert_eq!(outcome.events_written, 2);

    wait_for_graph_len(&net.nodes[1], 5).await?;
    wait_for_graph_len(&net.nodes[0], 5).await?;

    net.shutdown().await;
    Ok(())
}
