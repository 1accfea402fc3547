// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Signed states: periodic snapshots of the consensus application state,
//! hashed, self-signed and cross-signed by the committee.

mod sig_set;

pub use sig_set::SigSet;

use crate::address_book::{AddressBook, MemberId};
use crate::consensus::Round;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::LogMarker;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use ed25519_dalek::{Keypair, Signature, Signer, Verifier};
use hex_fmt::HexFmt;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tiny_keccak::{Hasher, Sha3};

/// 32-byte SHA3-256 digest over a signed state.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHash(pub [u8; 32]);

impl Debug for StateHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "StateHash({:.8})", HexFmt(&self.0))
    }
}

/// An application-state snapshot at a round boundary.
#[derive(Debug, Clone)]
pub struct SignedState {
    /// The consensus round this state reflects.
    pub round: Round,
    /// Minimum famous-witness generation at the boundary; what a restart
    /// needs to rebuild the ancient floor.
    pub min_gen_info: Vec<(Round, u64)>,
    /// Serialized application state; opaque to the core.
    pub app_snapshot: Bytes,
    /// Non-ancient events to reload the shadow graph from.
    pub events: Vec<Arc<Event>>,
    /// Filled in by the hash-sign worker.
    pub hash: Option<StateHash>,
}

impl SignedState {
    /// SHA3-256 over the snapshot and round boundary.
    pub fn compute_hash(&self) -> StateHash {
        let mut sha3 = Sha3::v256();
        sha3.update(&self.round.to_be_bytes());
        sha3.update(&self.app_snapshot);
        for (round, gen) in &self.min_gen_info {
            sha3.update(&round.to_be_bytes());
            sha3.update(&gen.to_be_bytes());
        }
        let mut out = [0u8; 32];
        sha3.finalize(&mut out);
        StateHash(out)
    }
}

// On-disk layout handed to the signed-state persistence collaborator.
#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedState {
    round: Round,
    min_gen_info: Vec<(Round, u64)>,
    #[serde(with = "serde_bytes")]
    app_snapshot: Vec<u8>,
    events: Vec<serde_bytes::ByteBuf>,
    hash: Option<[u8; 32]>,
}

impl SignedState {
    /// Serializes for the on-disk signed-state file.
    pub fn encode(&self) -> Result<Bytes> {
        let events = self
            .events
            .iter()
            .map(|event| {
                let mut buf = BytesMut::new();
                crate::event::wire::write_event(&mut buf, event);
                serde_bytes::ByteBuf::from(buf.to_vec())
            })
            .collect();
        let persisted = PersistedState {
            round: self.round,
            min_gen_info: self.min_gen_info.clone(),
            app_snapshot: self.app_snapshot.to_vec(),
            events,
            hash: self.hash.map(|h| h.0),
        };
        Ok(Bytes::from(bincode::serialize(&persisted)?))
    }

    /// Reads back a state written by [`SignedState::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let persisted: PersistedState = bincode::deserialize(bytes)?;
        let events = persisted
            .events
            .into_iter()
            .map(|raw| crate::event::wire::read_event(Bytes::from(raw.into_vec())).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            round: persisted.round,
            min_gen_info: persisted.min_gen_info,
            app_snapshot: Bytes::from(persisted.app_snapshot),
            events,
            hash: persisted.hash.map(StateHash),
        })
    }
}

/// Payload of a `STATE_SIG` system transaction.
pub(crate) fn encode_state_sig(round: Round, hash: &StateHash, sig: &Signature) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + 32 + 64);
    buf.put_i64(round);
    buf.put_slice(&hash.0);
    buf.put_slice(&sig.to_bytes());
    buf.freeze()
}

pub(crate) fn decode_state_sig(mut payload: Bytes) -> Result<(Round, StateHash, Signature)> {
    if payload.remaining() < 8 + 32 {
        return Err(Error::TruncatedRecord(8 + 32 - payload.remaining()));
    }
    let round = payload.get_i64();
    let mut hash = [0u8; 32];
    payload.copy_to_slice(&mut hash);
    let sig = Signature::try_from(&payload[..])
        .map_err(|_| Error::MalformedEvent("state signature bytes".to_string()))?;
    Ok((round, StateHash(hash), sig))
}

#[derive(Debug, Default)]
struct RoundSigs {
    hash: Option<StateHash>,
    state: Option<Arc<SignedState>>,
    set: SigSet,
}

/// Per-round signature bookkeeping.
///
/// `last_complete_round` is the most recent round whose collected stake
/// reached a supermajority.
pub struct SigCollector {
    book: Arc<AddressBook>,
    rounds: DashMap<Round, RoundSigs>,
    last_complete_round: AtomicI64,
    newest_hashed_round: AtomicI64,
    max_rounds_kept: usize,
}

impl Debug for SigCollector {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("SigCollector")
            .field("rounds_tracked", &self.rounds.len())
            .field("last_complete_round", &self.last_complete_round())
            .finish()
    }
}

impl SigCollector {
    /// New collector over the committee.
    pub fn new(book: Arc<AddressBook>, max_rounds_kept: usize) -> Self {
        Self {
            book,
            rounds: DashMap::new(),
            last_complete_round: AtomicI64::new(-1),
            newest_hashed_round: AtomicI64::new(-1),
            max_rounds_kept: max_rounds_kept.max(1),
        }
    }

    /// Registers our own hash of `state` together with the self-signature.
    pub fn record_own(&self, state: Arc<SignedState>, self_id: MemberId, sig: Signature) {
        let round = state.round;
        let hash = match state.hash {
            Some(hash) => hash,
            None => state.compute_hash(),
        };
        {
            let mut entry = self.rounds.entry(round).or_default();
            entry.hash = Some(hash);
            entry.state = Some(state);
            let _ = entry
                .set
                .add(self_id, self.book.stake_of(self_id), sig);
        }
        let _ = self
            .newest_hashed_round
            .fetch_max(round, Ordering::Relaxed);
        self.check_progress(round);
        self.prune();
    }

    /// Folds in a `STATE_SIG` transaction from `member`. A signature over a
    /// hash that disagrees with ours is dropped with a warning; disagreement
    /// is for the consensus layer to resolve, not gossip.
    pub fn record_member_sig(&self, member: MemberId, payload: Bytes) -> Result<()> {
        let (round, hash, sig) = decode_state_sig(payload)?;
        let public_key = self
            .book
            .get(member)
            .ok_or(Error::UnknownCreator(member))?
            .public_key;
        public_key
            .verify(&hash.0, &sig)
            .map_err(|_| Error::BadSignature(member))?;
        {
            let mut entry = self.rounds.entry(round).or_default();
            if let Some(ours) = entry.hash {
                if ours != hash {
                    warn!(
                        "member {} signed a different state for round {}",
                        member, round
                    );
                    return Ok(());
                }
            }
            let _ = entry.set.add(member, self.book.stake_of(member), sig);
        }
        self.check_progress(round);
        Ok(())
    }

    fn check_progress(&self, round: Round) {
        if let Some(entry) = self.rounds.get(&round) {
            if entry.set.has_supermajority(self.book.total_stake()) {
                let prev = self.last_complete_round.fetch_max(round, Ordering::Relaxed);
                if round > prev {
                    info!("{} round {}", LogMarker::StateSupermajority, round);
                }
            }
            if entry.set.is_complete(&self.book) {
                debug!("{} round {}", LogMarker::StateSigSetComplete, round);
            }
        }
    }

    fn prune(&self) {
        let complete = self.last_complete_round();
        if self.rounds.len() > self.max_rounds_kept {
            self.rounds.retain(|round, _| *round >= complete);
        }
    }

    /// The most recent round that reached a signature supermajority.
    pub fn last_complete_round(&self) -> Round {
        self.last_complete_round.load(Ordering::Relaxed)
    }

    /// True while some hashed state newer than the last supermajority is
    /// still collecting signatures; gossip must keep running to finish it.
    pub fn has_unfinished_state(&self) -> bool {
        self.newest_hashed_round.load(Ordering::Relaxed) > self.last_complete_round()
    }

    /// The signature set for `round`, if tracked.
    pub fn sig_set(&self, round: Round) -> Option<SigSet> {
        self.rounds.get(&round).map(|entry| entry.set.clone())
    }

    /// The most recent supermajority state, pinned as the current consensus
    /// state.
    pub fn current_state(&self) -> Option<Arc<SignedState>> {
        let round = self.last_complete_round();
        self.rounds
            .get(&round)
            .and_then(|entry| entry.state.clone())
    }
}

/// Hashes and self-signs states from the `state_to_hash_sign` queue,
/// handing the result to the signature-aggregation queue.
pub(crate) async fn run_hash_sign_worker(
    mut rx: tokio::sync::mpsc::Receiver<SignedState>,
    keypair: Arc<Keypair>,
    for_sigs: tokio::sync::mpsc::Sender<(SignedState, Signature)>,
    mut running: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let mut state = tokio::select! {
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
                continue;
            }
            state = rx.recv() => match state {
                Some(state) => state,
                None => break,
            },
        };
        let hash = state.compute_hash();
        state.hash = Some(hash);
        let round = state.round;
        let sig = keypair.sign(&hash.0);
        debug!("{} round {}", LogMarker::StateHashSigned, round);
        if for_sigs.send((state, sig)).await.is_err() {
            trace!("signature queue closed; dropping state of round {round}");
            break;
        }
        tokio::task::yield_now().await;
    }
    trace!("hash-sign worker stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_book::Member;
    use rand::rngs::OsRng;

    fn committee(stakes: &[u64]) -> (Arc<AddressBook>, Vec<Keypair>) {
        let keypairs: Vec<Keypair> =
            stakes.iter().map(|_| Keypair::generate(&mut OsRng)).collect();
        let members = stakes
            .iter()
            .zip(keypairs.iter())
            .enumerate()
            .map(|(id, (stake, pair))| Member {
                id: id as MemberId,
                nickname: format!("m{id}"),
                public_key: pair.public,
                internal_addr: "127.0.0.1:0".parse().expect("addr"),
                external_addr: "127.0.0.1:0".parse().expect("addr"),
                stake: *stake,
            })
            .collect();
        (Arc::new(AddressBook::new(members)), keypairs)
    }

    fn state(round: Round) -> SignedState {
        SignedState {
            round,
            min_gen_info: vec![(round, 0)],
            app_snapshot: Bytes::from_static(b"app bytes"),
            events: vec![],
            hash: None,
        }
    }

    #[test]
    fn state_sig_payload_round_trip() {
        let keypair = Keypair::generate(&mut OsRng);
        let hash = state(3).compute_hash();
        let sig = keypair.sign(&hash.0);
        let payload = encode_state_sig(3, &hash, &sig);
        let (round, decoded_hash, decoded_sig) = decode_state_sig(payload).expect("decodes");
        assert_eq!(round, 3);
        assert_eq!(decoded_hash, hash);
        assert_eq!(decoded_sig, sig);
    }

    #[test]
    fn collector_reaches_supermajority_and_prunes() {
        let (book, keypairs) = committee(&[1, 1, 1]);
        let collector = SigCollector::new(book.clone(), 2);

        let own = Arc::new(SignedState {
            hash: Some(state(0).compute_hash()),
            ..state(0)
        });
        let hash = own.hash.expect("hashed");
        collector.record_own(own, 0, keypairs[0].sign(&hash.0));
        assert_eq!(collector.last_complete_round(), -1);
        assert!(collector.has_unfinished_state());

        for member in 1..3u64 {
            let sig = keypairs[member as usize].sign(&hash.0);
            collector
                .record_member_sig(member, encode_state_sig(0, &hash, &sig))
                .expect("valid sig");
        }
        assert_eq!(collector.last_complete_round(), 0);
        assert!(!collector.has_unfinished_state());
        assert!(collector.current_state().is_some());
    }

    #[test]
    fn persisted_state_round_trip() {
        use crate::event::test_utils::EventBuilder;
        let mut builder = EventBuilder::new(0, Keypair::generate(&mut OsRng));
        let e0 = Arc::new(builder.next_with_payload(b"a"));
        let e1 = Arc::new(builder.next_with_payload(b"b"));
        let mut state = SignedState {
            round: 5,
            min_gen_info: vec![(5, 1)],
            app_snapshot: Bytes::from_static(b"app"),
            events: vec![e0, e1.clone()],
            hash: None,
        };
        state.hash = Some(state.compute_hash());

        let bytes = state.encode().expect("encodes");
        let decoded = SignedState::decode(&bytes).expect("decodes");
        assert_eq!(decoded.round, 5);
        assert_eq!(decoded.min_gen_info, vec![(5, 1)]);
        assert_eq!(decoded.hash, state.hash);
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.events[1].hash(), e1.hash());
    }

    #[test]
    fn bad_member_signature_is_rejected() {
        let (book, keypairs) = committee(&[1, 1]);
        let collector = SigCollector::new(book, 4);
        let hash = state(1).compute_hash();
        // signed by the wrong key
        let sig = keypairs[0].sign(&hash.0);
        let err = collector
            .record_member_sig(1, encode_state_sig(1, &hash, &sig))
            .expect_err("wrong signer");
        assert!(matches!(err, Error::BadSignature(1)));
    }
}
