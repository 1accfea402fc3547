// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Events: the DAG vertices exchanged by gossip.

mod transaction;
pub(crate) mod wire;

pub use transaction::{SystemTxKind, Transaction};

use crate::address_book::{AddressBook, MemberId};
use crate::error::{Error, Result};

use bytes::BytesMut;
use ed25519_dalek::{Keypair, Signature, Signer, Verifier};
use hex_fmt::HexFmt;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tiny_keccak::{Hasher, Sha3};

/// Claimed generation of an absent parent.
pub const NO_PARENT_GEN: i64 = -1;

/// Creator id slot of an absent other-parent.
pub const NO_OTHER_PARENT: i64 = -1;

/// 32-byte SHA3-256 digest of the hashed portion of an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventHash(pub [u8; 32]);

impl EventHash {
    pub(crate) const SIZE: usize = 32;

    /// The all-zero digest written in place of an absent parent.
    pub(crate) const ZERO: EventHash = EventHash([0; 32]);
}

impl Debug for EventHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "EventHash({:.8})", HexFmt(&self.0))
    }
}

impl Display for EventHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:.8}", HexFmt(&self.0))
    }
}

/// The hashed portion of an event. Immutable once hashed.
#[derive(Debug, Clone)]
pub struct EventData {
    /// Who created this event.
    pub creator_id: MemberId,
    /// Per-creator sequence; zero iff there is no self-parent.
    pub creator_seq: u64,
    /// Creator of the other-parent, `-1` when absent.
    pub other_id: i64,
    /// Sequence of the other-parent under its creator, `-1` when absent.
    pub other_seq: i64,
    /// Digest of the previous event by the same creator.
    pub self_parent_hash: Option<EventHash>,
    /// Digest of the gossip partner's event this one descends from.
    pub other_parent_hash: Option<EventHash>,
    /// Claimed generation of the self-parent, `-1` when absent.
    pub self_parent_gen: i64,
    /// Claimed generation of the other-parent, `-1` when absent.
    pub other_parent_gen: i64,
    /// Wall clock at the creator.
    pub time_created: SystemTime,
    /// Payloads, in creator order.
    pub transactions: Vec<Transaction>,
}

impl EventData {
    /// `digest(creator_id ‖ self_parent_hash ‖ other_parent_hash ‖
    /// self_parent_gen ‖ other_parent_gen ‖ time_created ‖ transactions)`.
    pub fn base_hash(&self) -> EventHash {
        let mut sha3 = Sha3::v256();
        sha3.update(&self.creator_id.to_be_bytes());
        sha3.update(&self.self_parent_hash.unwrap_or(EventHash::ZERO).0);
        sha3.update(&self.other_parent_hash.unwrap_or(EventHash::ZERO).0);
        sha3.update(&self.self_parent_gen.to_be_bytes());
        sha3.update(&self.other_parent_gen.to_be_bytes());
        let (secs, nanos) = epoch_parts(self.time_created);
        sha3.update(&secs.to_be_bytes());
        sha3.update(&nanos.to_be_bytes());
        let mut txs = BytesMut::new();
        for tx in &self.transactions {
            wire::write_transaction(&mut txs, tx);
        }
        sha3.update(&txs);
        let mut out = [0u8; 32];
        sha3.finalize(&mut out);
        EventHash(out)
    }
}

/// An event: hashed data plus the creator's signature over the digest.
#[derive(Debug, Clone)]
pub struct Event {
    data: EventData,
    signature: Signature,
    hash: EventHash,
    generation: u64,
}

impl Event {
    /// Hashes and signs `data` with the creator's keypair.
    pub fn new_signed(data: EventData, keypair: &Keypair) -> Self {
        let hash = data.base_hash();
        let signature = keypair.sign(&hash.0);
        Self::assemble(data, signature, hash)
    }

    /// Rebuilds an event received off the wire. The digest is recomputed
    /// locally, never trusted from the peer.
    pub(crate) fn from_parts(data: EventData, signature: Signature) -> Self {
        let hash = data.base_hash();
        Self::assemble(data, signature, hash)
    }

    fn assemble(data: EventData, signature: Signature, hash: EventHash) -> Self {
        let generation = (data.self_parent_gen.max(data.other_parent_gen) + 1).max(0) as u64;
        Self {
            data,
            signature,
            hash,
            generation,
        }
    }

    /// The base hash identifying this event.
    pub fn hash(&self) -> &EventHash {
        &self.hash
    }

    /// `max(parent generations) + 1`; zero for an orphan.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Who created this event.
    pub fn creator_id(&self) -> MemberId {
        self.data.creator_id
    }

    /// Position in the creator's chain.
    pub fn creator_seq(&self) -> u64 {
        self.data.creator_seq
    }

    /// Creator wall clock.
    pub fn time_created(&self) -> SystemTime {
        self.data.time_created
    }

    /// Digest of the self-parent, if any.
    pub fn self_parent_hash(&self) -> Option<&EventHash> {
        self.data.self_parent_hash.as_ref()
    }

    /// Digest of the other-parent, if any.
    pub fn other_parent_hash(&self) -> Option<&EventHash> {
        self.data.other_parent_hash.as_ref()
    }

    /// Payloads in creator order.
    pub fn transactions(&self) -> &[Transaction] {
        &self.data.transactions
    }

    /// The hashed portion.
    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub(crate) fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Structural well-formedness that needs no graph context: sequence zero
    /// iff no self-parent, parent generation sentinels consistent with
    /// parent hashes, creator present in the book, and a verifying
    /// signature.
    pub fn check_well_formed(&self, book: &AddressBook) -> Result<()> {
        let data = &self.data;
        if (data.creator_seq == 0) != data.self_parent_hash.is_none() {
            return Err(Error::MalformedEvent(format!(
                "creator_seq {} inconsistent with self-parent presence",
                data.creator_seq
            )));
        }
        if data.self_parent_hash.is_none() && data.self_parent_gen != NO_PARENT_GEN {
            return Err(Error::MalformedEvent(
                "self-parent generation without a self-parent".to_string(),
            ));
        }
        if data.other_parent_hash.is_none()
            && (data.other_parent_gen != NO_PARENT_GEN || data.other_id != NO_OTHER_PARENT)
        {
            return Err(Error::MalformedEvent(
                "other-parent fields without an other-parent".to_string(),
            ));
        }
        let member = book
            .get(data.creator_id)
            .ok_or(Error::UnknownCreator(data.creator_id))?;
        self.verify_signature(&member.public_key)
    }

    /// Checks the creator's signature over the base hash.
    pub fn verify_signature(&self, public_key: &ed25519_dalek::PublicKey) -> Result<()> {
        public_key
            .verify(&self.hash.0, &self.signature)
            .map_err(|_| Error::BadSignature(self.data.creator_id))
    }
}

pub(crate) fn epoch_parts(time: SystemTime) -> (i64, i32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => (since.as_secs() as i64, since.subsec_nanos() as i32),
        // pre-epoch clocks only show up in tests with synthetic times
        Err(err) => {
            let before = err.duration();
            (-(before.as_secs() as i64), -(before.subsec_nanos() as i32))
        }
    }
}

pub(crate) fn from_epoch_parts(secs: i64, nanos: i32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos.max(0) as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, (-nanos).max(0) as u32)
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    //! Builders for events in tests.

    use super::*;
    use bytes::Bytes;

    /// A minimal chain-building helper around one creator's keypair.
    pub struct EventBuilder {
        /// Creator this builder signs for.
        pub creator_id: MemberId,
        /// Signing key.
        pub keypair: Keypair,
        seq: u64,
        last: Option<(EventHash, u64)>,
    }

    impl EventBuilder {
        /// New builder starting an empty chain.
        pub fn new(creator_id: MemberId, keypair: Keypair) -> Self {
            Self {
                creator_id,
                keypair,
                seq: 0,
                last: None,
            }
        }

        /// Next event in this creator's chain, optionally with an
        /// other-parent `(creator, seq, hash, generation)`.
        pub fn next(
            &mut self,
            other: Option<(MemberId, u64, EventHash, u64)>,
            transactions: Vec<Transaction>,
        ) -> Event {
            let (self_parent_hash, self_parent_gen) = match self.last {
                Some((hash, gen)) => (Some(hash), gen as i64),
                None => (None, NO_PARENT_GEN),
            };
            let (other_id, other_seq, other_parent_hash, other_parent_gen) = match other {
                Some((id, seq, hash, gen)) => (id as i64, seq as i64, Some(hash), gen as i64),
                None => (NO_OTHER_PARENT, -1, None, NO_PARENT_GEN),
            };
            let data = EventData {
                creator_id: self.creator_id,
                creator_seq: self.seq,
                other_id,
                other_seq,
                self_parent_hash,
                other_parent_hash,
                self_parent_gen,
                other_parent_gen,
                time_created: SystemTime::now(),
                transactions,
            };
            let event = Event::new_signed(data, &self.keypair);
            self.last = Some((*event.hash(), event.generation()));
            self.seq += 1;
            event
        }

        /// Next event with a single user transaction.
        pub fn next_with_payload(&mut self, payload: &[u8]) -> Event {
            self.next(
                None,
                vec![Transaction::User(Bytes::copy_from_slice(payload))],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::rngs::OsRng;

    fn keypair() -> Keypair {
        Keypair::generate(&mut OsRng)
    }

    fn orphan_data(creator_id: MemberId) -> EventData {
        EventData {
            creator_id,
            creator_seq: 0,
            other_id: NO_OTHER_PARENT,
            other_seq: -1,
            self_parent_hash: None,
            other_parent_hash: None,
            self_parent_gen: NO_PARENT_GEN,
            other_parent_gen: NO_PARENT_GEN,
            time_created: SystemTime::now(),
            transactions: vec![Transaction::User(Bytes::from_static(b"tx"))],
        }
    }

    #[test]
    fn orphan_generation_is_zero() {
        let event = Event::new_signed(orphan_data(0), &keypair());
        assert_eq!(event.generation(), 0);
    }

    #[test]
    fn generation_is_max_parent_plus_one() {
        let mut data = orphan_data(0);
        data.creator_seq = 3;
        data.self_parent_hash = Some(EventHash([1; 32]));
        data.self_parent_gen = 4;
        data.other_id = 1;
        data.other_seq = 0;
        data.other_parent_hash = Some(EventHash([2; 32]));
        data.other_parent_gen = 7;
        let event = Event::new_signed(data, &keypair());
        assert_eq!(event.generation(), 8);
    }

    #[test]
    fn hash_covers_transactions() {
        let pair = keypair();
        let a = Event::new_signed(orphan_data(0), &pair);
        let mut data = orphan_data(0);
        data.transactions = vec![Transaction::User(Bytes::from_static(b"other"))];
        data.time_created = a.time_created();
        let b = Event::new_signed(data, &pair);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn signature_round_trip() {
        let pair = keypair();
        let public = pair.public;
        let event = Event::new_signed(orphan_data(0), &pair);
        assert!(event.verify_signature(&public).is_ok());

        let wrong = keypair().public;
        assert!(event.verify_signature(&wrong).is_err());
    }

    #[test]
    fn seq_parent_mismatch_is_malformed() {
        let mut data = orphan_data(0);
        data.creator_seq = 1; // claims a self-parent it does not carry
        let event = Event::new_signed(data, &keypair());
        let book = crate::address_book::AddressBook::new(vec![]);
        assert!(matches!(
            event.check_well_formed(&book),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn epoch_parts_round_trip() {
        let now = SystemTime::now();
        let (secs, nanos) = epoch_parts(now);
        assert_eq!(from_epoch_parts(secs, nanos), now);
    }
}
