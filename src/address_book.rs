// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The fixed committee and its stake arithmetic.

use ed25519_dalek::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Committee member identifier; dense in `[0, N)`.
pub type MemberId = u64;

/// Total stake across a set of members.
pub type Stake = u64;

/// Aggregate stake is a strong minority when it is at least a third of the
/// whole.
#[inline]
pub const fn is_strong_minority(part: Stake, total: Stake) -> bool {
    3 * part >= total
}

/// Aggregate stake is a supermajority when it exceeds two thirds of the
/// whole (i.e. > 2/3).
#[inline]
pub const fn is_supermajority(part: Stake, total: Stake) -> bool {
    3 * part > 2 * total
}

/// One committee member as recorded at genesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Position in the address book.
    pub id: MemberId,
    /// Human readable name, unique in the book; used in the connection
    /// handshake.
    pub nickname: String,
    /// Verifies event and state signatures from this member.
    pub public_key: PublicKey,
    /// Endpoint for peers on the same LAN.
    pub internal_addr: SocketAddr,
    /// Endpoint for peers elsewhere.
    pub external_addr: SocketAddr,
    /// Voting weight. Zero makes this member a mirror.
    pub stake: Stake,
}

impl Member {
    /// Mirrors gossip but never count towards any quorum.
    pub fn is_mirror(&self) -> bool {
        self.stake == 0
    }
}

/// The fixed, ordered committee. Ids are assigned by position so lookups are
/// plain indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressBook {
    members: Vec<Member>,
    total_stake: Stake,
    by_nickname: BTreeMap<String, MemberId>,
}

impl AddressBook {
    /// Builds the book, assigning ids by position.
    pub fn new(mut members: Vec<Member>) -> Self {
        for (ix, member) in members.iter_mut().enumerate() {
            member.id = ix as MemberId;
        }
        let total_stake = members.iter().map(|m| m.stake).sum();
        let by_nickname = members
            .iter()
            .map(|m| (m.nickname.clone(), m.id))
            .collect();
        Self {
            members,
            total_stake,
            by_nickname,
        }
    }

    /// Number of members, mirrors included.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True for an empty committee (only seen in malformed setups).
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Sum of all member stakes.
    pub fn total_stake(&self) -> Stake {
        self.total_stake
    }

    pub(crate) fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.get(id as usize)
    }

    /// Member by handshake nickname.
    pub fn by_nickname(&self, nickname: &str) -> Option<&Member> {
        self.by_nickname
            .get(nickname)
            .and_then(|id| self.get(*id))
    }

    /// Stake of one member, zero when the id is unknown.
    pub fn stake_of(&self, id: MemberId) -> Stake {
        self.get(id).map(|m| m.stake).unwrap_or(0)
    }

    /// Iterate members in id order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strong_minority_boundaries() {
        assert!(!is_strong_minority(0, 3));
        assert!(is_strong_minority(1, 3));
        assert!(!is_strong_minority(2, 7));
        assert!(is_strong_minority(3, 9));
        // empty committee: zero of zero is everything
        assert!(is_strong_minority(0, 0));
    }

    #[test]
    fn supermajority_boundaries() {
        assert!(!is_supermajority(2, 3));
        assert!(is_supermajority(3, 3));
        assert!(!is_supermajority(6, 9));
        assert!(is_supermajority(7, 9));
    }

    proptest! {
        #[test]
        fn proptest_quorum_predicates(total in 1u64..100_000) {
            let third = total / 3;
            // anything strictly below a third is never a strong minority
            if third > 0 {
                prop_assert!(!is_strong_minority(third.saturating_sub(1), total));
            }
            // two thirds plus one is always a supermajority
            prop_assert!(is_supermajority(2 * total / 3 + 1, total));
            // a supermajority is always a strong minority as well
            prop_assert!(is_strong_minority(2 * total / 3 + 1, total));
        }
    }
}
