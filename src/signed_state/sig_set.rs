// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::address_book::{is_supermajority, AddressBook, MemberId, Stake};

use ed25519_dalek::Signature;
use std::collections::BTreeMap;

/// Signatures collected over one signed state.
#[derive(Debug, Default, Clone)]
pub struct SigSet {
    sigs: BTreeMap<MemberId, Signature>,
    stake_collected: Stake,
}

impl SigSet {
    /// Adds a member's signature; returns false for a repeat.
    pub fn add(&mut self, member: MemberId, stake: Stake, sig: Signature) -> bool {
        if self.sigs.contains_key(&member) {
            return false;
        }
        let _ = self.sigs.insert(member, sig);
        self.stake_collected += stake;
        true
    }

    /// Stake behind the collected signatures.
    pub fn stake_collected(&self) -> Stake {
        self.stake_collected
    }

    /// How many members have signed.
    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    /// True when nobody has signed yet.
    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }

    /// Every staked member has signed.
    pub fn is_complete(&self, book: &AddressBook) -> bool {
        book.members()
            .filter(|m| !m.is_mirror())
            .all(|m| self.sigs.contains_key(&m.id))
    }

    /// Collected stake exceeds two thirds of the total.
    pub fn has_supermajority(&self, total_stake: Stake) -> bool {
        is_supermajority(self.stake_collected, total_stake)
    }

    /// The collected signatures in member order.
    pub fn signatures(&self) -> impl Iterator<Item = (&MemberId, &Signature)> {
        self.sigs.iter()
    }
}
