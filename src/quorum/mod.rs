// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-round, stake-weighted event statistics feeding peer selection and
//! event-creation policy.
//!
//! Members that have created few events this round form the *critical
//! quorum*: the bottom slice whose aggregate weight is still a strong
//! minority. Syncing with them first drags the slowest third forward, which
//! is what advances consensus.

use crate::address_book::{is_strong_minority, AddressBook, MemberId, Stake};
use crate::consensus::Round;

use std::sync::RwLock;

/// Event counts above this are clamped into the last bucket.
const MAX_TRACKED_EVENTS: usize = 100;

/// Tracks, for the latest created round, how many events each member has
/// created and how much weight sits at each count.
///
/// Two variants share this type: stake-based (production) weighs members by
/// stake; count-based (stakeless test committees) weighs every member at
/// one. Both answer the same predicate.
#[derive(Debug)]
pub struct QuorumTracker {
    weights: Vec<Stake>,
    total_weight: Stake,
    mirrors_participate: bool,
    state: RwLock<RoundState>,
}

#[derive(Debug)]
struct RoundState {
    round: Round,
    events_by_member: Vec<u32>,
    weight_by_event_count: Vec<Stake>,
    threshold: u32,
}

impl RoundState {
    fn fresh(round: Round, n: usize, total_weight: Stake) -> Self {
        let mut weight_by_event_count = vec![0; MAX_TRACKED_EVENTS];
        // every member has created at least zero events
        weight_by_event_count[0] = total_weight;
        Self {
            round,
            events_by_member: vec![0; n],
            weight_by_event_count,
            threshold: 0,
        }
    }

    fn recompute_threshold(&mut self, total_weight: Stake) {
        // weight_by_event_count is non-increasing in k, so take the last k
        // still holding a strong minority
        self.threshold = self
            .weight_by_event_count
            .iter()
            .enumerate()
            .rev()
            .find(|(_, weight)| is_strong_minority(**weight, total_weight))
            .map(|(k, _)| k as u32)
            .unwrap_or(0);
    }
}

impl QuorumTracker {
    /// Production variant: members weighted by stake; mirrors excluded
    /// unless beta-mirror mode is on.
    pub fn stake_based(book: &AddressBook, mirrors_participate: bool) -> Self {
        let weights: Vec<Stake> = book.members().map(|m| m.stake).collect();
        Self::from_weights(weights, mirrors_participate)
    }

    /// Test-committee variant: every member weighs one.
    pub fn count_based(n: usize) -> Self {
        Self::from_weights(vec![1; n], true)
    }

    fn from_weights(weights: Vec<Stake>, mirrors_participate: bool) -> Self {
        let total_weight = weights.iter().sum();
        let n = weights.len();
        Self {
            weights,
            total_weight,
            mirrors_participate,
            state: RwLock::new(RoundState::fresh(-1, n, total_weight)),
        }
    }

    /// Folds one ingested event into the statistics. A later round than the
    /// tracked one resets the arrays wholesale; earlier rounds are stale and
    /// ignored.
    pub fn record_event(&self, creator: MemberId, round: Round) {
        let ix = creator as usize;
        if ix >= self.weights.len() {
            return;
        }
        let mut state = self.state.write().expect("quorum lock poisoned");
        if round > state.round {
            *state = RoundState::fresh(round, self.weights.len(), self.total_weight);
        } else if round < state.round {
            return;
        }
        state.events_by_member[ix] += 1;
        let k = (state.events_by_member[ix] as usize).min(MAX_TRACKED_EVENTS - 1);
        state.weight_by_event_count[k] += self.weights[ix];
        state.recompute_threshold(self.total_weight);
    }

    /// Whether `id` sits in the bottom slice this round.
    pub fn is_in_critical_quorum(&self, id: MemberId) -> bool {
        let ix = id as usize;
        let weight = match self.weights.get(ix) {
            Some(weight) => *weight,
            None => return false,
        };
        if weight == 0 && !self.mirrors_participate {
            return false;
        }
        let state = self.state.read().expect("quorum lock poisoned");
        state.events_by_member[ix] <= state.threshold
    }

    /// The round currently tracked.
    pub fn tracked_round(&self) -> Round {
        self.state.read().expect("quorum lock poisoned").round
    }

    /// The event-count threshold `T` for the tracked round.
    pub fn threshold(&self) -> u32 {
        self.state.read().expect("quorum lock poisoned").threshold
    }

    /// Events created by `id` in the tracked round.
    pub fn events_of(&self, id: MemberId) -> u32 {
        self.state
            .read()
            .expect("quorum lock poisoned")
            .events_by_member
            .get(id as usize)
            .copied()
            .unwrap_or(0)
    }
}
