// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Interface to the virtual-voting consensus collaborator.
//!
//! The fame-decision algorithm itself lives outside this crate; the gossip
//! core only needs round assignments and the ancient-generation floor.

use crate::event::Event;

/// Round number assigned to an event, `-1` before any round exists.
pub type Round = i64;

/// The consensus collaborator consulted by gossip and event flow.
pub trait ConsensusOracle: Send + Sync {
    /// Round in which this event was created, per the witness structure of
    /// its ancestry.
    fn round_created(&self, event: &Event) -> Round;

    /// The latest created round known to the oracle.
    fn max_round(&self) -> Round;

    /// Events at generations below this are ancient: excluded from gossip
    /// and evicted from the shadow graph.
    fn min_generation_non_ancient(&self) -> u64;

    /// Minimum generation of the famous witnesses of `round`, used in signed
    /// state round boundaries. Default: the global non-ancient floor.
    fn min_gen_of_round(&self, _round: Round) -> u64 {
        self.min_generation_non_ancient()
    }
}

/// Fixed-function oracle for tests and simulations: rounds are generations
/// divided by a constant, and nothing ever goes ancient unless told to.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct FixedOracle {
    /// Generations per round.
    pub gens_per_round: u64,
    /// Reported non-ancient floor.
    pub min_non_ancient: std::sync::atomic::AtomicU64,
    /// Reported latest round.
    pub latest_round: std::sync::atomic::AtomicI64,
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for FixedOracle {
    fn default() -> Self {
        Self {
            gens_per_round: 1,
            min_non_ancient: std::sync::atomic::AtomicU64::new(0),
            latest_round: std::sync::atomic::AtomicI64::new(0),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl ConsensusOracle for FixedOracle {
    fn round_created(&self, event: &Event) -> Round {
        (event.generation() / self.gens_per_round.max(1)) as Round
    }

    fn max_round(&self) -> Round {
        self.latest_round.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn min_generation_non_ancient(&self) -> u64 {
        self.min_non_ancient
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}
