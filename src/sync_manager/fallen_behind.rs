// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::address_book::MemberId;
use crate::LogMarker;

use itertools::Itertools;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Tracks which neighbours consider this node fallen behind.
///
/// A peer reports us behind during tip exchange when our whole tip set sits
/// below its ancient floor. Enough distinct reporters and the node gives up
/// gossiping forward and reconnects to the reporters to catch up.
#[derive(Debug)]
pub struct FallenBehindTracker {
    neighbors: Vec<MemberId>,
    threshold: f64,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    reported_by: BTreeSet<MemberId>,
    not_yet_reported: BTreeSet<MemberId>,
}

impl FallenBehindTracker {
    /// Tracker over this node's neighbour set.
    pub fn new(neighbors: Vec<MemberId>, threshold: f64) -> Self {
        Self {
            neighbors,
            threshold,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A neighbour said we have fallen behind.
    pub fn report_fallen_behind(&self, reporter: MemberId) {
        let mut inner = self.inner.lock().expect("fallen-behind lock poisoned");
        if inner.reported_by.is_empty() {
            // first report: everyone else still owes us an opinion
            inner.not_yet_reported = self.neighbors.iter().copied().collect();
        }
        let _ = inner.not_yet_reported.remove(&reporter);
        if inner.reported_by.insert(reporter) {
            debug!("{} by {}", LogMarker::FallenBehindReported, reporter);
        }
    }

    /// A neighbour synced us without complaint; any earlier report from it
    /// is stale.
    pub fn report_synced(&self, peer: MemberId) {
        let mut inner = self.inner.lock().expect("fallen-behind lock poisoned");
        let _ = inner.reported_by.remove(&peer);
        let _ = inner.not_yet_reported.remove(&peer);
        if inner.reported_by.is_empty() {
            inner.not_yet_reported.clear();
        }
    }

    /// At least one neighbour thinks we are behind, but not enough to act.
    pub fn is_suspected(&self) -> bool {
        !self
            .inner
            .lock()
            .expect("fallen-behind lock poisoned")
            .reported_by
            .is_empty()
    }

    /// More than `threshold` of the neighbourhood has reported us.
    pub fn has_fallen_behind(&self) -> bool {
        let reports = self
            .inner
            .lock()
            .expect("fallen-behind lock poisoned")
            .reported_by
            .len();
        reports as f64 > self.neighbors.len() as f64 * self.threshold
    }

    /// Neighbours that have not weighed in yet, shuffled.
    pub fn not_yet_reported(&self) -> Vec<MemberId> {
        let mut out = self
            .inner
            .lock()
            .expect("fallen-behind lock poisoned")
            .not_yet_reported
            .iter()
            .copied()
            .collect_vec();
        out.shuffle(&mut rand::thread_rng());
        out
    }

    /// The reporters, shuffled; whom to reconnect through.
    pub fn neighbors_for_reconnect(&self) -> Vec<MemberId> {
        let mut out = self
            .inner
            .lock()
            .expect("fallen-behind lock poisoned")
            .reported_by
            .iter()
            .copied()
            .collect_vec();
        out.shuffle(&mut rand::thread_rng());
        out
    }

    /// Clears all reports, e.g. after a reconnect rebuilt our graph.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("fallen-behind lock poisoned");
        *inner = Inner::default();
    }
}
