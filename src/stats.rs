// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Lock-free node counters and the per-sync stopwatch.
//!
//! Counters are observability only: readers may see transiently inconsistent
//! combinations and that is fine.

use std::fmt::{self, Debug, Formatter};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

const ORDER: Ordering = Ordering::Relaxed;

/// Counters shared across the node; cheap to clone.
#[derive(Clone, Default)]
pub struct NodeStats {
    inner: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    syncs_completed: AtomicU64,
    interrupted_calls: AtomicU64,
    interrupted_receives: AtomicU64,
    events_read: AtomicU64,
    events_written: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    events_created: AtomicU64,
    duplicate_events: AtomicU64,
}

impl NodeStats {
    /// Fresh zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn sync_completed(&self, events_read: u64, events_written: u64) {
        let _ = self.inner.syncs_completed.fetch_add(1, ORDER);
        let _ = self.inner.events_read.fetch_add(events_read, ORDER);
        let _ = self.inner.events_written.fetch_add(events_written, ORDER);
    }

    pub(crate) fn sync_interrupted(&self, caller: bool) {
        let counter = if caller {
            &self.inner.interrupted_calls
        } else {
            &self.inner.interrupted_receives
        };
        let _ = counter.fetch_add(1, ORDER);
    }

    pub(crate) fn add_bytes(&self, read: u64, written: u64) {
        let _ = self.inner.bytes_read.fetch_add(read, ORDER);
        let _ = self.inner.bytes_written.fetch_add(written, ORDER);
    }

    pub(crate) fn event_created(&self) {
        let _ = self.inner.events_created.fetch_add(1, ORDER);
    }

    pub(crate) fn duplicate_event(&self) {
        let _ = self.inner.duplicate_events.fetch_add(1, ORDER);
    }

    /// Completed syncs so far.
    pub fn syncs_completed(&self) -> u64 {
        self.inner.syncs_completed.load(ORDER)
    }

    /// Syncs this node initiated that failed mid-flight.
    pub fn interrupted_calls(&self) -> u64 {
        self.inner.interrupted_calls.load(ORDER)
    }

    /// Syncs this node accepted that failed mid-flight.
    pub fn interrupted_receives(&self) -> u64 {
        self.inner.interrupted_receives.load(ORDER)
    }

    /// Events pulled in over gossip.
    pub fn events_read(&self) -> u64 {
        self.inner.events_read.load(ORDER)
    }

    /// Events pushed out over gossip.
    pub fn events_written(&self) -> u64 {
        self.inner.events_written.load(ORDER)
    }

    /// Bytes read off gossip sockets.
    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(ORDER)
    }

    /// Bytes written to gossip sockets.
    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(ORDER)
    }

    /// Self events created.
    pub fn events_created(&self) -> u64 {
        self.inner.events_created.load(ORDER)
    }
}

impl Debug for NodeStats {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("NodeStats")
            .field("syncs_completed", &self.syncs_completed())
            .field("events_read", &self.events_read())
            .field("events_written", &self.events_written())
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

/// Six timestamps around the sync phase boundaries.
///
/// `t[0]` start, `t[1]` tips written+read, `t[2]` needs calculated, `t[3]`
/// booleans exchanged, `t[4]` event streams drained, `t[5]` finalised.
#[derive(Debug, Clone)]
pub struct SyncTiming {
    marks: [Instant; 6],
    next: usize,
}

impl SyncTiming {
    pub(crate) fn started() -> Self {
        Self {
            marks: [Instant::now(); 6],
            next: 1,
        }
    }

    /// Records the next phase boundary. Extra marks fold into the last slot
    /// rather than panicking; accuracy here is not a correctness concern.
    pub(crate) fn mark(&mut self) {
        let slot = self.next.min(5);
        self.marks[slot] = Instant::now();
        self.next = slot + 1;
    }

    /// Duration of phase `n` in `1..=5`.
    pub fn phase(&self, n: usize) -> Duration {
        let n = n.clamp(1, 5);
        self.marks[n].saturating_duration_since(self.marks[n - 1])
    }

    /// Whole-sync duration.
    pub fn total(&self) -> Duration {
        self.marks[5].saturating_duration_since(self.marks[0])
    }

    /// Aggregate throughput over the sync.
    pub fn bytes_per_second(&self, bytes: u64) -> f64 {
        let secs = self.total().as_secs_f64();
        if secs > 0.0 {
            bytes as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = NodeStats::new();
        stats.sync_completed(2, 0);
        stats.sync_completed(0, 3);
        stats.sync_interrupted(true);
        stats.add_bytes(10, 20);
        assert_eq!(stats.syncs_completed(), 2);
        assert_eq!(stats.events_read(), 2);
        assert_eq!(stats.events_written(), 3);
        assert_eq!(stats.interrupted_calls(), 1);
        assert_eq!(stats.interrupted_receives(), 0);
        assert_eq!(stats.bytes_written(), 20);
    }

    #[test]
    fn timing_marks_are_monotonic() {
        let mut timing = SyncTiming::started();
        for _ in 0..5 {
            timing.mark();
        }
        let sum: Duration = (1..=5).map(|n| timing.phase(n)).sum();
        assert!(sum <= timing.total() + Duration::from_millis(1));
    }
}
