// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The four staged transaction queues, updated atomically under one mutex.

use crate::error::{Error, Result};
use crate::event::Transaction;
use crate::LogMarker;

use std::collections::VecDeque;
use std::sync::Mutex;

/// Transaction staging between submission and the application states.
///
/// `offer` is all-or-nothing across the queues it touches; a user
/// transaction is rejected outright when any queue is over the throttle.
#[derive(Debug)]
pub struct TransLists {
    throttle_queue_size: usize,
    max_bytes_per_event: usize,
    uses_work_state: bool,
    inner: Mutex<Queues>,
}

#[derive(Debug, Default)]
struct Queues {
    /// Pending inclusion in the next self event.
    trans_event: VecDeque<Transaction>,
    /// Consumed by the pre-consensus "current" state.
    trans_curr: VecDeque<Transaction>,
    /// Consumed by the scratch "work" state in the non-fast-copy model.
    trans_work: VecDeque<Transaction>,
    /// Consumed by the consensus state.
    trans_cons: VecDeque<Transaction>,
    num_user_trans_event: usize,
    num_freeze_trans_event: usize,
}

impl TransLists {
    /// New staging queues.
    ///
    /// `uses_work_state` mirrors the application model: only the
    /// non-fast-copy model keeps `trans_curr`/`trans_work` populated.
    pub fn new(
        throttle_queue_size: usize,
        max_bytes_per_event: usize,
        uses_work_state: bool,
    ) -> Self {
        Self {
            throttle_queue_size,
            max_bytes_per_event,
            uses_work_state,
            inner: Mutex::new(Queues::default()),
        }
    }

    /// Stages one transaction on every applicable queue, or none at all.
    pub fn offer(&self, tx: Transaction) -> Result<()> {
        let mut queues = self.inner.lock().expect("trans lock poisoned");
        if tx.is_user() && self.any_over_throttle(&queues) {
            trace!("{}", LogMarker::TransactionRejected);
            return Err(Error::QueueFull);
        }
        if tx.is_user() {
            queues.num_user_trans_event += 1;
        }
        if tx.is_freeze_sig() {
            queues.num_freeze_trans_event += 1;
        }
        if self.uses_work_state {
            queues.trans_curr.push_back(tx.clone());
            queues.trans_work.push_back(tx.clone());
        }
        queues.trans_cons.push_back(tx.clone());
        queues.trans_event.push_back(tx);
        Ok(())
    }

    fn any_over_throttle(&self, queues: &Queues) -> bool {
        [
            &queues.trans_event,
            &queues.trans_curr,
            &queues.trans_work,
            &queues.trans_cons,
        ]
        .iter()
        .any(|q| q.len() > self.throttle_queue_size)
    }

    /// Transactions for the next self event: scans from the head, taking
    /// whatever still fits in the byte budget and leaving the rest queued in
    /// order. A transaction larger than the remaining budget is skipped, not
    /// a stopper; a later smaller one may still go.
    pub fn poll_trans_for_event(&self) -> Vec<Transaction> {
        let mut queues = self.inner.lock().expect("trans lock poisoned");
        let mut remaining = self.max_bytes_per_event;
        let mut picked = Vec::new();
        let mut left = VecDeque::with_capacity(queues.trans_event.len());
        while let Some(tx) = queues.trans_event.pop_front() {
            if tx.size() <= remaining {
                remaining -= tx.size();
                if tx.is_user() {
                    queues.num_user_trans_event -= 1;
                }
                if tx.is_freeze_sig() {
                    queues.num_freeze_trans_event -= 1;
                }
                picked.push(tx);
            } else {
                left.push_back(tx);
            }
        }
        queues.trans_event = left;
        picked
    }

    /// Next transaction for the pre-consensus state.
    pub fn poll_curr(&self) -> Option<Transaction> {
        self.inner
            .lock()
            .expect("trans lock poisoned")
            .trans_curr
            .pop_front()
    }

    /// Next transaction for the work state.
    pub fn poll_work(&self) -> Option<Transaction> {
        self.inner
            .lock()
            .expect("trans lock poisoned")
            .trans_work
            .pop_front()
    }

    /// Next transaction for the consensus state.
    pub fn poll_cons(&self) -> Option<Transaction> {
        self.inner
            .lock()
            .expect("trans lock poisoned")
            .trans_cons
            .pop_front()
    }

    /// User transactions still waiting to ride an event.
    pub fn pending_user_transactions(&self) -> usize {
        self.inner
            .lock()
            .expect("trans lock poisoned")
            .num_user_trans_event
    }

    /// Freeze signatures still waiting to ride an event.
    pub fn pending_freeze_transactions(&self) -> usize {
        self.inner
            .lock()
            .expect("trans lock poisoned")
            .num_freeze_trans_event
    }

    /// Drops everything; part of `stop_and_clear`.
    pub fn clear(&self) {
        let mut queues = self.inner.lock().expect("trans lock poisoned");
        *queues = Queues::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SystemTxKind;
    use bytes::Bytes;

    fn user(size: usize) -> Transaction {
        Transaction::User(Bytes::from(vec![0u8; size]))
    }

    fn lists(max_bytes: usize) -> TransLists {
        TransLists::new(100, max_bytes, true)
    }

    #[test]
    fn offer_is_all_or_nothing() {
        let lists = TransLists::new(1, 1024, true);
        lists.offer(user(1)).expect("accepted");
        lists.offer(user(1)).expect("accepted");
        // every queue now holds two, over the throttle of one
        assert!(matches!(lists.offer(user(1)), Err(Error::QueueFull)));
        assert_eq!(lists.pending_user_transactions(), 2);
        // system transactions bypass the throttle
        lists
            .offer(Transaction::System {
                kind: SystemTxKind::StateSig,
                payload: Bytes::from_static(b"sig"),
            })
            .expect("system bypasses");
    }

    #[test]
    fn poll_skips_oversized_and_keeps_order() {
        let lists = lists(1024);
        for size in [600, 500, 100] {
            lists.offer(user(size)).expect("accepted");
        }
        let picked = lists.poll_trans_for_event();
        let sizes: Vec<usize> = picked.iter().map(|t| t.size()).collect();
        // 500 does not fit after 600; 100 still does
        assert_eq!(sizes, vec![600, 100]);
        assert_eq!(lists.pending_user_transactions(), 1);

        // the skipped transaction goes on the next event
        let picked = lists.poll_trans_for_event();
        let sizes: Vec<usize> = picked.iter().map(|t| t.size()).collect();
        assert_eq!(sizes, vec![500]);
        assert_eq!(lists.pending_user_transactions(), 0);
    }

    #[test]
    fn freeze_counter_tracks_freeze_sigs() {
        let lists = lists(1024);
        lists
            .offer(Transaction::System {
                kind: SystemTxKind::StateSigFreeze,
                payload: Bytes::from_static(b"frozen"),
            })
            .expect("accepted");
        assert_eq!(lists.pending_freeze_transactions(), 1);
        assert_eq!(lists.pending_user_transactions(), 0);
        let _ = lists.poll_trans_for_event();
        assert_eq!(lists.pending_freeze_transactions(), 0);
    }

    #[test]
    fn consumer_queues_see_offered_transactions() {
        let lists = lists(1024);
        lists.offer(user(4)).expect("accepted");
        assert!(lists.poll_curr().is_some());
        assert!(lists.poll_work().is_some());
        assert!(lists.poll_cons().is_some());
        assert!(lists.poll_cons().is_none());

        let fast_copy = TransLists::new(100, 1024, false);
        fast_copy.offer(user(4)).expect("accepted");
        // fast-copy model leaves curr and work untouched
        assert!(fast_copy.poll_curr().is_none());
        assert!(fast_copy.poll_cons().is_some());
    }
}
