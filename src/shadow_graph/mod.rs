// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The shadow graph: a hash-indexed parent/child arena of non-ancient
//! events, driving gossip reconciliation.
//!
//! Single-writer, many-reader: callers wrap the graph in a `RwLock` and hold
//! guards only around these in-memory operations, materialising anything
//! needed across an I/O boundary first.

mod shadow;

pub use shadow::ShadowEvent;
pub(crate) use shadow::ShadowIx;

use crate::address_book::MemberId;
use crate::error::{Error, Result};
use crate::event::{Event, EventHash};
use crate::LogMarker;

use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The in-memory index of non-ancient events.
#[derive(Debug, Default)]
pub struct ShadowGraph {
    arena: Vec<Option<ShadowEvent>>,
    free: Vec<ShadowIx>,
    index: HashMap<EventHash, ShadowIx>,
    /// Events below this generation are ancient: not inserted, and their
    /// absence as parents is tolerated.
    expired_floor: u64,
}

impl ShadowGraph {
    /// Empty graph with an ancient floor of zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shadow events currently held.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when no events are held.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The current ancient floor.
    pub fn expired_floor(&self) -> u64 {
        self.expired_floor
    }

    /// True when the event is present.
    pub fn contains(&self, hash: &EventHash) -> bool {
        self.index.contains_key(hash)
    }

    /// The shadow for `hash`, if present.
    pub fn shadow(&self, hash: &EventHash) -> Option<&ShadowEvent> {
        self.index.get(hash).map(|ix| self.slot(*ix))
    }

    /// The event record for `hash`, if present.
    pub fn event(&self, hash: &EventHash) -> Option<Arc<Event>> {
        self.shadow(hash).map(|s| s.event.clone())
    }

    // the hash index never points at a tombstoned slot
    fn slot(&self, ix: ShadowIx) -> &ShadowEvent {
        self.arena[ix as usize].as_ref().expect("indexed slot occupied")
    }

    fn slot_mut(&mut self, ix: ShadowIx) -> &mut ShadowEvent {
        self.arena[ix as usize].as_mut().expect("indexed slot occupied")
    }

    /// Inserts one event, wiring parent and child links.
    ///
    /// Returns `Ok(false)` when the event is ancient and was discarded.
    /// A declared parent must resolve unless its claimed generation is
    /// itself ancient; otherwise the insert fails with `UnknownParent`.
    pub fn insert(&mut self, event: Arc<Event>) -> Result<bool> {
        if self.index.contains_key(event.hash()) {
            return Err(Error::DuplicateEvent);
        }
        if event.generation() < self.expired_floor {
            trace!("discarding ancient event {} at intake", event.hash());
            return Ok(false);
        }
        let self_parent = self.resolve_parent(
            event.self_parent_hash(),
            event.data().self_parent_gen,
        )?;
        let other_parent = self.resolve_parent(
            event.other_parent_hash(),
            event.data().other_parent_gen,
        )?;
        if let Some(parent_ix) = self_parent {
            let parent = &self.slot(parent_ix).event;
            if parent.creator_id() != event.creator_id()
                || parent.creator_seq() + 1 != event.creator_seq()
            {
                return Err(Error::MalformedEvent(
                    "self-parent is not the previous event of the creator".to_string(),
                ));
            }
            if event.time_created() < parent.time_created() {
                return Err(Error::MalformedEvent(
                    "time runs backwards along the self-parent chain".to_string(),
                ));
            }
        }

        let hash = *event.hash();
        let shadow = ShadowEvent::new(event, self_parent, other_parent);
        let ix = match self.free.pop() {
            Some(ix) => {
                self.arena[ix as usize] = Some(shadow);
                ix
            }
            None => {
                self.arena.push(Some(shadow));
                (self.arena.len() - 1) as ShadowIx
            }
        };
        if let Some(parent) = self_parent {
            self.slot_mut(parent).self_children.push(ix);
        }
        if let Some(parent) = other_parent {
            self.slot_mut(parent).other_children.push(ix);
        }
        let _ = self.index.insert(hash, ix);
        trace!("{} {}", LogMarker::EventInserted, hash);
        Ok(true)
    }

    fn resolve_parent(
        &self,
        declared: Option<&EventHash>,
        claimed_gen: i64,
    ) -> Result<Option<ShadowIx>> {
        match declared {
            None => Ok(None),
            Some(hash) => match self.index.get(hash) {
                Some(ix) => Ok(Some(*ix)),
                // a parent that has gone ancient is an accepted absence
                None if (claimed_gen.max(0) as u64) < self.expired_floor => Ok(None),
                None => Err(Error::UnknownParent),
            },
        }
    }

    /// Inserts a batch that may arrive in any order, re-attempting until no
    /// further event is insertable. Returns how many were inserted;
    /// duplicates and leftovers with unresolvable parents are skipped.
    pub fn insert_many(&mut self, events: Vec<Arc<Event>>) -> usize {
        let mut pending = events;
        let mut inserted = 0;
        loop {
            let mut leftovers = Vec::new();
            let mut progressed = false;
            for event in pending {
                match self.insert(event.clone()) {
                    Ok(added) => {
                        progressed = true;
                        if added {
                            inserted += 1;
                        }
                    }
                    Err(Error::UnknownParent) => leftovers.push(event),
                    Err(Error::DuplicateEvent) => {}
                    Err(err) => {
                        warn!("dropping event from batch insert: {err}");
                    }
                }
            }
            if leftovers.is_empty() || !progressed {
                if !leftovers.is_empty() {
                    warn!(
                        "{} events in batch had unresolvable parents",
                        leftovers.len()
                    );
                }
                return inserted;
            }
            pending = leftovers;
        }
    }

    /// All tips (events with no self-child), in `(creator, seq)` order.
    pub fn tips(&self) -> Vec<&ShadowEvent> {
        self.index
            .values()
            .map(|ix| self.slot(*ix))
            .filter(|s| s.is_tip())
            .sorted_by_key(|s| (s.event.creator_id(), s.event.creator_seq()))
            .collect()
    }

    /// Raises the ancient floor, evicting every event below it.
    pub fn expire_below(&mut self, floor: u64) {
        if floor <= self.expired_floor {
            return;
        }
        self.expired_floor = floor;
        let expired = self
            .index
            .iter()
            .filter(|(_, ix)| self.slot(**ix).event.generation() < floor)
            .map(|(hash, _)| *hash)
            .collect_vec();
        for hash in &expired {
            self.remove_one(hash);
        }
        if !expired.is_empty() {
            debug!(
                "{} expired {} events below generation {}",
                LogMarker::EventExpired,
                expired.len(),
                floor
            );
        }
    }

    fn remove_one(&mut self, hash: &EventHash) {
        let ix = match self.index.remove(hash) {
            Some(ix) => ix,
            None => return,
        };
        let shadow = self.arena[ix as usize].take().expect("indexed slot");
        for parent in [shadow.self_parent, shadow.other_parent].into_iter().flatten() {
            if self.arena[parent as usize].is_some() {
                self.slot_mut(parent).remove_child(ix);
            }
        }
        for child in shadow
            .self_children
            .iter()
            .chain(shadow.other_children.iter())
        {
            if let Some(child_shadow) = self.arena[*child as usize].as_mut() {
                if child_shadow.self_parent == Some(ix) {
                    child_shadow.self_parent = None;
                }
                if child_shadow.other_parent == Some(ix) {
                    child_shadow.other_parent = None;
                }
            }
        }
        self.free.push(ix);
    }

    /// Removes, from the strict ancestry of `root`, every event satisfying
    /// `predicate`. Post-order traversal; each reachable event is visited
    /// exactly once, even where both parent edges lead to it. Returns the
    /// number removed.
    pub fn remove_ancestry<F>(&mut self, root: &EventHash, predicate: F) -> Result<usize>
    where
        F: Fn(&ShadowEvent) -> bool,
    {
        let root_ix = *self.index.get(root).ok_or(Error::UnknownParent)?;
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        // iterative post-order over parent links, root excluded
        let mut stack = vec![(root_ix, false)];
        while let Some((ix, expanded)) = stack.pop() {
            if expanded {
                if ix != root_ix {
                    order.push(ix);
                }
                continue;
            }
            if !visited.insert(ix) {
                continue;
            }
            stack.push((ix, true));
            let shadow = self.slot(ix);
            for parent in [shadow.self_parent, shadow.other_parent].into_iter().flatten() {
                if !visited.contains(&parent) {
                    stack.push((parent, false));
                }
            }
        }
        let mut removed = 0;
        for ix in order {
            let (hash, matches) = {
                let shadow = self.slot(ix);
                (*shadow.event.hash(), predicate(shadow))
            };
            if matches {
                self.remove_one(&hash);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("{} removed {} ancestors of {}", LogMarker::AncestryRemoved, removed, root);
        }
        Ok(removed)
    }

    /// Bottom-up traversal of the self-parent forest: every event exactly
    /// once, each self-parent before any of its self-children, starting from
    /// the root of `start`'s chain and continuing with the remaining
    /// self-orphans. The order is materialised, so the tip set observed is
    /// the one at call time.
    pub fn forest_dfs(&self, start: Option<&EventHash>) -> Vec<Arc<Event>> {
        let mut roots = Vec::new();
        if let Some(hash) = start {
            if let Some(mut ix) = self.index.get(hash).copied() {
                while let Some(parent) = self.slot(ix).self_parent {
                    ix = parent;
                }
                roots.push(ix);
            }
        }
        let mut orphans = self
            .index
            .values()
            .copied()
            .filter(|ix| self.slot(*ix).self_parent.is_none())
            .sorted_by_key(|ix| {
                let event = &self.slot(*ix).event;
                (event.creator_id(), event.creator_seq())
            })
            .collect_vec();
        roots.append(&mut orphans);

        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(self.len());
        for root in roots {
            let mut stack = vec![root];
            while let Some(ix) = stack.pop() {
                if !visited.insert(ix) {
                    continue;
                }
                let shadow = self.slot(ix);
                out.push(shadow.event.clone());
                // reversed so the first child chain is walked first
                for child in shadow.self_children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        out
    }

    /// The events a peer still needs, given the frontier both sides share
    /// and the peer's per-creator ancient floors. The result is in
    /// generation order, a topological extension of this graph.
    pub(crate) fn events_to_send(
        &self,
        shared_frontier: &[EventHash],
        peer_min_gens: &[u64],
    ) -> Vec<Arc<Event>> {
        // everything at or below the shared frontier is already at the peer
        let mut known = HashSet::new();
        let mut stack = shared_frontier
            .iter()
            .filter_map(|hash| self.index.get(hash).copied())
            .collect_vec();
        while let Some(ix) = stack.pop() {
            if !known.insert(ix) {
                continue;
            }
            let shadow = self.slot(ix);
            for parent in [shadow.self_parent, shadow.other_parent].into_iter().flatten() {
                if !known.contains(&parent) {
                    stack.push(parent);
                }
            }
        }

        self.index
            .values()
            .filter(|ix| !known.contains(*ix))
            .map(|ix| self.slot(*ix).event.clone())
            .filter(|event| {
                let floor = peer_floor(peer_min_gens, event.creator_id());
                event.generation() >= floor
            })
            .sorted_by_key(|event| (event.generation(), event.creator_id(), event.creator_seq()))
            .collect()
    }
}

fn peer_floor(min_gens: &[u64], creator: MemberId) -> u64 {
    min_gens.get(creator as usize).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_utils::EventBuilder;
    use ed25519_dalek::Keypair;
    use rand::rngs::OsRng;

    fn builder(creator: MemberId) -> EventBuilder {
        EventBuilder::new(creator, Keypair::generate(&mut OsRng))
    }

    fn chain(creator: MemberId, len: usize) -> Vec<Arc<Event>> {
        let mut b = builder(creator);
        (0..len)
            .map(|ix| Arc::new(b.next_with_payload(format!("{creator}-{ix}").as_bytes())))
            .collect()
    }

    #[test]
    fn insert_wires_parent_and_child_links() {
        let mut graph = ShadowGraph::new();
        let events = chain(0, 3);
        for event in &events {
            assert!(graph.insert(event.clone()).expect("inserts"));
        }
        // middle event: parent is first, child is last
        let mid = graph.shadow(events[1].hash()).expect("present");
        assert!(!mid.is_tip());
        let tips = graph.tips();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].event().hash(), events[2].hash());

        // dag consistency: self_parent present iff creator_seq > 0
        for event in &events {
            let shadow = graph.shadow(event.hash()).expect("present");
            assert_eq!(shadow.self_parent.is_some(), event.creator_seq() > 0);
        }
    }

    #[test]
    fn insert_rejects_duplicates_and_unknown_parents() {
        let mut graph = ShadowGraph::new();
        let events = chain(0, 2);
        assert!(graph.insert(events[0].clone()).expect("inserts"));
        assert!(matches!(
            graph.insert(events[0].clone()),
            Err(Error::DuplicateEvent)
        ));

        let mut graph2 = ShadowGraph::new();
        // child before parent
        assert!(matches!(
            graph2.insert(events[1].clone()),
            Err(Error::UnknownParent)
        ));
    }

    #[test]
    fn insert_many_tolerates_out_of_order() {
        let mut graph = ShadowGraph::new();
        let mut events = chain(0, 5);
        events.reverse();
        assert_eq!(graph.insert_many(events), 5);
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.tips().len(), 1);
    }

    #[test]
    fn expire_below_evicts_and_tolerates_ancient_parents() {
        let mut graph = ShadowGraph::new();
        let events = chain(0, 4);
        for event in &events[..3] {
            let _ = graph.insert(event.clone()).expect("inserts");
        }
        graph.expire_below(2);
        assert_eq!(graph.len(), 1);
        assert!(!graph.contains(events[0].hash()));
        assert!(graph.contains(events[2].hash()));
        // generation 3 event declares a generation 2 parent that is present
        assert!(graph.insert(events[3].clone()).expect("inserts"));

        // now expire everything and insert an event whose parent is ancient
        graph.expire_below(3);
        assert!(graph.contains(events[3].hash()));
        assert!(!graph.contains(events[2].hash()));
        let orphaned = graph.shadow(events[3].hash()).expect("present");
        assert!(orphaned.self_parent.is_none());
    }

    #[test]
    fn ancient_event_is_discarded_not_inserted() {
        let mut graph = ShadowGraph::new();
        graph.expire_below(5);
        let events = chain(0, 1);
        assert!(!graph.insert(events[0].clone()).expect("insert call")); // discarded
        assert!(graph.is_empty());
    }

    #[test]
    fn remove_ancestry_visits_diamonds_once() {
        // two creators with a cross merge: ancestry of the merge reaches the
        // shared root through both parents
        let mut a = builder(0);
        let mut b = builder(1);
        let a0 = Arc::new(a.next(None, vec![]));
        let b0 = Arc::new(b.next(
            Some((0, 0, *a0.hash(), a0.generation())),
            vec![],
        ));
        let a1 = Arc::new(a.next(
            Some((1, 0, *b0.hash(), b0.generation())),
            vec![],
        ));
        let mut graph = ShadowGraph::new();
        for ev in [&a0, &b0, &a1] {
            let _ = graph.insert(ev.clone()).expect("inserts");
        }
        let removed = graph
            .remove_ancestry(a1.hash(), |_| true)
            .expect("root present");
        // strict ancestry: a0 and b0, each exactly once; a1 stays
        assert_eq!(removed, 2);
        assert!(graph.contains(a1.hash()));
        assert!(!graph.contains(a0.hash()));
        assert!(!graph.contains(b0.hash()));
    }

    #[test]
    fn forest_dfs_yields_parents_before_children() {
        let mut graph = ShadowGraph::new();
        let zero = chain(0, 3);
        let one = chain(1, 2);
        for event in zero.iter().chain(one.iter()) {
            let _ = graph.insert(event.clone()).expect("inserts");
        }
        let order = graph.forest_dfs(Some(zero[2].hash()));
        assert_eq!(order.len(), 5);
        let position = |hash: &EventHash| {
            order
                .iter()
                .position(|e| e.hash() == hash)
                .expect("yielded")
        };
        for pair in zero.windows(2).chain(one.windows(2)) {
            assert!(position(pair[0].hash()) < position(pair[1].hash()));
        }
        // the start chain's root goes first
        assert_eq!(order[0].hash(), zero[0].hash());
    }

    #[test]
    fn events_to_send_excludes_shared_ancestry_and_orders_topologically() {
        let mut graph = ShadowGraph::new();
        let events = chain(0, 4);
        for event in &events {
            let _ = graph.insert(event.clone()).expect("inserts");
        }
        // peer already has the first two (frontier at events[1])
        let send = graph.events_to_send(&[*events[1].hash()], &[0]);
        let hashes = send.iter().map(|e| *e.hash()).collect_vec();
        assert_eq!(hashes, vec![*events[2].hash(), *events[3].hash()]);

        // a floor above everything sends nothing
        let send = graph.events_to_send(&[], &[100]);
        assert!(send.is_empty());
    }
}
