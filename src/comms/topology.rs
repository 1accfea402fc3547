// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The fixed connection graph: adjacency defines which member pairs may
//! gossip. Chosen once at genesis from a shared seed so every node derives
//! the same graph.

use crate::address_book::MemberId;

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

const PAIRING_ATTEMPTS: usize = 100;

/// Undirected adjacency over the committee.
#[derive(Debug, Clone)]
pub struct ConnectionGraph {
    adj: Vec<BTreeSet<MemberId>>,
}

impl ConnectionGraph {
    /// Every pair adjacent; what small committees use.
    pub fn complete(n: usize) -> Self {
        let adj = (0..n)
            .map(|me| {
                (0..n)
                    .filter(|other| *other != me)
                    .map(|other| other as MemberId)
                    .collect()
            })
            .collect();
        Self { adj }
    }

    /// A `degree`-regular graph derived deterministically from `seed`.
    ///
    /// Pairing-model sampling with rejection; if no simple pairing shows up
    /// within the attempt budget (tiny committees, awkward degrees), falls
    /// back to the circulant graph on the same vertices, which is regular
    /// and connected.
    pub fn random_regular(n: usize, degree: usize, seed: u64) -> Self {
        if n == 0 || degree >= n.saturating_sub(1) {
            return Self::complete(n);
        }
        let degree = degree.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        if n * degree % 2 == 0 {
            for _ in 0..PAIRING_ATTEMPTS {
                if let Some(graph) = Self::try_pairing(n, degree, &mut rng) {
                    return graph;
                }
            }
        }
        Self::circulant(n, degree)
    }

    fn try_pairing(n: usize, degree: usize, rng: &mut StdRng) -> Option<Self> {
        let mut stubs = (0..n)
            .flat_map(|v| std::iter::repeat(v as MemberId).take(degree))
            .collect_vec();
        stubs.shuffle(rng);
        let mut adj: Vec<BTreeSet<MemberId>> = vec![BTreeSet::new(); n];
        for pair in stubs.chunks(2) {
            let (a, b) = (pair[0], pair[1]);
            if a == b || adj[a as usize].contains(&b) {
                return None;
            }
            let _ = adj[a as usize].insert(b);
            let _ = adj[b as usize].insert(a);
        }
        Some(Self { adj })
    }

    fn circulant(n: usize, degree: usize) -> Self {
        let mut adj: Vec<BTreeSet<MemberId>> = vec![BTreeSet::new(); n];
        for v in 0..n {
            for step in 1..=(degree + 1) / 2 {
                let w = (v + step) % n;
                if w != v {
                    let _ = adj[v].insert(w as MemberId);
                    let _ = adj[w].insert(v as MemberId);
                }
            }
        }
        Self { adj }
    }

    /// Number of members in the graph.
    pub fn len(&self) -> usize {
        self.adj.len()
    }

    /// True for the empty graph.
    pub fn is_empty(&self) -> bool {
        self.adj.is_empty()
    }

    /// Neighbours of `id` in id order.
    pub fn neighbors(&self, id: MemberId) -> Vec<MemberId> {
        self.adj
            .get(id as usize)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// How many neighbours `id` has.
    pub fn degree(&self, id: MemberId) -> usize {
        self.adj.get(id as usize).map(|set| set.len()).unwrap_or(0)
    }

    /// Whether `a` and `b` may connect.
    pub fn is_adjacent(&self, a: MemberId, b: MemberId) -> bool {
        self.adj
            .get(a as usize)
            .map(|set| set.contains(&b))
            .unwrap_or(false)
    }

    /// A uniformly random neighbour of `id`.
    pub fn random_neighbor<R: Rng>(&self, id: MemberId, rng: &mut R) -> Option<MemberId> {
        let set = self.adj.get(id as usize)?;
        if set.is_empty() {
            return None;
        }
        let pick = rng.gen_range(0, set.len());
        set.iter().nth(pick).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn complete_graph_adjacency() {
        let graph = ConnectionGraph::complete(4);
        for a in 0..4u64 {
            assert_eq!(graph.degree(a), 3);
            for b in 0..4u64 {
                assert_eq!(graph.is_adjacent(a, b), a != b);
            }
        }
    }

    #[test]
    fn random_regular_is_symmetric_and_regular() {
        let graph = ConnectionGraph::random_regular(20, 4, 7);
        for v in 0..20u64 {
            assert_eq!(graph.degree(v), 4, "vertex {v}");
            for w in graph.neighbors(v) {
                assert!(graph.is_adjacent(w, v));
                assert_ne!(w, v);
            }
        }
    }

    #[test]
    fn same_seed_same_graph() {
        let a = ConnectionGraph::random_regular(16, 4, 42);
        let b = ConnectionGraph::random_regular(16, 4, 42);
        for v in 0..16u64 {
            assert_eq!(a.neighbors(v), b.neighbors(v));
        }
    }

    proptest! {
        #[test]
        fn proptest_regular_graphs(n in 4usize..40, degree in 1usize..6, seed in 0u64..50) {
            let graph = ConnectionGraph::random_regular(n, degree, seed);
            prop_assert_eq!(graph.len(), n);
            for v in 0..n as u64 {
                prop_assert!(graph.degree(v) >= 1);
                for w in graph.neighbors(v) {
                    prop_assert!(graph.is_adjacent(w, v));
                }
            }
        }
    }
}
