// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::event::Event;
use std::sync::Arc;

/// Dense arena index of a shadow event. Indices are invalidated on removal
/// and may be reused; they never leave the graph's lock scope.
pub(crate) type ShadowIx = u32;

/// One non-ancient event as wired into the parent/child graph.
///
/// Parent and child links are arena indices, not references; the cycle
/// between parents and children that the original object graph carried is
/// flattened into the arena.
#[derive(Debug, Clone)]
pub struct ShadowEvent {
    pub(crate) event: Arc<Event>,
    pub(crate) self_parent: Option<ShadowIx>,
    pub(crate) other_parent: Option<ShadowIx>,
    pub(crate) self_children: Vec<ShadowIx>,
    pub(crate) other_children: Vec<ShadowIx>,
}

impl ShadowEvent {
    pub(crate) fn new(
        event: Arc<Event>,
        self_parent: Option<ShadowIx>,
        other_parent: Option<ShadowIx>,
    ) -> Self {
        Self {
            event,
            self_parent,
            other_parent,
            self_children: Vec::new(),
            other_children: Vec::new(),
        }
    }

    /// The underlying event record.
    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    /// A tip has no self-child.
    pub fn is_tip(&self) -> bool {
        self.self_children.is_empty()
    }

    pub(crate) fn remove_child(&mut self, child: ShadowIx) {
        self.self_children.retain(|ix| *ix != child);
        self.other_children.retain(|ix| *ix != child);
    }
}
