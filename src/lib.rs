// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Gossip and consensus core for a permissioned hashgraph ledger.
//!
//! A fixed committee exchanges events over authenticated point-to-point
//! connections; this crate carries the shadow event graph, the sync
//! protocol, the control plane steering it, and the event flow pipeline
//! that hands ordered transactions to the application. The virtual-voting
//! fame decision itself is a collaborator behind [`consensus::ConsensusOracle`].

#![doc(
    html_logo_url = "https://github.com/maidsafe/QA/raw/master/Images/maidsafe_logo.png",
    html_favicon_url = "https://maidsafe.net/img/favicon.ico",
    test(attr(deny(warnings)))
)]
// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    clippy::unicode_not_nfc
)]

#[macro_use]
extern crate tracing;

pub mod address_book;
pub mod comms;
pub mod config;
pub mod consensus;
mod error;
pub mod event;
pub mod event_flow;
pub mod gossip;
mod log_markers;
pub mod node;
pub mod quorum;
pub mod shadow_graph;
pub mod signed_state;
pub mod stats;
pub mod sync_manager;

/// Test and diagnostics helpers.
pub mod testing {
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Installs a tracing subscriber honouring `RUST_LOG`, once per process.
    pub fn init_test_logger() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

pub use crate::address_book::{AddressBook, Member, MemberId, Stake};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::event::{Event, EventHash, SystemTxKind, Transaction};
pub use crate::log_markers::LogMarker;
pub use crate::node::Node;
pub use crate::stats::NodeStats;
