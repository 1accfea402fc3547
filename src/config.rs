// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Tunables for gossip, throttling and the event flow.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many neighbours are sampled when picking whom to call.
pub const MAXIMUM_NEIGHBORS_TO_QUERY: usize = 10;

/// Number of calls after boot or reconnect during which gossip keeps going
/// regardless of pending work.
pub const TRANS_THROTTLE_INITIAL_CALLS_NUM: u32 = 10;

/// Consecutive empty-event syncs after which gossip is allowed to go quiet.
pub const TRANS_THROTTLE_EMPTY_SYNCS: u32 = 10;

/// Grace period when joining pipeline consumers during `stop_and_clear`.
pub const JOIN_WAIT_MS: u64 = 250;

/// Gossip and event flow configuration. Passed explicitly at construction;
/// there is no process-wide settings object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pad quiet syncs to smooth network utilisation.
    pub throttle7: bool,
    /// Pad a sync only when it moved fewer event bytes than this multiple
    /// of `throttle7_max_bytes`.
    pub throttle7_threshold: f64,
    /// Fraction of `throttle7_max_bytes` that may be written as padding.
    pub throttle7_extra: f64,
    /// Upper bound on padding per sync, in bytes.
    pub throttle7_max_bytes: usize,

    /// Above this intake queue depth, neither initiate nor accept syncs.
    pub event_intake_queue_throttle_size: usize,
    /// Above this queue depth, reject user transactions at `offer`.
    pub throttle_transaction_queue_size: usize,
    /// Byte budget for the transactions packed into one self event.
    pub max_transaction_bytes_per_event: usize,

    /// Hash and sign the consensus state every this many rounds.
    pub signed_state_freq: u64,

    /// Unused shuffle delay carried in the settings file for compatibility.
    pub delay_shuffle: u64,

    /// Set TCP_NODELAY on gossip sockets.
    pub tcp_no_delay: bool,
    /// IP type-of-service octet for gossip sockets, `None` leaves the default.
    pub socket_ip_tos: Option<u32>,

    /// Read/write timeout on an established sync socket.
    pub timeout_sync_client_socket: Duration,
    /// TCP connect timeout when dialling a peer.
    pub timeout_sync_client_connect: Duration,
    /// Accept timeout on the listen socket.
    pub timeout_server_accept_connect: Duration,

    /// Use 127.0.0.1 when caller and callee declare the same host.
    pub use_loopback_ip: bool,
    /// Buffered reader/writer capacity per connection.
    pub buffer_size: usize,
    /// Pause between heartbeat-driven sync attempts.
    pub sleep_heartbeat: Duration,

    /// One chance in this many of creating an event purely to give a
    /// childless event a child.
    pub rescue_childless_inverse_probability: u32,
    /// One chance in this many of creating an event regardless of the
    /// critical quorum outcome. Zero disables.
    pub random_event_probability: u32,

    /// Let zero-stake members take part in gossip as beta mirrors.
    pub enable_beta_mirror: bool,
    /// Fraction of neighbours that must report us behind before reconnecting.
    pub fallen_behind_threshold: f64,
    /// Skip event creation when a sync read more than this many events per
    /// member.
    pub stale_event_prevention_threshold: u64,

    /// Cap on the in-memory signed-state map.
    pub maximum_virtual_map_size: usize,
    /// Unused here; carried in the settings file for the signed-state
    /// persistence collaborator, which owns disk flushing.
    pub flush_interval: Duration,

    /// Threads in the signature verification pool. Zero picks the number of
    /// physical cores.
    pub verification_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            throttle7: false,
            throttle7_threshold: 1.5,
            throttle7_extra: 0.05,
            throttle7_max_bytes: 104_857_600,
            event_intake_queue_throttle_size: 1000,
            throttle_transaction_queue_size: 100_000,
            max_transaction_bytes_per_event: 245_760,
            signed_state_freq: 1,
            delay_shuffle: 0,
            tcp_no_delay: true,
            socket_ip_tos: None,
            timeout_sync_client_socket: Duration::from_secs(5),
            timeout_sync_client_connect: Duration::from_secs(5),
            timeout_server_accept_connect: Duration::from_secs(5),
            use_loopback_ip: true,
            buffer_size: 8 * 1024,
            sleep_heartbeat: Duration::from_millis(500),
            rescue_childless_inverse_probability: 10,
            random_event_probability: 0,
            enable_beta_mirror: false,
            fallen_behind_threshold: 0.5,
            stale_event_prevention_threshold: 5,
            maximum_virtual_map_size: 100,
            flush_interval: Duration::from_secs(60),
            verification_pool_size: 0,
        }
    }
}
