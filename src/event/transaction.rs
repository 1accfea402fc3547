// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumIter};

/// Subtype octet of a system transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumIter,
)]
#[repr(u8)]
pub enum SystemTxKind {
    /// `(round ‖ hash ‖ signature)` of a signed state.
    StateSig = 0,
    /// A state signature emitted while freezing; forces event creation so it
    /// propagates before the halt.
    StateSigFreeze = 1,
    /// Round-trip time probe.
    Ping = 2,
    /// Throughput report.
    BitsPerSecond = 3,
}

impl SystemTxKind {
    pub(crate) fn from_octet(octet: u8) -> Option<Self> {
        match octet {
            0 => Some(Self::StateSig),
            1 => Some(Self::StateSigFreeze),
            2 => Some(Self::Ping),
            3 => Some(Self::BitsPerSecond),
            _ => None,
        }
    }
}

/// One payload carried inside an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transaction {
    /// Application payload, opaque to the core.
    User(Bytes),
    /// Platform payload.
    System {
        /// Which platform concern this serves.
        kind: SystemTxKind,
        /// Encoded per `kind`.
        payload: Bytes,
    },
}

impl Transaction {
    /// True for platform transactions; these bypass the queue-full throttle.
    pub fn is_system(&self) -> bool {
        matches!(self, Transaction::System { .. })
    }

    /// True for application transactions.
    pub fn is_user(&self) -> bool {
        matches!(self, Transaction::User(_))
    }

    /// True for the freeze-time state signature.
    pub fn is_freeze_sig(&self) -> bool {
        matches!(
            self,
            Transaction::System {
                kind: SystemTxKind::StateSigFreeze,
                ..
            }
        )
    }

    /// Payload length in bytes; what counts against the per-event byte
    /// budget.
    pub fn size(&self) -> usize {
        match self {
            Transaction::User(bytes) => bytes.len(),
            Transaction::System { payload, .. } => payload.len(),
        }
    }

    pub(crate) fn payload(&self) -> &Bytes {
        match self {
            Transaction::User(bytes) => bytes,
            Transaction::System { payload, .. } => payload,
        }
    }
}
