// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::address_book::MemberId;
use crate::event_flow::freeze::FreezeStage;

use std::io;
use thiserror::Error;

/// The type returned by the gossip and event flow handling methods.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    // ---- transport ----
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Connection to {0} closed")]
    ConnectionClosed(MemberId),
    #[error("No open connection to {0}")]
    NotConnected(MemberId),
    #[error("Sync cancelled by shutdown")]
    Cancelled,

    // ---- protocol ----
    #[error("Frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
    #[error("Unexpected frame tag {0:#04x}")]
    UnexpectedFrameTag(u8),
    #[error("Handshake ack mismatch: got {0:#010x}")]
    HandshakeMismatch(i32),
    #[error("Nickname {0:?} is not in the address book")]
    UnknownNickname(String),
    #[error("Members {0} and {1} are not adjacent in the connection graph")]
    NotAdjacent(MemberId, MemberId),
    #[error("Record truncated: {0} more bytes expected")]
    TruncatedRecord(usize),
    #[error("Events arrived out of topological order")]
    TopologicalViolation,
    #[error("Sync rejected by peer")]
    SyncRejected,

    // ---- validation ----
    #[error("Event signature does not verify under creator {0}")]
    BadSignature(MemberId),
    #[error("Event declares a parent that is not present")]
    UnknownParent,
    #[error("Event already present in the shadow graph")]
    DuplicateEvent,
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Creator id {0} is outside the address book")]
    UnknownCreator(MemberId),

    // ---- submission ----
    #[error("Transaction queues are full")]
    QueueFull,

    // ---- fatal ----
    #[error("Invalid freeze transition from {0:?} to {1:?}")]
    FreezeTransition(FreezeStage, FreezeStage),
    #[error("Consensus oracle failure: {0}")]
    Consensus(String),

    // ---- lifecycle ----
    #[error("Peer reports this node has fallen behind")]
    FallenBehind,
    #[error("Pipeline queue closed")]
    PipelineClosed,

    // ---- serialisation ----
    #[error("Bincode error:: {0}")]
    Bincode(#[from] bincode::Error),
}

impl Error {
    /// Connection-level failures. These are recovered locally: the connection
    /// is dropped, the sync reports as interrupted and a reconnect is allowed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed(_) | Error::NotConnected(_) | Error::Cancelled
        )
    }

    /// Byzantine-looking failures. The connection is closed and the peer is
    /// not immediately re-dialled.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::FrameTooLarge(..)
                | Error::UnexpectedFrameTag(_)
                | Error::HandshakeMismatch(_)
                | Error::UnknownNickname(_)
                | Error::NotAdjacent(..)
                | Error::TruncatedRecord(_)
                | Error::TopologicalViolation
        )
    }

    /// Errors that must terminate the node rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FreezeTransition(..) | Error::Consensus(_))
    }
}

/// Flattens a spawned task result so callers observe a plain crate error.
///
/// An I/O error nested in the task output is surfaced as-is, preserving the
/// retry semantics of the enclosing protocol. A panic in the task is resumed
/// on the joining side; a cancelled task maps to `Error::Cancelled`.
pub(crate) fn flatten_task<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    match joined {
        Ok(inner) => inner,
        Err(join_err) => {
            if join_err.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                std::panic::resume_unwind(join_err.into_panic())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_is_disjoint() {
        let samples = [
            Error::Io(io::Error::new(io::ErrorKind::TimedOut, "t")),
            Error::TopologicalViolation,
            Error::BadSignature(3),
            Error::QueueFull,
            Error::FreezeTransition(FreezeStage::NotInFreeze, FreezeStage::FreezeComplete),
        ];
        for err in samples {
            let classes = [err.is_transport(), err.is_protocol(), err.is_fatal()];
            assert!(classes.iter().filter(|c| **c).count() <= 1, "{err:?}");
        }
    }
}
