// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::framing::{FramedReader, FramedWriter};
use crate::address_book::MemberId;
use crate::config::Config;

use std::net::SocketAddr;
use std::sync::{atomic::AtomicU64, Arc};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// A bidirectional framed channel bound to one `(self, other)` member pair.
///
/// The two halves carry independent mutexes so a sync can stream in both
/// directions at once; only one sync runs per connection at a time, so the
/// locks are uncontended in practice.
pub struct Connection {
    /// Our member id.
    pub self_id: MemberId,
    /// The peer's member id.
    pub other_id: MemberId,
    /// Random id agreed during the handshake; diagnostic only.
    pub conn_id: i32,
    /// Address the socket is actually connected to.
    pub peer_addr: SocketAddr,
    pub(crate) reader: Arc<Mutex<FramedReader<OwnedReadHalf>>>,
    pub(crate) writer: Arc<Mutex<FramedWriter<OwnedWriteHalf>>>,
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("self_id", &self.self_id)
            .field("other_id", &self.other_id)
            .field("conn_id", &self.conn_id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        self_id: MemberId,
        other_id: MemberId,
        conn_id: i32,
        config: &Config,
    ) -> crate::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        if config.tcp_no_delay {
            stream.set_nodelay(true)?;
        }
        if let Some(tos) = config.socket_ip_tos {
            socket2::SockRef::from(&stream).set_tos(tos)?;
        }
        let (read_half, write_half) = stream.into_split();
        let bytes_read = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));
        Ok(Self {
            self_id,
            other_id,
            conn_id,
            peer_addr,
            reader: Arc::new(Mutex::new(FramedReader::new(
                read_half,
                config.buffer_size,
                bytes_read.clone(),
                config.timeout_sync_client_socket,
            ))),
            writer: Arc::new(Mutex::new(FramedWriter::new(
                write_half,
                config.buffer_size,
                bytes_written.clone(),
                config.timeout_sync_client_socket,
            ))),
            bytes_read,
            bytes_written,
        })
    }

    /// Adopts the identity agreed during the handshake.
    pub(crate) fn identified(mut self, other_id: MemberId, conn_id: i32) -> Self {
        self.other_id = other_id;
        self.conn_id = conn_id;
        self
    }

    /// Bytes read since the connection opened.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Bytes written since the connection opened.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}
