// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Communication component: connection lifecycle between committee members.

mod connection;
pub(crate) mod framing;
pub(crate) mod handshake;
mod topology;

pub use connection::Connection;
pub use topology::ConnectionGraph;

use crate::address_book::{AddressBook, Member, MemberId};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::LogMarker;

use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Connection registry plus dial/accept logic.
///
/// Only dialled (caller-side) connections are registered; an absent entry
/// means "not connected". Accepted connections belong to the listener task
/// serving them, so each direction of a peer pair has its own socket and
/// the two never contend for frames.
pub struct Comm {
    self_id: MemberId,
    book: Arc<AddressBook>,
    graph: Arc<ConnectionGraph>,
    config: Arc<Config>,
    connections: DashMap<MemberId, Arc<Connection>>,
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("self_id", &self.self_id)
            .field("open_connections", &self.connections.len())
            .finish()
    }
}

impl Comm {
    /// New manager with an empty registry.
    pub fn new(
        self_id: MemberId,
        book: Arc<AddressBook>,
        graph: Arc<ConnectionGraph>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            self_id,
            book,
            graph,
            config,
            connections: DashMap::new(),
        }
    }

    /// The open connection to `other`, if any.
    pub fn get(&self, other: MemberId) -> Option<Arc<Connection>> {
        self.connections.get(&other).map(|c| c.value().clone())
    }

    /// Drops the registry entry; the socket closes when the last user of
    /// the `Arc` lets go.
    pub fn disconnect(&self, other: MemberId) {
        if self.connections.remove(&other).is_some() {
            debug!("{} to {}", LogMarker::ConnectionClosed, other);
        }
    }

    /// Existing connection to `other`, or a fresh dial.
    pub async fn get_or_connect(&self, other: MemberId) -> Result<Arc<Connection>> {
        if let Some(conn) = self.get(other) {
            return Ok(conn);
        }
        self.connect(other).await
    }

    /// Dials `other`, runs the caller handshake and registers the result.
    pub async fn connect(&self, other: MemberId) -> Result<Arc<Connection>> {
        if !self.graph.is_adjacent(self.self_id, other) {
            return Err(Error::NotAdjacent(self.self_id, other));
        }
        let me = self
            .book
            .get(self.self_id)
            .ok_or(Error::UnknownCreator(self.self_id))?;
        let them = self.book.get(other).ok_or(Error::UnknownCreator(other))?;
        let addr = endpoint_for(me, them, self.config.use_loopback_ip);

        let stream = timeout(
            self.config.timeout_sync_client_connect,
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            ))
        })??;

        // handshake over a provisional connection, then adopt the conn id
        let provisional = Connection::new(stream, self.self_id, other, 0, &self.config)?;
        let conn_id = {
            let mut reader = provisional.reader.lock().await;
            let mut writer = provisional.writer.lock().await;
            handshake::call(&mut *reader, &mut *writer, &me.nickname).await?
        };
        let conn = Arc::new(provisional.identified(other, conn_id));
        info!(
            "{} caller to {} ({}) conn_id={}",
            LogMarker::ConnectionOpened,
            other,
            addr,
            conn_id
        );
        let _ = self.connections.insert(other, conn.clone());
        Ok(conn)
    }

    /// Accept loop. Each inbound socket gets the listener handshake on its
    /// own task; authenticated connections are registered and handed to
    /// `inbound_tx` for the sync listener to serve.
    pub async fn run_accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        inbound_tx: mpsc::Sender<Arc<Connection>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.changed() => {
                    trace!("accept loop stopping");
                    return;
                }
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            trace!("inbound socket from {peer_addr}");
            let this = self.clone();
            let tx = inbound_tx.clone();
            let _ = tokio::spawn(async move {
                match this.accept_one(stream).await {
                    Ok(conn) => {
                        if tx.send(conn).await.is_err() {
                            trace!("inbound channel closed; dropping connection");
                        }
                    }
                    Err(err) => {
                        debug!("inbound handshake from {peer_addr} failed: {err}");
                    }
                }
            });
        }
    }

    async fn accept_one(&self, stream: TcpStream) -> Result<Arc<Connection>> {
        // the peer is unknown until the handshake resolves the nickname
        let provisional = Connection::new(stream, self.self_id, MemberId::MAX, 0, &self.config)?;
        let (other_id, conn_id) = {
            let mut reader = provisional.reader.lock().await;
            let mut writer = provisional.writer.lock().await;
            timeout(
                self.config.timeout_server_accept_connect,
                handshake::accept(
                    &mut *reader,
                    &mut *writer,
                    self.self_id,
                    &self.book,
                    &self.graph,
                ),
            )
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "inbound handshake timed out",
                ))
            })??
        };
        let conn = Arc::new(provisional.identified(other_id, conn_id));
        info!(
            "{} listener from {} conn_id={}",
            LogMarker::HandshakeComplete,
            other_id,
            conn_id
        );
        Ok(conn)
    }
}

/// Loopback when both declare the same host, internal address on a shared
/// LAN, external address otherwise.
pub(crate) fn endpoint_for(me: &Member, them: &Member, use_loopback: bool) -> SocketAddr {
    if use_loopback && me.external_addr.ip() == them.external_addr.ip() {
        return SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), them.internal_addr.port());
    }
    if same_lan(me.internal_addr.ip(), them.internal_addr.ip()) {
        return them.internal_addr;
    }
    them.external_addr
}

fn same_lan(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..3] == b.octets()[..3],
        _ => false,
    }
}
