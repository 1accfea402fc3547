// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The nickname/ack exchange that opens every connection.

use super::framing::{FramedReader, FramedWriter};
use super::topology::ConnectionGraph;
use crate::address_book::{AddressBook, MemberId};
use crate::error::{Error, Result};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

/// Ack sentinel; must match on both sides or the connection aborts.
pub(crate) const COMM_CONNECT: i32 = 0x5A03_E8C0_u32 as i32;

/// Caller side: announce our nickname, expect `conn_id ‖ COMM_CONNECT`.
pub(crate) async fn call<R, W>(
    reader: &mut FramedReader<R>,
    writer: &mut FramedWriter<W>,
    nickname: &str,
) -> Result<i32>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_frame(nickname.as_bytes()).await?;
    let mut ack = reader.read_frame().await?;
    if ack.remaining() < 8 {
        return Err(Error::TruncatedRecord(8 - ack.remaining()));
    }
    let conn_id = ack.get_i32();
    let sentinel = ack.get_i32();
    if sentinel != COMM_CONNECT {
        return Err(Error::HandshakeMismatch(sentinel));
    }
    Ok(conn_id)
}

/// Listener side: read the nickname, resolve and authorise the peer, reply
/// with a random connection id and the ack.
pub(crate) async fn accept<R, W>(
    reader: &mut FramedReader<R>,
    writer: &mut FramedWriter<W>,
    self_id: MemberId,
    book: &AddressBook,
    graph: &ConnectionGraph,
) -> Result<(MemberId, i32)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let raw = reader.read_frame().await?;
    let nickname = std::str::from_utf8(&raw)
        .map_err(|_| Error::UnknownNickname("<non-utf8>".to_string()))?;
    let member = book
        .by_nickname(nickname)
        .ok_or_else(|| Error::UnknownNickname(nickname.to_string()))?;
    if !graph.is_adjacent(self_id, member.id) {
        return Err(Error::NotAdjacent(self_id, member.id));
    }
    let conn_id: i32 = rand::random();
    let mut ack = BytesMut::with_capacity(8);
    ack.put_i32(conn_id);
    ack.put_i32(COMM_CONNECT);
    writer.write_frame(&ack).await?;
    Ok((member.id, conn_id))
}
