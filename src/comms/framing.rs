// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Length-prefixed frames with per-direction byte accounting.
//!
//! Every read and write is bounded by the configured socket timeout; an
//! elapsed timeout surfaces as a timed-out I/O error so the enclosing sync
//! reports as interrupted.

use crate::error::{Error, Result};

use bytes::Bytes;
use std::io;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::time::timeout;

/// Upper bound on a single frame; anything larger is treated as Byzantine.
pub(crate) const MAX_FRAME_BYTES: usize = 1 << 24;

fn timed_out() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        "socket operation timed out",
    ))
}

/// Write half of a framed stream.
pub(crate) struct FramedWriter<W> {
    inner: BufWriter<W>,
    written: Arc<AtomicU64>,
    io_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub(crate) fn new(
        inner: W,
        buffer_size: usize,
        written: Arc<AtomicU64>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            inner: BufWriter::with_capacity(buffer_size, inner),
            written,
            io_timeout,
        }
    }

    /// Writes one `u32`-length-prefixed frame and flushes it.
    pub(crate) async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge(body.len(), MAX_FRAME_BYTES));
        }
        let write = async {
            self.inner.write_u32(body.len() as u32).await?;
            self.inner.write_all(body).await?;
            self.inner.flush().await
        };
        timeout(self.io_timeout, write)
            .await
            .map_err(|_| timed_out())?
            .map_err(Error::Io)?;
        let _ = self
            .written
            .fetch_add(4 + body.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Read half of a framed stream.
pub(crate) struct FramedReader<R> {
    inner: BufReader<R>,
    read: Arc<AtomicU64>,
    io_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub(crate) fn new(
        inner: R,
        buffer_size: usize,
        read: Arc<AtomicU64>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            inner: BufReader::with_capacity(buffer_size, inner),
            read,
            io_timeout,
        }
    }

    /// Reads one frame body.
    pub(crate) async fn read_frame(&mut self) -> Result<Bytes> {
        let len = timeout(self.io_timeout, self.inner.read_u32())
            .await
            .map_err(|_| timed_out())?
            .map_err(Error::Io)? as usize;
        if len > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge(len, MAX_FRAME_BYTES));
        }
        let mut body = vec![0u8; len];
        timeout(self.io_timeout, self.inner.read_exact(&mut body))
            .await
            .map_err(|_| timed_out())?
            .map_err(Error::Io)?;
        let _ = self.read.fetch_add(4 + len as u64, Ordering::Relaxed);
        Ok(Bytes::from(body))
    }
}
