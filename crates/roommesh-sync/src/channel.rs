//! # Bulk Channel
//!
//! Single-use, point-to-point TCP byte stream for one mesh or bundle payload.
//!
//! ## Transfer Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        One Bulk Transfer                                │
//! │                                                                         │
//! │   LISTENING SIDE                         DIALING SIDE                   │
//! │   ──────────────                         ────────────                   │
//! │   1. BulkListener::bind(kind port)                                      │
//! │   2. announce descriptor ─── control plane ───►                         │
//! │   3. accept_once ◄──────────────────────────── 4. dial(host:port)       │
//! │                                                                         │
//! │   then exactly one side writes and closes, the other reads to the end:  │
//! │                                                                         │
//! │   write_payload ─────────── bytes ───────────► read_payload             │
//! │        │                                             │                  │
//! │        └── shutdown ───────── EOF ──────────────────►┘                  │
//! │                                                                         │
//! │  The listener is dropped after one accept. Nothing is pooled and a     │
//! │  dropped connection fails the transfer.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Framing
//! - `Raw`: all bytes until the writer closes. Read with a fixed chunk buffer.
//! - `LengthPrefixed`: one `LengthDelimitedCodec` frame (4-byte big-endian
//!   length), so an early close is detected instead of committed.
//!
//! Every blocking step is bounded by the configured timeout and aborts when
//! the node's cancellation token fires.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use roommesh_core::TransferKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::{Framing, TransferSettings};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Options
// =============================================================================

/// Wire and wait settings shared by both ends of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub framing: Framing,
    pub chunk_size: usize,
    pub max_payload: usize,
    pub timeout: Duration,
}

impl From<&TransferSettings> for ChannelOptions {
    fn from(settings: &TransferSettings) -> Self {
        ChannelOptions {
            framing: settings.framing,
            chunk_size: settings.chunk_size.max(1),
            max_payload: settings.max_payload_bytes,
            timeout: settings.timeout(),
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions::from(&TransferSettings::default())
    }
}

impl ChannelOptions {
    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.max_payload)
            .new_codec()
    }
}

/// Runs `fut` under the timeout, aborting early on cancellation.
pub(crate) async fn bounded<T, F>(
    what: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(SyncError::Timeout { what, secs: limit.as_secs() }),
        },
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Listening half of a bulk transfer.
pub struct BulkListener {
    listener: TcpListener,
    kind: TransferKind,
    local_addr: SocketAddr,
    options: ChannelOptions,
}

impl BulkListener {
    /// Binds `addr` for a transfer of `kind`.
    ///
    /// A bind failure is a port collision and is surfaced immediately.
    pub async fn bind(
        kind: TransferKind,
        addr: SocketAddr,
        options: ChannelOptions,
    ) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!(kind = %kind, addr = %addr, error = %e, "Failed to bind transfer listener");
            SyncError::PortInUse {
                kind,
                addr,
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;
        debug!(kind = %kind, addr = %local_addr, "Transfer listener bound");

        Ok(BulkListener {
            listener,
            kind,
            local_addr,
            options,
        })
    }

    /// Address actually bound (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Waits for exactly one connection, then closes the listener.
    pub async fn accept_once(self, cancel: &CancellationToken) -> SyncResult<BulkStream> {
        let options = self.options;
        let listener = self.listener;
        bounded("accept", options.timeout, cancel, async move {
            let (stream, peer_addr) = listener.accept().await?;
            Ok(BulkStream::new(stream, peer_addr, options))
        })
        .await
    }

    /// Waits for the next connection without a deadline.
    ///
    /// Used by long-lived listeners that are re-armed after each accept.
    pub async fn accept_next(&self, cancel: &CancellationToken) -> SyncResult<BulkStream> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            res = self.listener.accept() => {
                let (stream, peer_addr) = res?;
                Ok(BulkStream::new(stream, peer_addr, self.options))
            }
        }
    }
}

/// Dials a listening side.
pub async fn dial(
    addr: &str,
    options: ChannelOptions,
    cancel: &CancellationToken,
) -> SyncResult<BulkStream> {
    bounded("connect", options.timeout, cancel, async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SyncError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let peer_addr = stream.peer_addr()?;
        Ok(BulkStream::new(stream, peer_addr, options))
    })
    .await
}

// =============================================================================
// Stream
// =============================================================================

/// A connected bulk channel. Consumed by exactly one write or one read.
pub struct BulkStream {
    stream: TcpStream,
    peer_addr: SocketAddr,
    options: ChannelOptions,
}

impl BulkStream {
    fn new(stream: TcpStream, peer_addr: SocketAddr, options: ChannelOptions) -> Self {
        BulkStream {
            stream,
            peer_addr,
            options,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Writes the whole payload, then closes the write side.
    pub async fn write_payload(
        self,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> SyncResult<usize> {
        let options = self.options;
        if payload.len() > options.max_payload {
            return Err(SyncError::PayloadTooLarge {
                limit: options.max_payload,
            });
        }

        let len = payload.len();
        let stream = self.stream;
        bounded("write", options.timeout, cancel, async move {
            match options.framing {
                Framing::Raw => write_raw(stream, &payload).await,
                Framing::LengthPrefixed => write_framed(stream, payload, &options).await,
            }
        })
        .await?;

        trace!(peer = %self.peer_addr, bytes = len, "Payload written");
        Ok(len)
    }

    /// Reads one whole payload.
    pub async fn read_payload(self, cancel: &CancellationToken) -> SyncResult<Bytes> {
        let options = self.options;
        let stream = self.stream;
        let payload = bounded("read", options.timeout, cancel, async move {
            match options.framing {
                Framing::Raw => read_raw(stream, &options).await,
                Framing::LengthPrefixed => read_framed(stream, &options).await,
            }
        })
        .await?;

        trace!(peer = %self.peer_addr, bytes = payload.len(), "Payload read");
        Ok(payload)
    }
}

async fn write_raw(mut stream: TcpStream, payload: &[u8]) -> SyncResult<()> {
    stream.write_all(payload).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn write_framed(stream: TcpStream, payload: Bytes, options: &ChannelOptions) -> SyncResult<()> {
    let mut framed = FramedWrite::new(stream, options.codec());
    framed.send(payload).await?;
    let mut stream = framed.into_inner();
    stream.shutdown().await?;
    Ok(())
}

/// Accumulates chunk reads until end-of-stream.
async fn read_raw(mut stream: TcpStream, options: &ChannelOptions) -> SyncResult<Bytes> {
    let mut payload = BytesMut::new();
    let mut chunk = vec![0u8; options.chunk_size];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if payload.len() + n > options.max_payload {
            return Err(SyncError::PayloadTooLarge {
                limit: options.max_payload,
            });
        }
        payload.extend_from_slice(&chunk[..n]);
    }
    Ok(payload.freeze())
}

async fn read_framed(stream: TcpStream, options: &ChannelOptions) -> SyncResult<Bytes> {
    let mut framed = FramedRead::new(stream, options.codec());
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame.freeze()),
        Some(Err(e)) => {
            let too_large = e
                .get_ref()
                .map_or(false, |inner| inner.is::<LengthDelimitedCodecError>());
            if too_large {
                Err(SyncError::PayloadTooLarge {
                    limit: options.max_payload,
                })
            } else if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Err(SyncError::Truncated)
            } else {
                Err(e.into())
            }
        }
        None => Err(SyncError::Truncated),
    }
}
