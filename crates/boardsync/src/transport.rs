use crate::proto::{decode_message, encode_message};
use crate::protocol::{Message, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Frames larger than this are treated as a broken connection
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("connection closed")]
    Closed,
}

/// Process-unique id of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write one length-prefixed frame (4 bytes big-endian length, then body)
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), TransportError> {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Bytes>, TransportError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

enum Outgoing {
    Message(Message),
    Close,
}

/// Sending half of a connection
///
/// Cheap to clone. `send` never blocks: messages are queued and written in
/// order by the connection's writer task, so messages on one link arrive in
/// send order.
#[derive(Clone)]
pub struct PeerLink {
    id: ConnectionId,
    remote: String,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl PeerLink {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the other end, for logging
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn send(&self, msg: Message) -> Result<(), TransportError> {
        trace!(conn = %self.id, event = %msg.event(), "queue");
        self.tx
            .send(Outgoing::Message(msg))
            .map_err(|_| TransportError::Closed)
    }

    /// Flush everything queued so far, then shut the write side down
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Receiving half of a connection
pub struct Inbound {
    id: ConnectionId,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    max_frame_bytes: usize,
}

impl Inbound {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next message from the peer
    ///
    /// `Some(Err(_))` is an undecodable message; the stream is still usable.
    /// `None` means the connection is gone (orderly close or I/O failure).
    pub async fn next(&mut self) -> Option<Result<Message, ProtocolError>> {
        match read_frame(&mut self.reader, self.max_frame_bytes).await {
            Ok(Some(body)) => Some(decode_message(&body)),
            Ok(None) => {
                debug!(conn = %self.id, "peer closed connection");
                None
            }
            Err(e) => {
                warn!(conn = %self.id, "connection lost: {}", e);
                None
            }
        }
    }
}

/// A bidirectional message connection over any byte stream
pub struct Connection;

impl Connection {
    /// Split `stream` and start its writer task
    pub fn spawn<S>(stream: S, remote: String, max_frame_bytes: usize) -> (PeerLink, Inbound)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = ConnectionId::next();
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(id, writer, rx));
        debug!(conn = %id, remote = %remote, "connection established");

        (
            PeerLink { id, remote, tx },
            Inbound {
                id,
                reader: Box::new(reader),
                max_frame_bytes,
            },
        )
    }

    /// Dial `addr` over TCP
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<(PeerLink, Inbound), TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(addr.to_string()))??;
        stream.set_nodelay(true)?;
        Ok(Self::spawn(stream, addr.to_string(), max_frame_bytes))
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Message(msg) => {
                let body = encode_message(&msg);
                if let Err(e) = write_frame(&mut writer, &body).await {
                    debug!(conn = %id, "write failed: {}", e);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    rx.close();
    let _ = writer.shutdown().await;
    trace!(conn = %id, "writer finished");
}
