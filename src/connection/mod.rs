//! Duplex byte-stream connections to the peer processes.
//!
//! A connection is split into a write half shared by everybody who sends (serialized through a
//!  mutex, one frame at a time) and a read half that is owned exclusively by the connection's
//!  read loop.

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, trace};

use crate::codec::{MessageCodec, Tagged};

/// The socket a peer process listens on: a base directory plus a per-peer name suffix
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerEndpoint {
    path: PathBuf,
}

impl PeerEndpoint {
    pub fn new(socket_dir: impl AsRef<Path>, suffix: &str) -> PeerEndpoint {
        PeerEndpoint {
            path: socket_dir.as_ref().join(suffix),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Connects to a peer's socket, retrying at a fixed interval until the peer is there. This
///  never gives up: the gateway is useless without its peers.
pub async fn connect_with_retry(endpoint: &PeerEndpoint, retry_interval: Duration) -> UnixStream {
    let mut num_attempts: u64 = 0;
    loop {
        match UnixStream::connect(endpoint.path()).await {
            Ok(stream) => {
                info!("connected to {:?} after {} failed attempts", endpoint.path(), num_attempts);
                return stream;
            }
            Err(e) => {
                if num_attempts == 0 {
                    info!("waiting for {:?} to become available: {}", endpoint.path(), e);
                }
                else {
                    debug!("connecting to {:?} failed, retrying in {:?}: {}", endpoint.path(), retry_interval, e);
                }
                num_attempts += 1;
                sleep(retry_interval).await;
            }
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSender<M: Send + Sync + 'static>: Send + Sync + 'static {
    /// fire-and-forget: failures are logged and otherwise ignored
    async fn send(&self, msg: &M) {
        if let Err(e) = self.try_send(msg).await {
            error!("error sending message: {}", e);
        }
    }

    async fn try_send(&self, msg: &M) -> anyhow::Result<()>;
}

/// The write half of a peer connection, together with the codec for the peer's protocol family
pub struct Connection<C: MessageCodec> {
    name: String,
    codec: Arc<C>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl <C: MessageCodec> Debug for Connection<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{name:{},family:{}}}", self.name, C::FAMILY)
    }
}

impl <C: MessageCodec> Connection<C> {
    /// Splits a duplex stream into the shared [Connection] for writing and the [FrameReader]
    ///  for the read loop.
    pub fn new<S>(name: impl Into<String>, codec: Arc<C>, stream: S) -> (Connection<C>, FrameReader)
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let name = name.into();
        let (read_half, write_half) = tokio::io::split(stream);

        let connection = Connection {
            name: name.clone(),
            codec,
            writer: Mutex::new(Box::new(write_half)),
        };
        let reader = FrameReader {
            name,
            reader: Box::new(BufReader::new(read_half)),
        };
        (connection, reader)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// Writes a complete frame. The lock is held until the frame is flushed, so frames of
    ///  concurrent writers are never interleaved.
    pub async fn write_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("closing connection {}", self.name);
        self.writer.lock().await
            .shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl <C: MessageCodec> MessageSender<C::Message> for Connection<C> {
    async fn try_send(&self, msg: &C::Message) -> anyhow::Result<()> {
        let frame = self.codec.encode(msg)?;
        trace!(connection = %self.name, tag = ?msg.tag(), "sending {} bytes", frame.len());
        self.write_frame(&frame).await
    }
}

/// The read half of a peer connection.
pub struct FrameReader {
    name: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl Debug for FrameReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FrameReader{{name:{}}}", self.name)
    }
}

impl FrameReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads the next frame, returning its payload (i.e. without the length prefix). Any error,
    ///  including end of stream, means the connection is unusable.
    pub async fn read_frame(&mut self) -> std::io::Result<Bytes> {
        let len = self.reader.read_u16_le().await? as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(payload.into())
    }
}
