//! Transport adapters.
//!
//! The correlation layer needs two things from a connection: a way to write
//! an encoded frame, and a source of raw byte chunks. Each connection kind
//! (socket half, websocket bridge, in-memory channel) implements these traits
//! so the rest of the layer never looks at the concrete type.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

/// Default read buffer for [`ReaderSource`]
pub const DEFAULT_READ_BUFFER: usize = 8 * 1024;

/// Write side of a connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one complete encoded frame
    async fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Signal end of output to the peer. Called once the dispatch loop stops.
    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Read side of a connection
#[async_trait]
pub trait ChunkSource: Send {
    /// Next raw chunk. `None` or an empty chunk means the peer closed.
    async fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

/// Writes frames to any async byte sink.
///
/// Concurrent senders are serialized so frames never interleave.
pub struct StreamTransport<W> {
    writer: Mutex<W>,
}

impl<W> StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

/// Forwards frames into a channel, for connection kinds driven by their own
/// writer task (websocket bridges, tests).
#[derive(Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.sender
            .send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "Outbound channel closed"))
    }
}

/// Reads chunks from any async byte source until EOF or error.
pub struct ReaderSource<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R> ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, DEFAULT_READ_BUFFER)
    }

    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buffer: vec![0u8; capacity.max(1)],
        }
    }
}

#[async_trait]
impl<R> ChunkSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        match self.reader.read(&mut self.buffer).await {
            Ok(0) => {
                log::debug!("EOF reached on connection");
                None
            }
            Ok(n) => Some(self.buffer[..n].to_vec()),
            Err(e) => {
                log::error!("Error reading from connection: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl ChunkSource for mpsc::UnboundedReceiver<Vec<u8>> {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.recv().await
    }
}

#[async_trait]
impl ChunkSource for mpsc::Receiver<Vec<u8>> {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.recv().await
    }
}
