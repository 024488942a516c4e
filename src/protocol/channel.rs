use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A bidirectional, chunk-oriented byte channel.
///
/// The wire protocol runs over anything that can send a buffer and hand back
/// the next received chunk: a WebSocket carrying binary frames, an in-memory
/// pipe in tests, and so on. Chunk boundaries carry no meaning; the
/// [`FrameReader`](super::FrameReader) reassembles protocol messages.
#[async_trait]
pub trait Channel: Send {
    /// Send one buffer. Implementations should not split it.
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Receive the next chunk. An empty chunk means the peer closed.
    async fn recv(&mut self) -> Result<Bytes>;

    /// Close the underlying transport gracefully.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Check, without waiting, that the peer has not gone away. Data that
    /// arrives meanwhile stays queued for the next [`recv`](Self::recv).
    fn is_open(&mut self) -> bool {
        true
    }
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for Box<C> {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        (**self).send(data).await
    }

    async fn recv(&mut self) -> Result<Bytes> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn is_open(&mut self) -> bool {
        (**self).is_open()
    }
}
