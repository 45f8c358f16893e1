//! Message transport between key client and key server
//!
//! `SecureChannel` is the seam the key exchange is written against: it moves
//! whole messages and reports a clean close as `None`. `FramedChannel` is the
//! stock implementation, a 4-byte big-endian length prefix per message over
//! any `AsyncRead + AsyncWrite` stream (TCP, a TLS stream, or an in-memory
//! duplex in tests).

use std::future::Future;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tds_core::{TdsError, TdsResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest message accepted by default (8 MiB).
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

pub trait SecureChannel: Send {
    /// Send one whole message.
    fn send(&mut self, payload: &[u8]) -> impl Future<Output = TdsResult<()>> + Send;

    /// Receive one whole message, or `None` once the peer has closed the channel.
    fn recv(&mut self) -> impl Future<Output = TdsResult<Option<Bytes>>> + Send;

    /// Flush and close the sending half.
    fn close(&mut self) -> impl Future<Output = TdsResult<()>> + Send;
}

pub struct FramedChannel<T> {
    inner: Framed<T, LengthDelimitedCodec>,
}

impl<T> FramedChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: T) -> Self {
        Self::with_max_frame(io, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(io: T, max_frame: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame)
            .new_codec();
        Self {
            inner: Framed::new(io, codec),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> SecureChannel for FramedChannel<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, payload: &[u8]) -> TdsResult<()> {
        self.inner
            .send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| TdsError::Channel(format!("send failed: {e}")))
    }

    async fn recv(&mut self) -> TdsResult<Option<Bytes>> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(TdsError::Channel(format!("receive failed: {e}"))),
        }
    }

    async fn close(&mut self) -> TdsResult<()> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(|e| TdsError::Channel(format!("close failed: {e}")))
    }
}
