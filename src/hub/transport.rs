//! Length-prefixed framed transport.
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload. The
//! reader enforces the frame size limit before allocating.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::{ProtocolError, MAX_FRAME_BYTES};

/// Reads framed messages from a byte stream.
pub struct FramedReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wraps a readable stream.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary;
    /// a stream cut mid-frame is an error.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        let mut length_bytes = [0u8; 4];
        match self.inner.read_exact(&mut length_bytes).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let length = u32::from_be_bytes(length_bytes);
        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge { size: length });
        }

        let mut payload = vec![0u8; length as usize];
        self.inner.read_exact(&mut payload).await?;
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

/// Writes framed messages to a byte stream.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Wraps a writable stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serializes and writes one frame.
    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(message)?;
        let length = payload.len() as u32;
        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge { size: length });
        }

        self.inner.write_all(&length.to_be_bytes()).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
