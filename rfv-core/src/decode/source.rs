//! Byte sources feeding the tile decoder.
//!
//! One frame update can arrive two ways: streamed straight off the
//! socket (fresh frames) or replayed from an in-memory payload (cached
//! frames). [`UpdateSource`] is the seam that lets one decoder serve
//! both.

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::ByteChannel;
use crate::error::RfvError;

// ── UpdateSource ─────────────────────────────────────────────────

/// Sequential byte source for one frame-update body.
#[async_trait]
pub trait UpdateSource: Send {
    /// Fill `dst` completely or fail.
    async fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), RfvError>;

    async fn read_u8(&mut self) -> Result<u8, RfvError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_u16_be(&mut self) -> Result<u16, RfvError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    /// One 32-bit server pixel (little-endian on the wire).
    async fn read_pixel(&mut self) -> Result<u32, RfvError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_le_bytes(buf))
    }
}

// ── MemorySource ─────────────────────────────────────────────────

/// Replays a cached frame payload.
///
/// Reading past the end of the payload fails with
/// [`RfvError::OutOfBounds`].
pub struct MemorySource {
    data: Bytes,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }
}

#[async_trait]
impl UpdateSource for MemorySource {
    async fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), RfvError> {
        let end = self.pos + dst.len();
        if end > self.data.len() {
            return Err(RfvError::OutOfBounds);
        }
        dst.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(())
    }
}

// ── ByteChannel as a source ──────────────────────────────────────

#[async_trait]
impl UpdateSource for ByteChannel {
    async fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), RfvError> {
        // Inherent method; suspends until the transport delivers.
        ByteChannel::read_exact(self, dst).await
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_reads_sequentially() {
        let mut src = MemorySource::new(Bytes::from_static(&[1, 0, 2, 0xaa, 0xbb, 0xcc, 0xdd]));
        assert_eq!(src.read_u8().await.unwrap(), 1);
        assert_eq!(src.read_u16_be().await.unwrap(), 2);
        assert_eq!(src.read_pixel().await.unwrap(), 0xddcc_bbaa);
    }

    #[tokio::test]
    async fn memory_source_overrun_is_out_of_bounds() {
        let mut src = MemorySource::new(Bytes::from_static(&[1, 2]));
        let mut buf = [0u8; 3];
        let err = src.read_exact(&mut buf).await.unwrap_err();
        assert!(matches!(err, RfvError::OutOfBounds));
    }
}
