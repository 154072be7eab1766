//! Frame-update decoding.
//!
//! One frame update is a list of independently-encoded dirty
//! rectangles:
//!
//! ```text
//! [command:u8]  (cached payloads only — the session loop has already
//!                consumed it on the streaming path)
//! [padding:u8]
//! [rect_count:u16 BE]
//! rect_count × { RectHeader, payload per encoding }
//! ```
//!
//! Rectangles are applied strictly in server-send order, and a redraw
//! of exactly the rectangle's area is requested after each one.

mod hextile;
mod raw;
mod source;

pub use hextile::TileFlags;
pub use source::{MemorySource, UpdateSource};

use bytes::Bytes;
use tracing::trace;

use crate::error::RfvError;
use crate::protocol::messages::Encoding;
use crate::protocol::types::{FrameDescriptor, RectHeader};
use crate::sink::PixelSink;

/// Decode one update body from `source` into the sink's pixel buffer.
///
/// The leading command byte must already have been consumed.
pub async fn apply_update<S: UpdateSource + ?Sized>(
    source: &mut S,
    descriptor: &FrameDescriptor,
    sink: &mut dyn PixelSink,
) -> Result<(), RfvError> {
    let _padding = source.read_u8().await?;
    let rect_count = source.read_u16_be().await?;
    trace!("frame update: {rect_count} rectangles");

    for _ in 0..rect_count {
        apply_rectangle(source, descriptor, sink).await?;
    }
    Ok(())
}

/// Decode a complete cached payload, command byte included.
pub async fn apply_cached_update(
    payload: Bytes,
    descriptor: &FrameDescriptor,
    sink: &mut dyn PixelSink,
) -> Result<(), RfvError> {
    let mut source = MemorySource::new(payload);
    let _command = source.read_u8().await?;
    apply_update(&mut source, descriptor, sink).await
}

async fn apply_rectangle<S: UpdateSource + ?Sized>(
    source: &mut S,
    descriptor: &FrameDescriptor,
    sink: &mut dyn PixelSink,
) -> Result<(), RfvError> {
    let mut header_bytes = [0u8; RectHeader::WIRE_SIZE];
    source.read_exact(&mut header_bytes).await?;
    let header = RectHeader::parse(&header_bytes);
    let area = header.rect;

    // A rectangle outside the negotiated framebuffer cannot be
    // applied safely.
    if area.x as usize + area.width as usize > descriptor.width as usize
        || area.y as usize + area.height as usize > descriptor.height as usize
    {
        return Err(RfvError::OutOfBounds);
    }

    match header.encoding {
        e if e == Encoding::Raw as i32 => {
            raw::apply_raw(source, descriptor, sink, area).await?;
        }
        e if e == Encoding::Hextile as i32 => {
            hextile::apply_hextile(source, descriptor, sink, area).await?;
        }
        other => return Err(RfvError::UnsupportedRectangleEncoding(other)),
    }

    sink.redisplay(area);
    Ok(())
}

// ── Test support ─────────────────────────────────────────────────


// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testutil::{descriptor, TestSink};
    use super::*;
    use crate::protocol::types::Rect;

    fn raw_rect_message(area: Rect, pixels: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&area.x.to_be_bytes());
        buf.extend_from_slice(&area.y.to_be_bytes());
        buf.extend_from_slice(&area.width.to_be_bytes());
        buf.extend_from_slice(&area.height.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        for px in pixels {
            buf.extend_from_slice(&px.to_le_bytes());
        }
        buf
    }

    #[tokio::test]
    async fn cached_update_applies_rects_and_requests_redraws() {
        let desc = descriptor(4, 4);
        let mut sink = TestSink::new(4, 4);

        let mut payload = vec![0u8, 0]; // command + padding
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend(raw_rect_message(Rect::new(0, 0, 2, 1), &[1, 2]));
        payload.extend(raw_rect_message(Rect::new(2, 2, 1, 2), &[3, 4]));

        apply_cached_update(Bytes::from(payload), &desc, &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.pixels[0..2], [1, 2]);
        assert_eq!(sink.pixels[2 * 4 + 2], 3);
        assert_eq!(sink.pixels[3 * 4 + 2], 4);
        // Redraws in server-send order, exactly per rectangle.
        assert_eq!(
            sink.redisplays,
            vec![Rect::new(0, 0, 2, 1), Rect::new(2, 2, 1, 2)]
        );
    }

    #[tokio::test]
    async fn unknown_encoding_aborts_update() {
        let desc = descriptor(4, 4);
        let mut sink = TestSink::new(4, 4);

        let mut payload = vec![0u8, 0];
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes()); // x
        payload.extend_from_slice(&0u16.to_be_bytes()); // y
        payload.extend_from_slice(&1u16.to_be_bytes()); // width
        payload.extend_from_slice(&1u16.to_be_bytes()); // height
        payload.extend_from_slice(&16i32.to_be_bytes()); // ZRLE — unsupported

        let err = apply_cached_update(Bytes::from(payload), &desc, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, RfvError::UnsupportedRectangleEncoding(16)));
        assert!(sink.redisplays.is_empty());
    }

    #[tokio::test]
    async fn rect_outside_framebuffer_is_rejected() {
        let desc = descriptor(4, 4);
        let mut sink = TestSink::new(4, 4);

        let mut payload = vec![0u8, 0];
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend(raw_rect_message(Rect::new(3, 0, 2, 1), &[1, 2]));

        let err = apply_cached_update(Bytes::from(payload), &desc, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, RfvError::OutOfBounds));
    }

    #[tokio::test]
    async fn empty_update_is_a_no_op() {
        let desc = descriptor(4, 4);
        let mut sink = TestSink::new(4, 4);

        let mut payload = vec![0u8, 0];
        payload.extend_from_slice(&0u16.to_be_bytes());

        apply_cached_update(Bytes::from(payload), &desc, &mut sink)
            .await
            .unwrap();
        assert!(sink.redisplays.is_empty());
        assert!(sink.pixels.iter().all(|&p| p == 0));
    }
}
