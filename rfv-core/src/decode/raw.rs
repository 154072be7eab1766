//! Raw rectangle decoding.
//!
//! A raw rectangle carries `width × height` server pixels row-major.
//! Rectangles covering the whole framebuffer take a linear fast path;
//! everything else goes through the strided sub-rectangle copy.

use crate::decode::source::UpdateSource;
use crate::error::RfvError;
use crate::protocol::types::{FrameDescriptor, PixelFormat, Rect};
use crate::sink::PixelSink;

pub(crate) async fn apply_raw<S: UpdateSource + ?Sized>(
    source: &mut S,
    descriptor: &FrameDescriptor,
    sink: &mut dyn PixelSink,
    area: Rect,
) -> Result<(), RfvError> {
    let mut raw = vec![0u8; area.pixel_count() * 4];
    source.read_exact(&mut raw).await?;

    let frame = sink.frame();
    if area == descriptor.full_rect() {
        blit_linear(&raw, &descriptor.format, frame);
    } else {
        blit_strided(&raw, &descriptor.format, frame, descriptor.width as usize, area);
    }
    Ok(())
}

/// Full-framebuffer fast path: one linear pass.
fn blit_linear(raw: &[u8], format: &PixelFormat, frame: &mut [u32]) {
    for (dst, src) in frame.iter_mut().zip(raw.chunks_exact(4)) {
        *dst = format.to_device_pixel(u32::from_le_bytes([src[0], src[1], src[2], src[3]]));
    }
}

/// Generic path: copy row by row at the framebuffer stride.
fn blit_strided(raw: &[u8], format: &PixelFormat, frame: &mut [u32], stride: usize, area: Rect) {
    let mut src = raw.chunks_exact(4);
    let mut row_start = area.y as usize * stride + area.x as usize;
    for _ in 0..area.height {
        for dst in &mut frame[row_start..row_start + area.width as usize] {
            // chunks_exact is sized to the rect, so next() always yields.
            if let Some(px) = src.next() {
                *dst = format.to_device_pixel(u32::from_le_bytes([px[0], px[1], px[2], px[3]]));
            }
        }
        row_start += stride;
    }
}

// ── Tests ────────────────────────────────────────────────────────
