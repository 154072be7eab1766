//! Hextile rectangle decoding.
//!
//! The rectangle is partitioned into a row-major grid of ≤16×16 tiles
//! (edges clipped). Each tile leads with a sub-encoding flag byte; a
//! non-raw tile is flood-filled with the running background color and
//! then overpainted with zero or more subrects.
//!
//! The running foreground/background colors persist **across tiles
//! within one rectangle** and reset to 0 at rectangle start. A tile
//! that omits the color flags paints with whatever the previous tiles
//! established — resetting per tile would corrupt exactly those tiles.

use bitflags::bitflags;

use crate::decode::source::UpdateSource;
use crate::error::RfvError;
use crate::protocol::types::{FrameDescriptor, Rect};
use crate::sink::PixelSink;

bitflags! {
    /// Per-tile sub-encoding flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TileFlags: u8 {
        /// Verbatim pixels follow; all other bits are ignored.
        const RAW = 0x01;
        /// A 4-byte background color follows, replacing the running one.
        const BACKGROUND = 0x02;
        /// A 4-byte foreground color follows, replacing the running one.
        const FOREGROUND = 0x04;
        /// A subrect-count byte follows.
        const SUBRECT_COUNT = 0x08;
        /// Each subrect carries its own 4-byte color.
        const SUBRECTS_COLORED = 0x10;
    }
}

pub(crate) async fn apply_hextile<S: UpdateSource + ?Sized>(
    source: &mut S,
    descriptor: &FrameDescriptor,
    sink: &mut dyn PixelSink,
    area: Rect,
) -> Result<(), RfvError> {
    let format = descriptor.format;
    let stride = descriptor.width as usize;
    let frame = sink.frame();

    let mut background: u32 = 0;
    let mut foreground: u32 = 0;

    let tiles_x = (area.width as usize).div_ceil(16);
    let tiles_y = (area.height as usize).div_ceil(16);

    for tile_y in 0..tiles_y {
        for tile_x in 0..tiles_x {
            let x_off = (tile_x * 16) as u16;
            let y_off = (tile_y * 16) as u16;
            let tile = Rect::new(
                area.x + x_off,
                area.y + y_off,
                16.min(area.width - x_off),
                16.min(area.height - y_off),
            );

            let flags = TileFlags::from_bits_retain(source.read_u8().await?);

            if flags.contains(TileFlags::RAW) {
                let mut raw = vec![0u8; tile.pixel_count() * 4];
                source.read_exact(&mut raw).await?;
                let mut src = raw.chunks_exact(4);
                let mut row_start = tile.y as usize * stride + tile.x as usize;
                for _ in 0..tile.height {
                    for dst in &mut frame[row_start..row_start + tile.width as usize] {
                        if let Some(px) = src.next() {
                            *dst = format
                                .to_device_pixel(u32::from_le_bytes([px[0], px[1], px[2], px[3]]));
                        }
                    }
                    row_start += stride;
                }
                continue;
            }

            if flags.contains(TileFlags::BACKGROUND) {
                background = format.to_device_pixel(source.read_pixel().await?);
            }
            if flags.contains(TileFlags::FOREGROUND) {
                foreground = format.to_device_pixel(source.read_pixel().await?);
            }
            let subrect_count = if flags.contains(TileFlags::SUBRECT_COUNT) {
                source.read_u8().await?
            } else {
                0
            };

            // Flood the tile, then overpaint subrects (none leaves the
            // tile solid background).
            fill_subrect(
                frame,
                stride,
                tile,
                0,
                0,
                tile.width as usize,
                tile.height as usize,
                background,
            );

            for _ in 0..subrect_count {
                let color = if flags.contains(TileFlags::SUBRECTS_COLORED) {
                    format.to_device_pixel(source.read_pixel().await?)
                } else {
                    foreground
                };
                let position = source.read_u8().await?;
                let size = source.read_u8().await?;
                fill_subrect(
                    frame,
                    stride,
                    tile,
                    (position >> 4) as usize,
                    (position & 0x0f) as usize,
                    ((size >> 4) as usize) + 1,
                    ((size & 0x0f) as usize) + 1,
                    color,
                );
            }
        }
    }

    Ok(())
}

/// Flood-fill a subrect given in tile-local coordinates, clipped to
/// the tile.
#[allow(clippy::too_many_arguments)]
fn fill_subrect(
    frame: &mut [u32],
    stride: usize,
    tile: Rect,
    sub_x: usize,
    sub_y: usize,
    sub_w: usize,
    sub_h: usize,
    color: u32,
) {
    let tile_w = tile.width as usize;
    let tile_h = tile.height as usize;
    if sub_x >= tile_w || sub_y >= tile_h {
        return;
    }
    let sub_w = sub_w.min(tile_w - sub_x);
    let sub_h = sub_h.min(tile_h - sub_y);

    let mut row_start = (tile.y as usize + sub_y) * stride + tile.x as usize + sub_x;
    for _ in 0..sub_h {
        frame[row_start..row_start + sub_w].fill(color);
        row_start += stride;
    }
}

// ── Tests ────────────────────────────────────────────────────────
