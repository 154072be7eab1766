//! Watch-channel display sink.
//!
//! The decoded frame buffer is published via `tokio::sync::watch` so a
//! renderer (or, here, a logger) can read the latest frame without
//! blocking the protocol loop.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{info, trace};

use rfv_core::{ApiDispatcher, PixelSink, Rect};

// ── FrameSnapshot ────────────────────────────────────────────────

/// The latest decoded frame plus the area that just changed.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u32>,
    /// The rectangle whose repaint was requested, if any.
    pub dirty: Option<Rect>,
}

// ── WatchSink ────────────────────────────────────────────────────

/// `PixelSink` that owns the live buffer and snapshots it to a watch
/// channel on every redisplay request.
pub struct WatchSink {
    width: u16,
    height: u16,
    pixels: Vec<u32>,
    frame_tx: watch::Sender<FrameSnapshot>,
}

impl WatchSink {
    pub fn new() -> (Self, watch::Receiver<FrameSnapshot>) {
        let (frame_tx, frame_rx) = watch::channel(FrameSnapshot::default());
        (
            Self {
                width: 0,
                height: 0,
                pixels: Vec::new(),
                frame_tx,
            },
            frame_rx,
        )
    }
}

impl PixelSink for WatchSink {
    fn allocate(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize];
        info!("framebuffer allocated: {width}x{height}");
    }

    fn free(&mut self) {
        self.pixels = Vec::new();
        self.width = 0;
        self.height = 0;
    }

    fn frame(&mut self) -> &mut [u32] {
        &mut self.pixels
    }

    fn redisplay(&mut self, area: Rect) {
        trace!(
            "redisplay {}x{} at ({}, {})",
            area.width, area.height, area.x, area.y
        );
        let _ = self.frame_tx.send(FrameSnapshot {
            width: self.width,
            height: self.height,
            pixels: self.pixels.clone(),
            dirty: Some(area),
        });
    }
}

// ── LogDispatcher ────────────────────────────────────────────────

/// API dispatcher that logs every server invocation.
pub struct LogDispatcher;

impl ApiDispatcher for LogDispatcher {
    fn on_api_call(&mut self, parameters: HashMap<String, String>) {
        info!("api invocation:");
        for (name, value) in &parameters {
            info!("  {name} = {value}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
