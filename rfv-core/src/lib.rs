//! # rfv-core
//!
//! Core protocol engine for the RFV remote framebuffer viewer.
//!
//! This crate contains:
//! - **Channel**: `ByteChannel` — typed fixed-size reads/writes over one
//!   TCP connection, slab-buffered reads and FIFO-serialized writes
//! - **Protocol**: wire types (`FrameDescriptor`, `PixelFormat`,
//!   `RectHeader`) and client message builders
//! - **Decode**: raw and hextile rectangle decoders over a common
//!   `UpdateSource` seam (streamed or cached payloads)
//! - **Cache**: `FrameCache` — persistent key→blob store letting the
//!   server omit payloads the client has already seen
//! - **Session**: `RfbSession` — handshake, encoding negotiation, the
//!   update loop, RPC side channel, gestures, keep-alive
//! - **Error**: `RfvError` / `CacheError` — typed, `thiserror`-based
//!   error hierarchy

pub mod cache;
pub mod channel;
pub mod decode;
pub mod error;
pub mod protocol;
pub mod session;
pub mod sink;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use cache::{CacheInfo, CacheKey, FrameCache};
pub use channel::{ByteChannel, ChannelPhase, ChannelSender};
pub use decode::{MemorySource, TileFlags, UpdateSource};
pub use error::{CacheError, RfvError};
pub use protocol::messages::Encoding;
pub use protocol::types::{FrameDescriptor, PixelFormat, Rect, RectHeader};
pub use session::{
    ApiDispatcher, NullDispatcher, Point, PressPhase, RfbSession, SessionConfig, SessionHandle,
    SessionPhase,
};
pub use sink::PixelSink;
