//! Domain-specific error types for the RFV viewer core.
//!
//! All fallible operations return `Result<T, RfvError>`.
//! No panics on invalid input — every error is typed and recoverable
//! at the session boundary.

use thiserror::Error;

/// The canonical error type for the RFV protocol engine.
#[derive(Debug, Error)]
pub enum RfvError {
    // ── Channel Errors ───────────────────────────────────────────
    /// `connect()` was called on a channel that is not closed.
    #[error("channel is already open")]
    AlreadyOpen,

    /// The remote address could not be resolved to a socket endpoint.
    #[error("cannot create stream to {0}")]
    CannotCreateStream(String),

    /// The TCP connection attempt failed.
    #[error("cannot connect to {0}")]
    CannotConnect(String),

    /// The transport faulted or hit end-of-stream mid-read.
    #[error("read error")]
    ReadError,

    /// The transport faulted mid-write.
    #[error("write error")]
    WriteError,

    /// A read was issued against a channel that is not open.
    #[error("reading from non-open channel")]
    ReadingFromNonOpenChannel,

    /// A write was issued against a channel that is not open.
    #[error("sending to non-open channel")]
    SendingToNonOpenChannel,

    // ── Handshake / Session Errors ───────────────────────────────
    /// The server offered no authentication methods and reported why.
    #[error("invalid connection: {message}")]
    InvalidConnection { message: String },

    /// The server rejected the security handshake and reported why.
    #[error("security handshake failed: {message}")]
    SecurityFailed { message: String },

    /// The ready loop read a message-type byte it does not understand.
    #[error("unexpected server message type: {0:#x}")]
    UnexpectedServerMessage(u8),

    /// A session operation was attempted in the wrong phase.
    #[error("invalid session transition: {0}")]
    InvalidTransition(&'static str),

    /// A frame operation ran before the server sent its descriptor.
    #[error("no frame descriptor")]
    NoFrameDescriptor,

    // ── Decode Errors ────────────────────────────────────────────
    /// A rectangle header carried an encoding id the decoder does not
    /// support.
    #[error("unsupported rectangle encoding: {0}")]
    UnsupportedRectangleEncoding(i32),

    /// A decode read past the supplied buffer, or a rectangle does not
    /// fit the negotiated framebuffer.
    #[error("out of bounds")]
    OutOfBounds,

    // ── Cache Errors ─────────────────────────────────────────────
    /// The frame cache failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error outside a typed read/write.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
}

// ── CacheError ───────────────────────────────────────────────────

/// Typed error for the persistent frame cache.
///
/// Cache-open failures are fatal to viewer startup; everything else is
/// reported per-operation.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key file could not be created.
    #[error("cannot create key file: {0}")]
    CannotCreateKeyFile(std::io::Error),

    /// The data file could not be created.
    #[error("cannot create data file: {0}")]
    CannotCreateDataFile(std::io::Error),

    /// A cache file carries an unknown version tag.
    #[error("invalid cache version: {found}")]
    InvalidCacheVersion { found: u32 },

    /// An I/O operation on an open cache file failed.
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RfvError::CannotConnect("10.0.0.7:5900".into());
        assert!(e.to_string().contains("10.0.0.7:5900"));

        let e = RfvError::SecurityFailed {
            message: "too many failures".into(),
        };
        assert!(e.to_string().contains("too many failures"));

        let e = RfvError::UnsupportedRectangleEncoding(16);
        assert!(e.to_string().contains("16"));
    }

    #[test]
    fn cache_error_wraps_into_rfv_error() {
        let e: RfvError = CacheError::InvalidCacheVersion { found: 7 }.into();
        assert!(matches!(
            e,
            RfvError::Cache(CacheError::InvalidCacheVersion { found: 7 })
        ));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RfvError = io_err.into();
        assert!(matches!(e, RfvError::Connection(_)));
    }
}
