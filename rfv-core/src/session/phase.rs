//! Session lifecycle state machine.
//!
//! Models the full life of one viewer session with validated
//! transitions that return `Result` instead of panicking.

use std::time::Instant;

use crate::error::RfvError;

// ── SessionPhase ─────────────────────────────────────────────────

/// The current phase of a viewer session.
///
/// ```text
///  Disconnected ──► Connecting ──► VersionHandshake ──► SecurityHandshake
///                                                              │
///                 Terminated ◄── Ready ◄── AwaitingFrameDescriptor
/// ```
///
/// `Terminated` is reachable from every phase and is terminal: a
/// session drives exactly one connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No connection attempt yet. Initial state.
    #[default]
    Disconnected,

    /// TCP connect in progress.
    Connecting,

    /// Exchanging version banners.
    VersionHandshake,

    /// Negotiating the security method and result.
    SecurityHandshake,

    /// Waiting for the server's framebuffer descriptor.
    AwaitingFrameDescriptor,

    /// Update loop running.
    Ready {
        /// When the session entered the ready loop.
        since: Instant,
    },

    /// Torn down. Terminal.
    Terminated,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::VersionHandshake => write!(f, "VersionHandshake"),
            Self::SecurityHandshake => write!(f, "SecurityHandshake"),
            Self::AwaitingFrameDescriptor => write!(f, "AwaitingFrameDescriptor"),
            Self::Ready { .. } => write!(f, "Ready"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

impl SessionPhase {
    /// Returns `true` when the update loop is running.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Returns `true` once the session has been torn down.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// How long the session has been in the ready loop.
    pub fn ready_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Ready { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), RfvError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(RfvError::InvalidTransition(
                "cannot connect: not in Disconnected state",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn begin_version_handshake(&mut self) -> Result<(), RfvError> {
        match self {
            Self::Connecting => {
                *self = Self::VersionHandshake;
                Ok(())
            }
            _ => Err(RfvError::InvalidTransition(
                "cannot start version handshake: not in Connecting state",
            )),
        }
    }

    /// Valid from: `VersionHandshake`.
    pub fn begin_security_handshake(&mut self) -> Result<(), RfvError> {
        match self {
            Self::VersionHandshake => {
                *self = Self::SecurityHandshake;
                Ok(())
            }
            _ => Err(RfvError::InvalidTransition(
                "cannot start security handshake: not in VersionHandshake state",
            )),
        }
    }

    /// Valid from: `SecurityHandshake`.
    pub fn await_frame_descriptor(&mut self) -> Result<(), RfvError> {
        match self {
            Self::SecurityHandshake => {
                *self = Self::AwaitingFrameDescriptor;
                Ok(())
            }
            _ => Err(RfvError::InvalidTransition(
                "cannot await descriptor: not in SecurityHandshake state",
            )),
        }
    }

    /// Valid from: `AwaitingFrameDescriptor`.
    pub fn enter_ready(&mut self) -> Result<(), RfvError> {
        match self {
            Self::AwaitingFrameDescriptor => {
                *self = Self::Ready {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RfvError::InvalidTransition(
                "cannot enter ready loop: not in AwaitingFrameDescriptor state",
            )),
        }
    }

    /// Force-terminate from any phase. Idempotent.
    pub fn terminate(&mut self) {
        *self = Self::Terminated;
    }
}

// ── Tests ────────────────────────────────────────────────────────
