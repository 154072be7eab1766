//! Client → server message builders and protocol constants.
//!
//! Every builder returns the exact byte vector for one wire message so
//! callers can hand it straight to the channel. Handshake and message
//! fields are big-endian; the RPC side channel carries UTF-16BE
//! length-prefixed strings.

use crate::protocol::types::Rect;

// ── Protocol constants ───────────────────────────────────────────

/// Client version string sent in reply to the server banner.
pub const CLIENT_VERSION: &[u8; 12] = b"RFB 003.008\n";

/// Security type selected from the server's method list ("none").
pub const SECURITY_NONE: u8 = 1;

/// Server → client message: plain framebuffer update.
pub const MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Server → client message: RPC invocation (name/value pairs).
pub const MSG_INVOKE_API: u8 = 100;

/// Server → client message: frame update extension carrying a cache
/// key and optionally the payload. Shares its id with the client's
/// send-frame-data control byte.
pub const MSG_FRAME_UPDATE_EXTENSION: u8 = 101;

// ── Encoding ─────────────────────────────────────────────────────

/// Rectangle encodings advertised during negotiation.
///
/// `Api` and `ClientCache` are private extensions: `Api` opens the RPC
/// side channel, `ClientCache` lets the server replace update bodies
/// with `{has_data, length, hash}` fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Encoding {
    Raw = 0,
    Hextile = 5,
    ClientCache = 101,
    Api = 102,
}

impl Encoding {
    /// Negotiation list in preference order.
    pub fn supported(caching: bool) -> Vec<Encoding> {
        if caching {
            vec![
                Encoding::Hextile,
                Encoding::Raw,
                Encoding::Api,
                Encoding::ClientCache,
            ]
        } else {
            vec![Encoding::Hextile, Encoding::Raw, Encoding::Api]
        }
    }
}

// ── Message builders ─────────────────────────────────────────────

/// SetEncodings: `[2, 0, count:u16 BE, encoding:i32 BE ...]`.
pub fn set_encodings(encodings: &[Encoding]) -> Vec<u8> {
    let mut command = vec![2u8, 0];
    command.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for encoding in encodings {
        command.extend_from_slice(&(*encoding as i32).to_be_bytes());
    }
    command
}

/// FramebufferUpdateRequest: `[3, incremental, x, y, w, h]` (u16 BE).
pub fn framebuffer_update_request(incremental: bool, area: Rect) -> Vec<u8> {
    let mut command = vec![3u8, incremental as u8];
    command.extend_from_slice(&area.x.to_be_bytes());
    command.extend_from_slice(&area.y.to_be_bytes());
    command.extend_from_slice(&area.width.to_be_bytes());
    command.extend_from_slice(&area.height.to_be_bytes());
    command
}

/// PointerEvent: `[5, button_mask, x:u16 BE, y:u16 BE]`.
pub fn pointer_event(button_down: bool, x: u16, y: u16) -> Vec<u8> {
    let mut command = vec![5u8, button_down as u8];
    command.extend_from_slice(&x.to_be_bytes());
    command.extend_from_slice(&y.to_be_bytes());
    command
}

/// SetCutText: `[6, 0, 0, 0, len:u32 BE, utf8 bytes]`.
///
/// Sent with empty text as the keep-alive ping.
pub fn set_cut_text(text: &str) -> Vec<u8> {
    let mut command = vec![6u8, 0, 0, 0];
    command.extend_from_slice(&(text.len() as u32).to_be_bytes());
    command.extend_from_slice(text.as_bytes());
    command
}

/// SendFrameData control message: the bare extension sentinel byte,
/// asking the server to transmit the payload for the last fingerprint.
pub fn send_frame_data() -> Vec<u8> {
    vec![MSG_FRAME_UPDATE_EXTENSION]
}

/// InvokeApi: `[100, 0, (name, value)*, 0, 0]` with each string
/// encoded per [`push_api_string`].
pub fn invoke_api<'a, I>(parameters: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut command = vec![MSG_INVOKE_API, 0];
    for (name, value) in parameters {
        push_api_string(&mut command, name);
        push_api_string(&mut command, value);
    }
    // Empty-name terminator.
    command.extend_from_slice(&[0, 0]);
    command
}

/// Append one RPC string: `len:u16 BE` in UTF-16 code units, then the
/// units big-endian.
pub fn push_api_string(buf: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    buf.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for unit in units {
        buf.extend_from_slice(&unit.to_be_bytes());
    }
}

/// Decode one RPC string body (`len * 2` bytes of UTF-16BE units).
///
/// Decoding is lossy: a malformed surrogate becomes U+FFFD rather than
/// failing the pair loop.
pub fn parse_api_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

// ── Tests ────────────────────────────────────────────────────────
