//! Integration tests — full session lifecycle against a scripted
//! fake server over a real TCP connection on localhost.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use rfv_core::{
    FrameCache, NullDispatcher, PixelSink, Point, PressPhase, Rect, RfbSession, RfvError,
    SessionConfig, SessionHandle,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Sink that records every interaction and keeps its pixels after
/// `free()` so tests can assert on the final image.
#[derive(Default)]
struct RecordingSink {
    pixels: Vec<u32>,
    allocated: Option<(u16, u16)>,
    freed: bool,
    redisplays: Vec<Rect>,
}

impl PixelSink for RecordingSink {
    fn allocate(&mut self, width: u16, height: u16) {
        self.pixels = vec![0; width as usize * height as usize];
        self.allocated = Some((width, height));
    }

    fn free(&mut self) {
        self.freed = true;
    }

    fn frame(&mut self) -> &mut [u32] {
        &mut self.pixels
    }

    fn redisplay(&mut self, area: Rect) {
        self.redisplays.push(area);
    }
}

type TestSession = RfbSession<RecordingSink, NullDispatcher>;

/// Listener on an OS-assigned port plus a session wired to it, already
/// running in a background task. The task returns the session for
/// post-mortem inspection.
async fn start_session(
    config: SessionConfig,
) -> (
    TcpStream,
    SessionHandle,
    JoinHandle<(TestSession, Result<(), RfvError>)>,
    tempfile::TempDir,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cache_dir = tempfile::tempdir().unwrap();
    let cache = FrameCache::open(cache_dir.path()).unwrap();
    let (mut session, handle) =
        RfbSession::new(RecordingSink::default(), NullDispatcher, cache, config);

    let task = tokio::spawn(async move {
        let result = session.run("127.0.0.1", addr.port()).await;
        (session, result)
    });

    let (server, _) = listener.accept().await.unwrap();
    (server, handle, task, cache_dir)
}

/// Drive the server side of the handshake up to and including the
/// ServerInit message.
async fn serve_handshake(server: &mut TcpStream, width: u16, height: u16, name: &str) {
    server.write_all(b"RFB 003.008\n").await.unwrap();
    let mut client_version = [0u8; 12];
    server.read_exact(&mut client_version).await.unwrap();
    assert_eq!(&client_version, b"RFB 003.008\n");

    // One security method: none.
    server.write_all(&[1, 1]).await.unwrap();
    let mut selected = [0u8; 1];
    server.read_exact(&mut selected).await.unwrap();
    assert_eq!(selected[0], 1);

    server.write_all(&0u32.to_be_bytes()).await.unwrap();
    let mut share = [0u8; 1];
    server.read_exact(&mut share).await.unwrap();
    assert_eq!(share[0], 1);

    let mut init = Vec::new();
    init.extend_from_slice(&width.to_be_bytes());
    init.extend_from_slice(&height.to_be_bytes());
    init.extend_from_slice(&[32, 24, 0, 1]); // bpp, depth, little-endian, true-colour
    init.extend_from_slice(&255u16.to_be_bytes());
    init.extend_from_slice(&255u16.to_be_bytes());
    init.extend_from_slice(&255u16.to_be_bytes());
    init.extend_from_slice(&[0, 8, 16, 0, 0, 0]); // shifts + padding
    init.extend_from_slice(&(name.len() as u32).to_be_bytes());
    init.extend_from_slice(name.as_bytes());
    server.write_all(&init).await.unwrap();
}

/// Read the SetEncodings message and return the encoding ids.
async fn read_set_encodings(server: &mut TcpStream) -> Vec<i32> {
    let mut head = [0u8; 4];
    server.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 2);
    let count = u16::from_be_bytes([head[2], head[3]]) as usize;
    let mut body = vec![0u8; count * 4];
    server.read_exact(&mut body).await.unwrap();
    body.chunks_exact(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Read a FramebufferUpdateRequest; returns (incremental, w, h).
async fn read_update_request(server: &mut TcpStream) -> (bool, u16, u16) {
    let mut buf = [0u8; 10];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf[0], 3);
    (
        buf[1] != 0,
        u16::from_be_bytes([buf[6], buf[7]]),
        u16::from_be_bytes([buf[8], buf[9]]),
    )
}

async fn timed<T, F: std::future::Future<Output = T>>(fut: F) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timeout")
}

fn raw_update_message(command: bool, area: Rect, pixels: &[u32]) -> Vec<u8> {
    let mut msg = Vec::new();
    if command {
        msg.push(0u8);
    }
    msg.push(0); // padding
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&area.x.to_be_bytes());
    msg.extend_from_slice(&area.y.to_be_bytes());
    msg.extend_from_slice(&area.width.to_be_bytes());
    msg.extend_from_slice(&area.height.to_be_bytes());
    msg.extend_from_slice(&0i32.to_be_bytes());
    for px in pixels {
        msg.extend_from_slice(&px.to_le_bytes());
    }
    msg
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_negotiates_and_allocates_buffer() {
    let (mut server, _handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 100, 80, "test")).await;

    let encodings = timed(read_set_encodings(&mut server)).await;
    assert_eq!(encodings, vec![5, 0, 102, 101]);

    let (incremental, w, h) = timed(read_update_request(&mut server)).await;
    assert!(!incremental);
    assert_eq!((w, h), (100, 80));

    // Server disconnects; the session must end cleanly, not crash.
    drop(server);
    let (session, result) = timed(task).await.unwrap();
    assert!(result.is_err());
    assert!(session.phase().is_terminated());

    let view = session.view();
    assert_eq!(view.allocated, Some((100, 80)));
    assert!(view.redisplays.is_empty(), "nothing was decoded");
    assert!(view.freed);
}

#[tokio::test]
async fn caching_disabled_drops_cache_encoding() {
    let config = SessionConfig {
        disable_caching: true,
        ..SessionConfig::default()
    };
    let (mut server, _handle, task, _dir) = start_session(config).await;

    timed(serve_handshake(&mut server, 16, 16, "x")).await;
    let encodings = timed(read_set_encodings(&mut server)).await;
    assert_eq!(encodings, vec![5, 0, 102]);

    drop(server);
    let _ = timed(task).await.unwrap();
}

#[tokio::test]
async fn zero_auth_methods_surfaces_server_error() {
    let (mut server, _handle, task, _dir) = start_session(SessionConfig::default()).await;

    server.write_all(b"RFB 003.008\n").await.unwrap();
    let mut client_version = [0u8; 12];
    server.read_exact(&mut client_version).await.unwrap();

    // Zero methods, then the reason.
    let reason = b"connection limit reached";
    server.write_all(&[0]).await.unwrap();
    server
        .write_all(&(reason.len() as u32).to_be_bytes())
        .await
        .unwrap();
    server.write_all(reason).await.unwrap();

    let (_session, result) = timed(task).await.unwrap();
    match result {
        Err(RfvError::InvalidConnection { message }) => {
            assert_eq!(message, "connection limit reached");
        }
        other => panic!("expected InvalidConnection, got {other:?}"),
    }
}

#[tokio::test]
async fn security_failure_surfaces_server_error() {
    let (mut server, _handle, task, _dir) = start_session(SessionConfig::default()).await;

    server.write_all(b"RFB 003.008\n").await.unwrap();
    let mut client_version = [0u8; 12];
    server.read_exact(&mut client_version).await.unwrap();

    server.write_all(&[1, 1]).await.unwrap();
    let mut selected = [0u8; 1];
    server.read_exact(&mut selected).await.unwrap();

    // Nonzero security result, then the reason.
    let reason = b"authentication rejected";
    server.write_all(&1u32.to_be_bytes()).await.unwrap();
    server
        .write_all(&(reason.len() as u32).to_be_bytes())
        .await
        .unwrap();
    server.write_all(reason).await.unwrap();

    let (_session, result) = timed(task).await.unwrap();
    match result {
        Err(RfvError::SecurityFailed { message }) => {
            assert_eq!(message, "authentication rejected");
        }
        other => panic!("expected SecurityFailed, got {other:?}"),
    }
}

// ── Update loop ──────────────────────────────────────────────────

#[tokio::test]
async fn plain_update_decodes_and_requests_incremental() {
    let (mut server, _handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 4, 2, "s")).await;
    timed(read_set_encodings(&mut server)).await;
    timed(read_update_request(&mut server)).await;

    // One raw rectangle covering the full 4×2 framebuffer.
    let msg = raw_update_message(
        true,
        Rect::new(0, 0, 4, 2),
        &[1, 2, 3, 4, 5, 6, 7, 8],
    );
    server.write_all(&msg).await.unwrap();

    let (incremental, w, h) = timed(read_update_request(&mut server)).await;
    assert!(incremental);
    assert_eq!((w, h), (4, 2));

    drop(server);
    let (session, _) = timed(task).await.unwrap();
    let view = session.view();
    assert_eq!(view.pixels, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(view.redisplays, vec![Rect::new(0, 0, 4, 2)]);
}

#[tokio::test]
async fn cache_miss_requests_frame_data_not_update() {
    let (mut server, handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 4, 2, "s")).await;
    timed(read_set_encodings(&mut server)).await;
    timed(read_update_request(&mut server)).await;

    // Caching extension, has_data = 0, unknown fingerprint.
    let mut msg = vec![101u8, 0];
    msg.extend_from_slice(&32u32.to_be_bytes()); // length
    msg.extend_from_slice(&0xdead_beefu32.to_be_bytes()); // hash
    server.write_all(&msg).await.unwrap();

    // The client must answer with the bare send-frame-data byte…
    let mut reply = [0u8; 1];
    timed(server.read_exact(&mut reply)).await.unwrap();
    assert_eq!(reply[0], 101);

    // …and send nothing else this cycle (no update request).
    let mut extra = [0u8; 1];
    let res = tokio::time::timeout(Duration::from_millis(200), server.read_exact(&mut extra)).await;
    assert!(res.is_err(), "client sent unexpected bytes after SendFrameData");

    handle.terminate();
    let (session, result) = timed(task).await.unwrap();
    assert!(result.is_ok(), "cancel is a clean exit: {result:?}");
    assert!(session.phase().is_terminated());
}

#[tokio::test]
async fn cached_payload_is_stored_and_replayed() {
    let (mut server, _handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 4, 2, "s")).await;
    timed(read_set_encodings(&mut server)).await;
    timed(read_update_request(&mut server)).await;

    // Full update message as a cacheable payload.
    let payload = raw_update_message(
        true,
        Rect::new(0, 0, 4, 2),
        &[9, 9, 9, 9, 9, 9, 9, 9],
    );
    let mut msg = vec![101u8, 1];
    msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    msg.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    msg.extend_from_slice(&payload);
    server.write_all(&msg).await.unwrap();

    let (incremental, _, _) = timed(read_update_request(&mut server)).await;
    assert!(incremental);

    // Same fingerprint, no payload: must be served from the cache and
    // answered with another incremental request.
    let mut msg = vec![101u8, 0];
    msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    msg.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    server.write_all(&msg).await.unwrap();

    let (incremental, _, _) = timed(read_update_request(&mut server)).await;
    assert!(incremental);

    drop(server);
    let (session, _) = timed(task).await.unwrap();
    assert_eq!(session.view().pixels, vec![9; 8]);
    // Applied once from the wire and once from the cache.
    assert_eq!(session.view().redisplays.len(), 2);
}

// ── Input forwarding ─────────────────────────────────────────────

#[tokio::test]
async fn tap_sends_down_up_pair() {
    let (mut server, handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 16, 16, "s")).await;
    timed(read_set_encodings(&mut server)).await;
    timed(read_update_request(&mut server)).await;

    handle.tap(Point { x: 10, y: 20 });

    let mut events = [0u8; 12];
    timed(server.read_exact(&mut events)).await.unwrap();
    assert_eq!(&events[0..6], &[5, 1, 0, 10, 0, 20]);
    assert_eq!(&events[6..12], &[5, 0, 0, 10, 0, 20]);

    handle.terminate();
    let _ = timed(task).await.unwrap();
}

#[tokio::test]
async fn press_lifecycle_maps_to_pointer_events() {
    let (mut server, handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 16, 16, "s")).await;
    timed(read_set_encodings(&mut server)).await;
    timed(read_update_request(&mut server)).await;

    handle.press(Point { x: 3, y: 4 }, PressPhase::Began);
    handle.press(Point { x: 3, y: 4 }, PressPhase::Ended);

    let mut events = [0u8; 12];
    timed(server.read_exact(&mut events)).await.unwrap();
    assert_eq!(&events[0..6], &[5, 1, 0, 3, 0, 4]);
    assert_eq!(&events[6..12], &[5, 0, 0, 3, 0, 4]);

    handle.terminate();
    let _ = timed(task).await.unwrap();
}

// ── RPC side channel ─────────────────────────────────────────────

fn api_string(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut buf = Vec::new();
    buf.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for u in units {
        buf.extend_from_slice(&u.to_be_bytes());
    }
    buf
}

#[tokio::test]
async fn server_version_rpc_triggers_viewer_version_reply() {
    let (mut server, handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 16, 16, "s")).await;
    timed(read_set_encodings(&mut server)).await;
    timed(read_update_request(&mut server)).await;

    // InvokeApi from the server: Method=ServerVersion, Version=3.
    let mut msg = vec![100u8, 0];
    msg.extend(api_string("Method"));
    msg.extend(api_string("ServerVersion"));
    msg.extend(api_string("Version"));
    msg.extend(api_string("3"));
    msg.extend_from_slice(&[0, 0]);
    server.write_all(&msg).await.unwrap();

    // Expect the ViewerVersion reply: [100, 0], three pairs, [0, 0].
    let mut head = [0u8; 2];
    timed(server.read_exact(&mut head)).await.unwrap();
    assert_eq!(head, [100, 0]);

    let mut pairs = HashMap::new();
    loop {
        let mut len_buf = [0u8; 2];
        timed(server.read_exact(&mut len_buf)).await.unwrap();
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            break;
        }
        let mut body = vec![0u8; len * 2];
        timed(server.read_exact(&mut body)).await.unwrap();
        let name: String = String::from_utf16_lossy(
            &body
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect::<Vec<u16>>(),
        );

        let mut len_buf = [0u8; 2];
        timed(server.read_exact(&mut len_buf)).await.unwrap();
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len * 2];
        timed(server.read_exact(&mut body)).await.unwrap();
        let value: String = String::from_utf16_lossy(
            &body
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect::<Vec<u16>>(),
        );
        pairs.insert(name, value);
    }

    assert_eq!(pairs.get("Method").map(String::as_str), Some("ViewerVersion"));
    assert_eq!(pairs.get("Version").map(String::as_str), Some("1"));
    assert_eq!(pairs.get("App").map(String::as_str), Some("rfv"));
    assert_eq!(handle.server_api_version(), Some(3));

    handle.terminate();
    let _ = timed(task).await.unwrap();
}

// ── Protocol errors ──────────────────────────────────────────────

#[tokio::test]
async fn unknown_message_type_terminates_cleanly() {
    let (mut server, _handle, task, _dir) = start_session(SessionConfig::default()).await;

    timed(serve_handshake(&mut server, 4, 2, "s")).await;
    timed(read_set_encodings(&mut server)).await;
    timed(read_update_request(&mut server)).await;

    server.write_all(&[0xee]).await.unwrap();

    let (session, result) = timed(task).await.unwrap();
    assert!(matches!(
        result,
        Err(RfvError::UnexpectedServerMessage(0xee))
    ));
    assert!(session.phase().is_terminated());
    assert!(session.view().freed);
}
