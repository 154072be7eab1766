//! Session engine.
//!
//! Orchestrates one viewer session end to end: the version and
//! security handshakes, encoding negotiation, the update-request/reply
//! loop with cache-aware frame delivery, the RPC side channel, input
//! forwarding, and the keep-alive ping.
//!
//! ## Concurrency model
//!
//! For the session's lifetime four routines share one channel: the
//! protocol loop (owned by [`RfbSession::run`]), a keep-alive timer,
//! and two gesture forwarders. Only the protocol loop reads or touches
//! the pixel buffer; all writers go through the channel's serializing
//! [`ChannelSender`], so no further locking is needed. A single
//! `CancellationToken` tears everything down.

mod phase;

pub use phase::SessionPhase;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, FrameCache};
use crate::channel::{ByteChannel, ChannelSender};
use crate::decode;
use crate::error::RfvError;
use crate::protocol::messages::{
    self, CLIENT_VERSION, Encoding, MSG_FRAME_UPDATE_EXTENSION, MSG_FRAMEBUFFER_UPDATE,
    MSG_INVOKE_API, SECURITY_NONE,
};
use crate::protocol::types::FrameDescriptor;
use crate::sink::PixelSink;

// ── ApiDispatcher ────────────────────────────────────────────────

/// External consumer of the RPC side channel.
pub trait ApiDispatcher: Send {
    /// Called with each decoded name/value mapping from the server.
    fn on_api_call(&mut self, parameters: HashMap<String, String>);
}

/// Dispatcher for hosts without an API surface.
pub struct NullDispatcher;

impl ApiDispatcher for NullDispatcher {
    fn on_api_call(&mut self, _parameters: HashMap<String, String>) {}
}

// ── SessionConfig ────────────────────────────────────────────────

/// Configuration for one [`RfbSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Skip advertising the client-caching encoding.
    pub disable_caching: bool,
    /// ClientInit share flag: leave other viewers connected.
    pub share_desktop: bool,
    /// Idle ping period. Defaults to 5 minutes, short enough to stop
    /// middleboxes from reclaiming the connection.
    pub keep_alive_interval: Duration,
    /// Optional bound on the TCP connect. The ready loop itself never
    /// times out; a silent server stalls until explicit termination.
    pub connect_timeout: Option<Duration>,
    /// Application name reported in the ViewerVersion RPC reply.
    pub app_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disable_caching: false,
            share_desktop: true,
            keep_alive_interval: Duration::from_secs(300),
            connect_timeout: None,
            app_name: "rfv".into(),
        }
    }
}

// ── Gestures ─────────────────────────────────────────────────────

/// A point in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: u16,
    pub y: u16,
}

/// Lifecycle of a long-press gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressPhase {
    Began,
    Ended,
    Cancelled,
}

// ── SessionHandle ────────────────────────────────────────────────

struct SessionShared {
    cancel: CancellationToken,
    sender: Mutex<Option<ChannelSender>>,
    /// Negotiated server API version; 0 until ServerVersion arrives.
    api_version: AtomicU32,
}

/// Cloneable control handle to a running [`RfbSession`].
///
/// Safe to use from any task; every method is fire-and-forget.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    press_tx: mpsc::UnboundedSender<(Point, PressPhase)>,
    tap_tx: mpsc::UnboundedSender<Point>,
}

impl SessionHandle {
    /// Tear the session down. Idempotent, callable from any task.
    pub fn terminate(&self) {
        debug!("session termination requested");
        self.shared.cancel.cancel();
    }

    /// Forward a long-press transition at `point`.
    pub fn press(&self, point: Point, phase: PressPhase) {
        let _ = self.press_tx.send((point, phase));
    }

    /// Forward a discrete tap at `point`.
    pub fn tap(&self, point: Point) {
        let _ = self.tap_tx.send(point);
    }

    /// The negotiated server API version, if any.
    pub fn server_api_version(&self) -> Option<u32> {
        match self.shared.api_version.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    /// Send an RPC invocation to the server.
    ///
    /// A no-op until the server has announced its API version. Must be
    /// called within a Tokio runtime; failures are swallowed.
    pub fn invoke_api(&self, parameters: HashMap<String, String>) {
        if self.server_api_version().is_none() {
            return;
        }
        let Some(sender) = self.shared.sender.lock().ok().and_then(|guard| guard.clone())
        else {
            return;
        };
        let message =
            messages::invoke_api(parameters.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        tokio::spawn(async move {
            let _ = sender.send(message).await;
        });
    }
}

// ── RfbSession ───────────────────────────────────────────────────

/// One viewer session: a single connection from `begin` to
/// termination. Create a fresh session to reconnect.
pub struct RfbSession<V: PixelSink, D: ApiDispatcher> {
    config: SessionConfig,
    view: V,
    dispatcher: D,
    cache: FrameCache,
    channel: ByteChannel,
    phase: SessionPhase,
    descriptor: Option<FrameDescriptor>,
    shared: Arc<SessionShared>,
    handle: SessionHandle,
    press_rx: Option<mpsc::UnboundedReceiver<(Point, PressPhase)>>,
    tap_rx: Option<mpsc::UnboundedReceiver<Point>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<V: PixelSink, D: ApiDispatcher> RfbSession<V, D> {
    pub fn new(
        view: V,
        dispatcher: D,
        cache: FrameCache,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let (press_tx, press_rx) = mpsc::unbounded_channel();
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            cancel: CancellationToken::new(),
            sender: Mutex::new(None),
            api_version: AtomicU32::new(0),
        });
        let handle = SessionHandle {
            shared: Arc::clone(&shared),
            press_tx,
            tap_tx,
        };
        let session = Self {
            config,
            view,
            dispatcher,
            cache,
            channel: ByteChannel::new(),
            phase: SessionPhase::default(),
            descriptor: None,
            shared,
            handle: handle.clone(),
            press_rx: Some(press_rx),
            tap_rx: Some(tap_rx),
            tasks: Vec::new(),
        };
        (session, handle)
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// The negotiated frame descriptor, once received.
    pub fn descriptor(&self) -> Option<&FrameDescriptor> {
        self.descriptor.as_ref()
    }

    /// The display surface driven by this session.
    pub fn view(&self) -> &V {
        &self.view
    }

    /// Control handle; same as the one returned by [`new`](Self::new).
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// The frame cache, for host-level `clear()` / `info()` calls.
    pub fn cache(&mut self) -> &mut FrameCache {
        &mut self.cache
    }

    /// Run the session against `host:port` until the server
    /// disconnects, a protocol error occurs, or the handle terminates
    /// it. Always tears down cleanly before returning.
    pub async fn run(&mut self, host: &str, port: u16) -> Result<(), RfvError> {
        let result = self.drive(host, port).await;
        if let Err(e) = &result {
            warn!("session ended: {e}");
        }
        self.teardown();
        result
    }

    // ── Setup ────────────────────────────────────────────────────

    async fn drive(&mut self, host: &str, port: u16) -> Result<(), RfvError> {
        self.phase.begin_connect()?;
        info!("connecting to {host}:{port}");
        match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.channel.connect(host, port))
                .await
                .map_err(|_| RfvError::CannotConnect(format!("{host}:{port}")))??,
            None => self.channel.connect(host, port).await?,
        }
        let sender = self.channel.sender()?;
        if let Ok(mut guard) = self.shared.sender.lock() {
            *guard = Some(sender.clone());
        }

        self.phase.begin_version_handshake()?;
        self.version_handshake().await?;
        self.phase.begin_security_handshake()?;
        self.security_handshake().await?;
        self.phase.await_frame_descriptor()?;

        let descriptor = self.read_frame_descriptor().await?;
        self.descriptor = Some(descriptor);
        self.view.allocate(descriptor.width, descriptor.height);
        let name = self.read_session_name(descriptor.name_length).await?;
        info!(
            "session \"{name}\": {}x{}",
            descriptor.width, descriptor.height
        );

        let encodings = Encoding::supported(!self.config.disable_caching);
        self.channel.send(messages::set_encodings(&encodings)).await?;
        self.channel
            .send(messages::framebuffer_update_request(
                false,
                descriptor.full_rect(),
            ))
            .await?;
        self.phase.enter_ready()?;

        self.spawn_keep_alive(sender.clone());
        self.spawn_gesture_forwarders(sender);

        self.ready_loop().await
    }

    async fn version_handshake(&mut self) -> Result<(), RfvError> {
        let mut banner = [0u8; CLIENT_VERSION.len()];
        self.channel.read_exact(&mut banner).await?;
        debug!(
            "server version {:?}",
            String::from_utf8_lossy(&banner).trim_end()
        );
        self.channel.send(&CLIENT_VERSION[..]).await?;
        Ok(())
    }

    async fn security_handshake(&mut self) -> Result<(), RfvError> {
        let method_count = self.channel.read_u8().await?;
        if method_count == 0 {
            let message = self.read_error_string().await?;
            return Err(RfvError::InvalidConnection { message });
        }
        let mut methods = vec![0u8; method_count as usize];
        self.channel.read_exact(&mut methods).await?;
        debug!("server auth methods: {methods:?}");
        self.channel.send(vec![SECURITY_NONE]).await?;

        let security_result = self.channel.read_u32_be().await?;
        if security_result != 0 {
            let message = self.read_error_string().await?;
            return Err(RfvError::SecurityFailed { message });
        }

        // ClientInit: the share flag.
        self.channel
            .send(vec![self.config.share_desktop as u8])
            .await?;
        Ok(())
    }

    /// Length-prefixed UTF-8 error string sent after a failed
    /// handshake step. Surfaced verbatim to the caller.
    async fn read_error_string(&mut self) -> Result<String, RfvError> {
        let count = self.channel.read_u32_be().await?;
        let bytes = self.channel.read_bytes(count as usize).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn read_frame_descriptor(&mut self) -> Result<FrameDescriptor, RfvError> {
        let mut raw = [0u8; FrameDescriptor::WIRE_SIZE];
        self.channel.read_exact(&mut raw).await?;
        Ok(FrameDescriptor::parse(&raw))
    }

    /// Best-effort decode; an undecodable name must not fail the
    /// session.
    async fn read_session_name(&mut self, length: u32) -> Result<String, RfvError> {
        let bytes = self.channel.read_bytes(length as usize).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ── Background routines ──────────────────────────────────────

    fn spawn_keep_alive(&mut self, sender: ChannelSender) {
        let cancel = self.shared.cancel.clone();
        let period = self.config.keep_alive_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("keep-alive ping");
                        let _ = sender.send(messages::set_cut_text("")).await;
                    }
                }
            }
        }));
    }

    fn spawn_gesture_forwarders(&mut self, sender: ChannelSender) {
        // Long press: down on Began, up on Ended/Cancelled.
        if let Some(mut press_rx) = self.press_rx.take() {
            let sender = sender.clone();
            let cancel = self.shared.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        ev = press_rx.recv() => ev,
                    };
                    let Some((point, phase)) = event else { break };
                    let down = matches!(phase, PressPhase::Began);
                    let _ = sender
                        .send(messages::pointer_event(down, point.x, point.y))
                        .await;
                }
            }));
        }

        // Tap: immediate down + up pair.
        if let Some(mut tap_rx) = self.tap_rx.take() {
            let cancel = self.shared.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    let point = tokio::select! {
                        _ = cancel.cancelled() => break,
                        ev = tap_rx.recv() => ev,
                    };
                    let Some(point) = point else { break };
                    let _ = sender
                        .send(messages::pointer_event(true, point.x, point.y))
                        .await;
                    let _ = sender
                        .send(messages::pointer_event(false, point.x, point.y))
                        .await;
                }
            }));
        }
    }

    // ── Ready loop ───────────────────────────────────────────────

    async fn ready_loop(&mut self) -> Result<(), RfvError> {
        let cancel = self.shared.cancel.clone();
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => None,
                m = self.channel.read_u8() => Some(m),
            };
            let Some(message) = message else {
                debug!("ready loop cancelled");
                return Ok(());
            };
            self.handle_server_message(message?).await?;
        }
    }

    async fn handle_server_message(&mut self, message: u8) -> Result<(), RfvError> {
        let descriptor = self.descriptor.ok_or(RfvError::NoFrameDescriptor)?;
        match message {
            MSG_FRAMEBUFFER_UPDATE => {
                decode::apply_update(&mut self.channel, &descriptor, &mut self.view).await?;
                self.channel
                    .send(messages::framebuffer_update_request(
                        true,
                        descriptor.full_rect(),
                    ))
                    .await?;
            }
            MSG_FRAME_UPDATE_EXTENSION => {
                let need_payload = self.handle_frame_update_extension(&descriptor).await?;
                if need_payload {
                    debug!("cache miss: requesting frame data");
                    self.channel.send(messages::send_frame_data()).await?;
                } else {
                    self.channel
                        .send(messages::framebuffer_update_request(
                            true,
                            descriptor.full_rect(),
                        ))
                        .await?;
                }
            }
            MSG_INVOKE_API => self.process_api_call().await?,
            other => {
                return Err(RfvError::UnexpectedServerMessage(other));
            }
        }
        Ok(())
    }

    /// Handle one caching-extension message. Returns `true` when the
    /// payload is unknown and must be requested from the server.
    async fn handle_frame_update_extension(
        &mut self,
        descriptor: &FrameDescriptor,
    ) -> Result<bool, RfvError> {
        let has_data = self.channel.read_u8().await? != 0;
        let key = CacheKey {
            length: self.channel.read_u32_be().await?,
            hash: self.channel.read_u32_be().await?,
        };

        let payload = if has_data {
            let data = self.channel.read_bytes(key.length as usize).await?;
            // A full disk must not stall the update loop.
            if let Err(e) = self.cache.add(key, &data) {
                warn!("cache add failed: {e}");
            }
            Some(data)
        } else {
            match self.cache.get(key) {
                Ok(hit) => hit.map(Bytes::from),
                Err(e) => {
                    warn!("cache get failed: {e}");
                    None
                }
            }
        };

        match payload {
            Some(data) => {
                decode::apply_cached_update(data, descriptor, &mut self.view).await?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    // ── RPC side channel ─────────────────────────────────────────

    async fn process_api_call(&mut self) -> Result<(), RfvError> {
        let _padding = self.channel.read_u8().await?;
        let mut parameters = HashMap::new();
        loop {
            let Some(name) = self.read_api_string().await? else {
                break;
            };
            let Some(value) = self.read_api_string().await? else {
                break;
            };
            parameters.insert(name, value);
        }
        debug!("api call from server: {parameters:?}");

        // ServerVersion negotiates the API level and expects an
        // immediate ViewerVersion reply.
        if parameters.get("Method").map(String::as_str) == Some("ServerVersion") {
            if let Some(version) = parameters
                .get("Version")
                .and_then(|v| v.parse::<u32>().ok())
            {
                self.shared.api_version.store(version, Ordering::SeqCst);
                info!("server api version {version}");
                let reply = messages::invoke_api([
                    ("Method", "ViewerVersion"),
                    ("Version", "1"),
                    ("App", self.config.app_name.as_str()),
                ]);
                self.channel.send(reply).await?;
            }
        }

        self.dispatcher.on_api_call(parameters);
        Ok(())
    }

    /// One UTF-16BE length-prefixed string; `None` on the empty-string
    /// terminator.
    async fn read_api_string(&mut self) -> Result<Option<String>, RfvError> {
        let count = self.channel.read_u16_be().await?;
        if count == 0 {
            return Ok(None);
        }
        let bytes = self.channel.read_bytes(count as usize * 2).await?;
        Ok(Some(messages::parse_api_string(&bytes)))
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Stop the keep-alive and gesture routines, disconnect the
    /// channel, free the pixel buffer. Idempotent.
    fn teardown(&mut self) {
        self.shared.cancel.cancel();
        if let Ok(mut guard) = self.shared.sender.lock() {
            *guard = None;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.channel.disconnect();
        self.view.free();
        self.phase.terminate();
        debug!("session terminated");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testutil::TestSink;

    fn session() -> (RfbSession<TestSink, NullDispatcher>, SessionHandle) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FrameCache::open(dir.path()).unwrap();
        RfbSession::new(
            TestSink::empty(),
            NullDispatcher,
            cache,
            SessionConfig::default(),
        )
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert!(!config.disable_caching);
        assert!(config.share_desktop);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(300));
        assert!(config.connect_timeout.is_none());
    }

    #[tokio::test]
    async fn invoke_api_is_noop_before_negotiation() {
        let (_session, handle) = session();
        assert_eq!(handle.server_api_version(), None);
        // No negotiated version, no sender: both early-return paths.
        handle.invoke_api(HashMap::from([("Method".into(), "Ping".into())]));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (_session, handle) = session();
        handle.terminate();
        handle.terminate();
        handle.clone().terminate();
    }

    #[tokio::test]
    async fn run_against_dead_port_fails_with_connect_error() {
        let (mut session, _handle) = session();
        // Bind-then-drop to find a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = session.run("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, RfvError::CannotConnect(_)));
        assert!(session.phase().is_terminated());
        assert!(session.view().freed);
    }
}
