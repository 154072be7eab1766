//! Typed byte channel over one TCP connection.
//!
//! The remote protocol has no message framing beyond fixed headers, so
//! the engine must be able to consume "the next N bytes as this record"
//! with minimal copying. Reads are served from slab buffers filled by a
//! background reader task; writes drain through a FIFO writer task, one
//! request in flight at a time, so any number of producers can share
//! the channel safely.
//!
//! ```text
//!  socket ──► reader task ──► bounded slab queue ──► typed reads
//!  typed writes ──► FIFO request queue ──► writer task ──► socket
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::RfvError;

// ── Constants ────────────────────────────────────────────────────

/// Size of one receive slab.
const SLAB_SIZE: usize = 32 * 1024;

/// Slabs buffered ahead of the consumer before the reader task blocks.
const READ_QUEUE_DEPTH: usize = 32;

/// Pending write requests buffered before senders block.
const WRITE_QUEUE_DEPTH: usize = 64;

// ── ChannelPhase ─────────────────────────────────────────────────

/// Lifecycle of a [`ByteChannel`].
///
/// ```text
///  Closed ──► Opening ──► FirstStreamOpen ──► Open ──► Error
///    ▲                                          │        (terminal,
///    └──────────────── disconnect ◄─────────────┘         fails all
///                                                         pending ops)
/// ```
///
/// `FirstStreamOpen` marks the point where the read half is serviced
/// but the write half is not yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPhase {
    /// No connection. Initial state, and the result of `disconnect()`.
    #[default]
    Closed,

    /// TCP connect in progress.
    Opening,

    /// Reader task running; writer task not yet started.
    FirstStreamOpen,

    /// Both halves serviced; reads and writes accepted.
    Open,

    /// The transport faulted. Terminal until `disconnect()`.
    Error,
}

impl std::fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Opening => write!(f, "Opening"),
            Self::FirstStreamOpen => write!(f, "FirstStreamOpen"),
            Self::Open => write!(f, "Open"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl ChannelPhase {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Transition to `Opening`. Valid from: `Closed`.
    fn begin_open(&mut self) -> Result<(), RfvError> {
        match self {
            Self::Closed => {
                *self = Self::Opening;
                Ok(())
            }
            _ => Err(RfvError::AlreadyOpen),
        }
    }

    /// Transition to `FirstStreamOpen`. Valid from: `Opening`.
    fn first_stream_open(&mut self) -> Result<(), RfvError> {
        match self {
            Self::Opening => {
                *self = Self::FirstStreamOpen;
                Ok(())
            }
            _ => Err(RfvError::InvalidTransition(
                "cannot open first stream: not in Opening state",
            )),
        }
    }

    /// Transition to `Open`. Valid from: `FirstStreamOpen`.
    fn open(&mut self) -> Result<(), RfvError> {
        match self {
            Self::FirstStreamOpen => {
                *self = Self::Open;
                Ok(())
            }
            _ => Err(RfvError::InvalidTransition(
                "cannot open: not in FirstStreamOpen state",
            )),
        }
    }

    /// Force the terminal error state.
    fn fail(&mut self) {
        *self = Self::Error;
    }
}

// ── WriteRequest ─────────────────────────────────────────────────

/// One pending write: payload plus its completion continuation.
struct WriteRequest {
    bytes: Bytes,
    done: oneshot::Sender<Result<(), RfvError>>,
}

// ── ChannelSender ────────────────────────────────────────────────

/// Cloneable write handle to a [`ByteChannel`].
///
/// Writes serialize through the channel's FIFO writer task, so any
/// number of holders may send concurrently; later callers simply
/// queue.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<WriteRequest>,
}

impl ChannelSender {
    /// Enqueue `bytes` and wait for the write to complete.
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<(), RfvError> {
        let (done, ack) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                bytes: bytes.into(),
                done,
            })
            .await
            .map_err(|_| RfvError::SendingToNonOpenChannel)?;
        // A dropped ack means the writer task died before reaching us.
        ack.await.map_err(|_| RfvError::WriteError)?
    }
}

// ── ByteChannel ──────────────────────────────────────────────────

/// Reliable ordered delivery of typed fixed-layout values and raw
/// blocks over one TCP connection.
///
/// Reading requires `&mut self` and belongs to a single consumer (the
/// protocol loop). Writing goes through [`ChannelSender`] clones.
pub struct ByteChannel {
    phase: ChannelPhase,
    /// Slab currently being consumed.
    current: Bytes,
    /// Filled slabs (or the terminal read fault) from the reader task.
    slab_rx: Option<mpsc::Receiver<std::io::Result<Bytes>>>,
    write_tx: Option<mpsc::Sender<WriteRequest>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl ByteChannel {
    pub fn new() -> Self {
        Self {
            phase: ChannelPhase::Closed,
            current: Bytes::new(),
            slab_rx: None,
            write_tx: None,
            reader_task: None,
            writer_task: None,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    /// Resolve `host:port` and connect.
    ///
    /// Fails with [`RfvError::AlreadyOpen`] on a non-closed channel,
    /// [`RfvError::CannotCreateStream`] when the address does not
    /// resolve, and [`RfvError::CannotConnect`] when the TCP connect
    /// fails.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), RfvError> {
        self.phase.begin_open()?;
        let target = format!("{host}:{port}");

        let addr = match tokio::net::lookup_host(&target).await {
            Ok(mut addrs) => addrs.next(),
            Err(_) => None,
        };
        let Some(addr) = addr else {
            self.phase = ChannelPhase::Closed;
            return Err(RfvError::CannotCreateStream(target));
        };

        let stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                self.phase = ChannelPhase::Closed;
                debug!("connect to {target} failed: {e}");
                return Err(RfvError::CannotConnect(target));
            }
        };
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        // Reader task: socket -> slab queue. A fault or EOF is pushed
        // as the terminal queue item.
        let (slab_tx, slab_rx) = mpsc::channel::<std::io::Result<Bytes>>(READ_QUEUE_DEPTH);
        self.reader_task = Some(tokio::spawn(async move {
            loop {
                let mut slab = BytesMut::with_capacity(SLAB_SIZE);
                match read_half.read_buf(&mut slab).await {
                    Ok(0) => {
                        let _ = slab_tx
                            .send(Err(std::io::ErrorKind::UnexpectedEof.into()))
                            .await;
                        break;
                    }
                    Ok(n) => {
                        trace!("reader: {n} bytes");
                        if slab_tx.send(Ok(slab.freeze())).await.is_err() {
                            break; // consumer gone
                        }
                    }
                    Err(e) => {
                        let _ = slab_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        }));
        self.slab_rx = Some(slab_rx);
        self.phase.first_stream_open()?;

        // Writer task: drain the FIFO, one request in flight at a time.
        let (write_tx, mut write_rx) = mpsc::channel::<WriteRequest>(WRITE_QUEUE_DEPTH);
        self.writer_task = Some(tokio::spawn(async move {
            while let Some(req) = write_rx.recv().await {
                match write_half.write_all(&req.bytes).await {
                    Ok(()) => {
                        let _ = req.done.send(Ok(()));
                    }
                    Err(e) => {
                        debug!("writer fault: {e}");
                        let _ = req.done.send(Err(RfvError::WriteError));
                        break; // queued requests fail via dropped acks
                    }
                }
            }
        }));
        self.write_tx = Some(write_tx);
        self.phase.open()?;

        debug!("channel open to {target}");
        Ok(())
    }

    /// Cloneable write handle.
    pub fn sender(&self) -> Result<ChannelSender, RfvError> {
        match &self.write_tx {
            Some(tx) => Ok(ChannelSender { tx: tx.clone() }),
            None => Err(RfvError::SendingToNonOpenChannel),
        }
    }

    /// Enqueue `bytes` and wait for the write to complete.
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<(), RfvError> {
        self.sender()?.send(bytes).await
    }

    /// Tear the channel down, cancelling pending operations.
    ///
    /// Idempotent; the channel returns to `Closed` and may be
    /// reconnected.
    pub fn disconnect(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        self.slab_rx = None;
        self.write_tx = None;
        self.current = Bytes::new();
        self.phase = ChannelPhase::Closed;
    }

    // ── Typed reads ──────────────────────────────────────────────

    /// Fill `dst` completely, suspending until enough bytes arrive.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), RfvError> {
        self.ensure_readable()?;
        let mut filled = 0;
        while filled < dst.len() {
            if self.current.is_empty() {
                self.refill().await?;
            }
            let n = self.current.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&self.current[..n]);
            self.current.advance(n);
            filled += n;
        }
        Ok(())
    }

    /// Read exactly `count` raw bytes.
    pub async fn read_bytes(&mut self, count: usize) -> Result<Bytes, RfvError> {
        self.ensure_readable()?;
        if self.current.len() >= count {
            return Ok(self.current.split_to(count));
        }
        let mut buf = vec![0u8; count];
        self.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn read_u8(&mut self) -> Result<u8, RfvError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_u16_be(&mut self) -> Result<u16, RfvError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    pub async fn read_u32_be(&mut self) -> Result<u32, RfvError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Read one 32-bit server pixel (little-endian, see
    /// [`crate::protocol::types`]).
    pub async fn read_u32_le(&mut self) -> Result<u32, RfvError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await?;
        Ok(u32::from_le_bytes(buf))
    }

    // ── Internal ─────────────────────────────────────────────────

    fn ensure_readable(&self) -> Result<(), RfvError> {
        match self.phase {
            ChannelPhase::Open => Ok(()),
            ChannelPhase::Error => Err(RfvError::ReadError),
            _ => Err(RfvError::ReadingFromNonOpenChannel),
        }
    }

    /// Pull the next slab off the queue.
    async fn refill(&mut self) -> Result<(), RfvError> {
        let rx = self
            .slab_rx
            .as_mut()
            .ok_or(RfvError::ReadingFromNonOpenChannel)?;
        match rx.recv().await {
            Some(Ok(slab)) => {
                self.current = slab;
                Ok(())
            }
            Some(Err(e)) => {
                debug!("read fault: {e}");
                self.phase.fail();
                Err(RfvError::ReadError)
            }
            None => {
                self.phase.fail();
                Err(RfvError::ReadError)
            }
        }
    }
}

impl Default for ByteChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ByteChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ── Tests ────────────────────────────────────────────────────────
