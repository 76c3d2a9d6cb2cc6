// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
};

use anyhow::{Context as _, Result, bail};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    sync::{Mutex, Notify},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::TransportConfig,
    client::{
        common::{StateError, monotonic_ms},
        parser::Parser,
        stream::{StreamKind, StreamStatus, TransportStream, dial},
    },
};

/// The identity a connection is reused under. Two connections alias only
/// if every component matches; in particular a TLS and a plaintext
/// stream to the same host never share pool entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub kind: StreamKind,
    pub host: String,
    pub port: u16,
    /// Frozen at creation; part of the key so callers asking for a
    /// different pipelining window get a different connection.
    pub pipeline_limit: u32,
}

impl EndpointKey {
    /// Host-level match, ignoring the pipelining window. Used by the
    /// retirement sweep.
    pub(crate) fn matches_endpoint(&self, kind: StreamKind, host: &str, port: u16) -> bool {
        self.kind == kind && self.host == host && self.port == port
    }

    pub(crate) fn matches(
        &self,
        kind: StreamKind,
        host: &str,
        port: u16,
        pipeline_limit: u32,
    ) -> bool {
        self.matches_endpoint(kind, host, port) && self.pipeline_limit == pipeline_limit
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind, self.host, self.port)
    }
}

pub(crate) struct WriteEnd {
    pub(crate) io: WriteHalf<TransportStream>,
}

impl fmt::Debug for WriteEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteEnd").finish_non_exhaustive()
    }
}

/// Everything only the active reader may touch: the read half itself,
/// the excess buffer holding bytes that belong to the next response,
/// and the reusable parser slot.
pub(crate) struct ReadEnd {
    io: ReadHalf<TransportStream>,
    excess: BytesMut,
    eof_seen: bool,
    parser: Parser,
}

impl fmt::Debug for ReadEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadEnd")
            .field("excess", &self.excess.len())
            .field("eof_seen", &self.eof_seen)
            .finish_non_exhaustive()
    }
}

impl ReadEnd {
    const CHUNK: usize = 16 * 1024;

    fn new(io: ReadHalf<TransportStream>) -> Self {
        Self {
            io,
            excess: BytesMut::new(),
            eof_seen: false,
            parser: Parser::new(),
        }
    }

    /// Next chunk of response bytes: the excess buffer first, then the
    /// stream. An empty result means end of stream.
    pub(crate) async fn read_available(
        &mut self,
        closed: &CancellationToken,
    ) -> Result<Bytes> {
        if !self.excess.is_empty() {
            return Ok(self.excess.split().freeze());
        }
        if self.eof_seen {
            return Ok(Bytes::new());
        }

        let mut buf = BytesMut::zeroed(Self::CHUNK);
        let n = tokio::select! {
            _ = closed.cancelled() => bail!(StateError::ConnectionClosed),
            r = self.io.read(&mut buf[..]) => r.context("stream read failed")?,
        };
        if n == 0 {
            self.eof_seen = true;
            return Ok(Bytes::new());
        }
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Pushes back bytes that were read past the end of the current
    /// response; the next `read_available` returns exactly these.
    pub(crate) fn unread(&mut self, bytes: Bytes) {
        self.excess.clear();
        self.excess.extend_from_slice(&bytes);
    }

    /// Polls the read half exactly once with a no-op waker, so it never
    /// suspends and is callable outside an async context. `None` means
    /// nothing is buffered right now, `Some(0)` end of stream.
    fn read_now(&mut self, scratch: &mut [u8]) -> std::io::Result<Option<usize>> {
        let mut cx = Context::from_waker(Waker::noop());
        let mut rb = ReadBuf::new(scratch);
        match Pin::new(&mut self.io).poll_read(&mut cx, &mut rb) {
            Poll::Ready(Ok(())) => Ok(Some(rb.filled().len())),
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(None),
        }
    }

    /// Moves whatever the kernel already holds into the excess buffer
    /// without suspending; stream order is preserved because probed
    /// bytes land behind any pushed-back ones. Returns how many bytes
    /// were waiting on the socket.
    pub(crate) fn probe_socket(&mut self) -> usize {
        if self.eof_seen {
            return 0;
        }
        let mut pulled = 0;
        let mut scratch = vec![0u8; Self::CHUNK];
        loop {
            match self.read_now(&mut scratch) {
                Ok(Some(0)) => {
                    self.eof_seen = true;
                    break;
                },
                Ok(Some(n)) => {
                    self.excess.extend_from_slice(&scratch[..n]);
                    pulled += n;
                },
                Ok(None) | Err(_) => break,
            }
        }
        pulled
    }

    /// Bytes obtainable without blocking. Prefers the excess buffer;
    /// otherwise pulls whatever the kernel already holds into it.
    pub(crate) fn bytes_available(&mut self) -> usize {
        if self.excess.is_empty() {
            self.probe_socket();
        }
        self.excess.len()
    }

    /// True once the stream is exhausted and no buffered bytes remain.
    /// Blocks until the peer either sends data or closes.
    pub(crate) async fn eof(&mut self, closed: &CancellationToken) -> Result<bool> {
        if !self.excess.is_empty() {
            return Ok(false);
        }
        if self.eof_seen {
            return Ok(true);
        }
        let chunk = self.read_available(closed).await?;
        if chunk.is_empty() {
            return Ok(true);
        }
        self.excess.extend_from_slice(&chunk);
        Ok(false)
    }

    /// Discards everything the stream still holds and resets the excess
    /// buffer. Called after the stream has been torn down so a later
    /// `bytes_available` cannot report stale kernel bytes.
    pub(crate) fn purge(&mut self) {
        let mut scratch = vec![0u8; Self::CHUNK];
        loop {
            match self.read_now(&mut scratch) {
                Ok(Some(n)) if n > 0 => {},
                Ok(Some(_)) => {
                    self.eof_seen = true;
                    break;
                },
                Ok(None) | Err(_) => break,
            }
        }
        self.excess.clear();
    }

    pub(crate) fn excess_len(&self) -> usize {
        self.excess.len()
    }

    pub(crate) fn parser_mut(&mut self) -> &mut Parser {
        &mut self.parser
    }

    pub(crate) fn io_mut(&mut self) -> &mut ReadHalf<TransportStream> {
        &mut self.io
    }
}

/// One pooled stream to one endpoint.
///
/// A connection exposes no request operations of its own; transactions
/// mediate all traffic. The write side is guarded by the `write_busy`
/// flag (flipped only under the pool lock or by the owning writer), the
/// read side by the `reader` mutex, which is held for the entire
/// duration of one response read.
#[derive(Debug)]
pub struct Connection {
    key: EndpointKey,
    peer_port: u16,
    local_port: u16,

    pub(crate) writer: Mutex<WriteEnd>,
    pub(crate) reader: Arc<Mutex<ReadEnd>>,

    write_busy: AtomicBool,
    write_count: AtomicU32,
    read_count: AtomicU32,
    open: AtomicBool,
    last_active_ms: AtomicU64,

    /// Signalled every time `read_count` advances; readers waiting for
    /// their response turn park here.
    pub(crate) read_advanced: Notify,
    /// Cancelled on close so transactions blocked in stream I/O fail
    /// promptly instead of waiting for the peer.
    pub(crate) closed: CancellationToken,
}

impl Connection {
    /// Dials a fresh stream and wraps it into a pooled connection.
    pub(crate) async fn connect(
        kind: StreamKind,
        host: &str,
        port: u16,
        pipeline_limit: u32,
        transport: &TransportConfig,
    ) -> Result<Arc<Self>> {
        let stream = dial(kind, host, port, transport).await?;
        let peer_port = stream.peer_addr().map(|a| a.port()).unwrap_or(0);
        let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
        let (r, w) = tokio::io::split(stream);

        let conn = Arc::new(Self {
            key: EndpointKey {
                kind,
                host: host.to_string(),
                port,
                pipeline_limit,
            },
            peer_port,
            local_port,
            writer: Mutex::new(WriteEnd { io: w }),
            reader: Arc::new(Mutex::new(ReadEnd::new(r))),
            write_busy: AtomicBool::new(false),
            write_count: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
            open: AtomicBool::new(true),
            last_active_ms: AtomicU64::new(monotonic_ms()),
            read_advanced: Notify::new(),
            closed: CancellationToken::new(),
        });
        debug!(conn = %conn.key, local_port, "connection established");
        Ok(conn)
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn write_busy(&self) -> bool {
        self.write_busy.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Requests written but not yet fully read.
    pub fn in_flight(&self) -> u32 {
        self.write_count().saturating_sub(self.read_count())
    }

    /// Seconds since the read side last showed activity.
    pub fn inactive_seconds(&self) -> f64 {
        let ts = self.last_active_ms.load(Ordering::SeqCst);
        monotonic_ms().saturating_sub(ts) as f64 / 1000.0
    }

    pub(crate) fn touch(&self) {
        self.last_active_ms.store(monotonic_ms(), Ordering::SeqCst);
    }

    /// Whether no reader currently holds the read side.
    pub(crate) fn reader_idle(&self) -> bool {
        self.reader.try_lock().is_ok()
    }

    /// Bytes already readable without blocking: the excess buffer when
    /// non-empty, otherwise whatever the kernel holds. Reports 0 while
    /// an active reader owns the read side.
    pub fn bytes_available(&self) -> usize {
        match self.reader.try_lock() {
            Ok(mut g) => g.bytes_available(),
            Err(_) => 0,
        }
    }

    pub fn status(&self) -> StreamStatus {
        if !self.is_open() {
            StreamStatus::Closed
        } else if self.write_busy() || !self.reader_idle() {
            StreamStatus::Active
        } else {
            StreamStatus::Open
        }
    }

    /// Claims the write side. Returns the sequence the new transaction
    /// will respond at. Only called with the pool lock held.
    pub(crate) fn begin_write(&self) -> Result<u32> {
        if self.write_busy.swap(true, Ordering::SeqCst) {
            bail!(StateError::WriterBusy);
        }
        Ok(self.write_count())
    }

    /// Marks one request as fully written and releases the write side.
    pub(crate) fn finish_write(&self) {
        let wc = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_busy.store(false, Ordering::SeqCst);
        debug_assert!(wc - self.read_count() <= self.key.pipeline_limit + 1);
    }

    /// Releases the write side without completing a request. Used when a
    /// writer is abandoned; the connection must already be closed.
    pub(crate) fn release_writer(&self) {
        self.write_busy.store(false, Ordering::SeqCst);
    }

    /// Marks one response as fully read and hands the read turn to the
    /// next transaction in sequence.
    pub(crate) fn advance_read(&self) {
        let rc = self.read_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(rc <= self.write_count());
        self.touch();
        self.read_advanced.notify_waiters();
    }

    /// Closes the underlying stream. Idempotent; skips the FIN when a
    /// concurrent writer holds the write half (its next operation fails
    /// via the cancellation token instead).
    pub(crate) async fn close(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        self.closed.cancel();
        if let Ok(mut w) = self.writer.try_lock() {
            let _ = w.io.shutdown().await;
        }
        if was_open {
            debug!(conn = %self.key, "connection closed");
            self.read_advanced.notify_waiters();
        }
    }

    /// Synchronous hard kill for drop paths: no FIN, just flags. The
    /// sockets are reclaimed when the pool drops the connection.
    pub(crate) fn abort(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
        self.read_advanced.notify_waiters();
    }
}

impl fmt::Display for Connection {
    /// One human-readable line per connection, the pool's only
    /// user-facing surface.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let busy = if self.write_busy() { "*" } else { "" };
        let (lock, excess, socket) = match self.reader.try_lock() {
            Ok(mut g) => ("", g.excess_len(), g.probe_socket()),
            Err(_) => ("L", 0, 0),
        };
        write!(
            f,
            "{} {}:{} {}↑{} {}↓{} pipeline={}",
            self.status().symbol(),
            self.key,
            self.local_port,
            self.write_count(),
            busy,
            self.read_count(),
            lock,
            self.key.pipeline_limit,
        )?;
        if excess > 0 {
            write!(f, " excess={excess}")?;
        }
        if socket > 0 {
            write!(f, " socket={socket}")?;
        }
        let idle = self.inactive_seconds();
        if idle > 5.0 {
            write!(f, " idle={idle:.1}s")?;
        }
        Ok(())
    }
}
