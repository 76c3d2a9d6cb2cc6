// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context as _, Result, bail, ensure};
use bytes::Bytes;
use tokio::{
    io::{AsyncWriteExt, ReadHalf},
    sync::{Notify, OwnedMutexGuard},
};
use tracing::{debug, warn};

use crate::client::{
    common::StateError,
    connection::{Connection, ReadEnd},
    parser::Parser,
    stream::TransportStream,
};

/// Where a transaction currently stands. Created writing, then
/// `close_write` hands the turn to the response side, `start_read`
/// claims the connection's read lock, `close_read` retires the handle.
#[derive(Debug)]
enum Phase {
    Writing,
    AwaitRead,
    Reading(OwnedMutexGuard<ReadEnd>),
    Done,
}

/// A single-request handle onto a shared connection: a permit to write
/// one request and then read exactly one response.
///
/// `sequence` is the connection's `write_count` captured at creation.
/// Transactions are created serially under the pool lock, so sequences
/// are unique and contiguous per connection; `start_read` blocks until
/// `read_count` reaches the transaction's sequence, which is what keeps
/// pipelined responses flowing back in request order.
#[derive(Debug)]
pub struct Transaction {
    conn: Arc<Connection>,
    sequence: u32,
    phase: Phase,
    pool_cond: Arc<Notify>,
}

impl Transaction {
    /// Claims the write side of `conn`. Called by the pool inside its
    /// critical section, which is what makes sequences race-free.
    pub(crate) fn new(conn: Arc<Connection>, pool_cond: Arc<Notify>) -> Result<Self> {
        let sequence = conn.begin_write()?;
        debug!(conn = %conn.key(), sequence, "transaction issued");
        Ok(Self {
            conn,
            sequence,
            phase: Phase::Writing,
            pool_cond,
        })
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    pub fn inactive_seconds(&self) -> f64 {
        self.conn.inactive_seconds()
    }

    /// This transaction holds the write turn: the connection's writer
    /// flag is up and no later request has been written.
    pub fn is_writable(&self) -> bool {
        matches!(self.phase, Phase::Writing)
            && self.conn.write_busy()
            && self.conn.write_count() == self.sequence
    }

    /// This transaction holds the read lock and it is its response's
    /// turn on the wire.
    pub fn is_readable(&self) -> bool {
        matches!(self.phase, Phase::Reading(_))
            && self.conn.read_count() == self.sequence
    }

    /// Forwards request bytes to the stream.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        ensure!(
            !self.conn.closed.is_cancelled(),
            StateError::ConnectionClosed
        );
        ensure!(self.is_writable(), StateError::NotWritable);
        let mut w = self.conn.writer.lock().await;
        tokio::select! {
            _ = self.conn.closed.cancelled() => bail!(StateError::ConnectionClosed),
            r = w.io.write_all(bytes) => r.context("stream write failed")?,
        }
        Ok(())
    }

    /// Marks the request complete: bumps `write_count`, releases the
    /// write side and wakes pool waiters so the connection can take its
    /// next writer while this response is still pending.
    pub async fn close_write(&mut self) -> Result<()> {
        ensure!(self.is_writable(), StateError::NotWritable);
        {
            let mut w = self.conn.writer.lock().await;
            w.io.flush().await.context("stream flush failed")?;
        }
        self.conn.finish_write();
        self.phase = Phase::AwaitRead;
        debug!(conn = %self.conn.key(), sequence = self.sequence, "request written");
        self.pool_cond.notify_waiters();
        Ok(())
    }

    /// Claims the connection's read side, waiting until every earlier
    /// response has been fully consumed.
    pub async fn start_read(&mut self) -> Result<()> {
        ensure!(matches!(self.phase, Phase::AwaitRead), StateError::NotReadable);

        let guard = loop {
            let g = self.conn.reader.clone().lock_owned().await;
            if self.conn.read_count() == self.sequence {
                break g;
            }
            // Not our turn yet. Register for the next read_count bump
            // before releasing the lock so the wakeup cannot be lost.
            let advanced = self.conn.read_advanced.notified();
            tokio::pin!(advanced);
            advanced.as_mut().enable();
            drop(g);
            tokio::select! {
                _ = &mut advanced => {},
                _ = self.conn.closed.cancelled() => {
                    if self.conn.read_count() != self.sequence {
                        bail!(StateError::ConnectionClosed);
                    }
                },
            }
        };

        self.conn.touch();
        self.phase = Phase::Reading(guard);
        debug!(conn = %self.conn.key(), sequence = self.sequence, "response turn taken");
        Ok(())
    }

    /// `start_read` that tolerates already being the reader.
    pub async fn ensure_readable(&mut self) -> Result<()> {
        match self.phase {
            Phase::Reading(_) => Ok(()),
            Phase::AwaitRead => self.start_read().await,
            _ => bail!(StateError::NotReadable),
        }
    }

    /// Next chunk of the response: pushed-back excess bytes first, then
    /// whatever the stream yields. Empty means end of stream.
    pub async fn read_available(&mut self) -> Result<Bytes> {
        ensure!(self.is_readable(), StateError::NotReadable);
        let closed = self.conn.closed.clone();
        let chunk = match &mut self.phase {
            Phase::Reading(g) => g.read_available(&closed).await?,
            _ => bail!(StateError::NotReadable),
        };
        self.conn.touch();
        Ok(chunk)
    }

    /// Returns bytes that belong to the next response. They stay parked
    /// on the connection and are served before any further stream read.
    pub fn unread(&mut self, bytes: Bytes) -> Result<()> {
        ensure!(self.is_readable(), StateError::NotReadable);
        match &mut self.phase {
            Phase::Reading(g) => {
                g.unread(bytes);
                Ok(())
            },
            _ => bail!(StateError::NotReadable),
        }
    }

    /// Bytes readable without blocking.
    pub fn bytes_available(&mut self) -> usize {
        match &mut self.phase {
            Phase::Reading(g) => g.bytes_available(),
            _ => self.conn.bytes_available(),
        }
    }

    /// End-of-response-stream check. Never true while buffered bytes
    /// remain; outside the reading phase it is only answerable for a
    /// closed connection.
    pub async fn eof(&mut self) -> Result<bool> {
        let closed = self.conn.closed.clone();
        match &mut self.phase {
            Phase::Reading(g) => g.eof(&closed).await,
            _ => {
                ensure!(!self.conn.is_open(), StateError::NotReadable);
                Ok(true)
            },
        }
    }

    /// The reusable parser parked on this connection. Only the active
    /// reader may touch it.
    pub fn parser_mut(&mut self) -> Result<&mut Parser> {
        match &mut self.phase {
            Phase::Reading(g) if self.conn.read_count() == self.sequence => {
                Ok(g.parser_mut())
            },
            _ => bail!(StateError::NotReadable),
        }
    }

    /// Direct access to the read half, for message layers that want to
    /// drive the stream themselves.
    pub fn raw_stream_mut(&mut self) -> Result<&mut ReadHalf<TransportStream>> {
        match &mut self.phase {
            Phase::Reading(g) if self.conn.read_count() == self.sequence => {
                Ok(g.io_mut())
            },
            _ => bail!(StateError::NotReadable),
        }
    }

    /// Marks the response fully read: bumps `read_count`, releases the
    /// read lock and wakes both the next reader in line and any pool
    /// waiters.
    pub async fn close_read(&mut self) -> Result<()> {
        ensure!(self.is_readable(), StateError::NotReadable);
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Reading(guard) => {
                self.conn.advance_read();
                drop(guard);
                debug!(conn = %self.conn.key(), sequence = self.sequence, "response read");
                self.pool_cond.notify_waiters();
                Ok(())
            },
            other => {
                self.phase = other;
                bail!(StateError::NotReadable)
            },
        }
    }

    /// Forcibly finishes the transaction and closes the underlying
    /// stream. The only way a caller evicts a connection from the pool.
    ///
    /// A still-writing transaction has its `close_write` synthesized so
    /// the connection's ledger stays consistent; a reading one drains
    /// residual bytes before handing the read turn on.
    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await;
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Writing => self.conn.finish_write(),
            Phase::AwaitRead => {},
            Phase::Reading(mut guard) => {
                guard.purge();
                self.conn.advance_read();
                drop(guard);
            },
            Phase::Done => {},
        }
        debug!(conn = %self.conn.key(), sequence = self.sequence, "transaction force-closed");
        self.pool_cond.notify_waiters();
        Ok(())
    }
}

impl Drop for Transaction {
    /// Backstop for handles dropped without `close`: releases whatever
    /// side this transaction held and kills the connection, so no
    /// waiter can deadlock on a writer or reader that no longer exists.
    fn drop(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Done => return,
            Phase::Writing => {
                self.conn.abort();
                self.conn.release_writer();
            },
            Phase::AwaitRead => self.conn.abort(),
            Phase::Reading(guard) => {
                self.conn.abort();
                self.conn.advance_read();
                drop(guard);
            },
        }
        warn!(
            conn = %self.conn.key(),
            sequence = self.sequence,
            "transaction dropped without close"
        );
        self.pool_cond.notify_waiters();
    }
}
