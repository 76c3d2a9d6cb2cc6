// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, sync::Arc, time::Duration};

use anyhow::Result;
use once_cell::sync::Lazy;
use rand::RngExt;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::{
    cfg::config::TransportConfig,
    client::{connection::Connection, stream::StreamKind, transaction::Transaction},
};

pub const DEFAULT_DUPLICATE_LIMIT: usize = 8;
pub const DEFAULT_PIPELINE_LIMIT: u32 = 16;

/// Per-acquire sizing policy.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Cap on parallel streams to one endpoint.
    pub duplicate_limit: usize,
    /// Cap on concurrently in-flight request/response pairs per stream.
    pub pipeline_limit: u32,
    /// Lifetime request cap per stream; `None` means unlimited.
    pub reuse_limit: Option<u32>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            duplicate_limit: DEFAULT_DUPLICATE_LIMIT,
            pipeline_limit: DEFAULT_PIPELINE_LIMIT,
            reuse_limit: None,
        }
    }
}

static SHARED: Lazy<Pool> = Lazy::new(Pool::default);

/// The connection pool: every live stream, one mutex, one condition.
///
/// All allocator state is guarded by the single `conns` mutex; the
/// `cond` Notify is broadcast on every state-machine transition
/// (`close_write`, `close_read`, `close`) so blocked acquires rescan.
#[derive(Debug, Default)]
pub struct Pool {
    conns: Mutex<Vec<Arc<Connection>>>,
    cond: Arc<Notify>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool.
    pub fn shared() -> &'static Pool {
        &SHARED
    }

    /// Hands out a transaction bound to a connection for `(kind, host,
    /// port)`, creating, reusing, sharing, or waiting as policy allows.
    ///
    /// The scan order is fixed: retire over-used connections, drop dead
    /// ones, reuse an idle writable one, dial a new one while below the
    /// duplicate limit, pipeline onto a busy-reading one, and only then
    /// block until some transaction transitions. Ties are broken
    /// uniformly at random to spread load across equivalent streams.
    /// Dialing happens with the pool lock held, so new-connection
    /// establishment is serialized process-wide.
    pub async fn acquire(
        &self,
        kind: StreamKind,
        host: &str,
        port: u16,
        limits: Limits,
        transport: &TransportConfig,
    ) -> Result<Transaction> {
        loop {
            let mut conns = self.conns.lock().await;

            // Retire connections that hit their lifetime request cap.
            // Ones with an active reader are skipped; they get caught on
            // a later pass.
            if let Some(reuse_limit) = limits.reuse_limit {
                for c in conns.iter() {
                    if c.key().matches_endpoint(kind, host, port)
                        && c.is_open()
                        && c.read_count() >= reuse_limit
                        && c.reader_idle()
                    {
                        debug!(conn = %c.key(), "reuse limit reached, retiring");
                        c.close().await;
                    }
                }
            }

            Self::purge_locked(&mut conns);

            let writable: Vec<Arc<Connection>> = conns
                .iter()
                .filter(|c| {
                    c.key().matches(kind, host, port, limits.pipeline_limit)
                        && c.is_open()
                        && !c.write_busy()
                        && limits.reuse_limit.is_none_or(|l| c.write_count() < l)
                        && c.in_flight() < limits.pipeline_limit + 1
                })
                .cloned()
                .collect();

            // Best case: a writable connection nobody is reading from.
            let idle: Vec<&Arc<Connection>> =
                writable.iter().filter(|c| c.reader_idle()).collect();
            if !idle.is_empty() {
                let pick = idle[rand::rng().random_range(0..idle.len())].clone();
                return Transaction::new(pick, self.cond.clone());
            }

            // Still below the duplicate cap: grow.
            let endpoint_count = conns
                .iter()
                .filter(|c| c.key().matches(kind, host, port, limits.pipeline_limit))
                .count();
            if endpoint_count < limits.duplicate_limit {
                let conn = Connection::connect(
                    kind,
                    host,
                    port,
                    limits.pipeline_limit,
                    transport,
                )
                .await?;
                conns.push(conn.clone());
                debug!(pool_size = conns.len(), conn = %conn.key(), "pool grew");
                return Transaction::new(conn, self.cond.clone());
            }

            // Pipeline onto a connection that is still reading an
            // earlier response.
            if !writable.is_empty() {
                let pick =
                    writable[rand::rng().random_range(0..writable.len())].clone();
                return Transaction::new(pick, self.cond.clone());
            }

            // Saturated. Park until some transaction transitions, then
            // rescan from the top. Registering before releasing the lock
            // keeps the wakeup from being lost; spurious wakeups only
            // cost a rescan.
            let notified = self.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(conns);
            notified.await;
        }
    }

    fn purge_locked(conns: &mut Vec<Arc<Connection>>) {
        conns.retain(|c| {
            let dead = !c.is_open() && c.read_count() >= c.write_count();
            if dead {
                debug!(conn = %c.key(), "purged dead connection");
            }
            !dead
        });
    }

    /// Drops connections that are closed and owe no response.
    pub async fn purge(&self) {
        let mut conns = self.conns.lock().await;
        Self::purge_locked(&mut conns);
    }

    /// Closes connections whose read side has been quiet for at least
    /// `max_idle` and drops them from the pool. Connections with an
    /// active writer, an active reader, or an outstanding response are
    /// left alone.
    pub async fn purge_idle(&self, max_idle: Duration) {
        let mut conns = self.conns.lock().await;
        for c in conns.iter() {
            if c.is_open()
                && !c.write_busy()
                && c.in_flight() == 0
                && c.reader_idle()
                && c.inactive_seconds() >= max_idle.as_secs_f64()
            {
                debug!(
                    conn = %c.key(),
                    idle = c.inactive_seconds(),
                    "idle timeout reached, closing"
                );
                c.close().await;
            }
        }
        Self::purge_locked(&mut conns);
    }

    /// Closes every connection and empties the pool. Idempotent; blocked
    /// acquires are woken so they can dial fresh streams.
    pub async fn close_all(&self) {
        let mut conns = self.conns.lock().await;
        for c in conns.iter() {
            c.close().await;
        }
        conns.clear();
        drop(conns);
        self.cond.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.conns.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.lock().await.is_empty()
    }

    /// Writes one line per pooled connection.
    pub async fn show_pool<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let conns = self.conns.lock().await;
        for c in conns.iter() {
            writeln!(w, "{c}")?;
        }
        Ok(())
    }
}
