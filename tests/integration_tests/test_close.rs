// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use http_pool_rs::{
    cfg::config::TransportConfig,
    client::{
        pool::{Limits, Pool},
        stream::StreamKind,
    },
};

use crate::integration_tests::common::{
    get_request, nth_body, run_cycle, spawn_http_server,
};

const HOST: &str = "127.0.0.1";

#[tokio::test]
async fn forced_close_mid_read_drains_and_retires() -> Result<()> {
    let addr = spawn_http_server().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();

    let mut t1 = pool
        .acquire(
            StreamKind::Tcp,
            HOST,
            addr.port(),
            Limits::default(),
            &transport,
        )
        .await?;
    t1.write(get_request(HOST).as_bytes()).await?;
    t1.close_write().await?;
    t1.start_read().await?;
    let conn = t1.connection().clone();

    // forced close while reading: the response is abandoned, residual
    // bytes are drained, and the read turn is handed on
    t1.close().await?;
    assert!(!conn.is_open());
    assert_eq!(conn.read_count(), conn.write_count());

    // the next purge sweep removes the dead connection
    pool.purge().await;
    assert!(pool.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn forced_close_while_writing_synthesizes_close_write() -> Result<()> {
    let addr = spawn_http_server().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();

    let mut t1 = pool
        .acquire(
            StreamKind::Tcp,
            HOST,
            addr.port(),
            Limits::default(),
            &transport,
        )
        .await?;
    let conn = t1.connection().clone();
    t1.write(b"GET / HT").await?;

    t1.close().await?;
    assert!(!conn.is_open());
    assert!(!conn.write_busy());
    assert_eq!(conn.write_count(), 1);
    // the truncated request's response is owed but will never arrive
    assert_eq!(conn.read_count(), 0);
    Ok(())
}

#[tokio::test]
async fn idle_sweep_retires_quiet_connections() -> Result<()> {
    let addr = spawn_http_server().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();

    let mut t1 = pool
        .acquire(
            StreamKind::Tcp,
            HOST,
            addr.port(),
            Limits::default(),
            &transport,
        )
        .await?;
    run_cycle(&mut t1, HOST, &nth_body(0)).await?;
    let conn = t1.connection().clone();
    assert_eq!(pool.len().await, 1);

    // a generous threshold leaves the young connection alone
    pool.purge_idle(Duration::from_secs(3600)).await;
    assert_eq!(pool.len().await, 1);
    assert!(conn.is_open());

    // at zero, anything quiet is fair game
    pool.purge_idle(Duration::ZERO).await;
    assert!(pool.is_empty().await);
    assert!(!conn.is_open());
    Ok(())
}

#[tokio::test]
async fn close_all_empties_the_pool() -> Result<()> {
    let addr = spawn_http_server().await?;
    let pool = Arc::new(Pool::new());
    let transport = TransportConfig::default();
    let limits = Limits {
        duplicate_limit: 2,
        pipeline_limit: 1,
        reuse_limit: None,
    };

    // two concurrent writers force two distinct streams
    let mut t1 = pool
        .acquire(StreamKind::Tcp, HOST, addr.port(), limits, &transport)
        .await?;
    let mut t2 = pool
        .acquire(StreamKind::Tcp, HOST, addr.port(), limits, &transport)
        .await?;
    let c1 = t1.connection().clone();
    let c2 = t2.connection().clone();
    assert!(!Arc::ptr_eq(&c1, &c2));
    assert_eq!(pool.len().await, 2);

    pool.close_all().await;
    assert!(pool.is_empty().await);
    assert!(!c1.is_open());
    assert!(!c2.is_open());

    // pending transactions observe the closure
    assert!(!t1.is_open());
    let err = t1.write(b"late").await.expect_err("stream is gone");
    assert!(err.to_string().contains("connection closed"));

    // close_all again is a no-op
    pool.close_all().await;
    assert!(pool.is_empty().await);

    t1.close().await?;
    t2.close().await?;
    Ok(())
}
