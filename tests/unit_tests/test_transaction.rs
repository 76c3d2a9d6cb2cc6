// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_pool_rs::{
    cfg::config::TransportConfig,
    client::{
        common::StateError,
        pool::{Limits, Pool},
        stream::StreamKind,
    },
};

use crate::unit_tests::{spawn_echo, spawn_oneshot};

fn is_state_err(err: &anyhow::Error, expected: StateError) -> bool {
    err.downcast_ref::<StateError>() == Some(&expected)
}

#[tokio::test]
async fn write_read_cycle_then_reuse() -> Result<()> {
    let addr = spawn_echo().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();
    let limits = Limits::default();

    let mut t1 = pool
        .acquire(StreamKind::Tcp, "127.0.0.1", addr.port(), limits, &transport)
        .await?;
    assert_eq!(t1.sequence(), 0);
    assert!(t1.is_writable());
    assert!(!t1.is_readable());

    t1.write(b"ping").await?;
    t1.close_write().await?;
    assert_eq!(t1.connection().write_count(), 1);
    assert!(!t1.is_writable());

    t1.start_read().await?;
    assert!(t1.is_readable());
    let mut got = Vec::new();
    while got.len() < 4 {
        let chunk = t1.read_available().await?;
        assert!(!chunk.is_empty(), "echo ended early");
        got.extend_from_slice(&chunk);
    }
    assert_eq!(&got, b"ping");
    t1.close_read().await?;
    assert_eq!(t1.connection().read_count(), 1);
    let conn1 = t1.connection().clone();

    // The next acquire must hand back the same connection, advanced by
    // one sequence number.
    let mut t2 = pool
        .acquire(StreamKind::Tcp, "127.0.0.1", addr.port(), limits, &transport)
        .await?;
    assert!(Arc::ptr_eq(t2.connection(), &conn1));
    assert_eq!(t2.sequence(), 1);
    t2.close().await?;
    Ok(())
}

#[tokio::test]
async fn precondition_violations_surface_as_state_errors() -> Result<()> {
    let addr = spawn_echo().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();
    let limits = Limits::default();

    let mut t = pool
        .acquire(StreamKind::Tcp, "127.0.0.1", addr.port(), limits, &transport)
        .await?;

    // reading operations are rejected while writing
    let err = t.start_read().await.expect_err("not readable yet");
    assert!(is_state_err(&err, StateError::NotReadable));
    let err = t.close_read().await.expect_err("not readable yet");
    assert!(is_state_err(&err, StateError::NotReadable));
    let err = t.unread(Bytes::from_static(b"x")).expect_err("not reading");
    assert!(is_state_err(&err, StateError::NotReadable));
    let err = t.parser_mut().expect_err("not reading");
    assert!(is_state_err(&err, StateError::NotReadable));

    t.write(b"ping").await?;
    t.close_write().await?;

    // write side is spent
    let err = t.write(b"more").await.expect_err("write after close_write");
    assert!(is_state_err(&err, StateError::NotWritable));
    let err = t.close_write().await.expect_err("double close_write");
    assert!(is_state_err(&err, StateError::NotWritable));

    t.start_read().await?;
    let err = t.start_read().await.expect_err("double start_read");
    assert!(is_state_err(&err, StateError::NotReadable));
    t.ensure_readable().await?;

    let mut got = Vec::new();
    while got.len() < 4 {
        got.extend_from_slice(&t.read_available().await?);
    }
    t.close_read().await?;

    let err = t.read_available().await.expect_err("read after close_read");
    assert!(is_state_err(&err, StateError::NotReadable));

    // close after a clean finish is a no-op
    t.close().await?;
    Ok(())
}

#[tokio::test]
async fn unread_round_trips_exactly() -> Result<()> {
    let addr = spawn_echo().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();

    let mut t = pool
        .acquire(
            StreamKind::Tcp,
            "127.0.0.1",
            addr.port(),
            Limits::default(),
            &transport,
        )
        .await?;
    t.write(b"ping").await?;
    t.close_write().await?;
    t.start_read().await?;

    t.unread(Bytes::from_static(b"EXTRA"))?;
    assert_eq!(t.bytes_available(), 5);
    assert!(!t.eof().await?);

    let chunk = t.read_available().await?;
    assert_eq!(chunk, Bytes::from_static(b"EXTRA"));

    // with the excess consumed, the stream's own bytes come through
    let mut got = Vec::new();
    while got.len() < 4 {
        got.extend_from_slice(&t.read_available().await?);
    }
    assert_eq!(&got, b"ping");

    t.close_read().await?;
    t.close().await?;
    Ok(())
}

#[tokio::test]
async fn eof_after_peer_close() -> Result<()> {
    let addr = spawn_oneshot(b"bye").await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();

    let mut t = pool
        .acquire(
            StreamKind::Tcp,
            "127.0.0.1",
            addr.port(),
            Limits::default(),
            &transport,
        )
        .await?;
    t.write(b"x").await?;
    t.close_write().await?;
    t.start_read().await?;

    let mut got = Vec::new();
    while got.len() < 3 {
        let chunk = t.read_available().await?;
        assert!(!chunk.is_empty());
        got.extend_from_slice(&chunk);
    }
    assert_eq!(&got, b"bye");

    assert!(t.eof().await?, "peer closed, eof expected");
    let chunk = t.read_available().await?;
    assert!(chunk.is_empty());

    t.close_read().await?;
    t.close().await?;
    Ok(())
}

#[tokio::test]
async fn parser_slot_is_shared_across_transactions() -> Result<()> {
    let addr = spawn_echo().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();
    let limits = Limits::default();

    let mut t1 = pool
        .acquire(StreamKind::Tcp, "127.0.0.1", addr.port(), limits, &transport)
        .await?;
    t1.write(b"a").await?;
    t1.close_write().await?;
    t1.start_read().await?;
    t1.parser_mut()?.reset();
    assert_eq!(t1.parser_mut()?.generation(), 1);
    let _ = t1.read_available().await?;
    t1.close_read().await?;

    let mut t2 = pool
        .acquire(StreamKind::Tcp, "127.0.0.1", addr.port(), limits, &transport)
        .await?;
    t2.write(b"b").await?;
    t2.close_write().await?;
    t2.start_read().await?;
    // same parser instance, still carrying the generation bump
    assert_eq!(t2.parser_mut()?.generation(), 1);
    let _ = t2.read_available().await?;
    t2.close_read().await?;
    t2.close().await?;
    Ok(())
}

#[tokio::test]
async fn dropped_transaction_kills_its_connection() -> Result<()> {
    let addr = spawn_echo().await?;
    let pool = Pool::new();
    let transport = TransportConfig::default();
    let limits = Limits::default();

    let conn1 = {
        let t = pool
            .acquire(StreamKind::Tcp, "127.0.0.1", addr.port(), limits, &transport)
            .await?;
        t.connection().clone()
        // dropped here while still writing
    };
    assert!(!conn1.is_open());

    // the pool must recover with a fresh connection, not hang
    let mut t2 = pool
        .acquire(StreamKind::Tcp, "127.0.0.1", addr.port(), limits, &transport)
        .await?;
    assert!(!Arc::ptr_eq(t2.connection(), &conn1));
    assert_eq!(t2.sequence(), 0);
    t2.close().await?;
    Ok(())
}
