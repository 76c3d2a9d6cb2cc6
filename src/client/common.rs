// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Instant;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Process-wide monotonic epoch; connection activity timestamps are
/// cheap millisecond offsets from it.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

pub(crate) fn monotonic_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// State-machine precondition violations.
///
/// These indicate a caller driving a transaction out of order (writing
/// after `close_write`, reading before `start_read`, and so on), not a
/// recoverable transport condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("transaction is not writable")]
    NotWritable,
    #[error("transaction is not readable")]
    NotReadable,
    #[error("connection already has an active writer")]
    WriterBusy,
    #[error("connection closed")]
    ConnectionClosed,
}
