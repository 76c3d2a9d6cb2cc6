// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use bytes::BytesMut;
use http_pool_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    client::pool::Pool,
};
use tracing::info;

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;
    let target = cfg
        .target
        .clone()
        .context("config has no target section")?;
    let limits = cfg.pool.limits();

    let pool = Pool::new();

    // A few sequential HEAD requests; after the first one the pool must
    // keep reusing the same connection.
    for request in 0..3u32 {
        let mut txn = pool
            .acquire(target.kind, &target.host, target.port, limits, &cfg.transport)
            .await?;
        info!(request, sequence = txn.sequence(), "issuing request");

        let req = format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\n\r\n",
            target.path, target.host
        );
        txn.write(req.as_bytes()).await?;
        txn.close_write().await?;

        txn.start_read().await?;
        let mut head = BytesMut::new();
        loop {
            let chunk = txn.read_available().await?;
            if chunk.is_empty() {
                break;
            }
            head.extend_from_slice(&chunk);
            if let Some(end) = find_header_end(&head) {
                let extra = head.split_off(end);
                if !extra.is_empty() {
                    txn.unread(extra.freeze())?;
                }
                break;
            }
        }
        txn.close_read().await?;

        let status_line = head
            .as_ref()
            .split(|&b| b == b'\r')
            .next()
            .map(String::from_utf8_lossy)
            .unwrap_or_default()
            .into_owned();
        info!(request, %status_line, bytes = head.len(), "response received");
    }

    // sweep connections that sat quiet past the configured threshold
    pool.purge_idle(cfg.pool.idle_timeout).await;

    let mut rendered = String::new();
    let _ = pool.show_pool(&mut rendered).await;
    info!(pool = %rendered.trim_end(), "pool state before shutdown");

    pool.close_all().await;
    Ok(())
}
