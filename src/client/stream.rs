// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{
    TlsConnector, client::TlsStream, rustls::pki_types::ServerName,
};
use tracing::debug;

use crate::cfg::config::TransportConfig;

/// The concrete kind of byte stream backing a pooled connection.
///
/// Part of the reuse key: a plaintext and a TLS connection to the same
/// host/port never alias in the pool.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Tcp,
    Tls,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Tcp => f.write_str("tcp"),
            StreamKind::Tls => f.write_str("tls"),
        }
    }
}

/// Coarse stream lifecycle used for rendering a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Connecting,
    Open,
    Active,
    Paused,
    Closing,
    Closed,
    Other,
}

impl StreamStatus {
    /// One-character marker used by the pool's human-readable rendering.
    pub fn symbol(&self) -> char {
        match self {
            StreamStatus::Connecting => '…',
            StreamStatus::Open => '○',
            StreamStatus::Active => '●',
            StreamStatus::Paused => '‖',
            StreamStatus::Closing => '◌',
            StreamStatus::Closed => '✗',
            StreamStatus::Other => '?',
        }
    }
}

/// A full-duplex byte pipe to a remote endpoint, either plain TCP or
/// TLS over TCP.
///
/// The adapter does no framing; callers read and write raw bytes. The
/// two variants are deliberately a tagged sum rather than a trait
/// object so the pool can key connections by kind.
#[derive(Debug)]
pub enum TransportStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TransportStream {
    fn tcp_ref(&self) -> &TcpStream {
        match self {
            TransportStream::Tcp(s) => s,
            TransportStream::Tls(s) => s.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp_ref().peer_addr()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp_ref().local_addr()
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            TransportStream::Tcp(_) => StreamKind::Tcp,
            TransportStream::Tls(_) => StreamKind::Tls,
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Establishes a connected stream of the requested kind.
///
/// This is the only outbound dependency of the pool; everything above
/// it treats the result as an opaque pipe.
pub async fn dial(
    kind: StreamKind,
    host: &str,
    port: u16,
    cfg: &TransportConfig,
) -> Result<TransportStream> {
    let tcp = timeout(cfg.connect_timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("connect {host}:{port} timed out"))?
        .with_context(|| format!("connect {host}:{port} failed"))?;
    tcp.set_linger(None)?;
    tcp.set_nodelay(cfg.nodelay)?;

    let stream = match kind {
        StreamKind::Tcp => TransportStream::Tcp(tcp),
        StreamKind::Tls => {
            let connector = TlsConnector::from(cfg.tls_client_config());
            let name = ServerName::try_from(host.to_owned())
                .with_context(|| format!("invalid TLS server name {host:?}"))?;
            let tls = timeout(cfg.connect_timeout, connector.connect(name, tcp))
                .await
                .with_context(|| format!("TLS handshake with {host}:{port} timed out"))?
                .with_context(|| format!("TLS handshake with {host}:{port} failed"))?;
            TransportStream::Tls(Box::new(tls))
        },
    };

    debug!(%kind, host, port, "dialed new stream");
    Ok(stream)
}
