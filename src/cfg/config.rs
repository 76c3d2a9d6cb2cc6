// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result, ensure};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::client::{pool::Limits, stream::StreamKind};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Pool sizing policy applied to every acquire unless overridden.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Dial-layer knobs that live below the pool.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Optional endpoint used by the demo binary.
    #[serde(default)]
    pub target: Option<TargetConfig>,
}

/// Limits governing how many streams the pool opens and how hard it
/// reuses each of them.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_duplicate_limit")]
    /// Maximum parallel streams per endpoint.
    pub duplicate_limit: usize,

    #[serde(default = "default_pipeline_limit")]
    /// Maximum concurrently in-flight request/response pairs per stream.
    pub pipeline_limit: u32,

    #[serde(default)]
    /// Lifetime request cap per stream; `None` means unlimited.
    pub reuse_limit: Option<u32>,

    #[serde(default = "default_idle_timeout", with = "serde_secs")]
    /// Advisory idleness threshold used by callers to retire a pool.
    pub idle_timeout: Duration,
}

impl PoolConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            duplicate_limit: self.duplicate_limit,
            pipeline_limit: self.pipeline_limit,
            reuse_limit: self.reuse_limit,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            duplicate_limit: default_duplicate_limit(),
            pipeline_limit: default_pipeline_limit(),
            reuse_limit: None,
            idle_timeout: default_idle_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Settings applied when dialing a fresh stream.
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout", with = "serde_secs")]
    /// Timeout for TCP connect and, separately, for the TLS handshake.
    pub connect_timeout: Duration,

    #[serde(default = "default_nodelay")]
    /// Whether to set TCP_NODELAY on new streams.
    pub nodelay: bool,

    #[serde(skip)]
    tls: OnceCell<Arc<ClientConfig>>,
}

impl TransportConfig {
    /// Shared rustls client config with webpki trust anchors, built once
    /// per `TransportConfig`.
    pub fn tls_client_config(&self) -> Arc<ClientConfig> {
        self.tls
            .get_or_init(|| {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Arc::new(
                    ClientConfig::builder()
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .clone()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            nodelay: default_nodelay(),
            tls: OnceCell::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Endpoint the demo binary talks to.
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_kind")]
    pub kind: StreamKind,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_duplicate_limit() -> usize {
    8
}

fn default_pipeline_limit() -> u32 {
    16
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_nodelay() -> bool {
    true
}

fn default_kind() -> StreamKind {
    StreamKind::Tcp
}

fn default_path() -> String {
    "/".to_string()
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.pool.duplicate_limit > 0,
            "pool.duplicate_limit must be > 0"
        );
        if let Some(limit) = self.pool.reuse_limit {
            ensure!(limit > 0, "pool.reuse_limit must be > 0 when set");
        }
        ensure!(
            !self.transport.connect_timeout.is_zero(),
            "transport.connect_timeout must be > 0"
        );
        if let Some(t) = &self.target {
            ensure!(!t.host.is_empty(), "target.host must not be empty");
        }
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
