// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use http_pool_rs::{cfg::config::Config, client::stream::StreamKind};

#[test]
fn defaults_match_contract() {
    let cfg = Config::default();
    assert_eq!(cfg.pool.duplicate_limit, 8);
    assert_eq!(cfg.pool.pipeline_limit, 16);
    assert_eq!(cfg.pool.reuse_limit, None);

    let limits = cfg.pool.limits();
    assert_eq!(limits.duplicate_limit, 8);
    assert_eq!(limits.pipeline_limit, 16);
    assert_eq!(limits.reuse_limit, None);
}

#[test]
fn parses_full_yaml() -> Result<()> {
    let yaml = r#"
pool:
  duplicate_limit: 2
  pipeline_limit: 4
  reuse_limit: 100
  idle_timeout: 30
transport:
  connect_timeout: 5
  nodelay: false
target:
  host: localhost
  port: 8080
  kind: tls
"#;
    let mut cfg: Config = serde_yaml::from_str(yaml)?;
    cfg.validate_and_normalize()?;

    assert_eq!(cfg.pool.duplicate_limit, 2);
    assert_eq!(cfg.pool.reuse_limit, Some(100));
    assert_eq!(cfg.pool.idle_timeout, Duration::from_secs(30));
    assert_eq!(cfg.transport.connect_timeout, Duration::from_secs(5));
    assert!(!cfg.transport.nodelay);

    let target = cfg.target.expect("target section");
    assert_eq!(target.kind, StreamKind::Tls);
    assert_eq!(target.port, 8080);
    assert_eq!(target.path, "/");
    Ok(())
}

#[test]
fn rejects_zero_duplicate_limit() {
    let yaml = r#"
pool:
  duplicate_limit: 0
"#;
    let mut cfg: Config = serde_yaml::from_str(yaml).expect("parses");
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn rejects_zero_reuse_limit() {
    let yaml = r#"
pool:
  reuse_limit: 0
"#;
    let mut cfg: Config = serde_yaml::from_str(yaml).expect("parses");
    assert!(cfg.validate_and_normalize().is_err());
}
