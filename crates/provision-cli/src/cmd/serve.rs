use anyhow::Context;
use provision_core::config::WarnLevel;
use std::path::Path;

use super::load_config;

pub fn run(config: &Path, bind: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut cfg = load_config(config)?;
    if let Some(bind) = bind {
        cfg.server.bind = bind;
    }
    if let Some(port) = port {
        cfg.server.port = port;
    }

    let warnings = cfg.validate();
    for w in &warnings {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => tracing::error!("{}", w.message),
        }
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config has errors; run `provision check` for details");
    }

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(provision_server::serve(&cfg))
}
