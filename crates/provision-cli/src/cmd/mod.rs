pub mod check;
pub mod runs;
pub mod serve;

use anyhow::Context;
use provision_core::config::Config;
use std::path::Path;

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("failed to load config {}", path.display()))
}
