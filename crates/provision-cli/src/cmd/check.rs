use provision_core::config::WarnLevel;
use std::path::Path;

use super::load_config;
use crate::output::print_json;

/// Validate the config file, then the policy bundles against the configured
/// backends. Fails if any check reports an error.
pub fn run(config: &Path, json: bool) -> anyhow::Result<()> {
    let cfg = load_config(config)?;
    let mut warnings = cfg.validate();

    let policies = cfg.policy_store()?;
    let registry = cfg.adapter_registry()?;
    warnings.extend(policies.validate(&registry));

    if json {
        let value = serde_json::json!({
            "bundles": policies.names().collect::<Vec<_>>(),
            "modules": registry.modules(),
            "warnings": warnings,
        });
        print_json(&value)?;
    } else {
        println!(
            "{} bundle(s), {} backend module(s)",
            policies.len(),
            registry.len()
        );
        if warnings.is_empty() {
            println!("Config is valid. No warnings.");
        }
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
