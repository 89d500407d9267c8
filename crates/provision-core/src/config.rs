use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{AdapterRegistry, HttpBackendAdapter};
use crate::credential::{BrokerSettings, CredentialBroker, LocalBroker, VaultBroker};
use crate::error::{ProvisionError, Result};
use crate::policy::{PolicyFile, PolicyStore};
use crate::retry::RetryPolicy;
use crate::types::ModuleKind;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("provision.redb")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// PoliciesConfig
// ---------------------------------------------------------------------------

/// Either a path to a policies file, inline bundles, or both (the file wins
/// on name collisions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoliciesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(flatten)]
    pub inline: PolicyFile,
}

// ---------------------------------------------------------------------------
// BrokerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Vault,
    #[default]
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_broker_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ttl_secs() -> u64 {
    900
}

fn default_broker_timeout_secs() -> u64 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            address: None,
            namespace: None,
            ttl_secs: default_ttl_secs(),
            timeout_secs: default_broker_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// BackendConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: ModuleKind,
    pub url: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether the backend exposes `DELETE /resources/{id}` for rollback.
    #[serde(default)]
    pub compensation: bool,
}

fn default_backend_timeout_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// RetryConfig / RunConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub backend: RetryPolicy,
    #[serde(default)]
    pub broker: RetryPolicy,
    #[serde(default)]
    pub audit: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_run_timeout_secs")]
    pub max_run_timeout_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Upper bound on a single backend call, on top of the adapter's own timeout.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_max_run_timeout_secs() -> u64 {
    3600
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_run_timeout_secs: default_max_run_timeout_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl RunConfig {
    pub fn max_run_timeout(&self) -> Duration {
        Duration::from_secs(self.max_run_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub run: RunConfig,
    /// Directory relative paths are resolved against. Set by `load`.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ProvisionError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml(&data)?;
        cfg.base_dir = path.parent().map(Path::to_path_buf);
        Ok(cfg)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        Ok(cfg)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.store.path)
    }

    /// Inline bundles merged with the policies file, if one is configured.
    pub fn policy_store(&self) -> Result<PolicyStore> {
        let inline = PolicyStore::from_file(self.policies.inline.clone());
        let Some(path) = &self.policies.path else {
            return Ok(inline);
        };
        let from_file = PolicyStore::load(&self.resolve(path))?;
        Ok(PolicyStore::new(
            inline
                .bundles()
                .chain(from_file.bundles())
                .cloned()
                .collect::<Vec<_>>(),
        ))
    }

    pub fn adapter_registry(&self) -> Result<AdapterRegistry> {
        let mut registry = AdapterRegistry::new();
        for (module, backend) in &self.backends {
            let adapter = HttpBackendAdapter::new(
                module.clone(),
                backend.kind,
                &backend.url,
                Duration::from_secs(backend.timeout_secs),
                backend.compensation,
            )?;
            registry.register(Arc::new(adapter));
        }
        Ok(registry)
    }

    pub fn credential_broker(&self) -> Result<Arc<dyn CredentialBroker>> {
        match self.broker.kind {
            BrokerKind::Local => Ok(Arc::new(LocalBroker)),
            BrokerKind::Vault => {
                let address = self.broker.address.clone().ok_or_else(|| {
                    ProvisionError::Config("broker.address is required for the vault broker".into())
                })?;
                Ok(Arc::new(VaultBroker::new(
                    address,
                    self.broker.namespace.clone(),
                )?))
            }
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            ttl: Duration::from_secs(self.broker.ttl_secs),
            call_timeout: Duration::from_secs(self.broker.timeout_secs.max(1)),
            retry: self.retry.broker.clone(),
            max_run_timeout: self.run.max_run_timeout(),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Checks that don't need the policy file or the network.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "server.port is 0; an ephemeral port will be chosen".into(),
            });
        }

        match self.broker.kind {
            BrokerKind::Vault => {
                if self.broker.address.as_deref().map_or(true, |a| a.trim().is_empty()) {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: "broker.kind is vault but broker.address is not set".into(),
                    });
                }
            }
            BrokerKind::Local => warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "local broker mints unverified tokens; use only for development".into(),
            }),
        }

        if self.broker.ttl_secs >= self.run.max_run_timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "broker.ttl_secs={} is not below run.max_run_timeout_secs={}; it will be clamped",
                    self.broker.ttl_secs, self.run.max_run_timeout_secs
                ),
            });
        }

        if self.run.max_run_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "run.max_run_timeout_secs must be greater than 0".into(),
            });
        }

        for (module, backend) in &self.backends {
            if backend.url.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("backend '{module}' has an empty url"),
                });
            }
            if backend.timeout_secs == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("backend '{module}' has timeout_secs=0"),
                });
            }
            if !backend.compensation {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "backend '{module}' has no compensation; failed runs after it will need manual remediation"
                    ),
                });
            }
        }

        for (name, policy) in [
            ("backend", &self.retry.backend),
            ("broker", &self.retry.broker),
            ("audit", &self.retry.audit),
        ] {
            if policy.max_attempts == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("retry.{name}.max_attempts is 0; treated as 1"),
                });
            }
            if policy.max_attempts > 10 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "retry.{name}.max_attempts={} (>10 is unusual)",
                        policy.max_attempts
                    ),
                });
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FULL: &str = r#"
server:
  bind: 0.0.0.0
  port: 9090
store:
  path: runs.redb
broker:
  kind: vault
  address: https://vault.example
  ttl_secs: 600
backends:
  blueprint:
    kind: blueprint
    url: https://calm.example/adapter
    timeout_secs: 120
    compensation: true
  registrar:
    kind: registrar
    url: https://ipam.example/adapter
    compensation: true
retry:
  backend:
    max_attempts: 4
run:
  max_run_timeout_secs: 1800
"#;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = Config::from_yaml("{}").unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.broker.kind, BrokerKind::Local);
        assert_eq!(cfg.run.max_run_timeout_secs, 3600);
        assert_eq!(cfg.retry.audit.max_attempts, 3);
        assert!(cfg.backends.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let cfg = Config::from_yaml(FULL).unwrap();
        assert_eq!(cfg.server.addr(), "0.0.0.0:9090");
        assert_eq!(cfg.backends["registrar"].kind, ModuleKind::Registrar);
        assert_eq!(cfg.backends["registrar"].timeout_secs, 60);
        assert_eq!(cfg.retry.backend.max_attempts, 4);
        assert_eq!(cfg.retry.broker.max_attempts, 3);
        assert_eq!(cfg.broker_settings().max_run_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn full_config_has_no_errors() {
        let cfg = Config::from_yaml(FULL).unwrap();
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .collect();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn vault_without_address_is_an_error() {
        let cfg = Config::from_yaml("broker: { kind: vault }").unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("broker.address")));
        assert!(cfg.credential_broker().is_err());
    }

    #[test]
    fn ttl_not_below_run_timeout_warns() {
        let cfg = Config::from_yaml("broker: { ttl_secs: 7200 }").unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("clamped")));
    }

    #[test]
    fn backend_without_compensation_warns() {
        let cfg = Config::from_yaml(
            "backends: { iac: { kind: iac_apply, url: http://iac.local } }",
        )
        .unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("manual remediation")));
    }

    #[test]
    fn adapter_registry_has_configured_modules() {
        let cfg = Config::from_yaml(FULL).unwrap();
        let registry = cfg.adapter_registry().unwrap();
        assert_eq!(registry.get("blueprint").unwrap().kind(), ModuleKind::Blueprint);
        assert!(registry.get("registrar").unwrap().supports_compensation());
        assert!(registry.get("iac").is_none());
    }

    #[test]
    fn load_resolves_paths_against_config_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("policies.yaml"),
            "bundles:\n  sbx:\n    allowed_environments: [SBX]\n    allowed_modules: [blueprint]\n    credential_scope: s\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("provision.yaml"),
            "store: { path: data/runs.redb }\npolicies:\n  path: policies.yaml\n  bundles:\n    dev:\n      allowed_environments: [DEV]\n      allowed_modules: [blueprint]\n      credential_scope: d\n",
        )
        .unwrap();

        let cfg = Config::load(&dir.path().join("provision.yaml")).unwrap();
        assert_eq!(cfg.store_path(), dir.path().join("data/runs.redb"));
        let store = cfg.policy_store().unwrap();
        assert_eq!(store.names().collect::<Vec<_>>(), vec!["dev", "sbx"]);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }
}
