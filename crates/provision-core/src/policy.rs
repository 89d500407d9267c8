//! Policy bundles and their resolution.
//!
//! A bundle is the authorization envelope for a request: which environments it
//! may target, which backend modules run (in dependency order), the credential
//! scope handed to the broker and the tag keys every request must carry.
//! Bundles are loaded once into a read-only `PolicyStore`; `PolicyResolver`
//! is the pure lookup-and-check over that store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::adapter::AdapterRegistry;
use crate::config::{ConfigWarning, WarnLevel};
use crate::error::{ProvisionError, Result};
use crate::types::{Environment, Tags};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub allowed_environments: BTreeSet<Environment>,
    /// Module identifiers in the order they must execute.
    pub allowed_modules: Vec<String>,
    pub credential_scope: String,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
}

/// On-disk shape of a bundle: the name is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BundleEntry {
    #[serde(default)]
    description: String,
    allowed_environments: BTreeSet<Environment>,
    allowed_modules: Vec<String>,
    credential_scope: String,
    #[serde(default)]
    required_tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    bundles: BTreeMap<String, BundleEntry>,
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

/// Read-only set of named bundles.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    bundles: BTreeMap<String, PolicyBundle>,
}

impl PolicyStore {
    pub fn new(bundles: impl IntoIterator<Item = PolicyBundle>) -> Self {
        Self {
            bundles: bundles.into_iter().map(|b| (b.name.clone(), b)).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ProvisionError::Config(format!(
                "policy file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(data)?;
        Ok(Self::from_file(file))
    }

    pub(crate) fn from_file(file: PolicyFile) -> Self {
        Self::new(file.bundles.into_iter().map(|(name, entry)| PolicyBundle {
            name,
            description: entry.description,
            allowed_environments: entry.allowed_environments,
            allowed_modules: entry.allowed_modules,
            credential_scope: entry.credential_scope,
            required_tags: entry.required_tags,
        }))
    }

    pub fn get(&self, name: &str) -> Option<&PolicyBundle> {
        self.bundles.get(name)
    }

    pub fn bundles(&self) -> impl Iterator<Item = &PolicyBundle> {
        self.bundles.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Check every bundle against the adapters that are actually registered.
    pub fn validate(&self, registry: &AdapterRegistry) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.bundles.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "no policy bundles defined; every request will be rejected".into(),
            });
        }

        for bundle in self.bundles.values() {
            if bundle.allowed_environments.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("bundle '{}' allows no environments", bundle.name),
                });
            }
            if bundle.credential_scope.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("bundle '{}' has an empty credential_scope", bundle.name),
                });
            }

            let mut seen = HashSet::new();
            for module in &bundle.allowed_modules {
                if !seen.insert(module.as_str()) {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "bundle '{}' lists module '{}' more than once",
                            bundle.name, module
                        ),
                    });
                }
                if registry.get(module).is_none() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Error,
                        message: format!(
                            "bundle '{}' references unknown module '{}'",
                            bundle.name, module
                        ),
                    });
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// PolicyResolver
// ---------------------------------------------------------------------------

/// Handle passed into each run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    store: Arc<PolicyStore>,
}

impl PolicyResolver {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// Resolve `name` and check the request against it.
    ///
    /// Pure: the same inputs always produce the same answer.
    pub fn resolve(&self, name: &str, environment: Environment, tags: &Tags) -> Result<PolicyBundle> {
        let bundle = self
            .store
            .get(name)
            .ok_or_else(|| ProvisionError::PolicyNotFound(name.to_string()))?;

        if !bundle.allowed_environments.contains(&environment) {
            let allowed: Vec<&str> = bundle
                .allowed_environments
                .iter()
                .map(|e| e.as_str())
                .collect();
            return Err(ProvisionError::PolicyDenied {
                bundle: bundle.name.clone(),
                reason: format!(
                    "environment {environment} is not allowed (allowed: {})",
                    allowed.join(", ")
                ),
            });
        }

        let missing: Vec<&str> = bundle
            .required_tags
            .iter()
            .filter(|key| !tags.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ProvisionError::PolicyDenied {
                bundle: bundle.name.clone(),
                reason: format!("missing required tags: {}", missing.join(", ")),
            });
        }

        Ok(bundle.clone())
    }
}
