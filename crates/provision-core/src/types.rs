use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProvisionError;

/// Request tags, ordered for stable serialization and audit output.
pub type Tags = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Environment {
    Sbx,
    Dev,
    Test,
    PreProd,
    Prod,
    Aspe,
}

impl Environment {
    pub fn all() -> &'static [Environment] {
        &[
            Environment::Sbx,
            Environment::Dev,
            Environment::Test,
            Environment::PreProd,
            Environment::Prod,
            Environment::Aspe,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Sbx => "SBX",
            Environment::Dev => "DEV",
            Environment::Test => "TEST",
            Environment::PreProd => "PRE_PROD",
            Environment::Prod => "PROD",
            Environment::Aspe => "ASPE",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Environment::Sbx => "Sandbox Environment",
            Environment::Dev => "Development Environment",
            Environment::Test => "Test Environment",
            Environment::PreProd => "Pre-Production Environment",
            Environment::Prod => "Production Environment",
            Environment::Aspe => "DR Environment",
        }
    }

    /// Production and disaster-recovery environments.
    pub fn is_prod_like(self) -> bool {
        matches!(self, Environment::Prod | Environment::Aspe)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = ProvisionError;

    /// Case-insensitive; accepts canonical codes and the common aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_uppercase();
        match normalized.as_str() {
            "SBX" | "SANDBOX" => Ok(Environment::Sbx),
            "DEV" | "DEVELOPMENT" => Ok(Environment::Dev),
            "TEST" => Ok(Environment::Test),
            "PRE_PROD" | "PREPROD" | "PREPRODUCTION" => Ok(Environment::PreProd),
            "PROD" | "PRODUCTION" => Ok(Environment::Prod),
            "ASPE" | "DR" => Ok(Environment::Aspe),
            _ => Err(ProvisionError::Validation(format!(
                "unknown environment '{s}'"
            ))),
        }
    }
}

impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ModuleKind
// ---------------------------------------------------------------------------

/// The family of backend a module belongs to.
///
/// The sequencer only cares about `Registrar`: those steps are skipped when a
/// request does not ask for DNS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Blueprint,
    IacApply,
    Registrar,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Blueprint => "blueprint",
            ModuleKind::IacApply => "iac_apply",
            ModuleKind::Registrar => "registrar",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_aliases_case_insensitively() {
        assert_eq!("sbx".parse::<Environment>().unwrap(), Environment::Sbx);
        assert_eq!("Sandbox".parse::<Environment>().unwrap(), Environment::Sbx);
        assert_eq!("pre-prod".parse::<Environment>().unwrap(), Environment::PreProd);
        assert_eq!("PREPRODUCTION".parse::<Environment>().unwrap(), Environment::PreProd);
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!("dr".parse::<Environment>().unwrap(), Environment::Aspe);
    }

    #[test]
    fn environment_rejects_unknown() {
        let err = "staging".parse::<Environment>().unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
    }

    #[test]
    fn environment_serializes_canonical_code() {
        let json = serde_json::to_string(&Environment::PreProd).unwrap();
        assert_eq!(json, "\"PRE_PROD\"");
        let back: Environment = serde_json::from_str("\"production\"").unwrap();
        assert_eq!(back, Environment::Prod);
    }

    #[test]
    fn prod_like_covers_prod_and_dr() {
        let prod_like: Vec<_> = Environment::all()
            .iter()
            .filter(|e| e.is_prod_like())
            .collect();
        assert_eq!(prod_like, vec![&Environment::Prod, &Environment::Aspe]);
    }
}
