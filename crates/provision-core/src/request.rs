//! Provisioning request intake.
//!
//! `ProvisionPayload` is the wire shape accepted from callers (humans, CI jobs
//! or agents). `ProvisionPayload::validate` turns it into an immutable
//! `ProvisioningRequest` or fails with `ProvisionError::Validation`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProvisionError, Result};
use crate::types::{Environment, Tags};

const MAX_REQUEST_ID_LEN: usize = 128;
const MAX_SERVICE_LEN: usize = 63;
const MAX_TAG_KEY_LEN: usize = 128;
const MAX_TAG_VALUE_LEN: usize = 256;

/// Raw request body. `request_id` is optional; one is generated when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionPayload {
    #[serde(default)]
    pub request_id: Option<String>,
    pub environment: String,
    pub service: String,
    pub owner: String,
    pub policy_bundle: String,
    #[serde(default)]
    pub dns: bool,
    #[serde(default)]
    pub tags: Tags,
}

/// An accepted, validated request. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub request_id: String,
    pub environment: Environment,
    pub service: String,
    pub owner: String,
    pub policy_bundle: String,
    pub dns: bool,
    pub tags: Tags,
}

impl ProvisionPayload {
    pub fn validate(self) -> Result<ProvisioningRequest> {
        let request_id = match self.request_id {
            Some(id) => {
                validate_request_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        let environment: Environment = self.environment.parse()?;
        validate_service(&self.service)?;

        let owner = self.owner.trim().to_string();
        if owner.is_empty() {
            return Err(ProvisionError::Validation("owner must not be empty".into()));
        }
        let policy_bundle = self.policy_bundle.trim().to_string();
        if policy_bundle.is_empty() {
            return Err(ProvisionError::Validation(
                "policy_bundle must not be empty".into(),
            ));
        }
        for (key, value) in &self.tags {
            validate_tag(key, value)?;
        }

        Ok(ProvisioningRequest {
            request_id,
            environment,
            service: self.service,
            owner,
            policy_bundle,
            dns: self.dns,
            tags: self.tags,
        })
    }
}

fn validate_request_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.len() > MAX_REQUEST_ID_LEN
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ProvisionError::Validation(format!(
            "invalid request_id '{id}': 1-{MAX_REQUEST_ID_LEN} letters, digits, '.', '-' or '_'"
        )));
    }
    Ok(())
}

/// Service names become hostname labels, so they follow label rules.
fn validate_service(service: &str) -> Result<()> {
    let valid = !service.is_empty()
        && service.len() <= MAX_SERVICE_LEN
        && service
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !service.starts_with('-')
        && !service.ends_with('-');
    if !valid {
        return Err(ProvisionError::Validation(format!(
            "invalid service '{service}': must be a lowercase hostname label (a-z, 0-9, '-')"
        )));
    }
    Ok(())
}

fn validate_tag(key: &str, value: &str) -> Result<()> {
    if key.is_empty()
        || key.len() > MAX_TAG_KEY_LEN
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-'))
    {
        return Err(ProvisionError::Validation(format!("invalid tag key '{key}'")));
    }
    if value.len() > MAX_TAG_VALUE_LEN {
        return Err(ProvisionError::Validation(format!(
            "tag '{key}' value exceeds {MAX_TAG_VALUE_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ProvisionPayload {
        ProvisionPayload {
            request_id: Some("req-1".into()),
            environment: "SBX".into(),
            service: "svc".into(),
            owner: "alice".into(),
            policy_bundle: "sbx_default".into(),
            dns: true,
            tags: Tags::new(),
        }
    }

    #[test]
    fn valid_payload_is_accepted() {
        let req = payload().validate().unwrap();
        assert_eq!(req.request_id, "req-1");
        assert_eq!(req.environment, Environment::Sbx);
        assert!(req.dns);
    }

    #[test]
    fn missing_request_id_is_generated() {
        let mut p = payload();
        p.request_id = None;
        let req = p.validate().unwrap();
        assert!(Uuid::parse_str(&req.request_id).is_ok());
    }

    #[test]
    fn bad_request_id_is_rejected() {
        let mut p = payload();
        p.request_id = Some("../etc/passwd".into());
        assert!(matches!(
            p.validate(),
            Err(ProvisionError::Validation(_))
        ));
    }

    #[test]
    fn service_must_be_hostname_label() {
        for bad in ["", "Svc", "svc_1", "-svc", "svc-", "svc.example"] {
            let mut p = payload();
            p.service = bad.into();
            assert!(p.validate().is_err(), "accepted service {bad:?}");
        }
    }

    #[test]
    fn blank_owner_is_rejected() {
        let mut p = payload();
        p.owner = "   ".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let mut p = payload();
        p.environment = "moon".into();
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("moon"));
    }

    #[test]
    fn tag_keys_are_checked() {
        let mut p = payload();
        p.tags.insert("cost center".into(), "42".into());
        assert!(p.validate().is_err());

        let mut p = payload();
        p.tags.insert("cost_center".into(), "42".into());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn payload_defaults_dns_and_tags() {
        let json = serde_json::json!({
            "environment": "DEV",
            "service": "api",
            "owner": "bob",
            "policy_bundle": "dev"
        });
        let p: ProvisionPayload = serde_json::from_value(json).unwrap();
        assert!(!p.dns);
        assert!(p.tags.is_empty());
    }
}
