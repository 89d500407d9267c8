//! Ephemeral credentials and the broker client that issues them.
//!
//! A run never talks to a backend with the caller's own bearer. Instead the
//! bearer is exchanged for a sub-credential scoped by the policy bundle and
//! bound to exactly one run. Only the non-secret `CredentialRef` is ever
//! persisted or audited.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{ProvisionError, Result};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// Opaque secret string. `Debug` and `Display` are redacted and the type is
/// deliberately not `Serialize`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

// ---------------------------------------------------------------------------
// EphemeralCredential
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EphemeralCredential {
    value: Secret,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub run_id: String,
}

impl EphemeralCredential {
    pub fn new(
        value: Secret,
        scope: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            value,
            scope: scope.into(),
            issued_at,
            expires_at,
            run_id: run_id.into(),
        }
    }

    pub fn value(&self) -> &Secret {
        &self.value
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn reference(&self) -> CredentialRef {
        CredentialRef {
            scope: self.scope.clone(),
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }
}

/// The persistable, non-secret facts about an issued credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Broker contract
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker denied the request: {0}")]
    Denied(String),
}

/// A credential authority (Vault or similar).
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn issue(
        &self,
        bearer: &Secret,
        scope: &str,
        run_id: &str,
        ttl: Duration,
    ) -> std::result::Result<EphemeralCredential, BrokerError>;

    async fn revoke(
        &self,
        bearer: &Secret,
        credential: &EphemeralCredential,
    ) -> std::result::Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub ttl: Duration,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on a run's lifetime; issued credentials always expire
    /// strictly before it.
    pub max_run_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(900),
            call_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_run_timeout: Duration::from_secs(3600),
        }
    }
}

impl BrokerSettings {
    /// TTL to request: the configured TTL, clamped below the run timeout.
    pub fn effective_ttl(&self) -> Duration {
        let ceiling = self
            .max_run_timeout
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        self.ttl.min(ceiling)
    }
}

// ---------------------------------------------------------------------------
// CredentialBrokerClient
// ---------------------------------------------------------------------------

/// Request-scoped client: one per incoming request, carrying that caller's
/// bearer.
#[derive(Clone)]
pub struct CredentialBrokerClient {
    broker: Arc<dyn CredentialBroker>,
    bearer: Secret,
    settings: BrokerSettings,
}

impl fmt::Debug for CredentialBrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBrokerClient")
            .field("bearer", &self.bearer)
            .field("settings", &self.settings)
            .finish()
    }
}

impl CredentialBrokerClient {
    pub fn new(broker: Arc<dyn CredentialBroker>, bearer: Secret, settings: BrokerSettings) -> Self {
        Self {
            broker,
            bearer,
            settings,
        }
    }

    /// Exchange the caller's bearer for a credential bound to `run_id`.
    ///
    /// Unavailability (including call timeouts) is retried; denial is not.
    pub async fn issue(&self, scope: &str, run_id: &str) -> Result<EphemeralCredential> {
        let ttl = self.settings.effective_ttl();
        let attempts = self.settings.retry.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let call = self.broker.issue(&self.bearer, scope, run_id, ttl);
            let outcome = match tokio::time::timeout(self.settings.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Unavailable(format!(
                    "no response within {:?}",
                    self.settings.call_timeout
                ))),
            };

            match outcome {
                Ok(credential) => {
                    let credential = self.bind(credential, scope, run_id, ttl)?;
                    info!(
                        run_id,
                        scope,
                        expires_at = %credential.expires_at,
                        "ephemeral credential issued"
                    );
                    return Ok(credential);
                }
                Err(BrokerError::Denied(reason)) => {
                    warn!(run_id, scope, "credential broker denied issuance");
                    return Err(ProvisionError::CredentialDenied(reason));
                }
                Err(BrokerError::Unavailable(reason)) => {
                    warn!(run_id, attempt, attempts, "credential broker unavailable");
                    last_error = reason;
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(ProvisionError::CredentialBrokerUnavailable(last_error))
    }

    /// Best-effort revocation. Failures are logged and swallowed.
    pub async fn revoke(&self, credential: &EphemeralCredential) {
        let call = self.broker.revoke(&self.bearer, credential);
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(Ok(())) => info!(run_id = %credential.run_id, "ephemeral credential revoked"),
            Ok(Err(e)) => warn!(run_id = %credential.run_id, error = %e, "credential revocation failed"),
            Err(_) => warn!(run_id = %credential.run_id, "credential revocation timed out"),
        }
    }

    /// Check the broker honoured scope and binding, and clamp the lifetime.
    fn bind(
        &self,
        mut credential: EphemeralCredential,
        scope: &str,
        run_id: &str,
        ttl: Duration,
    ) -> Result<EphemeralCredential> {
        if credential.scope != scope {
            return Err(ProvisionError::CredentialDenied(format!(
                "broker issued scope '{}' but '{scope}' was requested",
                credential.scope
            )));
        }
        credential.run_id = run_id.to_string();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ProvisionError::Config(e.to_string()))?;
        let ceiling = credential.issued_at + ttl;
        if credential.expires_at > ceiling {
            credential.expires_at = ceiling;
        }
        Ok(credential)
    }
}

// ---------------------------------------------------------------------------
// VaultBroker
// ---------------------------------------------------------------------------

/// Issues child tokens through Vault's token API. The caller's bearer is used
/// as the parent token; the bundle scope becomes the token policy.
pub struct VaultBroker {
    base: String,
    namespace: Option<String>,
    client: reqwest::Client,
}

impl VaultBroker {
    pub fn new(base: impl Into<String>, namespace: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProvisionError::Config(format!("vault client: {e}")))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            namespace,
            client,
        })
    }

    fn request(&self, path: &str, bearer: &Secret) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/{}", self.base, path);
        let mut req = self
            .client
            .post(url)
            .header("X-Vault-Token", bearer.expose())
            .header("X-Vault-Request", "true");
        if let Some(ns) = &self.namespace {
            req = req.header("X-Vault-Namespace", ns);
        }
        req
    }
}

fn classify_status(status: reqwest::StatusCode, context: &str) -> BrokerError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        BrokerError::Unavailable(format!("{context}: HTTP {status}"))
    } else {
        BrokerError::Denied(format!("{context}: HTTP {status}"))
    }
}

#[derive(Deserialize)]
struct VaultAuthResponse {
    auth: VaultAuth,
}

#[derive(Deserialize)]
struct VaultAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

#[async_trait]
impl CredentialBroker for VaultBroker {
    async fn issue(
        &self,
        bearer: &Secret,
        scope: &str,
        run_id: &str,
        ttl: Duration,
    ) -> std::result::Result<EphemeralCredential, BrokerError> {
        let body = serde_json::json!({
            "policies": [scope],
            "ttl": format!("{}s", ttl.as_secs()),
            "explicit_max_ttl": format!("{}s", ttl.as_secs()),
            "renewable": false,
            "display_name": format!("provision-{run_id}"),
            "meta": { "run_id": run_id },
        });
        let resp = self
            .request("auth/token/create", bearer)
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("token create: {e}")))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "token create"));
        }
        let parsed: VaultAuthResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("token create response: {e}")))?;

        let issued_at = Utc::now();
        let lease = if parsed.auth.lease_duration > 0 {
            Duration::from_secs(parsed.auth.lease_duration).min(ttl)
        } else {
            ttl
        };
        let expires_at = issued_at
            + chrono::Duration::from_std(lease)
                .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(EphemeralCredential::new(
            Secret::new(parsed.auth.client_token),
            scope,
            issued_at,
            expires_at,
            run_id,
        ))
    }

    async fn revoke(
        &self,
        bearer: &Secret,
        credential: &EphemeralCredential,
    ) -> std::result::Result<(), BrokerError> {
        let resp = self
            .request("auth/token/revoke", bearer)
            .json(&serde_json::json!({ "token": credential.value().expose() }))
            .send()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("token revoke: {e}")))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "token revoke"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LocalBroker
// ---------------------------------------------------------------------------

/// Mints random in-process tokens. For development setups without a broker.
#[derive(Debug, Default)]
pub struct LocalBroker;

#[async_trait]
impl CredentialBroker for LocalBroker {
    async fn issue(
        &self,
        _bearer: &Secret,
        scope: &str,
        run_id: &str,
        ttl: Duration,
    ) -> std::result::Result<EphemeralCredential, BrokerError> {
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl).map_err(|e| BrokerError::Denied(e.to_string()))?;
        Ok(EphemeralCredential::new(
            Secret::new(format!("local.{}", uuid::Uuid::new_v4().simple())),
            scope,
            issued_at,
            expires_at,
            run_id,
        ))
    }

    async fn revoke(
        &self,
        _bearer: &Secret,
        _credential: &EphemeralCredential,
    ) -> std::result::Result<(), BrokerError> {
        Ok(())
    }
}
