//! Backend adapter contract and the static module registry.
//!
//! Every backend (blueprint orchestration, IaC apply, DNS/IP registrar) is
//! reached through `BackendAdapter`. Concrete backend logic lives outside
//! this crate; `HttpBackendAdapter` is the generic client for backends that
//! expose the adapter contract over HTTP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::credential::EphemeralCredential;
use crate::error::{ProvisionError, Result};
use crate::types::{Environment, ModuleKind, Tags};

/// Reference attribute holding a fully qualified DNS name.
pub const ATTR_FQDN: &str = "fqdn";
/// Reference attribute holding a hostname.
pub const ATTR_HOSTNAME: &str = "hostname";
/// Reference attribute holding an IP address.
pub const ATTR_IP_ADDRESS: &str = "ip_address";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying: timeouts, throttling, 5xx.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The backend refused the request as given.
    #[error("backend rejected the request: {0}")]
    Rejected(String),
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// What a backend hands back for a created resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReference {
    pub id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl BackendReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Input to one backend step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleParams {
    pub run_id: String,
    pub module: String,
    pub environment: Environment,
    pub service: String,
    pub owner: String,
    pub dns: bool,
    pub tags: Tags,
    /// References produced by earlier steps of the same run, keyed by module.
    pub upstream: BTreeMap<String, BackendReference>,
}

// ---------------------------------------------------------------------------
// BackendAdapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Module identifier, as referenced by policy bundles.
    fn module(&self) -> &str;

    fn kind(&self) -> ModuleKind;

    async fn invoke(
        &self,
        params: &ModuleParams,
        credential: &EphemeralCredential,
    ) -> std::result::Result<BackendReference, BackendError>;

    fn supports_compensation(&self) -> bool {
        false
    }

    /// Undo the effect of a successful `invoke`.
    async fn compensate(
        &self,
        _reference: &BackendReference,
        _credential: &EphemeralCredential,
    ) -> std::result::Result<(), BackendError> {
        Err(BackendError::Fatal(format!(
            "module '{}' does not support compensation",
            self.module()
        )))
    }
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

/// Static map from module identifier to adapter. Built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut modules: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        modules.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("modules", &modules)
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own module id, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.module().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, module: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(module).cloned()
    }

    pub fn require(&self, module: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.get(module)
            .ok_or_else(|| ProvisionError::UnknownModule(module.to_string()))
    }

    pub fn modules(&self) -> Vec<&str> {
        let mut modules: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        modules.sort_unstable();
        modules
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// HttpBackendAdapter
// ---------------------------------------------------------------------------

/// Generic client for a backend exposing the adapter contract over HTTP:
///
/// - `POST {base}/invoke` with `ModuleParams` as JSON, answering with a
///   `BackendReference`
/// - `DELETE {base}/resources/{id}` for compensation, when enabled
///
/// The ephemeral credential travels as a bearer token.
pub struct HttpBackendAdapter {
    module: String,
    kind: ModuleKind,
    base: String,
    compensation: bool,
    client: reqwest::Client,
}

impl HttpBackendAdapter {
    pub fn new(
        module: impl Into<String>,
        kind: ModuleKind,
        base: &str,
        timeout: Duration,
        compensation: bool,
    ) -> Result<Self> {
        let module = module.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::Config(format!("backend '{module}' client: {e}")))?;
        Ok(Self {
            module,
            kind,
            base: base.trim_end_matches('/').to_string(),
            compensation,
            client,
        })
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> BackendError {
    let detail = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body, 200))
    };
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        BackendError::Transient(detail)
    } else if status.is_client_error() {
        BackendError::Rejected(detail)
    } else {
        BackendError::Fatal(detail)
    }
}

fn classify_send_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        BackendError::Transient(e.to_string())
    } else {
        BackendError::Fatal(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl BackendAdapter for HttpBackendAdapter {
    fn module(&self) -> &str {
        &self.module
    }

    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn supports_compensation(&self) -> bool {
        self.compensation
    }

    async fn invoke(
        &self,
        params: &ModuleParams,
        credential: &EphemeralCredential,
    ) -> std::result::Result<BackendReference, BackendError> {
        let resp = self
            .client
            .post(format!("{}/invoke", self.base))
            .bearer_auth(credential.value().expose())
            .header("Idempotency-Key", format!("{}:{}", params.run_id, params.module))
            .json(params)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let body = resp.text().await.map_err(classify_send_error)?;
        serde_json::from_str::<BackendReference>(&body)
            .map_err(|e| BackendError::Fatal(format!("malformed backend response: {e}")))
    }

    async fn compensate(
        &self,
        reference: &BackendReference,
        credential: &EphemeralCredential,
    ) -> std::result::Result<(), BackendError> {
        if !self.compensation {
            return Err(BackendError::Fatal(format!(
                "module '{}' does not support compensation",
                self.module
            )));
        }
        let resp = self
            .client
            .delete(format!("{}/resources/{}", self.base, reference.id))
            .bearer_auth(credential.value().expose())
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        // Already gone counts as compensated.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}
