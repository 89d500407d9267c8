//! Orchestration sequencer.
//!
//! `Orchestrator` is the entry point: it accepts requests, creates runs
//! idempotently and hands each run to a `RunDriver` which walks the state
//! machine. `Reconciler` picks up runs that no driver owns any more.

mod driver;
mod reconcile;

pub use reconcile::{ReconcileReport, Reconciler};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::info;

use crate::adapter::AdapterRegistry;
use crate::audit::{AuditLogger, AuditRecord, AuditSink};
use crate::config::Config;
use crate::credential::{BrokerSettings, CredentialBroker, CredentialBrokerClient, Secret};
use crate::error::{ProvisionError, Result};
use crate::policy::PolicyResolver;
use crate::request::ProvisionPayload;
use crate::response::{Explanation, StatusView};
use crate::retry::RetryPolicy;
use crate::run::OrchestrationRun;
use crate::store::RunDb;

use driver::RunDriver;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub broker: BrokerSettings,
    pub backend_retry: RetryPolicy,
    pub audit_retry: RetryPolicy,
    pub step_timeout: Duration,
    pub max_run_timeout: Duration,
    pub reconcile_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            backend_retry: RetryPolicy::default(),
            audit_retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(300),
            max_run_timeout: Duration::from_secs(3600),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            broker: cfg.broker_settings(),
            backend_retry: cfg.retry.backend.clone(),
            audit_retry: cfg.retry.audit.clone(),
            step_timeout: cfg.run.step_timeout(),
            max_run_timeout: cfg.run.max_run_timeout(),
            reconcile_interval: cfg.run.reconcile_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    pub(crate) store: Arc<RunDb>,
    pub(crate) audit: AuditLogger,
    pub(crate) policies: PolicyResolver,
    pub(crate) adapters: AdapterRegistry,
    pub(crate) broker: Arc<dyn CredentialBroker>,
    pub(crate) settings: OrchestratorSettings,
    /// Runs with a driver in this process, and their cancel flags.
    live: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Inner {
    fn live(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a run from the live set when its driver goes away.
pub(crate) struct LiveGuard {
    inner: Arc<Inner>,
    run_id: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.inner.live().remove(&self.run_id);
    }
}

/// Cheap to clone; all clones share the same live-run table.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

enum Prepared {
    /// The request id was already known.
    Existing(OrchestrationRun),
    /// The run reached a terminal state during preparation.
    Settled(OrchestrationRun),
    Ready(RunDriver),
}

impl Orchestrator {
    pub fn new(
        store: Arc<RunDb>,
        audit_sink: Arc<dyn AuditSink>,
        policies: PolicyResolver,
        adapters: AdapterRegistry,
        broker: Arc<dyn CredentialBroker>,
        settings: OrchestratorSettings,
    ) -> Self {
        let audit = AuditLogger::new(audit_sink, settings.audit_retry.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                audit,
                policies,
                adapters,
                broker,
                settings,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire everything up from a loaded config. The run store doubles as the
    /// audit sink.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let store = Arc::new(RunDb::open(&cfg.store_path())?);
        let policies = PolicyResolver::new(Arc::new(cfg.policy_store()?));
        let adapters = cfg.adapter_registry()?;
        let broker = cfg.credential_broker()?;
        Ok(Self::new(
            store.clone(),
            store,
            policies,
            adapters,
            broker,
            OrchestratorSettings::from_config(cfg),
        ))
    }

    pub fn store(&self) -> &RunDb {
        &self.inner.store
    }

    pub fn policies(&self) -> &PolicyResolver {
        &self.inner.policies
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.inner.adapters
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// True while a driver in this process owns the run.
    pub fn is_live(&self, run_id: &str) -> bool {
        self.inner.live().contains_key(run_id)
    }

    /// Take ownership of a run that no driver holds, so only one recovery
    /// settles it. Gives back the current owner's cancel flag if it is taken.
    pub(crate) fn claim(
        &self,
        run_id: &str,
    ) -> std::result::Result<(LiveGuard, Arc<AtomicBool>), Arc<AtomicBool>> {
        let mut live = self.inner.live();
        if let Some(flag) = live.get(run_id) {
            return Err(flag.clone());
        }
        let flag = Arc::new(AtomicBool::new(false));
        live.insert(run_id.to_string(), flag.clone());
        let guard = LiveGuard {
            inner: self.inner.clone(),
            run_id: run_id.to_string(),
        };
        Ok((guard, flag))
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.clone())
    }

    /// Validate, authorize and credential the request, then execute the
    /// backend steps in a background task.
    ///
    /// Returns the run as it stands once execution has been handed off, or
    /// the stored run unchanged if `request_id` was seen before.
    pub async fn submit(&self, payload: ProvisionPayload, bearer: Secret) -> Result<OrchestrationRun> {
        match self.prepare(payload, bearer).await? {
            Prepared::Existing(run) | Prepared::Settled(run) => Ok(run),
            Prepared::Ready(driver) => {
                let run = driver.run().clone();
                tokio::spawn(driver.finish());
                Ok(run)
            }
        }
    }

    /// Like `submit`, but drives the run to the end before returning.
    pub async fn provision(
        &self,
        payload: ProvisionPayload,
        bearer: Secret,
    ) -> Result<OrchestrationRun> {
        match self.prepare(payload, bearer).await? {
            Prepared::Existing(run) | Prepared::Settled(run) => Ok(run),
            Prepared::Ready(driver) => Ok(driver.finish().await),
        }
    }

    async fn prepare(&self, payload: ProvisionPayload, bearer: Secret) -> Result<Prepared> {
        // A known request id is answered from the store whatever the payload
        // now says.
        if let Some(id) = payload.request_id.as_deref() {
            if let Some(stored) = self.inner.store.get(id)? {
                info!(run_id = %id, state = %stored.state, "duplicate request; returning stored run");
                return Ok(Prepared::Existing(stored));
            }
        }
        let request = payload.validate()?;
        let run_id = request.request_id.clone();

        // Creation and registration happen under the live lock so the
        // reconciler never sees a fresh run without its driver.
        let (run, cancel) = {
            let mut live = self.inner.live();
            let (stored, created) = self
                .inner
                .store
                .create_if_absent(&OrchestrationRun::new(request))?;
            if !created {
                info!(run_id = %run_id, state = %stored.state, "duplicate request; returning stored run");
                return Ok(Prepared::Existing(stored));
            }
            let flag = Arc::new(AtomicBool::new(false));
            live.insert(run_id.clone(), flag.clone());
            (stored, flag)
        };
        info!(run_id = %run_id, service = %run.request.service, environment = %run.request.environment, "run accepted");

        let guard = LiveGuard {
            inner: self.inner.clone(),
            run_id,
        };
        let credentials = CredentialBrokerClient::new(
            self.inner.broker.clone(),
            bearer,
            self.inner.settings.broker.clone(),
        );
        let mut driver = RunDriver::new(self.inner.clone(), run, credentials, cancel, guard);

        if let Err(e) = driver.prepare().await {
            driver.abandon().await;
            return Err(e);
        }
        if driver.run().is_terminal() {
            return Ok(Prepared::Settled(driver.finish().await));
        }
        Ok(Prepared::Ready(driver))
    }

    /// Request cancellation.
    ///
    /// A live run is flagged and stops at its next step boundary. A run with
    /// no driver is claimed and failed on the spot.
    pub async fn cancel(&self, run_id: &str) -> Result<OrchestrationRun> {
        let run = self.inner.store.require(run_id)?;
        if run.is_terminal() {
            return Err(conflict(&run));
        }

        let (_guard, flag) = match self.claim(run_id) {
            Ok(claimed) => claimed,
            Err(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(run_id, "cancellation requested");
                return Ok(run);
            }
        };
        flag.store(true, Ordering::SeqCst);

        // Re-read under the claim: a reconcile pass may have settled it.
        let mut run = self.inner.store.require(run_id)?;
        if run.is_terminal() {
            return Err(conflict(&run));
        }
        run.cancel_requested = true;
        self.inner.store.update(&mut run)?;
        info!(run_id, "cancellation requested for run without a driver");
        self.recover(run, &flag).await
    }

    pub fn get(&self, run_id: &str) -> Result<OrchestrationRun> {
        self.inner.store.require(run_id)
    }

    pub fn status(&self, run_id: &str) -> Result<StatusView> {
        Ok(StatusView::from_run(&self.get(run_id)?))
    }

    pub fn explain(&self, run_id: &str) -> Result<Explanation> {
        let run = self.get(run_id)?;
        let trail = self.inner.audit.trail(run_id)?;
        Ok(Explanation::new(&run, trail))
    }

    pub fn trail(&self, run_id: &str) -> Result<Vec<AuditRecord>> {
        self.inner.audit.trail(run_id)
    }

    /// All runs, newest first.
    pub fn list(&self) -> Result<Vec<OrchestrationRun>> {
        self.inner.store.list()
    }
}

fn conflict(run: &OrchestrationRun) -> ProvisionError {
    ProvisionError::RunConflict(format!("run {} is already {}", run.run_id, run.state))
}

/// Apply an audited record to `run` and persist it.
pub(crate) fn commit_record(
    store: &RunDb,
    run: &mut OrchestrationRun,
    record: &AuditRecord,
    seq: u64,
) -> Result<()> {
    match record.to_state {
        Some(to) => run.apply_transition(to, seq)?,
        None => run.note_audit(seq),
    }
    run.held = None;
    store.update(run)
}
