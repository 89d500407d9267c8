use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use super::{commit_record, Inner, LiveGuard};
use crate::adapter::{BackendAdapter, BackendError, BackendReference, ModuleParams};
use crate::audit::{AuditEvent, AuditRecord};
use crate::credential::{CredentialBrokerClient, EphemeralCredential};
use crate::error::{ProvisionError, Result};
use crate::policy::PolicyBundle;
use crate::run::{
    Failure, HeldTransition, OrchestrationRun, RunState, StepError, StepResult, StepStatus,
};
use crate::types::ModuleKind;

/// Owns one run and its credential for as long as this process drives it.
///
/// Each call in `drive` moves the run by exactly one audited record, so
/// cancellation and held audit writes are observed between steps.
pub(crate) struct RunDriver {
    inner: Arc<Inner>,
    run: OrchestrationRun,
    credentials: CredentialBrokerClient,
    credential: Option<EphemeralCredential>,
    cancel: Arc<AtomicBool>,
    _live: LiveGuard,
}

impl RunDriver {
    pub(super) fn new(
        inner: Arc<Inner>,
        run: OrchestrationRun,
        credentials: CredentialBrokerClient,
        cancel: Arc<AtomicBool>,
        live: LiveGuard,
    ) -> Self {
        Self {
            inner,
            run,
            credentials,
            credential: None,
            cancel,
            _live: live,
        }
    }

    pub(super) fn run(&self) -> &OrchestrationRun {
        &self.run
    }

    /// Policy resolution and credential issuance. Stops early if an audit
    /// write is held; the rest of the driver picks that up.
    pub(super) async fn prepare(&mut self) -> Result<()> {
        loop {
            if self.run.held.is_some() || self.run.is_terminal() {
                return Ok(());
            }
            let outcome = match self.run.state {
                RunState::Pending => self.validate().await,
                RunState::Validated => self.acquire_credential().await,
                _ => return Ok(()),
            };
            if let Err(e) = outcome {
                if self.run.held.is_some() {
                    return Ok(());
                }
                return Err(e);
            }
        }
    }

    /// Drive the run to a terminal state (or give up on a held audit write)
    /// and release the credential.
    pub(super) async fn finish(mut self) -> OrchestrationRun {
        if let Err(e) = self.drive().await {
            if self.run.held.is_some() {
                error!(
                    run_id = %self.run.run_id,
                    error = %e,
                    "audit record still held at run deadline; leaving run for the reconciler"
                );
            } else if !self.run.is_terminal() {
                error!(run_id = %self.run.run_id, error = %e, "run driver failed");
                if let Err(e) = self.fail(None, e).await {
                    error!(run_id = %self.run.run_id, error = %e, "could not record run failure");
                }
            }
        }
        self.release_credential().await;
        self.run
    }

    /// Drop the run without driving it further.
    pub(super) async fn abandon(mut self) {
        warn!(run_id = %self.run.run_id, state = %self.run.state, "abandoning run");
        self.release_credential().await;
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            if self.run.held.is_some() {
                self.await_release().await?;
            }
            if self.run.is_terminal() {
                return Ok(());
            }
            if self.cancel_observed()
                && matches!(
                    self.run.state,
                    RunState::Pending
                        | RunState::Validated
                        | RunState::Credentialed
                        | RunState::Executing
                )
            {
                self.run.cancel_requested = true;
                info!(run_id = %self.run.run_id, state = %self.run.state, "cancellation observed");
                let outcome = self.fail(None, ProvisionError::Cancelled).await;
                self.hold_tolerant(outcome)?;
                continue;
            }

            let outcome = match self.run.state {
                RunState::Pending => self.validate().await,
                RunState::Validated => self.acquire_credential().await,
                RunState::Credentialed => self.start_execution().await,
                RunState::Executing => self.execute_next().await,
                RunState::RollingBack => self.rollback_next().await,
                RunState::Tagging => {
                    let record =
                        AuditRecord::transition(&self.run, AuditEvent::Audited, RunState::Audited);
                    self.advance(record).await
                }
                RunState::Audited => {
                    let record = AuditRecord::transition(
                        &self.run,
                        AuditEvent::Completed,
                        RunState::Complete,
                    );
                    self.advance(record).await
                }
                RunState::Complete | RunState::Failed => return Ok(()),
            };
            self.hold_tolerant(outcome)?;
        }
    }

    /// A held audit write is not an error for the drive loop.
    fn hold_tolerant(&self, outcome: Result<()>) -> Result<()> {
        match outcome {
            Err(_) if self.run.held.is_some() => Ok(()),
            other => other,
        }
    }

    fn cancel_observed(&self) -> bool {
        self.run.cancel_requested || self.cancel.load(Ordering::SeqCst)
    }

    fn bundle(&self) -> Result<&PolicyBundle> {
        self.run.policy.as_ref().ok_or_else(|| ProvisionError::InvalidTransition {
            from: self.run.state.to_string(),
            to: "execution without a resolved policy bundle".into(),
        })
    }

    // -----------------------------------------------------------------------
    // Audit plumbing
    // -----------------------------------------------------------------------

    /// Write `record`, then apply it to the run and persist.
    ///
    /// If the audit write fails the run is held: the record is stored on the
    /// run, the state is left alone and `AuditWriteFailure` is returned.
    async fn advance(&mut self, record: AuditRecord) -> Result<()> {
        if let Some(to) = record.to_state {
            if !self.run.state.can_transition_to(to) {
                return Err(ProvisionError::InvalidTransition {
                    from: self.run.state.to_string(),
                    to: to.to_string(),
                });
            }
        }

        match self.inner.audit.append(&record).await {
            Ok(seq) => {
                let from = self.run.state;
                commit_record(&self.inner.store, &mut self.run, &record, seq)?;
                if let Some(to) = record.to_state {
                    info!(
                        run_id = %self.run.run_id,
                        from = %from,
                        to = %to,
                        event = %record.event,
                        seq,
                        "run transition"
                    );
                }
                Ok(())
            }
            Err(ProvisionError::AuditWriteFailure(reason)) => {
                error!(
                    run_id = %self.run.run_id,
                    event = %record.event,
                    "audit write failed; holding run"
                );
                self.run.held = Some(HeldTransition::new(record));
                self.inner.store.update(&mut self.run)?;
                Err(ProvisionError::AuditWriteFailure(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Retry the held record at the reconcile interval until it is written
    /// or the run deadline passes.
    async fn await_release(&mut self) -> Result<()> {
        let deadline = self.run.deadline(self.inner.settings.max_run_timeout);
        loop {
            let Some(held) = self.run.held.clone() else {
                return Ok(());
            };
            if Utc::now() >= deadline {
                return Err(ProvisionError::AuditWriteFailure(format!(
                    "record '{}' still unwritten at run deadline",
                    held.record.event
                )));
            }
            tokio::time::sleep(self.inner.settings.reconcile_interval).await;
            match self.inner.audit.append(&held.record).await {
                Ok(seq) => {
                    commit_record(&self.inner.store, &mut self.run, &held.record, seq)?;
                    info!(run_id = %self.run.run_id, event = %held.record.event, seq, "held audit record flushed");
                }
                Err(e) => {
                    warn!(run_id = %self.run.run_id, error = %e, "held audit record still unwritten");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // PENDING -> VALIDATED -> CREDENTIALED
    // -----------------------------------------------------------------------

    async fn validate(&mut self) -> Result<()> {
        let request = &self.run.request;
        let resolved = self.inner.policies.resolve(
            &request.policy_bundle,
            request.environment,
            &request.tags,
        );
        match resolved {
            Ok(bundle) => {
                let detail = json!({
                    "bundle": bundle.name,
                    "modules": bundle.allowed_modules,
                    "credential_scope": bundle.credential_scope,
                });
                self.run.policy = Some(bundle);
                let record =
                    AuditRecord::transition(&self.run, AuditEvent::Validated, RunState::Validated)
                        .with_detail(detail);
                self.advance(record).await
            }
            Err(e) => self.fail(None, e).await,
        }
    }

    async fn acquire_credential(&mut self) -> Result<()> {
        let scope = self.bundle()?.credential_scope.clone();
        match self.credentials.issue(&scope, &self.run.run_id).await {
            Ok(credential) => {
                let reference = credential.reference();
                self.credential = Some(credential);
                self.run.credential = Some(reference.clone());
                let record = AuditRecord::transition(
                    &self.run,
                    AuditEvent::CredentialIssued,
                    RunState::Credentialed,
                )
                .with_detail(json!({
                    "scope": reference.scope,
                    "expires_at": reference.expires_at,
                }));
                self.advance(record).await
            }
            Err(e) => self.fail(None, e).await,
        }
    }

    /// Make sure the held credential is usable for the bundle, re-issuing it
    /// if it has expired.
    async fn ensure_credential(&mut self) -> Result<()> {
        let scope = self.bundle()?.credential_scope.clone();
        if let Some(current) = &self.credential {
            if current.scope != scope {
                return Err(ProvisionError::CredentialDenied(format!(
                    "credential scope '{}' does not match bundle scope '{scope}'",
                    current.scope
                )));
            }
            if current.is_valid_at(Utc::now()) {
                return Ok(());
            }
        }

        let fresh = self.credentials.issue(&scope, &self.run.run_id).await?;
        let reference = fresh.reference();
        if let Some(old) = self.credential.replace(fresh) {
            self.credentials.revoke(&old).await;
        }
        self.run.credential = Some(reference.clone());
        info!(run_id = %self.run.run_id, "ephemeral credential refreshed");
        let record = AuditRecord::event(&self.run, AuditEvent::CredentialRefreshed).with_detail(
            json!({ "scope": reference.scope, "expires_at": reference.expires_at }),
        );
        self.advance(record).await
    }

    /// The credential an adapter call may use: present, unexpired and scoped
    /// by the resolved bundle.
    fn usable_credential(&self) -> Result<&EphemeralCredential> {
        let scope = &self.bundle()?.credential_scope;
        self.credential
            .as_ref()
            .filter(|c| c.is_valid_at(Utc::now()) && &c.scope == scope)
            .ok_or_else(|| {
                ProvisionError::CredentialDenied("no unexpired credential for the bundle scope".into())
            })
    }

    async fn release_credential(&mut self) {
        if let Some(credential) = self.credential.take() {
            self.credentials.revoke(&credential).await;
        }
    }

    // -----------------------------------------------------------------------
    // EXECUTING
    // -----------------------------------------------------------------------

    async fn start_execution(&mut self) -> Result<()> {
        let modules = self.bundle()?.allowed_modules.clone();
        let record =
            AuditRecord::transition(&self.run, AuditEvent::ExecutionStarted, RunState::Executing)
                .with_detail(json!({ "modules": modules }));
        self.advance(record).await
    }

    /// Run the next module without a result, or move on to tagging.
    async fn execute_next(&mut self) -> Result<()> {
        let next = self
            .bundle()?
            .allowed_modules
            .iter()
            .find(|m| self.run.step(m).is_none())
            .cloned();
        match next {
            Some(module) => self.run_step(&module).await,
            None => self.tag().await,
        }
    }

    fn params(&self, module: &str) -> ModuleParams {
        let request = &self.run.request;
        let upstream: BTreeMap<String, BackendReference> = self
            .run
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .filter_map(|s| {
                s.backend_reference
                    .clone()
                    .map(|reference| (s.module.clone(), reference))
            })
            .collect();
        ModuleParams {
            run_id: self.run.run_id.clone(),
            module: module.to_string(),
            environment: request.environment,
            service: request.service.clone(),
            owner: request.owner.clone(),
            dns: request.dns,
            tags: request.tags.clone(),
            upstream,
        }
    }

    async fn run_step(&mut self, module: &str) -> Result<()> {
        let adapter = match self.inner.adapters.require(module) {
            Ok(adapter) => adapter,
            Err(e) => return self.fail(Some(module), e).await,
        };
        let started_at = Utc::now();

        if adapter.kind() == ModuleKind::Registrar && !self.run.request.dns {
            self.run.steps.push(StepResult {
                module: module.to_string(),
                kind: adapter.kind(),
                status: StepStatus::Skipped,
                backend_reference: None,
                error: None,
                attempt_count: 0,
                started_at,
                finished_at: started_at,
            });
            info!(run_id = %self.run.run_id, module, "registrar step skipped; dns not requested");
            let record =
                AuditRecord::transition(&self.run, AuditEvent::StepSkipped, RunState::Executing)
                    .with_module(module)
                    .with_detail(json!({ "reason": "dns not requested" }));
            return self.advance(record).await;
        }

        let params = self.params(module);
        let (outcome, attempts) = self.invoke_with_retry(adapter.as_ref(), &params).await;
        let finished_at = Utc::now();
        match outcome {
            Ok(reference) => {
                info!(run_id = %self.run.run_id, module, attempts, reference = %reference.id, "step succeeded");
                let detail = json!({ "reference": reference.id, "attempts": attempts });
                self.run.steps.push(StepResult {
                    module: module.to_string(),
                    kind: adapter.kind(),
                    status: StepStatus::Succeeded,
                    backend_reference: Some(reference),
                    error: None,
                    attempt_count: attempts,
                    started_at,
                    finished_at,
                });
                let record = AuditRecord::transition(
                    &self.run,
                    AuditEvent::StepCompleted,
                    RunState::Executing,
                )
                .with_module(module)
                .with_detail(detail);
                self.advance(record).await
            }
            // A held refresh record: retry the step once it is released.
            Err(e) if self.run.held.is_some() => Err(e),
            Err(e) => {
                warn!(run_id = %self.run.run_id, module, attempts, error = %e, "step failed");
                self.run.steps.push(StepResult {
                    module: module.to_string(),
                    kind: adapter.kind(),
                    status: StepStatus::Failed,
                    backend_reference: None,
                    error: Some(StepError {
                        kind: e.kind(),
                        message: e.to_string(),
                    }),
                    attempt_count: attempts,
                    started_at,
                    finished_at,
                });
                self.fail(Some(module), e).await
            }
        }
    }

    /// Invoke with bounded backoff on transient errors. Exhausted retries
    /// escalate to a fatal error. Also returns the number of calls made.
    async fn invoke_with_retry(
        &mut self,
        adapter: &dyn BackendAdapter,
        params: &ModuleParams,
    ) -> (Result<BackendReference>, u32) {
        let policy = self.inner.settings.backend_retry.clone();
        let step_timeout = self.inner.settings.step_timeout;
        let attempts = policy.attempts();
        let mut made = 0;

        for attempt in 1..=attempts {
            if let Err(e) = self.ensure_credential().await {
                return (Err(e), made);
            }
            let credential = match self.usable_credential() {
                Ok(c) => c,
                Err(e) => return (Err(e), made),
            };

            made = attempt;
            let outcome =
                match tokio::time::timeout(step_timeout, adapter.invoke(params, credential)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BackendError::Transient(format!(
                        "no response within {step_timeout:?}"
                    ))),
                };

            match outcome {
                Ok(reference) => return (Ok(reference), made),
                Err(BackendError::Transient(reason)) if attempt < attempts => {
                    warn!(
                        run_id = %params.run_id,
                        module = %params.module,
                        attempt,
                        attempts,
                        error = %reason,
                        "transient backend error; retrying"
                    );
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
                Err(BackendError::Transient(reason)) => {
                    let source =
                        BackendError::Fatal(format!("gave up after {attempts} attempts: {reason}"));
                    return (
                        Err(ProvisionError::Backend {
                            module: params.module.clone(),
                            source,
                        }),
                        made,
                    );
                }
                Err(source) => {
                    return (
                        Err(ProvisionError::Backend {
                            module: params.module.clone(),
                            source,
                        }),
                        made,
                    )
                }
            }
        }

        (
            Err(ProvisionError::Backend {
                module: params.module.clone(),
                source: BackendError::Fatal("no attempt was made".into()),
            }),
            made,
        )
    }

    // -----------------------------------------------------------------------
    // TAGGING
    // -----------------------------------------------------------------------

    async fn tag(&mut self) -> Result<()> {
        let bundle_name = self.bundle()?.name.clone();
        let request = &self.run.request;
        let mut tags = request.tags.clone();
        tags.insert("owner".into(), request.owner.clone());
        tags.insert("service".into(), request.service.clone());
        tags.insert("environment".into(), request.environment.as_str().to_string());
        tags.insert("run_id".into(), self.run.run_id.clone());
        tags.insert("policy_bundle".into(), bundle_name);

        let detail = json!({ "applied_tags": tags });
        self.run.applied_tags = tags;
        let record = AuditRecord::transition(&self.run, AuditEvent::Tagged, RunState::Tagging)
            .with_detail(detail);
        self.advance(record).await
    }

    // -----------------------------------------------------------------------
    // Failure and ROLLING_BACK
    // -----------------------------------------------------------------------

    /// Record `err` as the run's failure and move towards FAILED, through
    /// ROLLING_BACK if earlier steps changed backend state.
    async fn fail(&mut self, module: Option<&str>, err: ProvisionError) -> Result<()> {
        let failure = Failure::from_error(module, &err);
        let rolling_back = self.run.state == RunState::Executing && self.run.any_step_live();
        let event = match &err {
            ProvisionError::PolicyNotFound(_) => AuditEvent::PolicyNotFound,
            ProvisionError::PolicyDenied { .. } => AuditEvent::PolicyDenied,
            ProvisionError::CredentialDenied(_) => AuditEvent::CredentialDenied,
            ProvisionError::CredentialBrokerUnavailable(_) => AuditEvent::CredentialUnavailable,
            ProvisionError::Backend { .. } | ProvisionError::UnknownModule(_) => {
                AuditEvent::StepFailed
            }
            _ if rolling_back => AuditEvent::RollbackStarted,
            _ => AuditEvent::Failed,
        };

        let mut detail = json!({ "kind": failure.kind });
        // Only caller-fixable reasons go into the trail verbatim.
        if failure.kind.is_client_error() {
            detail["reason"] = json!(failure.message);
        }
        if rolling_back {
            let live: Vec<&str> = self
                .run
                .steps
                .iter()
                .filter(|s| s.is_live())
                .map(|s| s.module.as_str())
                .collect();
            detail["compensate"] = json!(live);
        }

        warn!(
            run_id = %self.run.run_id,
            module = module.unwrap_or("-"),
            kind = %failure.kind,
            rolling_back,
            "run failing"
        );
        self.run.failure = Some(failure);
        let target = if rolling_back {
            RunState::RollingBack
        } else {
            RunState::Failed
        };
        let mut record = AuditRecord::transition(&self.run, event, target).with_detail(detail);
        if let Some(module) = module {
            record = record.with_module(module);
        }
        self.advance(record).await
    }

    /// Compensate the most recent succeeded step, or finish the rollback.
    async fn rollback_next(&mut self) -> Result<()> {
        let next = self
            .run
            .steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.module.clone());
        match next {
            Some(module) => self.compensate(&module).await,
            None => {
                let kind = self.run.failure.as_ref().map(|f| f.kind);
                let record =
                    AuditRecord::transition(&self.run, AuditEvent::Failed, RunState::Failed)
                        .with_detail(json!({
                            "kind": kind,
                            "needs_manual_remediation": self.run.needs_manual_remediation,
                        }));
                self.advance(record).await
            }
        }
    }

    async fn compensate(&mut self, module: &str) -> Result<()> {
        let adapter = self
            .inner
            .adapters
            .get(module)
            .filter(|a| a.supports_compensation());
        let Some(adapter) = adapter else {
            warn!(run_id = %self.run.run_id, module, "no compensation available; manual remediation needed");
            self.mark_step(module, StepStatus::CompensationFailed);
            self.run.needs_manual_remediation = true;
            let record = AuditRecord::event(&self.run, AuditEvent::CompensationUnavailable)
                .with_module(module);
            return self.advance(record).await;
        };

        let outcome = self.compensate_once(adapter.as_ref(), module).await;
        match outcome {
            Ok(()) => {
                info!(run_id = %self.run.run_id, module, "step compensated");
                self.mark_step(module, StepStatus::Compensated);
                let record =
                    AuditRecord::event(&self.run, AuditEvent::Compensated).with_module(module);
                self.advance(record).await
            }
            Err(e) if self.run.held.is_some() => Err(e),
            Err(e) => {
                warn!(run_id = %self.run.run_id, module, error = %e, "compensation failed; manual remediation needed");
                self.mark_step(module, StepStatus::CompensationFailed);
                self.run.needs_manual_remediation = true;
                let record = AuditRecord::event(&self.run, AuditEvent::CompensationFailed)
                    .with_module(module)
                    .with_detail(json!({ "kind": e.kind() }));
                self.advance(record).await
            }
        }
    }

    /// A single timed compensating call. Any error, including a timeout,
    /// leaves the step for manual remediation.
    async fn compensate_once(&mut self, adapter: &dyn BackendAdapter, module: &str) -> Result<()> {
        let reference = self
            .run
            .step(module)
            .and_then(|s| s.backend_reference.clone())
            .ok_or_else(|| ProvisionError::Backend {
                module: module.to_string(),
                source: BackendError::Fatal("no backend reference to compensate".into()),
            })?;
        let step_timeout = self.inner.settings.step_timeout;

        self.ensure_credential().await?;
        let credential = self.usable_credential()?;
        let outcome =
            match tokio::time::timeout(step_timeout, adapter.compensate(&reference, credential))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(BackendError::Transient(format!(
                    "no response within {step_timeout:?}"
                ))),
            };
        outcome.map_err(|source| ProvisionError::Backend {
            module: module.to_string(),
            source,
        })
    }

    fn mark_step(&mut self, module: &str, status: StepStatus) {
        if let Some(step) = self.run.step_mut(module) {
            step.status = status;
            step.finished_at = Utc::now();
        }
    }
}
