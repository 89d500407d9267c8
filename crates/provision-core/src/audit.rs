//! Append-only audit trail.
//!
//! Records are written through an `AuditSink` (the run store in production)
//! by the `AuditLogger`, which retries sink errors with bounded backoff.
//! Sequence numbers are assigned by the sink and are monotonic per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::{ProvisionError, Result};
use crate::retry::RetryPolicy;
use crate::run::{OrchestrationRun, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Validated,
    PolicyNotFound,
    PolicyDenied,
    CredentialIssued,
    CredentialDenied,
    CredentialUnavailable,
    CredentialRefreshed,
    ExecutionStarted,
    StepCompleted,
    StepSkipped,
    StepFailed,
    CancelRequested,
    RollbackStarted,
    Compensated,
    CompensationFailed,
    CompensationUnavailable,
    Tagged,
    Audited,
    Completed,
    Failed,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEvent::Validated => "validated",
            AuditEvent::PolicyNotFound => "policy_not_found",
            AuditEvent::PolicyDenied => "policy_denied",
            AuditEvent::CredentialIssued => "credential_issued",
            AuditEvent::CredentialDenied => "credential_denied",
            AuditEvent::CredentialUnavailable => "credential_unavailable",
            AuditEvent::CredentialRefreshed => "credential_refreshed",
            AuditEvent::ExecutionStarted => "execution_started",
            AuditEvent::StepCompleted => "step_completed",
            AuditEvent::StepSkipped => "step_skipped",
            AuditEvent::StepFailed => "step_failed",
            AuditEvent::CancelRequested => "cancel_requested",
            AuditEvent::RollbackStarted => "rollback_started",
            AuditEvent::Compensated => "compensated",
            AuditEvent::CompensationFailed => "compensation_failed",
            AuditEvent::CompensationUnavailable => "compensation_unavailable",
            AuditEvent::Tagged => "tagged",
            AuditEvent::Audited => "audited",
            AuditEvent::Completed => "completed",
            AuditEvent::Failed => "failed",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry in a run's trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: String,
    /// Assigned by the sink on append; 0 until then.
    #[serde(default)]
    pub seq: u64,
    pub owner: String,
    pub policy_bundle: String,
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<RunState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<RunState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditRecord {
    /// A record for something that happened to `run` without a state change.
    pub fn event(run: &OrchestrationRun, event: AuditEvent) -> Self {
        Self {
            run_id: run.run_id.clone(),
            seq: 0,
            owner: run.request.owner.clone(),
            policy_bundle: run.request.policy_bundle.clone(),
            event,
            from_state: None,
            to_state: None,
            module: None,
            timestamp: Utc::now(),
            detail: serde_json::Value::Null,
        }
    }

    /// A record for the transition of `run` from its current state to `to`.
    pub fn transition(run: &OrchestrationRun, event: AuditEvent, to: RunState) -> Self {
        Self {
            from_state: Some(run.state),
            to_state: Some(to),
            ..Self::event(run, event)
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn is_transition(&self) -> bool {
        self.to_state.is_some()
    }

    pub fn reference(&self) -> String {
        format!("audit:{}:{}", self.run_id, self.seq)
    }
}

// ---------------------------------------------------------------------------
// AuditSink
// ---------------------------------------------------------------------------

/// Durable destination for audit records.
pub trait AuditSink: Send + Sync {
    /// Durably append `record`, returning its assigned sequence number.
    fn append(&self, record: &AuditRecord) -> Result<u64>;

    /// All records for `run_id`, ordered by sequence.
    fn trail(&self, run_id: &str) -> Result<Vec<AuditRecord>>;
}

// ---------------------------------------------------------------------------
// AuditLogger
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    retry: RetryPolicy,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    /// Append with bounded retry. `AuditWriteFailure` once attempts run out.
    pub async fn append(&self, record: &AuditRecord) -> Result<u64> {
        let attempts = self.retry.attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.sink.append(record) {
                Ok(seq) => return Ok(seq),
                Err(e) => {
                    warn!(
                        run_id = %record.run_id,
                        event = %record.event,
                        attempt,
                        attempts,
                        error = %e,
                        "audit append failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
            }
        }
        error!(run_id = %record.run_id, event = %record.event, "audit append exhausted retries");
        Err(ProvisionError::AuditWriteFailure(last_error))
    }

    pub fn trail(&self, run_id: &str) -> Result<Vec<AuditRecord>> {
        self.sink.trail(run_id)
    }
}
