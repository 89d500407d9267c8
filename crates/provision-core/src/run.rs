//! The persisted orchestration run and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::adapter::BackendReference;
use crate::audit::AuditRecord;
use crate::credential::CredentialRef;
use crate::error::{ErrorKind, ProvisionError, Result};
use crate::policy::PolicyBundle;
use crate::request::ProvisioningRequest;
use crate::types::{ModuleKind, Tags};

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Validated,
    Credentialed,
    Executing,
    Tagging,
    Audited,
    Complete,
    RollingBack,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Validated => "VALIDATED",
            RunState::Credentialed => "CREDENTIALED",
            RunState::Executing => "EXECUTING",
            RunState::Tagging => "TAGGING",
            RunState::Audited => "AUDITED",
            RunState::Complete => "COMPLETE",
            RunState::RollingBack => "ROLLING_BACK",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Pending, Validated)
            | (Validated, Credentialed)
            | (Credentialed, Executing)
            | (Executing, Executing)
            | (Executing, Tagging)
            | (Tagging, Audited)
            | (Audited, Complete)
            | (Executing, RollingBack)
            | (RollingBack, Failed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse caller-facing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Compensated,
    CompensationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub module: String,
    pub kind: ModuleKind,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_reference: Option<BackendReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    /// The step changed backend state and has not been undone.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Succeeded | StepStatus::CompensationFailed
        )
    }
}

// ---------------------------------------------------------------------------
// Transition / Failure / HeldTransition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
    /// Sequence number of the audit record written for this transition.
    pub audit_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn from_error(module: Option<&str>, err: &ProvisionError) -> Self {
        Self {
            module: module.map(str::to_string),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// An audit record that could not be written. For transition records the
/// run stays in its current state until the record is flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldTransition {
    pub record: AuditRecord,
    pub held_at: DateTime<Utc>,
}

impl HeldTransition {
    pub fn new(record: AuditRecord) -> Self {
        Self {
            record,
            held_at: Utc::now(),
        }
    }

    /// The state the run moves to once the record is written.
    pub fn target(&self) -> Option<RunState> {
        self.record.to_state
    }
}

// ---------------------------------------------------------------------------
// OrchestrationRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub run_id: String,
    pub request: ProvisioningRequest,
    pub state: RunState,
    /// Snapshot of the resolved bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyBundle>,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub applied_tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub needs_manual_remediation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held: Option<HeldTransition>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_audit_seq: Option<u64>,
    /// Compare-and-set counter, bumped by the store on every update.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
}

impl OrchestrationRun {
    pub fn new(request: ProvisioningRequest) -> Self {
        let now = Utc::now();
        Self {
            run_id: request.request_id.clone(),
            request,
            state: RunState::Pending,
            policy: None,
            steps: Vec::new(),
            credential: None,
            transitions: Vec::new(),
            applied_tags: Tags::new(),
            failure: None,
            needs_manual_remediation: false,
            held: None,
            cancel_requested: false,
            last_audit_seq: None,
            version: 0,
            created_at: now,
            updated_at: now,
            terminal_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// A held run is never reported terminal, whatever its target.
    pub fn status(&self) -> RunStatus {
        match self.state {
            RunState::Complete => RunStatus::Complete,
            RunState::Failed => RunStatus::Failed,
            _ => RunStatus::InProgress,
        }
    }

    pub fn audit_pending(&self) -> bool {
        self.held.is_some()
    }

    pub fn deadline(&self, max_run_timeout: Duration) -> DateTime<Utc> {
        let max = chrono::Duration::from_std(max_run_timeout)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.created_at + max
    }

    pub fn step(&self, module: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.module == module)
    }

    pub fn step_mut(&mut self, module: &str) -> Option<&mut StepResult> {
        self.steps.iter_mut().find(|s| s.module == module)
    }

    pub fn any_step_live(&self) -> bool {
        self.steps.iter().any(StepResult::is_live)
    }

    pub fn audit_reference(&self) -> Option<String> {
        self.last_audit_seq
            .map(|seq| format!("audit:{}:{}", self.run_id, seq))
    }

    /// Move to `to`, recording the transition under audit record `audit_seq`.
    pub fn apply_transition(&mut self, to: RunState, audit_seq: u64) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(ProvisionError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.transitions.push(Transition {
            from: self.state,
            to,
            at: now,
            audit_seq,
        });
        self.state = to;
        self.note_audit(audit_seq);
        if to.is_terminal() {
            self.terminal_at = Some(now);
        }
        Ok(())
    }

    pub fn note_audit(&mut self, seq: u64) {
        self.last_audit_seq = Some(self.last_audit_seq.map_or(seq, |s| s.max(seq)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Environment;

    fn request() -> ProvisioningRequest {
        ProvisioningRequest {
            request_id: "req-1".into(),
            environment: Environment::Sbx,
            service: "svc".into(),
            owner: "alice".into(),
            policy_bundle: "sbx_default".into(),
            dns: true,
            tags: Tags::new(),
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use RunState::*;
        let path = [
            Pending,
            Validated,
            Credentialed,
            Executing,
            Executing,
            Tagging,
            Audited,
            Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn every_non_terminal_state_can_fail() {
        use RunState::*;
        for s in [Pending, Validated, Credentialed, Executing, Tagging, Audited, RollingBack] {
            assert!(s.can_transition_to(Failed), "{s} -> FAILED");
        }
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use RunState::*;
        assert!(!Pending.can_transition_to(Executing));
        assert!(!Validated.can_transition_to(RollingBack));
        assert!(!RollingBack.can_transition_to(Executing));
        assert!(!Complete.can_transition_to(Pending));
        assert!(!Tagging.can_transition_to(Complete));
    }

    #[test]
    fn apply_transition_records_history_and_terminal_time() {
        let mut run = OrchestrationRun::new(request());
        run.apply_transition(RunState::Failed, 1).unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.transitions.len(), 1);
        assert_eq!(run.transitions[0].from, RunState::Pending);
        assert!(run.terminal_at.is_some());
        assert_eq!(run.audit_reference().as_deref(), Some("audit:req-1:1"));
    }

    #[test]
    fn apply_transition_rejects_illegal_move() {
        let mut run = OrchestrationRun::new(request());
        let err = run.apply_transition(RunState::Complete, 1).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { .. }));
        assert_eq!(run.state, RunState::Pending);
        assert!(run.transitions.is_empty());
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let json = serde_json::to_string(&RunState::RollingBack).unwrap();
        assert_eq!(json, "\"ROLLING_BACK\"");
        assert_eq!(RunStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn run_id_mirrors_request_id() {
        let run = OrchestrationRun::new(request());
        assert_eq!(run.run_id, "req-1");
        assert_eq!(run.status(), RunStatus::InProgress);
        assert!(!run.audit_pending());
    }
}
