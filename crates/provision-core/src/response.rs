//! Caller-facing views composed from persisted run state.
//!
//! Nothing here reads credentials or raw backend/broker error text: failures
//! are reported by module and classified kind only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::adapter::{BackendReference, ATTR_FQDN};
use crate::audit::AuditRecord;
use crate::error::ErrorKind;
use crate::run::{OrchestrationRun, RunState, RunStatus, StepStatus, Transition};
use crate::types::{Environment, ModuleKind, Tags};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub kind: ErrorKind,
}

/// What the caller can do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NextAction {
    PollStatus { href: String },
    FetchExplanation { href: String },
    Cancel { href: String },
    ManualRemediation { modules: Vec<String> },
    /// Resubmitting the same request id returns this run again.
    ResubmitWithNewRequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub status: RunStatus,
    pub run_id: String,
    pub state: RunState,
    pub environment: Environment,
    pub service: String,
    pub owner: String,
    /// Module id to the reference of every resource the run left in place.
    pub resources: BTreeMap<String, BackendReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_bundle_applied: Option<String>,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub applied_tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    pub needs_manual_remediation: bool,
    pub audit_pending: bool,
    pub next_actions: Vec<NextAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_reference: Option<String>,
}

impl RunResponse {
    pub fn from_run(run: &OrchestrationRun) -> Self {
        let live_steps = run.steps.iter().filter(|s| s.is_live());
        let resources: BTreeMap<String, BackendReference> = live_steps
            .clone()
            .filter_map(|s| {
                s.backend_reference
                    .clone()
                    .map(|reference| (s.module.clone(), reference))
            })
            .collect();
        let dns_name = live_steps
            .filter(|s| s.kind == ModuleKind::Registrar)
            .filter_map(|s| s.backend_reference.as_ref())
            .find_map(|r| r.attribute(ATTR_FQDN).map(str::to_string));

        Self {
            status: run.status(),
            run_id: run.run_id.clone(),
            state: run.state,
            environment: run.request.environment,
            service: run.request.service.clone(),
            owner: run.request.owner.clone(),
            resources,
            dns_name,
            policy_bundle_applied: run.policy.as_ref().map(|b| b.name.clone()),
            applied_tags: run.applied_tags.clone(),
            failure: run.failure.as_ref().map(|f| FailureSummary {
                module: f.module.clone(),
                kind: f.kind,
            }),
            needs_manual_remediation: run.needs_manual_remediation,
            audit_pending: run.audit_pending(),
            next_actions: next_actions(run),
            audit_reference: run.audit_reference(),
        }
    }
}

fn next_actions(run: &OrchestrationRun) -> Vec<NextAction> {
    let id = &run.run_id;
    let explain = NextAction::FetchExplanation {
        href: format!("/explain/{id}"),
    };
    match run.status() {
        RunStatus::InProgress => {
            let mut actions = vec![
                NextAction::PollStatus {
                    href: format!("/status/{id}"),
                },
                explain,
            ];
            if !run.cancel_requested {
                actions.push(NextAction::Cancel {
                    href: format!("/cancel/{id}"),
                });
            }
            actions
        }
        RunStatus::Complete => vec![explain],
        RunStatus::Failed => {
            let mut actions = vec![explain];
            if run.needs_manual_remediation {
                let modules = run
                    .steps
                    .iter()
                    .filter(|s| s.is_live())
                    .map(|s| s.module.clone())
                    .collect();
                actions.push(NextAction::ManualRemediation { modules });
            }
            actions.push(NextAction::ResubmitWithNewRequestId);
            actions
        }
    }
}

// ---------------------------------------------------------------------------
// StatusView
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub module: String,
    pub kind: ModuleKind,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_reference: Option<BackendReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    #[serde(flatten)]
    pub response: RunResponse,
    pub steps: Vec<StepView>,
    pub transitions: Vec<Transition>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<DateTime<Utc>>,
}

impl StatusView {
    pub fn from_run(run: &OrchestrationRun) -> Self {
        Self {
            response: RunResponse::from_run(run),
            steps: run
                .steps
                .iter()
                .map(|s| StepView {
                    module: s.module.clone(),
                    kind: s.kind,
                    status: s.status,
                    backend_reference: s.backend_reference.clone(),
                    error_kind: s.error.as_ref().map(|e| e.kind),
                    attempt_count: s.attempt_count,
                    started_at: s.started_at,
                    finished_at: s.finished_at,
                })
                .collect(),
            transitions: run.transitions.clone(),
            cancel_requested: run.cancel_requested,
            created_at: run.created_at,
            updated_at: run.updated_at,
            terminal_at: run.terminal_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Explanation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRationale {
    pub name: String,
    pub description: String,
    pub allowed_environments: BTreeSet<Environment>,
    pub allowed_modules: Vec<String>,
    pub required_tags: BTreeSet<String>,
}

/// Why a run looks the way it does: the bundle that governed it and the
/// full audit trail in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub run_id: String,
    pub summary: String,
    pub requested_bundle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleRationale>,
    pub trail: Vec<AuditRecord>,
}

impl Explanation {
    pub fn new(run: &OrchestrationRun, trail: Vec<AuditRecord>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            summary: summarize(run),
            requested_bundle: run.request.policy_bundle.clone(),
            bundle: run.policy.as_ref().map(|b| BundleRationale {
                name: b.name.clone(),
                description: b.description.clone(),
                allowed_environments: b.allowed_environments.clone(),
                allowed_modules: b.allowed_modules.clone(),
                required_tags: b.required_tags.clone(),
            }),
            trail,
        }
    }
}

fn summarize(run: &OrchestrationRun) -> String {
    let req = &run.request;
    let mut summary = format!(
        "{} requested '{}' in {} under bundle '{}'; run is {}",
        req.owner, req.service, req.environment, req.policy_bundle, run.state
    );
    if let Some(failure) = &run.failure {
        match &failure.module {
            Some(module) => summary.push_str(&format!(" ({} at {module})", failure.kind)),
            None => summary.push_str(&format!(" ({})", failure.kind)),
        }
    }
    if run.audit_pending() {
        summary.push_str("; an audit record is pending");
    }
    if run.needs_manual_remediation {
        summary.push_str("; manual remediation required");
    }
    summary
}
