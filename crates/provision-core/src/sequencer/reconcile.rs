use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{commit_record, Orchestrator};
use crate::audit::{AuditEvent, AuditRecord};
use crate::error::{ErrorKind, Result};
use crate::run::{Failure, HeldTransition, OrchestrationRun, RunState};

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Held audit records written.
    pub flushed: u32,
    /// Runs without a driver moved to FAILED.
    pub failed: u32,
    /// Runs whose held record still could not be written.
    pub still_held: u32,
    /// Runs that could not be settled this pass.
    pub errors: u32,
}

enum Settled {
    Skipped,
    Recovered {
        had_held: bool,
        after: OrchestrationRun,
    },
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.flushed == 0 && self.failed == 0 && self.still_held == 0 && self.errors == 0
    }
}

/// Background sweep over runs that no driver in this process owns.
///
/// Run once at startup it doubles as crash recovery: every non-terminal run
/// left behind by a previous process is failed, with
/// `needs_manual_remediation` set when any of its steps had taken effect.
#[derive(Clone)]
pub struct Reconciler {
    orchestrator: Orchestrator,
}

impl Reconciler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for candidate in self.orchestrator.store().list_active()? {
            let run_id = candidate.run_id;
            let Ok((_guard, cancel)) = self.orchestrator.claim(&run_id) else {
                continue;
            };
            match self.settle(&run_id, &cancel).await {
                Ok(Settled::Skipped) => {}
                Ok(Settled::Recovered { had_held, after }) => {
                    if had_held && after.held.is_none() {
                        report.flushed += 1;
                    }
                    if after.held.is_some() {
                        report.still_held += 1;
                    } else if after.state == RunState::Failed {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "could not reconcile run");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn settle(&self, run_id: &str, cancel: &AtomicBool) -> Result<Settled> {
        // Re-read under the claim: a driver may have finished since the listing.
        let Some(run) = self.orchestrator.store().get(run_id)? else {
            return Ok(Settled::Skipped);
        };
        if run.is_terminal() {
            return Ok(Settled::Skipped);
        }
        let had_held = run.held.is_some();
        let after = self.orchestrator.recover(run, cancel).await?;
        Ok(Settled::Recovered { had_held, after })
    }

    /// Reconcile every `interval`, forever. The first pass runs immediately.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.reconcile_once().await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => info!(
                    flushed = report.flushed,
                    failed = report.failed,
                    still_held = report.still_held,
                    errors = report.errors,
                    "reconcile pass"
                ),
                Err(e) => warn!(error = %e, "reconcile pass failed"),
            }
        }
    }
}

impl Orchestrator {
    /// Settle a claimed run that has no driver: flush its held record, then
    /// fail it if it is still not terminal.
    pub(crate) async fn recover(
        &self,
        mut run: OrchestrationRun,
        cancel: &AtomicBool,
    ) -> Result<OrchestrationRun> {
        let store = self.store();

        if let Some(held) = run.held.clone() {
            match self.inner.audit.append(&held.record).await {
                Ok(seq) => {
                    commit_record(store, &mut run, &held.record, seq)?;
                    info!(run_id = %run.run_id, event = %held.record.event, seq, "held audit record flushed");
                }
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "held audit record still unwritten");
                    return Ok(run);
                }
            }
        }
        if run.is_terminal() {
            return Ok(run);
        }

        if cancel.load(Ordering::SeqCst) {
            run.cancel_requested = true;
        }
        let kind = if run.cancel_requested {
            ErrorKind::Cancelled
        } else {
            ErrorKind::Abandoned
        };
        if run.failure.is_none() {
            run.failure = Some(Failure {
                module: None,
                kind,
                message: "run has no live driver".into(),
            });
        }
        if run.any_step_live() {
            run.needs_manual_remediation = true;
        }
        warn!(
            run_id = %run.run_id,
            state = %run.state,
            kind = %kind,
            needs_manual_remediation = run.needs_manual_remediation,
            "failing run without a driver"
        );

        let record = AuditRecord::transition(&run, AuditEvent::Failed, RunState::Failed)
            .with_detail(json!({
                "kind": kind,
                "reason": "run has no live driver",
                "needs_manual_remediation": run.needs_manual_remediation,
            }));
        match self.inner.audit.append(&record).await {
            Ok(seq) => commit_record(store, &mut run, &record, seq)?,
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "audit write failed; holding run");
                run.held = Some(HeldTransition::new(record));
                store.update(&mut run)?;
            }
        }
        Ok(run)
    }
}
