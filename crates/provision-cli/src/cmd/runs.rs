use anyhow::Context;
use provision_core::audit::AuditSink;
use provision_core::response::{Explanation, StatusView};
use provision_core::store::RunDb;
use std::path::Path;

use super::load_config;
use crate::output::{enum_label, print_field, print_json, print_table};

/// Open the configured run store. The store is locked while a server has it
/// open, so these commands are for inspection of a stopped deployment.
fn open_store(config: &Path) -> anyhow::Result<RunDb> {
    let cfg = load_config(config)?;
    let path = cfg.store_path();
    if !path.exists() {
        anyhow::bail!("no run store at {}", path.display());
    }
    RunDb::open(&path).with_context(|| {
        format!(
            "failed to open run store {} (is a server using it?)",
            path.display()
        )
    })
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

pub fn status(config: &Path, run_id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let run = store.require(run_id)?;
    let view = StatusView::from_run(&run);
    if json {
        return print_json(&view);
    }

    let r = &view.response;
    print_field("Run", &r.run_id);
    print_field("State", format!("{} ({})", r.state, enum_label(&run.status())));
    print_field(
        "Service",
        format!("{} ({}) owned by {}", r.service, r.environment, r.owner),
    );
    if let Some(bundle) = &r.policy_bundle_applied {
        print_field("Bundle", bundle);
    }
    if let Some(dns) = &r.dns_name {
        print_field("DNS", dns);
    }
    if let Some(failure) = &r.failure {
        match &failure.module {
            Some(module) => print_field("Failure", format!("{} in {module}", failure.kind)),
            None => print_field("Failure", failure.kind),
        }
    }
    if r.needs_manual_remediation {
        println!("Manual remediation required.");
    }
    if r.audit_pending {
        println!("Audit write pending.");
    }

    if !view.steps.is_empty() {
        println!();
        let rows: Vec<Vec<String>> = view
            .steps
            .iter()
            .map(|s| {
                vec![
                    s.module.clone(),
                    enum_label(&s.status),
                    s.attempt_count.to_string(),
                    s.backend_reference
                        .as_ref()
                        .map(|b| b.id.clone())
                        .unwrap_or_else(|| "-".into()),
                ]
            })
            .collect();
        print_table(&["MODULE", "STATUS", "ATTEMPTS", "REFERENCE"], &rows);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// explain
// ---------------------------------------------------------------------------

pub fn explain(config: &Path, run_id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let run = store.require(run_id)?;
    let trail = store.trail(run_id)?;
    let explanation = Explanation::new(&run, trail);
    if json {
        return print_json(&explanation);
    }

    println!("{}", explanation.summary);
    if let Some(bundle) = &explanation.bundle {
        println!();
        println!("Bundle '{}': {}", bundle.name, bundle.description);
    }
    println!();
    let rows: Vec<Vec<String>> = explanation
        .trail
        .iter()
        .map(|r| {
            let transition = match (r.from_state, r.to_state) {
                (Some(from), Some(to)) => format!("{from} -> {to}"),
                _ => "-".into(),
            };
            vec![
                r.seq.to_string(),
                r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                r.event.to_string(),
                transition,
                r.module.clone().unwrap_or_else(|| "-".into()),
            ]
        })
        .collect();
    print_table(&["SEQ", "TIME", "EVENT", "TRANSITION", "MODULE"], &rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

pub fn list(config: &Path, active: bool, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let runs = if active {
        store.list_active()?
    } else {
        store.list()?
    };

    if json {
        let list: Vec<serde_json::Value> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.run_id,
                    "state": r.state,
                    "status": r.status(),
                    "service": r.request.service,
                    "environment": r.request.environment,
                    "policy_bundle": r.request.policy_bundle,
                    "needs_manual_remediation": r.needs_manual_remediation,
                    "updated_at": r.updated_at,
                })
            })
            .collect();
        return print_json(&list);
    }

    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = runs
        .iter()
        .map(|r| {
            vec![
                r.run_id.clone(),
                r.state.to_string(),
                r.request.service.clone(),
                r.request.environment.to_string(),
                r.request.policy_bundle.clone(),
                r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(
        &["RUN_ID", "STATE", "SERVICE", "ENV", "BUNDLE", "UPDATED"],
        &rows,
    );
    Ok(())
}
