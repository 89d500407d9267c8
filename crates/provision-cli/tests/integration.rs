#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use provision_core::request::ProvisionPayload;
use provision_core::run::OrchestrationRun;
use provision_core::store::RunDb;
use tempfile::TempDir;

const CONFIG: &str = r#"
store:
  path: runs.redb
policies:
  bundles:
    sbx_default:
      description: Sandbox self-service
      allowed_environments: [SBX]
      allowed_modules: [blueprint, registrar]
      credential_scope: provision-sbx
backends:
  blueprint: { kind: blueprint, url: "http://127.0.0.1:9/blueprint" }
  registrar: { kind: registrar, url: "http://127.0.0.1:9/registrar" }
"#;

fn provision(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("provision").unwrap();
    cmd.current_dir(dir.path())
        .env("PROVISION_CONFIG", dir.path().join("provision.yaml"));
    cmd
}

fn write_config(dir: &TempDir, yaml: &str) {
    std::fs::write(dir.path().join("provision.yaml"), yaml).unwrap();
}

/// Put a pending run into the store the config points at.
fn seed_run(dir: &TempDir, id: &str) {
    let store = RunDb::open(&dir.path().join("runs.redb")).unwrap();
    let request = ProvisionPayload {
        request_id: Some(id.into()),
        environment: "SBX".into(),
        service: "api".into(),
        owner: "alice".into(),
        policy_bundle: "sbx_default".into(),
        dns: true,
        tags: Default::default(),
    }
    .validate()
    .unwrap();
    store
        .create_if_absent(&OrchestrationRun::new(request))
        .unwrap();
}

// ---------------------------------------------------------------------------
// provision check
// ---------------------------------------------------------------------------

#[test]
fn check_accepts_a_complete_config() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    provision(&dir)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 bundle(s), 2 backend module(s)"))
        .stdout(predicate::str::contains("[warning] local broker"));
}

#[test]
fn check_rejects_bundle_with_unknown_module() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, &CONFIG.replace("[blueprint, registrar]", "[blueprint, iac]"));
    provision(&dir)
        .arg("check")
        .assert()
        .failure()
        .stdout(predicate::str::contains("unknown module 'iac'"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn check_rejects_vault_without_address() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, &format!("{CONFIG}broker:\n  kind: vault\n"));
    provision(&dir).arg("check").assert().failure();
}

#[test]
fn check_json_lists_bundles_and_modules() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    let output = provision(&dir).args(["check", "--json"]).output().unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["bundles"][0], "sbx_default");
    assert_eq!(value["modules"].as_array().unwrap().len(), 2);
}

#[test]
fn missing_config_is_an_error() {
    let dir = TempDir::new().unwrap();
    provision(&dir)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

// ---------------------------------------------------------------------------
// provision runs / status / explain
// ---------------------------------------------------------------------------

#[test]
fn runs_without_store_is_an_error() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    provision(&dir)
        .arg("runs")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no run store"));
}

#[test]
fn runs_lists_stored_runs() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    seed_run(&dir, "req-1");
    provision(&dir)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("req-1"))
        .stdout(predicate::str::contains("PENDING"));
}

#[test]
fn runs_active_json_includes_pending_runs() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    seed_run(&dir, "req-2");
    let output = provision(&dir)
        .args(["runs", "--active", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value[0]["run_id"], "req-2");
    assert_eq!(value[0]["status"], "in_progress");
}

#[test]
fn status_json_shows_run() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    seed_run(&dir, "req-3");
    let output = provision(&dir)
        .args(["status", "req-3", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["run_id"], "req-3");
    assert_eq!(value["state"], "PENDING");
    assert_eq!(value["service"], "api");
}

#[test]
fn status_of_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    seed_run(&dir, "req-4");
    provision(&dir)
        .args(["status", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn explain_prints_summary() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, CONFIG);
    seed_run(&dir, "req-5");
    provision(&dir)
        .args(["explain", "req-5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice requested 'api' in SBX"));
}
