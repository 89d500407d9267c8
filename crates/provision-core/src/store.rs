//! Persistent storage for runs and audit records using redb.
//!
//! # Table design
//!
//! `RUNS` maps `run_id` to the JSON-encoded `OrchestrationRun`. Updates are
//! compare-and-set on `OrchestrationRun::version` inside a single write
//! transaction, so readers only ever see whole runs.
//!
//! `AUDIT` uses a composite key:
//! ```text
//! [ run_id bytes | 0x00 | seq: u64 big-endian (8 bytes) ]
//! ```
//! Run ids never contain `0x00`, so a range scan over
//! `[run_id, 0x00] .. [run_id, 0x01]` returns exactly one run's trail in
//! sequence order. Records are only ever inserted, never overwritten.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::warn;

use crate::audit::{AuditRecord, AuditSink};
use crate::error::{ProvisionError, Result};
use crate::run::OrchestrationRun;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: run_id. Value: JSON-encoded OrchestrationRun.
const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Key: run_id ++ 0x00 ++ seq_be. Value: JSON-encoded AuditRecord.
const AUDIT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("audit");

fn db_err(e: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn audit_key(run_id: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(run_id.len() + 9);
    key.extend_from_slice(run_id.as_bytes());
    key.push(0x00);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Half-open range covering every audit key of `run_id`.
fn audit_range(run_id: &str) -> (Vec<u8>, Vec<u8>) {
    let mut lower = Vec::with_capacity(run_id.len() + 1);
    lower.extend_from_slice(run_id.as_bytes());
    lower.push(0x00);
    let mut upper = lower.clone();
    if let Some(last) = upper.last_mut() {
        *last = 0x01;
    }
    (lower, upper)
}

fn seq_from_key(key: &[u8]) -> Option<u64> {
    let tail = key.len().checked_sub(8)?;
    let bytes: [u8; 8] = key[tail..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

// ---------------------------------------------------------------------------
// RunDb
// ---------------------------------------------------------------------------

/// Persistent store for runs and their audit trail.
pub struct RunDb {
    db: Database,
}

impl RunDb {
    /// Open or create the redb database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        // Ensure both tables exist before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(RUNS).map_err(db_err)?;
        wt.open_table(AUDIT).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert `run` unless a run with the same id exists.
    ///
    /// Returns the stored run and whether this call created it. The check and
    /// the insert happen in one write transaction.
    pub fn create_if_absent(&self, run: &OrchestrationRun) -> Result<(OrchestrationRun, bool)> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let outcome = {
            let mut table = wt.open_table(RUNS).map_err(db_err)?;
            let existing = match table.get(run.run_id.as_str()).map_err(db_err)? {
                Some(v) => Some(serde_json::from_slice::<OrchestrationRun>(v.value())?),
                None => None,
            };
            match existing {
                Some(existing) => (existing, false),
                None => {
                    let value = serde_json::to_vec(run)?;
                    table
                        .insert(run.run_id.as_str(), value.as_slice())
                        .map_err(db_err)?;
                    (run.clone(), true)
                }
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(outcome)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<OrchestrationRun>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RUNS).map_err(db_err)?;
        match table.get(run_id).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, run_id: &str) -> Result<OrchestrationRun> {
        self.get(run_id)?
            .ok_or_else(|| ProvisionError::RunNotFound(run_id.to_string()))
    }

    /// Compare-and-set update.
    ///
    /// Succeeds only if the stored version equals `run.version`; on success
    /// the version is bumped on both the stored and the caller's copy.
    pub fn update(&self, run: &mut OrchestrationRun) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(RUNS).map_err(db_err)?;
            let stored_version = match table.get(run.run_id.as_str()).map_err(db_err)? {
                Some(v) => serde_json::from_slice::<OrchestrationRun>(v.value())?.version,
                None => return Err(ProvisionError::RunNotFound(run.run_id.clone())),
            };
            if stored_version != run.version {
                warn!(
                    run_id = %run.run_id,
                    expected = run.version,
                    found = stored_version,
                    "run version conflict"
                );
                return Err(ProvisionError::RunConflict(format!(
                    "run {} was modified concurrently (expected version {}, found {})",
                    run.run_id, run.version, stored_version
                )));
            }
            let mut next = run.clone();
            next.version += 1;
            next.updated_at = Utc::now();
            let value = serde_json::to_vec(&next)?;
            table
                .insert(run.run_id.as_str(), value.as_slice())
                .map_err(db_err)?;
            *run = next;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// List all runs, sorted by `created_at` descending (newest first).
    pub fn list(&self) -> Result<Vec<OrchestrationRun>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RUNS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let run: OrchestrationRun = serde_json::from_slice(v.value())?;
            result.push(run);
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    /// Runs not yet COMPLETE or FAILED, oldest first.
    pub fn list_active(&self) -> Result<Vec<OrchestrationRun>> {
        let mut runs: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect();
        runs.reverse();
        Ok(runs)
    }
}

impl AuditSink for RunDb {
    fn append(&self, record: &AuditRecord) -> Result<u64> {
        let (lower, upper) = audit_range(&record.run_id);
        let wt = self.db.begin_write().map_err(db_err)?;
        let seq = {
            let mut table = wt.open_table(AUDIT).map_err(db_err)?;
            let last = match table
                .range(lower.as_slice()..upper.as_slice())
                .map_err(db_err)?
                .next_back()
            {
                Some(entry) => {
                    let (k, _) = entry.map_err(db_err)?;
                    seq_from_key(k.value()).unwrap_or(0)
                }
                None => 0,
            };
            let seq = last + 1;
            let mut stored = record.clone();
            stored.seq = seq;
            let value = serde_json::to_vec(&stored)?;
            let key = audit_key(&record.run_id, seq);
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
            seq
        };
        wt.commit().map_err(db_err)?;
        Ok(seq)
    }

    fn trail(&self, run_id: &str) -> Result<Vec<AuditRecord>> {
        let (lower, upper) = audit_range(run_id);
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(AUDIT).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table
            .range(lower.as_slice()..upper.as_slice())
            .map_err(db_err)?
        {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::request::ProvisioningRequest;
    use crate::run::RunState;
    use crate::types::{Environment, Tags};
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RunDb) {
        let dir = TempDir::new().unwrap();
        let db = RunDb::open(&dir.path().join("test.redb")).unwrap();
        (dir, db)
    }

    fn run(id: &str) -> OrchestrationRun {
        OrchestrationRun::new(ProvisioningRequest {
            request_id: id.into(),
            environment: Environment::Sbx,
            service: "svc".into(),
            owner: "alice".into(),
            policy_bundle: "sbx_default".into(),
            dns: true,
            tags: Tags::new(),
        })
    }

    #[test]
    fn create_if_absent_is_idempotent() {
        let (_dir, db) = open_tmp();
        let first = run("req-1");
        let (stored, created) = db.create_if_absent(&first).unwrap();
        assert!(created);
        assert_eq!(stored.run_id, "req-1");

        let mut second = run("req-1");
        second.request.owner = "mallory".into();
        let (stored, created) = db.create_if_absent(&second).unwrap();
        assert!(!created);
        assert_eq!(stored.request.owner, "alice");
    }

    #[test]
    fn update_bumps_version() {
        let (_dir, db) = open_tmp();
        let (mut r, _) = db.create_if_absent(&run("req-1")).unwrap();
        r.state = RunState::Validated;
        db.update(&mut r).unwrap();
        assert_eq!(r.version, 1);
        let stored = db.require("req-1").unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.state, RunState::Validated);
    }

    #[test]
    fn stale_update_is_a_conflict() {
        let (_dir, db) = open_tmp();
        let (mut a, _) = db.create_if_absent(&run("req-1")).unwrap();
        let mut b = a.clone();
        db.update(&mut a).unwrap();
        let err = db.update(&mut b).unwrap_err();
        assert!(matches!(err, ProvisionError::RunConflict(_)));
    }

    #[test]
    fn update_of_unknown_run_is_not_found() {
        let (_dir, db) = open_tmp();
        let mut r = run("ghost");
        assert!(matches!(
            db.update(&mut r),
            Err(ProvisionError::RunNotFound(_))
        ));
        assert!(db.get("ghost").unwrap().is_none());
    }

    #[test]
    fn list_is_newest_first_and_active_filters_terminal() {
        let (_dir, db) = open_tmp();
        let mut old = run("old");
        old.created_at = Utc::now() - CDur::minutes(5);
        db.create_if_absent(&old).unwrap();
        let (mut done, _) = db.create_if_absent(&run("done")).unwrap();
        done.state = RunState::Failed;
        db.update(&mut done).unwrap();

        let all = db.list().unwrap();
        assert_eq!(all[0].run_id, "done");
        assert_eq!(all[1].run_id, "old");

        let active = db.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, "old");
    }

    #[test]
    fn audit_sequences_are_per_run_and_ordered() {
        let (_dir, db) = open_tmp();
        let a = run("a");
        let ab = run("ab");
        for event in [AuditEvent::Validated, AuditEvent::CredentialIssued, AuditEvent::Completed] {
            db.append(&AuditRecord::event(&a, event)).unwrap();
        }
        let seq = db.append(&AuditRecord::event(&ab, AuditEvent::Failed)).unwrap();
        assert_eq!(seq, 1);

        let trail = db.trail("a").unwrap();
        let seqs: Vec<u64> = trail.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(trail[2].event, AuditEvent::Completed);
        // "ab" shares a prefix with "a" but not the separator
        assert_eq!(db.trail("ab").unwrap().len(), 1);
    }

    #[test]
    fn trail_of_unknown_run_is_empty() {
        let (_dir, db) = open_tmp();
        assert!(db.trail("nobody").unwrap().is_empty());
    }

    #[test]
    fn sequences_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.redb");
        let r = run("req-1");
        {
            let db = RunDb::open(&path).unwrap();
            db.append(&AuditRecord::event(&r, AuditEvent::Validated)).unwrap();
        }
        let db = RunDb::open(&path).unwrap();
        let seq = db.append(&AuditRecord::event(&r, AuditEvent::Failed)).unwrap();
        assert_eq!(seq, 2);
    }

    #[test]
    fn audit_key_layout() {
        let key = audit_key("r", 258);
        assert_eq!(key, vec![b'r', 0, 0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(seq_from_key(&key), Some(258));
    }
}
