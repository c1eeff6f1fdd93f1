use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::models::*;
use crate::util::ts;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. Holding the mutex for the whole closure is
/// what makes read-check-write sequences atomic.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PipelineDb {
    pub(super) conn: Connection,
}

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    project_id TEXT,
                    subject TEXT NOT NULL,
                    geography TEXT,
                    time_horizon TEXT,
                    objective TEXT,
                    user_datasets TEXT NOT NULL DEFAULT '[]',
                    depth TEXT NOT NULL DEFAULT 'total',
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_phase INTEGER NOT NULL DEFAULT 0,
                    phase_results TEXT NOT NULL DEFAULT '{}',
                    adjustments TEXT,
                    gate_status TEXT,
                    quality_gate TEXT,
                    confidence_cap REAL,
                    build_verdict TEXT,
                    model_verdict TEXT,
                    sources_found INTEGER NOT NULL DEFAULT 0,
                    data_points INTEGER NOT NULL DEFAULT 0,
                    variables_found INTEGER NOT NULL DEFAULT 0,
                    coverage_pct REAL NOT NULL DEFAULT 0,
                    error_log TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    job_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    dedupe_key TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    run_after TEXT NOT NULL,
                    locked_by TEXT,
                    locked_at TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_eligible ON jobs(status, run_after, id);
                CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(run_id, job_type, dedupe_key);

                CREATE TABLE IF NOT EXISTS unit_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    batch_index INTEGER NOT NULL,
                    subdomain TEXT NOT NULL,
                    level TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    sources_found INTEGER NOT NULL DEFAULT 0,
                    chunks_generated INTEGER NOT NULL DEFAULT 0,
                    error_log TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    UNIQUE(run_id, batch_index)
                );

                CREATE TABLE IF NOT EXISTS sources (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    batch_index INTEGER,
                    subdomain TEXT,
                    name TEXT NOT NULL,
                    url TEXT,
                    source_type TEXT NOT NULL DEFAULT 'unknown',
                    reliability REAL NOT NULL DEFAULT 5,
                    update_frequency TEXT,
                    tier TEXT,
                    origin TEXT NOT NULL DEFAULT 'research',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sources_run ON sources(run_id, batch_index);

                CREATE TABLE IF NOT EXISTS chunks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    batch_index INTEGER NOT NULL,
                    subdomain TEXT NOT NULL,
                    content TEXT NOT NULL,
                    topic TEXT,
                    confidence REAL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_chunks_run ON chunks(run_id, batch_index);

                CREATE TABLE IF NOT EXISTS variables (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    batch_index INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    variable_type TEXT NOT NULL DEFAULT 'unknown',
                    description TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS contradictions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    batch_index INTEGER,
                    claim_a TEXT NOT NULL,
                    claim_b TEXT NOT NULL,
                    severity TEXT NOT NULL DEFAULT 'medium',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS signals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    layer_id INTEGER NOT NULL,
                    layer_name TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    confidence REAL NOT NULL,
                    impact TEXT NOT NULL DEFAULT 'medium',
                    trend TEXT NOT NULL DEFAULT 'stable',
                    devil_advocate TEXT,
                    data_source TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step TEXT NOT NULL,
                    unit_index INTEGER NOT NULL,
                    subdomain TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '{}',
                    is_error INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    UNIQUE(run_id, step, unit_index)
                );

                CREATE TABLE IF NOT EXISTS quality_checks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    check_type TEXT NOT NULL,
                    verdict TEXT NOT NULL,
                    score REAL NOT NULL DEFAULT 0,
                    details TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    subdomain TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    word_count INTEGER NOT NULL DEFAULT 0,
                    extraction_quality TEXT,
                    content_hash TEXT,
                    chunks_total INTEGER NOT NULL DEFAULT 0,
                    chunks_kept INTEGER NOT NULL DEFAULT 0,
                    chunks_stored INTEGER NOT NULL DEFAULT 0,
                    error_log TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_documents_run ON documents(run_id, content_hash);

                CREATE TABLE IF NOT EXISTS query_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    question TEXT NOT NULL,
                    answer TEXT NOT NULL,
                    sources_used TEXT NOT NULL DEFAULT '[]',
                    confidence REAL NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );
                ",
            )
            .context("Failed to create tables")?;

        // Additive columns for databases created by earlier releases. Only
        // "duplicate column" errors are ignored.
        for ddl in [
            "ALTER TABLE runs ADD COLUMN dashboard TEXT",
            "ALTER TABLE jobs ADD COLUMN finished_at TEXT",
            "ALTER TABLE runs ADD COLUMN depth TEXT NOT NULL DEFAULT 'total'",
            "ALTER TABLE chunks ADD COLUMN content_hash TEXT",
            "ALTER TABLE chunks ADD COLUMN document_id INTEGER",
        ] {
            match self.conn.execute(ddl, []) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column") => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to apply migration: {}", ddl));
                }
            }
        }

        // Needs the columns above. Research chunks carry no hash and are
        // never deduplicated here.
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_hash
                 ON chunks(run_id, content_hash) WHERE content_hash IS NOT NULL;",
            )
            .context("Failed to create chunk hash index")?;

        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(&self, new: &NewRun, now: DateTime<Utc>) -> Result<Run> {
        let datasets =
            serde_json::to_string(&new.user_datasets).context("Failed to encode user datasets")?;
        let stamp = ts(now);
        self.conn
            .execute(
                "INSERT INTO runs (user_id, project_id, subject, geography, time_horizon, objective, user_datasets, depth, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    new.user_id,
                    new.project_id,
                    new.subject,
                    new.geography,
                    new.time_horizon,
                    new.objective,
                    datasets,
                    new.depth.as_str(),
                    stamp
                ],
            )
            .context("Failed to insert run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Most recent runs first, optionally for one user.
    pub fn list_runs(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM runs WHERE (?1 IS NULL OR user_id = ?1) ORDER BY id DESC LIMIT ?2",
                RUN_COLUMNS
            ))
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Ids of every run currently in `status`, oldest first.
    pub fn run_ids_with_status(&self, status: RunStatus) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM runs WHERE status = ?1 ORDER BY id")
            .context("Failed to prepare run_ids_with_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, i64>(0))
            .context("Failed to query runs by status")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read run ids")
    }

    /// Merge a partial update into a run.
    ///
    /// `phase_result` replaces only its own key inside `phase_results`;
    /// `current_phase` only ever moves forward. Returns `None` when the run
    /// does not exist. Status transition rules are checked by the caller.
    pub fn update_run(&self, id: i64, update: &RunUpdate, now: DateTime<Utc>) -> Result<Option<Run>> {
        let stamp = ts(now);
        // Use unchecked_transaction so all field updates land together.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin run update")?;

        let touched = tx
            .execute(
                "UPDATE runs SET updated_at = ?1 WHERE id = ?2",
                params![stamp, id],
            )
            .context("Failed to touch run")?;
        if touched == 0 {
            return Ok(None);
        }

        if let Some(status) = update.status {
            tx.execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update run status")?;
            if status == RunStatus::Completed {
                tx.execute(
                    "UPDATE runs SET completed_at = ?1 WHERE id = ?2",
                    params![stamp, id],
                )
                .context("Failed to set completed_at")?;
            }
        }
        if let Some(phase) = update.current_phase {
            tx.execute(
                "UPDATE runs SET current_phase = MAX(current_phase, ?1) WHERE id = ?2",
                params![phase, id],
            )
            .context("Failed to update current phase")?;
        }
        if let Some((phase, result)) = &update.phase_result {
            let encoded =
                serde_json::to_string(result).context("Failed to encode phase result")?;
            tx.execute(
                "UPDATE runs SET phase_results = json_set(phase_results, ?1, json(?2)) WHERE id = ?3",
                params![format!("$.{}", phase.key()), encoded, id],
            )
            .context("Failed to merge phase result")?;
        }
        if let Some(adjustments) = &update.adjustments {
            let encoded =
                serde_json::to_string(adjustments).context("Failed to encode adjustments")?;
            tx.execute(
                "UPDATE runs SET adjustments = ?1 WHERE id = ?2",
                params![encoded, id],
            )
            .context("Failed to update adjustments")?;
        }
        if let Some(gate) = update.gate_status {
            tx.execute(
                "UPDATE runs SET gate_status = ?1 WHERE id = ?2",
                params![gate.as_str(), id],
            )
            .context("Failed to update gate status")?;
        }
        if let Some(record) = &update.quality_gate {
            tx.execute(
                "UPDATE runs SET quality_gate = ?1 WHERE id = ?2",
                params![record.to_string(), id],
            )
            .context("Failed to update quality gate")?;
        }
        if let Some(cap) = update.confidence_cap {
            tx.execute(
                "UPDATE runs SET confidence_cap = ?1 WHERE id = ?2",
                params![cap, id],
            )
            .context("Failed to update confidence cap")?;
        }
        if let Some(verdict) = update.build_verdict {
            tx.execute(
                "UPDATE runs SET build_verdict = ?1 WHERE id = ?2",
                params![verdict.as_str(), id],
            )
            .context("Failed to update build verdict")?;
        }
        if let Some(verdict) = &update.model_verdict {
            tx.execute(
                "UPDATE runs SET model_verdict = ?1 WHERE id = ?2",
                params![verdict, id],
            )
            .context("Failed to update model verdict")?;
        }
        if let Some(dashboard) = &update.dashboard {
            tx.execute(
                "UPDATE runs SET dashboard = ?1 WHERE id = ?2",
                params![dashboard.to_string(), id],
            )
            .context("Failed to update dashboard")?;
        }
        if let Some(counters) = update.counters {
            tx.execute(
                "UPDATE runs SET sources_found = ?1, data_points = ?2, variables_found = ?3, coverage_pct = ?4 WHERE id = ?5",
                params![
                    counters.sources_found,
                    counters.data_points,
                    counters.variables_found,
                    counters.coverage_pct,
                    id
                ],
            )
            .context("Failed to update run counters")?;
        }
        if let Some(error) = &update.error_log {
            tx.execute(
                "UPDATE runs SET error_log = ?1 WHERE id = ?2",
                params![error, id],
            )
            .context("Failed to update error log")?;
        }

        tx.commit().context("Failed to commit run update")?;
        self.get_run(id)
    }

    /// Full `phase_results` map, empty when the run has no completed phase.
    pub fn get_phase_results(&self, id: i64) -> Result<Option<serde_json::Map<String, Value>>> {
        Ok(self.get_run(id)?.map(|run| run.phase_results))
    }

    /// Everything an operator needs to explain a run's state.
    pub fn run_view(&self, id: i64) -> Result<Option<RunView>> {
        let Some(run) = self.get_run(id)? else {
            return Ok(None);
        };
        Ok(Some(RunView {
            status_label: run.status_label(),
            units: self.list_units(id)?,
            job_counts: self.job_counts(id)?,
            artifacts: self.count_artifacts(id)?,
            contradictions: self.count_contradictions(id)?,
            latest_quality_check: self.latest_quality_check(id, None)?,
            run,
        }))
    }
}

const RUN_COLUMNS: &str = "id, user_id, project_id, subject, geography, time_horizon, objective, user_datasets, depth, status, current_phase, phase_results, adjustments, gate_status, quality_gate, confidence_cap, build_verdict, model_verdict, dashboard, sources_found, data_points, variables_found, coverage_pct, error_log, created_at, updated_at, completed_at";

/// Intermediate row struct for runs.
struct RunRow {
    id: i64,
    user_id: String,
    project_id: Option<String>,
    subject: String,
    geography: Option<String>,
    time_horizon: Option<String>,
    objective: Option<String>,
    user_datasets: String,
    depth: String,
    status: String,
    current_phase: i32,
    phase_results: String,
    adjustments: Option<String>,
    gate_status: Option<String>,
    quality_gate: Option<String>,
    confidence_cap: Option<f64>,
    build_verdict: Option<String>,
    model_verdict: Option<String>,
    dashboard: Option<String>,
    sources_found: i64,
    data_points: i64,
    variables_found: i64,
    coverage_pct: f64,
    error_log: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            project_id: row.get(2)?,
            subject: row.get(3)?,
            geography: row.get(4)?,
            time_horizon: row.get(5)?,
            objective: row.get(6)?,
            user_datasets: row.get(7)?,
            depth: row.get(8)?,
            status: row.get(9)?,
            current_phase: row.get(10)?,
            phase_results: row.get(11)?,
            adjustments: row.get(12)?,
            gate_status: row.get(13)?,
            quality_gate: row.get(14)?,
            confidence_cap: row.get(15)?,
            build_verdict: row.get(16)?,
            model_verdict: row.get(17)?,
            dashboard: row.get(18)?,
            sources_found: row.get(19)?,
            data_points: row.get(20)?,
            variables_found: row.get(21)?,
            coverage_pct: row.get(22)?,
            error_log: row.get(23)?,
            created_at: row.get(24)?,
            updated_at: row.get(25)?,
            completed_at: row.get(26)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        let depth = Depth::from_str(&self.depth)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run depth")?;
        let gate_status = self
            .gate_status
            .as_deref()
            .map(GateStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse gate status")?;
        let build_verdict = self
            .build_verdict
            .as_deref()
            .map(BuildVerdict::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse build verdict")?;
        let user_datasets: Vec<String> = serde_json::from_str(&self.user_datasets)
            .context("Failed to parse user datasets JSON")?;
        let phase_results: serde_json::Map<String, Value> =
            serde_json::from_str(&self.phase_results)
                .context("Failed to parse phase results JSON")?;
        let adjustments: Option<Adjustments> = self
            .adjustments
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse adjustments JSON")?;
        let quality_gate: Option<Value> = self
            .quality_gate
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse quality gate JSON")?;
        let dashboard: Option<Value> = self
            .dashboard
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse dashboard JSON")?;

        Ok(Run {
            id: self.id,
            user_id: self.user_id,
            project_id: self.project_id,
            subject: self.subject,
            geography: self.geography,
            time_horizon: self.time_horizon,
            objective: self.objective,
            user_datasets,
            depth,
            status,
            current_phase: self.current_phase,
            phase_results,
            adjustments,
            gate_status,
            quality_gate,
            confidence_cap: self.confidence_cap,
            build_verdict,
            model_verdict: self.model_verdict,
            dashboard,
            sources_found: self.sources_found,
            data_points: self.data_points,
            variables_found: self.variables_found,
            coverage_pct: self.coverage_pct,
            error_log: self.error_log,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_run(subject: &str) -> NewRun {
        NewRun {
            user_id: "user-1".into(),
            subject: subject.into(),
            geography: Some("Spain".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('runs', 'jobs', 'unit_runs', 'sources', 'chunks', 'variables', 'contradictions', 'signals', 'artifacts', 'quality_checks', 'documents', 'query_log')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 12);
        // Re-running migrations on an existing schema is harmless.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_run_starts_pending_at_phase_zero() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(&new_run("pharmacy demand"), Utc::now())?;
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.current_phase, 0);
        assert!(run.phase_results.is_empty());
        assert_eq!(run.geography.as_deref(), Some("Spain"));
        assert_eq!(run.depth, Depth::Total);
        assert_eq!(run.status_label(), "pending");
        Ok(())
    }

    #[test]
    fn test_create_run_keeps_depth() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let mut new = new_run("s");
        new.depth = Depth::Standard;
        let run = db.create_run(&new, Utc::now())?;
        assert_eq!(db.get_run(run.id)?.unwrap().depth, Depth::Standard);
        Ok(())
    }

    #[test]
    fn test_update_run_merges_phase_results() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(&new_run("s"), Utc::now())?;
        db.update_run(
            run.id,
            &RunUpdate::default().with_result(Phase::DomainAnalysis, json!({"subdomains": []})),
            Utc::now(),
        )?;
        let updated = db
            .update_run(
                run.id,
                &RunUpdate::default().with_result(Phase::QualityGate, json!({"status": "PASS"})),
                Utc::now(),
            )?
            .unwrap();
        assert_eq!(updated.phase_results.len(), 2);
        assert_eq!(
            updated.phase_results["domain_analysis"],
            json!({"subdomains": []})
        );
        assert_eq!(updated.phase_results["quality_gate"]["status"], "PASS");
        Ok(())
    }

    #[test]
    fn test_update_run_replaces_only_targeted_key() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(&new_run("s"), Utc::now())?;
        for value in [json!({"v": 1}), json!({"v": 2})] {
            db.update_run(
                run.id,
                &RunUpdate::default().with_result(Phase::Backtesting, value),
                Utc::now(),
            )?;
        }
        db.update_run(
            run.id,
            &RunUpdate::default().with_result(Phase::Synthesis, json!("done")),
            Utc::now(),
        )?;
        let results = db.get_phase_results(run.id)?.unwrap();
        assert_eq!(results["backtesting"], json!({"v": 2}));
        assert_eq!(results["synthesis"], json!("done"));
        Ok(())
    }

    #[test]
    fn test_current_phase_never_decreases() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(&new_run("s"), Utc::now())?;
        db.update_run(run.id, &RunUpdate::default().with_phase(4), Utc::now())?;
        let updated = db
            .update_run(run.id, &RunUpdate::default().with_phase(2), Utc::now())?
            .unwrap();
        assert_eq!(updated.current_phase, 4);
        Ok(())
    }

    #[test]
    fn test_update_missing_run_returns_none() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let result = db.update_run(999, &RunUpdate::status(RunStatus::Running), Utc::now())?;
        assert!(result.is_none());
        assert!(db.get_phase_results(999)?.is_none());
        Ok(())
    }

    #[test]
    fn test_completed_sets_completed_at() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(&new_run("s"), Utc::now())?;
        assert!(run.completed_at.is_none());
        let done = db
            .update_run(run.id, &RunUpdate::status(RunStatus::Completed), Utc::now())?
            .unwrap();
        assert!(done.completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_update_typed_fields_round_trip() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(&new_run("s"), Utc::now())?;
        let mut adjustments = Adjustments::new();
        adjustments.insert("regulation".into(), UnitAdjustment { include: false });
        let update = RunUpdate {
            gate_status: Some(GateStatus::PassConditional),
            build_verdict: Some(BuildVerdict::GoodEnough),
            confidence_cap: Some(0.6),
            adjustments: Some(adjustments),
            counters: Some(RunCounters {
                sources_found: 12,
                data_points: 40,
                variables_found: 7,
                coverage_pct: 57.0,
            }),
            ..Default::default()
        };
        let updated = db.update_run(run.id, &update, Utc::now())?.unwrap();
        assert_eq!(updated.gate_status, Some(GateStatus::PassConditional));
        assert_eq!(updated.build_verdict, Some(BuildVerdict::GoodEnough));
        assert_eq!(updated.confidence_cap, Some(0.6));
        assert_eq!(updated.sources_found, 12);
        assert!(!updated.adjustments.unwrap()["regulation"].include);
        Ok(())
    }

    #[test]
    fn test_list_runs_filters_by_user() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.create_run(&new_run("a"), Utc::now())?;
        let mut other = new_run("b");
        other.user_id = "user-2".into();
        db.create_run(&other, Utc::now())?;

        assert_eq!(db.list_runs(None, 10)?.len(), 2);
        let mine = db.list_runs(Some("user-2"), 10)?;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].subject, "b");
        Ok(())
    }

    #[test]
    fn test_run_ids_with_status() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let a = db.create_run(&new_run("a"), Utc::now())?;
        let b = db.create_run(&new_run("b"), Utc::now())?;
        db.update_run(b.id, &RunUpdate::status(RunStatus::Running), Utc::now())?;
        assert_eq!(db.run_ids_with_status(RunStatus::Running)?, vec![b.id]);
        assert_eq!(db.run_ids_with_status(RunStatus::Pending)?, vec![a.id]);
        Ok(())
    }

    #[test]
    fn test_run_view_for_fresh_run() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(&new_run("s"), Utc::now())?;
        let view = db.run_view(run.id)?.unwrap();
        assert_eq!(view.status_label, "pending");
        assert!(view.units.is_empty());
        assert_eq!(view.job_counts, JobCounts::default());
        assert!(db.run_view(42)?.is_none());
        Ok(())
    }
}
