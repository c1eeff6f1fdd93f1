//! Fan-out bookkeeping and research outputs: unit runs, sources, chunks,
//! variables, contradictions, signals, post-processing artifacts and
//! quality checks.

use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::db::PipelineDb;
use super::models::*;
use crate::util::ts;

/// Units moved by one staleness pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealReport {
    pub orphaned: usize,
    pub failed: usize,
}

impl HealReport {
    pub fn is_empty(&self) -> bool {
        self.orphaned == 0 && self.failed == 0
    }
}

const UNIT_COLUMNS: &str = "id, run_id, batch_index, subdomain, level, status, sources_found, chunks_generated, error_log, started_at, completed_at";

impl PipelineDb {
    // ── Unit runs ─────────────────────────────────────────────────────

    /// Create or reset the unit record for a batch to `running`.
    pub fn start_unit(
        &self,
        run_id: i64,
        batch_index: usize,
        subdomain: &str,
        level: &str,
        now: DateTime<Utc>,
    ) -> Result<UnitRun> {
        self.conn
            .execute(
                "INSERT INTO unit_runs (run_id, batch_index, subdomain, level, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)
                 ON CONFLICT(run_id, batch_index) DO UPDATE SET
                    subdomain = excluded.subdomain, level = excluded.level, status = 'running',
                    sources_found = 0, chunks_generated = 0, error_log = NULL,
                    started_at = excluded.started_at, completed_at = NULL",
                params![run_id, batch_index as i64, subdomain, level, ts(now)],
            )
            .context("Failed to start unit run")?;
        self.get_unit(run_id, batch_index)?
            .context("Unit run not found after insert")
    }

    pub fn get_unit(&self, run_id: i64, batch_index: usize) -> Result<Option<UnitRun>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM unit_runs WHERE run_id = ?1 AND batch_index = ?2",
                    UNIT_COLUMNS
                ),
                params![run_id, batch_index as i64],
                UnitRow::from_row,
            )
            .optional()
            .context("Failed to query unit run")?;
        row.map(UnitRow::into_unit).transpose()
    }

    pub fn list_units(&self, run_id: i64) -> Result<Vec<UnitRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM unit_runs WHERE run_id = ?1 ORDER BY batch_index",
                UNIT_COLUMNS
            ))
            .context("Failed to prepare list_units")?;
        let rows = stmt
            .query_map(params![run_id], UnitRow::from_row)
            .context("Failed to query unit runs")?;
        let mut units = Vec::new();
        for row in rows {
            units.push(row.context("Failed to read unit row")?.into_unit()?);
        }
        Ok(units)
    }

    /// Replace everything the batch produced before and mark its unit
    /// `completed`, all in one transaction. Returns `(sources, chunks)`.
    pub fn record_batch_output(
        &self,
        run_id: i64,
        batch_index: usize,
        subdomain: &str,
        output: &BatchOutput,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let stamp = ts(now);
        let batch = batch_index as i64;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin batch write")?;

        clear_batch_rows(&tx, run_id, batch)?;

        for source in &output.sources {
            tx.execute(
                "INSERT INTO sources (run_id, batch_index, subdomain, name, url, source_type, reliability, update_frequency, tier, origin, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'research', ?10)",
                params![
                    run_id,
                    batch,
                    subdomain,
                    source.name,
                    source.url,
                    source.source_type,
                    source.reliability,
                    source.update_frequency,
                    source.tier,
                    stamp
                ],
            )
            .context("Failed to insert source")?;
        }
        for chunk in &output.chunks {
            tx.execute(
                "INSERT INTO chunks (run_id, batch_index, subdomain, content, topic, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    batch,
                    subdomain,
                    chunk.content,
                    chunk.topic,
                    chunk.confidence,
                    stamp
                ],
            )
            .context("Failed to insert chunk")?;
        }
        for variable in &output.variables {
            tx.execute(
                "INSERT INTO variables (run_id, batch_index, name, variable_type, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    batch,
                    variable.name,
                    variable.variable_type,
                    variable.description,
                    stamp
                ],
            )
            .context("Failed to insert variable")?;
        }
        for contradiction in &output.contradictions {
            tx.execute(
                "INSERT INTO contradictions (run_id, batch_index, claim_a, claim_b, severity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    batch,
                    contradiction.claim_a,
                    contradiction.claim_b,
                    contradiction.severity,
                    stamp
                ],
            )
            .context("Failed to insert contradiction")?;
        }

        tx.execute(
            "UPDATE unit_runs
             SET status = 'completed', sources_found = ?3, chunks_generated = ?4,
                 error_log = NULL, completed_at = ?5
             WHERE run_id = ?1 AND batch_index = ?2",
            params![
                run_id,
                batch,
                output.sources.len() as i64,
                output.chunks.len() as i64,
                stamp
            ],
        )
        .context("Failed to complete unit run")?;

        tx.commit().context("Failed to commit batch output")?;
        Ok((output.sources.len(), output.chunks.len()))
    }

    /// Mark a batch's unit `failed`, creating the record when the batch never
    /// got as far as starting it.
    pub fn fail_unit(
        &self,
        run_id: i64,
        batch_index: usize,
        subdomain: &str,
        level: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let stamp = ts(now);
        self.conn
            .execute(
                "INSERT INTO unit_runs (run_id, batch_index, subdomain, level, status, error_log, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, 'failed', ?5, ?6, ?6)
                 ON CONFLICT(run_id, batch_index) DO UPDATE SET
                    status = 'failed', error_log = excluded.error_log, completed_at = excluded.completed_at",
                params![run_id, batch_index as i64, subdomain, level, error, stamp],
            )
            .context("Failed to mark unit failed")?;
        Ok(())
    }

    /// Two-tier staleness: `running` units started before `now - orphan_after`
    /// become `orphaned`; `running`/`orphaned` units started before
    /// `now - hard_fail_after` become `failed`.
    pub fn heal_stale_units(
        &self,
        run_id: i64,
        orphan_after: TimeDelta,
        hard_fail_after: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<HealReport> {
        let stamp = ts(now);
        let failed = self
            .conn
            .execute(
                "UPDATE unit_runs
                 SET status = 'failed', completed_at = ?3,
                     error_log = COALESCE(error_log, 'unit timed out without completing')
                 WHERE run_id = ?1 AND status IN ('running', 'orphaned') AND started_at < ?2",
                params![run_id, ts(now - hard_fail_after), stamp],
            )
            .context("Failed to hard-fail stale units")?;
        let orphaned = self
            .conn
            .execute(
                "UPDATE unit_runs
                 SET status = 'orphaned', error_log = 'no progress since start'
                 WHERE run_id = ?1 AND status = 'running' AND started_at < ?2",
                params![run_id, ts(now - orphan_after)],
            )
            .context("Failed to orphan stale units")?;
        Ok(HealReport { orphaned, failed })
    }

    pub fn completed_batch_indices(&self, run_id: i64) -> Result<BTreeSet<usize>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT batch_index FROM unit_runs WHERE run_id = ?1 AND status = 'completed'",
            )
            .context("Failed to prepare completed_batch_indices")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, i64>(0))
            .context("Failed to query completed units")?;
        let mut indices = BTreeSet::new();
        for row in rows {
            indices.insert(row.context("Failed to read unit index")? as usize);
        }
        Ok(indices)
    }

    /// Cumulative counters recomputed from stored rows.
    pub fn compute_counters(
        &self,
        run_id: i64,
        total_batches: usize,
        expected_chunks_per_batch: u32,
    ) -> Result<RunCounters> {
        let (sources, chunks, variables): (i64, i64, i64) = self
            .conn
            .query_row(
                "SELECT
                    (SELECT COUNT(1) FROM sources WHERE run_id = ?1),
                    (SELECT COUNT(1) FROM chunks WHERE run_id = ?1),
                    (SELECT COUNT(1) FROM variables WHERE run_id = ?1)",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Failed to count research rows")?;
        let expected = (total_batches as f64 * expected_chunks_per_batch as f64).max(1.0);
        let coverage = ((chunks as f64 / expected) * 100.0).round().min(100.0);
        Ok(RunCounters {
            sources_found: sources,
            data_points: chunks,
            variables_found: variables,
            coverage_pct: coverage,
        })
    }

    // ── Sources ───────────────────────────────────────────────────────

    pub fn list_sources(&self, run_id: i64) -> Result<Vec<SourceRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, batch_index, subdomain, name, url, source_type, reliability, update_frequency, tier, origin
                 FROM sources WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_sources")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(SourceRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    batch_index: row.get(2)?,
                    subdomain: row.get(3)?,
                    name: row.get(4)?,
                    url: row.get(5)?,
                    source_type: row.get(6)?,
                    reliability: row.get(7)?,
                    update_frequency: row.get(8)?,
                    tier: row.get(9)?,
                    origin: row.get(10)?,
                })
            })
            .context("Failed to query sources")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read source rows")
    }

    /// Register sources found outside the fan-out (quality gate
    /// autocorrection). Names already registered for the run are skipped,
    /// case-insensitively. Returns the number inserted.
    pub fn add_supplementary_sources(
        &self,
        run_id: i64,
        sources: &[NewSource],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let stamp = ts(now);
        let mut inserted = 0;
        for source in sources {
            let exists: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(1) FROM sources WHERE run_id = ?1 AND lower(name) = lower(?2)",
                    params![run_id, source.name],
                    |row| row.get(0),
                )
                .context("Failed to check for existing source")?;
            if exists > 0 {
                continue;
            }
            self.conn
                .execute(
                    "INSERT INTO sources (run_id, batch_index, subdomain, name, url, source_type, reliability, update_frequency, tier, origin, created_at)
                     VALUES (?1, NULL, NULL, ?2, ?3, ?4, ?5, ?6, ?7, 'supplementary', ?8)",
                    params![
                        run_id,
                        source.name,
                        source.url,
                        source.source_type,
                        source.reliability,
                        source.update_frequency,
                        source.tier,
                        stamp
                    ],
                )
                .context("Failed to insert supplementary source")?;
            inserted += 1;
        }
        Ok(inserted)
    }

    // ── Chunks, variables, contradictions ─────────────────────────────

    /// Chunks for one subdomain in insertion order, capped at `limit`.
    pub fn list_chunks(&self, run_id: i64, subdomain: &str, limit: usize) -> Result<Vec<ChunkRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, batch_index, subdomain, content, topic FROM chunks
                 WHERE run_id = ?1 AND subdomain = ?2 ORDER BY id LIMIT ?3",
            )
            .context("Failed to prepare list_chunks")?;
        let rows = stmt
            .query_map(params![run_id, subdomain, limit as i64], |row| {
                Ok(ChunkRecord {
                    id: row.get(0)?,
                    batch_index: row.get(1)?,
                    subdomain: row.get(2)?,
                    content: row.get(3)?,
                    topic: row.get(4)?,
                })
            })
            .context("Failed to query chunks")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read chunk rows")
    }

    pub fn count_chunks(&self, run_id: i64, subdomain: Option<&str>) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(1) FROM chunks WHERE run_id = ?1 AND (?2 IS NULL OR subdomain = ?2)",
                params![run_id, subdomain],
                |row| row.get(0),
            )
            .context("Failed to count chunks")
    }

    pub fn list_variable_names(&self, run_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT name FROM variables WHERE run_id = ?1 ORDER BY name")
            .context("Failed to prepare list_variable_names")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get(0))
            .context("Failed to query variables")?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed to read variable rows")
    }

    pub fn count_contradictions(&self, run_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(1) FROM contradictions WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to count contradictions")
    }

    // ── Signals ───────────────────────────────────────────────────────

    /// Replace the run's detected signals. Re-running detection never
    /// accumulates duplicates.
    pub fn replace_signals(
        &self,
        run_id: i64,
        signals: &[NewSignal],
        now: DateTime<Utc>,
    ) -> Result<Vec<SignalRecord>> {
        let stamp = ts(now);
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin signal write")?;
        tx.execute("DELETE FROM signals WHERE run_id = ?1", params![run_id])
            .context("Failed to clear signals")?;
        for signal in signals {
            tx.execute(
                "INSERT INTO signals (run_id, layer_id, layer_name, name, description, confidence, impact, trend, devil_advocate, data_source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run_id,
                    signal.layer_id,
                    signal.layer_name,
                    signal.name,
                    signal.description,
                    signal.confidence,
                    signal.impact,
                    signal.trend,
                    signal.devil_advocate,
                    signal.data_source,
                    stamp
                ],
            )
            .context("Failed to insert signal")?;
        }
        tx.commit().context("Failed to commit signals")?;
        self.list_signals(run_id)
    }

    pub fn list_signals(&self, run_id: i64) -> Result<Vec<SignalRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, layer_id, layer_name, name, description, confidence, impact, trend, devil_advocate, data_source
                 FROM signals WHERE run_id = ?1 ORDER BY layer_id, id",
            )
            .context("Failed to prepare list_signals")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(SignalRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    layer_id: row.get(2)?,
                    layer_name: row.get(3)?,
                    name: row.get(4)?,
                    description: row.get(5)?,
                    confidence: row.get(6)?,
                    impact: row.get(7)?,
                    trend: row.get(8)?,
                    devil_advocate: row.get(9)?,
                    data_source: row.get(10)?,
                })
            })
            .context("Failed to query signals")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read signal rows")
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_artifact(
        &self,
        run_id: i64,
        step: ChainStep,
        unit_index: usize,
        subdomain: &str,
        content: &Value,
        is_error: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO artifacts (run_id, step, unit_index, subdomain, content, is_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_id, step, unit_index) DO UPDATE SET
                    subdomain = excluded.subdomain, content = excluded.content,
                    is_error = excluded.is_error, created_at = excluded.created_at",
                params![
                    run_id,
                    step.as_str(),
                    unit_index as i64,
                    subdomain,
                    content.to_string(),
                    is_error,
                    ts(now)
                ],
            )
            .context("Failed to upsert artifact")?;
        Ok(())
    }

    pub fn get_artifact(&self, run_id: i64, step: ChainStep, unit_index: usize) -> Result<Option<Artifact>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, run_id, step, unit_index, subdomain, content, is_error, created_at
                 FROM artifacts WHERE run_id = ?1 AND step = ?2 AND unit_index = ?3",
                params![run_id, step.as_str(), unit_index as i64],
                ArtifactRow::from_row,
            )
            .optional()
            .context("Failed to query artifact")?;
        row.map(ArtifactRow::into_artifact).transpose()
    }

    pub fn list_artifacts(&self, run_id: i64) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, step, unit_index, subdomain, content, is_error, created_at
                 FROM artifacts WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![run_id], ArtifactRow::from_row)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?.into_artifact()?);
        }
        Ok(artifacts)
    }

    pub fn count_artifacts(&self, run_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(1) FROM artifacts WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to count artifacts")
    }

    /// Artifacts for which [`Artifact::is_usable`] holds.
    pub fn count_usable_artifacts(&self, run_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(1) FROM artifacts WHERE run_id = ?1 AND is_error = 0 AND step != ?2",
                params![run_id, ChainStep::Quality.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count usable artifacts")
    }

    pub fn delete_artifacts(&self, run_id: i64) -> Result<usize> {
        self.conn
            .execute("DELETE FROM artifacts WHERE run_id = ?1", params![run_id])
            .context("Failed to delete artifacts")
    }

    // ── Quality checks ────────────────────────────────────────────────

    pub fn insert_quality_check(
        &self,
        run_id: i64,
        check_type: &str,
        verdict: &str,
        score: f64,
        details: &Value,
        now: DateTime<Utc>,
    ) -> Result<QualityCheck> {
        self.conn
            .execute(
                "INSERT INTO quality_checks (run_id, check_type, verdict, score, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, check_type, verdict, score, details.to_string(), ts(now)],
            )
            .context("Failed to insert quality check")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, run_id, check_type, verdict, score, details, created_at
                 FROM quality_checks WHERE id = ?1",
                params![id],
                QualityCheckRow::from_row,
            )
            .context("Quality check not found after insert")?
            .into_check()
    }

    /// Latest check for a run, optionally restricted to one check type.
    pub fn latest_quality_check(&self, run_id: i64, check_type: Option<&str>) -> Result<Option<QualityCheck>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, run_id, check_type, verdict, score, details, created_at
                 FROM quality_checks WHERE run_id = ?1 AND (?2 IS NULL OR check_type = ?2)
                 ORDER BY id DESC LIMIT 1",
                params![run_id, check_type],
                QualityCheckRow::from_row,
            )
            .optional()
            .context("Failed to query quality checks")?;
        row.map(QualityCheckRow::into_check).transpose()
    }
}

fn clear_batch_rows(tx: &rusqlite::Transaction<'_>, run_id: i64, batch: i64) -> Result<()> {
    for table in ["sources", "chunks", "variables", "contradictions"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE run_id = ?1 AND batch_index = ?2", table),
            params![run_id, batch],
        )
        .with_context(|| format!("Failed to clear prior {} for batch {}", table, batch))?;
    }
    Ok(())
}

/// Intermediate row struct for unit_runs.
struct UnitRow {
    id: i64,
    run_id: i64,
    batch_index: i64,
    subdomain: String,
    level: String,
    status: String,
    sources_found: i64,
    chunks_generated: i64,
    error_log: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl UnitRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            batch_index: row.get(2)?,
            subdomain: row.get(3)?,
            level: row.get(4)?,
            status: row.get(5)?,
            sources_found: row.get(6)?,
            chunks_generated: row.get(7)?,
            error_log: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_unit(self) -> Result<UnitRun> {
        let status = UnitStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse unit status")?;
        Ok(UnitRun {
            id: self.id,
            run_id: self.run_id,
            batch_index: self.batch_index,
            subdomain: self.subdomain,
            level: self.level,
            status,
            sources_found: self.sources_found,
            chunks_generated: self.chunks_generated,
            error_log: self.error_log,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

struct ArtifactRow {
    id: i64,
    run_id: i64,
    step: String,
    unit_index: i64,
    subdomain: String,
    content: String,
    is_error: bool,
    created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            step: row.get(2)?,
            unit_index: row.get(3)?,
            subdomain: row.get(4)?,
            content: row.get(5)?,
            is_error: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_artifact(self) -> Result<Artifact> {
        let step = ChainStep::from_str(&self.step)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse chain step")?;
        let content =
            serde_json::from_str(&self.content).context("Failed to parse artifact JSON")?;
        Ok(Artifact {
            id: self.id,
            run_id: self.run_id,
            step,
            unit_index: self.unit_index,
            subdomain: self.subdomain,
            content,
            is_error: self.is_error,
            created_at: self.created_at,
        })
    }
}

struct QualityCheckRow {
    id: i64,
    run_id: i64,
    check_type: String,
    verdict: String,
    score: f64,
    details: String,
    created_at: String,
}

impl QualityCheckRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            check_type: row.get(2)?,
            verdict: row.get(3)?,
            score: row.get(4)?,
            details: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_check(self) -> Result<QualityCheck> {
        let details =
            serde_json::from_str(&self.details).context("Failed to parse quality check JSON")?;
        Ok(QualityCheck {
            id: self.id,
            run_id: self.run_id,
            check_type: self.check_type,
            verdict: self.verdict,
            score: self.score,
            details,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Result<(PipelineDb, i64)> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run(
            &NewRun {
                user_id: "u".into(),
                subject: "s".into(),
                ..Default::default()
            },
            Utc::now(),
        )?;
        Ok((db, run.id))
    }

    fn output(sources: usize, chunks: usize) -> BatchOutput {
        BatchOutput {
            sources: (0..sources)
                .map(|i| NewSource {
                    name: format!("source-{}", i),
                    source_type: "official".into(),
                    reliability: 7.0,
                    ..Default::default()
                })
                .collect(),
            chunks: (0..chunks)
                .map(|i| NewChunk {
                    content: format!("fact {}", i),
                    ..Default::default()
                })
                .collect(),
            variables: vec![NewVariable {
                name: "demand".into(),
                variable_type: "numeric".into(),
                description: None,
            }],
            contradictions: Vec::new(),
        }
    }

    #[test]
    fn test_batch_rerun_replaces_prior_rows() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.start_unit(run_id, 0, "regulation", "surface", now)?;
        db.record_batch_output(run_id, 0, "regulation", &output(3, 5), now)?;
        db.start_unit(run_id, 0, "regulation", "surface", now)?;
        db.record_batch_output(run_id, 0, "regulation", &output(2, 4), now)?;

        let counters = db.compute_counters(run_id, 2, 5)?;
        assert_eq!(counters.sources_found, 2);
        assert_eq!(counters.data_points, 4);
        assert_eq!(counters.variables_found, 1);
        assert_eq!(counters.coverage_pct, 40.0);

        let unit = db.get_unit(run_id, 0)?.unwrap();
        assert_eq!(unit.status, UnitStatus::Completed);
        assert_eq!(unit.chunks_generated, 4);
        Ok(())
    }

    #[test]
    fn test_rerun_leaves_other_batches_untouched() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.start_unit(run_id, 0, "a", "surface", now)?;
        db.record_batch_output(run_id, 0, "a", &output(1, 3), now)?;
        db.start_unit(run_id, 1, "a", "academic", now)?;
        db.record_batch_output(run_id, 1, "a", &output(1, 2), now)?;
        db.start_unit(run_id, 1, "a", "academic", now)?;
        db.record_batch_output(run_id, 1, "a", &output(1, 1), now)?;
        assert_eq!(db.count_chunks(run_id, Some("a"))?, 4);
        Ok(())
    }

    #[test]
    fn test_coverage_is_capped() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.start_unit(run_id, 0, "a", "surface", now)?;
        db.record_batch_output(run_id, 0, "a", &output(0, 12), now)?;
        assert_eq!(db.compute_counters(run_id, 1, 5)?.coverage_pct, 100.0);
        Ok(())
    }

    #[test]
    fn test_heal_two_tiers() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.start_unit(run_id, 0, "a", "surface", now - TimeDelta::minutes(45))?;
        db.start_unit(run_id, 1, "a", "academic", now - TimeDelta::minutes(15))?;
        db.start_unit(run_id, 2, "a", "datasets", now - TimeDelta::minutes(2))?;

        let report = db.heal_stale_units(
            run_id,
            TimeDelta::minutes(10),
            TimeDelta::minutes(30),
            now,
        )?;
        assert_eq!(report, HealReport { orphaned: 1, failed: 1 });
        let units = db.list_units(run_id)?;
        assert_eq!(units[0].status, UnitStatus::Failed);
        assert_eq!(units[1].status, UnitStatus::Orphaned);
        assert_eq!(units[2].status, UnitStatus::Running);

        // Orphaned units hard-fail once they cross the longer threshold.
        let report = db.heal_stale_units(
            run_id,
            TimeDelta::minutes(10),
            TimeDelta::minutes(30),
            now + TimeDelta::minutes(20),
        )?;
        assert_eq!(report.failed, 1);
        assert_eq!(db.get_unit(run_id, 1)?.unwrap().status, UnitStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_fail_unit_creates_missing_record() -> Result<()> {
        let (db, run_id) = setup()?;
        db.fail_unit(run_id, 4, "b", "frontier", "dead-lettered", Utc::now())?;
        let unit = db.get_unit(run_id, 4)?.unwrap();
        assert_eq!(unit.status, UnitStatus::Failed);
        assert_eq!(unit.error_log.as_deref(), Some("dead-lettered"));
        assert!(db.completed_batch_indices(run_id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_supplementary_sources_skip_known_names() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.start_unit(run_id, 0, "a", "surface", now)?;
        db.record_batch_output(run_id, 0, "a", &output(1, 0), now)?;
        let extra = vec![
            NewSource {
                name: "SOURCE-0".into(),
                ..Default::default()
            },
            NewSource {
                name: "AEMET".into(),
                source_type: "climate".into(),
                ..Default::default()
            },
        ];
        assert_eq!(db.add_supplementary_sources(run_id, &extra, now)?, 1);
        let sources = db.list_sources(run_id)?;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].origin, "supplementary");
        Ok(())
    }

    #[test]
    fn test_artifact_upsert_and_counts() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.upsert_artifact(run_id, ChainStep::KnowledgeGraph, 0, "a", &json!({"error": "bad"}), true, now)?;
        assert_eq!(db.count_artifacts(run_id)?, 1);
        assert_eq!(db.count_usable_artifacts(run_id)?, 0);

        db.upsert_artifact(run_id, ChainStep::KnowledgeGraph, 0, "a", &json!({"nodes": 3}), false, now)?;
        assert_eq!(db.count_artifacts(run_id)?, 1);
        assert_eq!(db.count_usable_artifacts(run_id)?, 1);

        // Locally computed quality rows never count as usable.
        db.upsert_artifact(run_id, ChainStep::Quality, 0, "a", &json!({"score": 1.0}), false, now)?;
        assert_eq!(db.count_artifacts(run_id)?, 2);
        assert_eq!(db.count_usable_artifacts(run_id)?, 1);
        let usable = db.list_artifacts(run_id)?.iter().filter(|a| a.is_usable()).count();
        assert_eq!(usable, 1);
        let artifact = db.get_artifact(run_id, ChainStep::KnowledgeGraph, 0)?.unwrap();
        assert_eq!(artifact.content["nodes"], 3);

        assert_eq!(db.delete_artifacts(run_id)?, 2);
        assert!(db.list_artifacts(run_id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_replace_signals_is_idempotent() -> Result<()> {
        let (db, run_id) = setup()?;
        let signal = NewSignal {
            layer_id: 1,
            layer_name: "Public".into(),
            name: "flu season".into(),
            confidence: 0.6,
            ..Default::default()
        };
        db.replace_signals(run_id, &[signal.clone(), signal.clone()], Utc::now())?;
        let stored = db.replace_signals(run_id, &[signal], Utc::now())?;
        assert_eq!(stored.len(), 1);
        Ok(())
    }

    #[test]
    fn test_latest_quality_check_by_type() -> Result<()> {
        let (db, run_id) = setup()?;
        let now = Utc::now();
        db.insert_quality_check(run_id, "gate", "PASS", 90.0, &json!({}), now)?;
        db.insert_quality_check(run_id, "build", "GOOD_ENOUGH", 0.8, &json!({}), now)?;
        assert_eq!(
            db.latest_quality_check(run_id, Some("gate"))?.unwrap().verdict,
            "PASS"
        );
        assert_eq!(
            db.latest_quality_check(run_id, None)?.unwrap().check_type,
            "build"
        );
        Ok(())
    }
}
