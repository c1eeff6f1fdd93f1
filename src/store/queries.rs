//! Keyword search over a run's chunks and the log of answered questions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::db::PipelineDb;
use super::models::*;
use crate::util::ts;

impl PipelineDb {
    /// Chunks containing any of `keywords` (lowercase), oldest first.
    /// Matching is a case-insensitive substring test.
    pub fn search_chunks(&self, run_id: i64, keywords: &[String], limit: usize) -> Result<Vec<ChunkRecord>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let any_keyword = (0..keywords.len())
            .map(|i| format!("instr(lower(content), ?{}) > 0", i + 3))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT id, batch_index, subdomain, content, topic FROM chunks
             WHERE run_id = ?1 AND ({}) ORDER BY id LIMIT ?2",
            any_keyword
        );
        let mut values: Vec<rusqlite::types::Value> = vec![run_id.into(), (limit as i64).into()];
        values.extend(keywords.iter().map(|k| rusqlite::types::Value::from(k.clone())));

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare search_chunks")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok(ChunkRecord {
                    id: row.get(0)?,
                    batch_index: row.get(1)?,
                    subdomain: row.get(2)?,
                    content: row.get(3)?,
                    topic: row.get(4)?,
                })
            })
            .context("Failed to search chunks")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read chunk rows")
    }

    pub fn log_query(
        &self,
        run_id: i64,
        question: &str,
        answer: &str,
        sources_used: &[String],
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<QueryRecord> {
        let sources = serde_json::to_string(sources_used).context("Failed to encode query sources")?;
        let stamp = ts(now);
        self.conn
            .execute(
                "INSERT INTO query_log (run_id, question, answer, sources_used, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, question, answer, sources, confidence, stamp],
            )
            .context("Failed to log query")?;
        Ok(QueryRecord {
            id: self.conn.last_insert_rowid(),
            run_id,
            question: question.to_string(),
            answer: answer.to_string(),
            sources_used: sources_used.to_vec(),
            confidence,
            created_at: stamp,
        })
    }

    /// Most recent questions first.
    pub fn list_queries(&self, run_id: i64, limit: usize) -> Result<Vec<QueryRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, question, answer, sources_used, confidence, created_at
                 FROM query_log WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .context("Failed to prepare list_queries")?;
        let rows = stmt
            .query_map(params![run_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query query log")?;
        let mut queries = Vec::new();
        for row in rows {
            let (id, run_id, question, answer, sources, confidence, created_at) =
                row.context("Failed to read query row")?;
            queries.push(QueryRecord {
                id,
                run_id,
                question,
                answer,
                sources_used: serde_json::from_str(&sources)
                    .context("Failed to parse query sources JSON")?,
                confidence,
                created_at,
            });
        }
        Ok(queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
        let output = BatchOutput {
            chunks: ["Flu season drives Antihistamine demand", "Rent in the old town keeps rising", "Pollen counts peak in May"]
                .iter()
                .map(|text| NewChunk {
                    content: text.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        db.start_unit(run.id, 0, "demand", "surface", Utc::now())?;
        db.record_batch_output(run.id, 0, "demand", &output, Utc::now())?;
        Ok((db, run.id))
    }

    #[test]
    fn test_search_matches_any_keyword_ignoring_case() -> Result<()> {
        let (db, run_id) = setup()?;
        let hits = db.search_chunks(run_id, &["antihistamine".into(), "pollen".into()], 20)?;
        let contents: Vec<&str> = hits.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Flu season drives Antihistamine demand", "Pollen counts peak in May"]
        );
        assert_eq!(db.search_chunks(run_id, &["pollen".into()], 20)?[0].subdomain, "demand");
        Ok(())
    }

    #[test]
    fn test_search_respects_limit_and_empty_keywords() -> Result<()> {
        let (db, run_id) = setup()?;
        assert_eq!(db.search_chunks(run_id, &["in".into()], 1)?.len(), 1);
        assert!(db.search_chunks(run_id, &[], 20)?.is_empty());
        assert!(db.search_chunks(run_id, &["unheard".into()], 20)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_query_log_newest_first() -> Result<()> {
        let (db, run_id) = setup()?;
        db.log_query(run_id, "first?", "a", &[], 0.0, Utc::now())?;
        let logged = db.log_query(run_id, "second?", "b", &["demand".into()], 0.8, Utc::now())?;
        let queries = db.list_queries(run_id, 10)?;
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].id, logged.id);
        assert_eq!(queries[0].sources_used, vec!["demand"]);
        assert_eq!(queries[1].question, "first?");
        Ok(())
    }
}
