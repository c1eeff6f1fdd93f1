//! Ingested documents and the chunks they file into a run's knowledge base.
//!
//! Chunks from documents share the `chunks` table with research output but
//! carry `batch_index = -1`, their `document_id` and a content hash. The
//! unique `(run_id, content_hash)` index makes filing a chunk twice a no-op,
//! whichever document it came from.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::db::PipelineDb;
use super::models::*;
use crate::util::ts;

/// `batch_index` of chunks that did not come from a research batch.
pub const INGEST_BATCH: i64 = -1;

const DOCUMENT_COLUMNS: &str = "id, run_id, name, subdomain, status, word_count, extraction_quality, content_hash, chunks_total, chunks_kept, chunks_stored, error_log, created_at, updated_at";

impl PipelineDb {
    pub fn create_document(
        &self,
        run_id: i64,
        name: &str,
        subdomain: &str,
        now: DateTime<Utc>,
    ) -> Result<Document> {
        let stamp = ts(now);
        self.conn
            .execute(
                "INSERT INTO documents (run_id, name, subdomain, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![run_id, name, subdomain, stamp],
            )
            .context("Failed to insert document")?;
        let id = self.conn.last_insert_rowid();
        self.get_document(id)?
            .context("Document not found after insert")
    }

    pub fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
                params![id],
                DocumentRow::from_row,
            )
            .optional()
            .context("Failed to query document")?;
        row.map(DocumentRow::into_document).transpose()
    }

    pub fn list_documents(&self, run_id: i64) -> Result<Vec<Document>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM documents WHERE run_id = ?1 ORDER BY id",
                DOCUMENT_COLUMNS
            ))
            .context("Failed to prepare list_documents")?;
        let rows = stmt
            .query_map(params![run_id], DocumentRow::from_row)
            .context("Failed to query documents")?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row.context("Failed to read document row")?.into_document()?);
        }
        Ok(documents)
    }

    pub fn update_document(
        &self,
        id: i64,
        update: &DocumentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Document>> {
        let changed = self
            .conn
            .execute(
                "UPDATE documents SET
                    status = COALESCE(?2, status),
                    word_count = COALESCE(?3, word_count),
                    extraction_quality = COALESCE(?4, extraction_quality),
                    content_hash = COALESCE(?5, content_hash),
                    chunks_total = COALESCE(?6, chunks_total),
                    chunks_kept = COALESCE(?7, chunks_kept),
                    chunks_stored = COALESCE(?8, chunks_stored),
                    error_log = COALESCE(?9, error_log),
                    updated_at = ?10
                 WHERE id = ?1",
                params![
                    id,
                    update.status.map(|s| s.as_str()),
                    update.word_count,
                    update.extraction_quality,
                    update.content_hash,
                    update.chunks_total,
                    update.chunks_kept,
                    update.chunks_stored,
                    update.error_log,
                    ts(now)
                ],
            )
            .context("Failed to update document")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_document(id)
    }

    /// Apply a stage's update and enqueue the next stage in one transaction.
    pub fn advance_document(
        &self,
        id: i64,
        update: &DocumentUpdate,
        next: &NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<Document>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin document advance")?;
        let updated = self.update_document(id, update, now)?;
        if updated.is_some() {
            self.enqueue_job(next, now)?;
        }
        tx.commit().context("Failed to commit document advance")?;
        Ok(updated)
    }

    /// Another live document of the run whose cleaned text hashes the same.
    pub fn duplicate_document(&self, run_id: i64, content_hash: &str, except: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM documents
                 WHERE run_id = ?1 AND content_hash = ?2 AND id != ?3
                   AND status NOT IN ('SKIPPED', 'FAILED')
                 ORDER BY id LIMIT 1",
                params![run_id, content_hash, except],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up duplicate document")
    }

    /// File a document's chunks and mark it `STORED`, in one transaction.
    /// Chunks whose hash is already in the run are skipped. Returns how
    /// many chunks of the run now belong to the document.
    pub fn store_document_chunks(
        &self,
        document: &Document,
        chunks: &[HashedChunk],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let stamp = ts(now);
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin chunk filing")?;
        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks (run_id, batch_index, subdomain, content, topic, confidence, content_hash, document_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (run_id, content_hash) WHERE content_hash IS NOT NULL DO NOTHING",
                params![
                    document.run_id,
                    INGEST_BATCH,
                    document.subdomain,
                    chunk.content,
                    document.name,
                    chunk.score as f64 / 100.0,
                    chunk.content_hash,
                    document.id,
                    stamp
                ],
            )
            .context("Failed to insert document chunk")?;
        }
        let stored: i64 = tx
            .query_row(
                "SELECT COUNT(1) FROM chunks WHERE document_id = ?1",
                params![document.id],
                |row| row.get(0),
            )
            .context("Failed to count document chunks")?;
        tx.execute(
            "UPDATE documents SET status = 'STORED', chunks_stored = ?2, updated_at = ?3 WHERE id = ?1",
            params![document.id, stored, stamp],
        )
        .context("Failed to mark document stored")?;
        tx.commit().context("Failed to commit document chunks")?;
        Ok(stored)
    }
}

struct DocumentRow {
    id: i64,
    run_id: i64,
    name: String,
    subdomain: String,
    status: String,
    word_count: i64,
    extraction_quality: Option<String>,
    content_hash: Option<String>,
    chunks_total: i64,
    chunks_kept: i64,
    chunks_stored: i64,
    error_log: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            name: row.get(2)?,
            subdomain: row.get(3)?,
            status: row.get(4)?,
            word_count: row.get(5)?,
            extraction_quality: row.get(6)?,
            content_hash: row.get(7)?,
            chunks_total: row.get(8)?,
            chunks_kept: row.get(9)?,
            chunks_stored: row.get(10)?,
            error_log: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        let status = DocumentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse document status")?;
        Ok(Document {
            id: self.id,
            run_id: self.run_id,
            name: self.name,
            subdomain: self.subdomain,
            status,
            word_count: self.word_count,
            extraction_quality: self.extraction_quality,
            content_hash: self.content_hash,
            chunks_total: self.chunks_total,
            chunks_kept: self.chunks_kept,
            chunks_stored: self.chunks_stored,
            error_log: self.error_log,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
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
        Ok((db, run.id))
    }

    fn chunk(text: &str, hash: &str) -> HashedChunk {
        HashedChunk {
            content: text.into(),
            content_hash: hash.into(),
            score: 100,
        }
    }

    #[test]
    fn test_document_starts_queued_and_keeps_untouched_fields() -> Result<()> {
        let (db, run_id) = setup()?;
        let doc = db.create_document(run_id, "guide.html", "regulation", Utc::now())?;
        assert_eq!(doc.status, DocumentStatus::Queued);

        let update = DocumentUpdate {
            word_count: Some(900),
            extraction_quality: Some("high".into()),
            ..DocumentUpdate::status(DocumentStatus::Extracted)
        };
        db.update_document(doc.id, &update, Utc::now())?;
        let doc = db
            .update_document(doc.id, &DocumentUpdate::status(DocumentStatus::Cleaned), Utc::now())?
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Cleaned);
        assert_eq!(doc.word_count, 900);
        assert_eq!(doc.extraction_quality.as_deref(), Some("high"));
        assert!(db.update_document(999, &update, Utc::now())?.is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_document_ignores_skipped_and_self() -> Result<()> {
        let (db, run_id) = setup()?;
        let a = db.create_document(run_id, "a", "x", Utc::now())?;
        let b = db.create_document(run_id, "b", "x", Utc::now())?;
        let hashed = DocumentUpdate {
            content_hash: Some("h1".into()),
            ..DocumentUpdate::status(DocumentStatus::Cleaned)
        };
        db.update_document(a.id, &hashed, Utc::now())?;
        assert_eq!(db.duplicate_document(run_id, "h1", a.id)?, None);
        assert_eq!(db.duplicate_document(run_id, "h1", b.id)?, Some(a.id));

        db.update_document(a.id, &DocumentUpdate::status(DocumentStatus::Skipped), Utc::now())?;
        assert_eq!(db.duplicate_document(run_id, "h1", b.id)?, None);
        Ok(())
    }

    #[test]
    fn test_advance_document_enqueues_next_stage() -> Result<()> {
        let (db, run_id) = setup()?;
        let doc = db.create_document(run_id, "a", "x", Utc::now())?;
        let next = NewJob::ingest(run_id, JobType::IngestClean, doc.id, serde_json::json!({"text": "t"}));

        let advanced = db.advance_document(doc.id, &DocumentUpdate::status(DocumentStatus::Extracted), &next, Utc::now())?;
        assert_eq!(advanced.unwrap().status, DocumentStatus::Extracted);
        let jobs = db.list_jobs(run_id)?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::IngestClean);
        assert_eq!(jobs[0].payload["document_id"], doc.id);
        Ok(())
    }

    #[test]
    fn test_advance_document_rolls_back_when_enqueue_fails() -> Result<()> {
        let (db, run_id) = setup()?;
        let doc = db.create_document(run_id, "a", "x", Utc::now())?;
        db.conn.execute_batch(
            "CREATE TRIGGER refuse_jobs BEFORE INSERT ON jobs BEGIN SELECT RAISE(ABORT, 'jobs closed'); END;",
        )?;
        let next = NewJob::ingest(run_id, JobType::IngestClean, doc.id, serde_json::json!({}));

        let result = db.advance_document(doc.id, &DocumentUpdate::status(DocumentStatus::Extracted), &next, Utc::now());
        assert!(result.is_err());
        assert_eq!(db.get_document(doc.id)?.unwrap().status, DocumentStatus::Queued);
        assert!(db.list_jobs(run_id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_store_chunks_skips_known_hashes() -> Result<()> {
        let (db, run_id) = setup()?;
        let first = db.create_document(run_id, "a", "pricing", Utc::now())?;
        let second = db.create_document(run_id, "b", "pricing", Utc::now())?;

        let stored = db.store_document_chunks(&first, &[chunk("one", "h1"), chunk("two", "h2")], Utc::now())?;
        assert_eq!(stored, 2);
        // Same text filed again by another document.
        let stored = db.store_document_chunks(&second, &[chunk("two", "h2"), chunk("three", "h3")], Utc::now())?;
        assert_eq!(stored, 1);
        // A retried store job changes nothing.
        let stored = db.store_document_chunks(&first, &[chunk("one", "h1"), chunk("two", "h2")], Utc::now())?;
        assert_eq!(stored, 2);

        assert_eq!(db.count_chunks(run_id, Some("pricing"))?, 3);
        let doc = db.get_document(second.id)?.unwrap();
        assert_eq!(doc.status, DocumentStatus::Stored);
        assert_eq!(doc.chunks_stored, 1);
        Ok(())
    }

    #[test]
    fn test_research_reruns_leave_document_chunks_alone() -> Result<()> {
        let (db, run_id) = setup()?;
        let doc = db.create_document(run_id, "a", "pricing", Utc::now())?;
        db.store_document_chunks(&doc, &[chunk("one", "h1")], Utc::now())?;
        db.start_unit(run_id, 0, "pricing", "surface", Utc::now())?;
        let output = BatchOutput {
            chunks: vec![NewChunk {
                content: "one".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        db.record_batch_output(run_id, 0, "pricing", &output, Utc::now())?;
        db.record_batch_output(run_id, 0, "pricing", &output, Utc::now())?;
        assert_eq!(db.count_chunks(run_id, None)?, 2);
        Ok(())
    }
}
