//! Document ingestion into a run's knowledge base.
//!
//! Every document walks five jobs: extract, clean, chunk, score, store.
//! Each stage reads its input from the job payload, updates the document row
//! and enqueues the next stage in one transaction, so a retried job
//! finds the document already past its stage and does nothing. A stage only
//! acts on a document in the status its predecessor leaves behind.
//!
//! Failures never touch the run: a document whose stage job fails or is
//! dead-lettered is marked `FAILED` and the rest of the run carries on.

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::context::PipelineContext;
use super::events::RunEvent;
use super::run_record::store_error;
use super::text::{self, ChunkVerdict};
use crate::errors::{JobError, PipelineError};
use crate::settings::IngestSettings;
use crate::store::{
    Document, DocumentStatus, DocumentUpdate, HashedChunk, Job, JobType, NewDocument, NewJob,
    PipelineDb,
};

/// Status a document must hold for `stage` to act on it.
fn expected_status(stage: JobType) -> Option<DocumentStatus> {
    match stage {
        JobType::IngestExtract => Some(DocumentStatus::Queued),
        JobType::IngestClean => Some(DocumentStatus::Extracted),
        JobType::IngestChunk => Some(DocumentStatus::Cleaned),
        JobType::IngestScore => Some(DocumentStatus::Chunked),
        JobType::IngestStore => Some(DocumentStatus::Scored),
        _ => None,
    }
}

/// What a stage decided for its document.
#[derive(Debug, Clone)]
enum Step {
    /// Record the update and hand the payload to the next stage.
    Next {
        update: DocumentUpdate,
        job_type: JobType,
        payload: Value,
    },
    /// Record the update, which settles the document.
    Settle(DocumentUpdate),
    /// File the surviving chunks.
    Store(Vec<HashedChunk>),
}

fn skipped(reason: String, update: DocumentUpdate) -> Step {
    Step::Settle(DocumentUpdate {
        status: Some(DocumentStatus::Skipped),
        error_log: Some(reason),
        ..update
    })
}

fn payload_text(payload: &Value) -> Result<&str, JobError> {
    payload
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| JobError::Fatal("ingest payload has no text".into()))
}

fn payload_chunks<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<Vec<T>, JobError> {
    let chunks = payload
        .get("chunks")
        .cloned()
        .ok_or_else(|| JobError::Fatal("ingest payload has no chunks".into()))?;
    serde_json::from_value(chunks).map_err(|e| JobError::Fatal(format!("bad ingest chunks: {}", e)))
}

fn capped(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// The local, side-effect free part of a stage.
fn process(stage: JobType, payload: &Value, settings: &IngestSettings) -> Result<Step, JobError> {
    let step = match stage {
        JobType::IngestExtract => {
            let extracted = text::extract_main_text(payload_text(payload)?);
            let words = text::word_count(&extracted);
            let update = DocumentUpdate {
                word_count: Some(words as i64),
                extraction_quality: Some(text::extraction_quality(words).to_string()),
                ..Default::default()
            };
            if words < settings.min_words {
                return Ok(skipped(format!("only {} words after extraction", words), update));
            }
            Step::Next {
                update: DocumentUpdate {
                    status: Some(DocumentStatus::Extracted),
                    ..update
                },
                job_type: JobType::IngestClean,
                payload: json!({"text": capped(&extracted, settings.max_text_chars)}),
            }
        }
        JobType::IngestClean => {
            let cleaned = text::clean_scraped(payload_text(payload)?);
            let words = text::word_count(&cleaned);
            let update = DocumentUpdate {
                word_count: Some(words as i64),
                ..Default::default()
            };
            if words < settings.min_words {
                return Ok(skipped(format!("only {} words after cleaning", words), update));
            }
            Step::Next {
                update: DocumentUpdate {
                    status: Some(DocumentStatus::Cleaned),
                    content_hash: Some(text::content_hash(&cleaned)),
                    ..update
                },
                job_type: JobType::IngestChunk,
                payload: json!({"text": cleaned}),
            }
        }
        JobType::IngestChunk => {
            let chunks = text::cheap_chunk(
                payload_text(payload)?,
                settings.chunk_target_words,
                settings.chunk_max_words,
            );
            let update = DocumentUpdate {
                chunks_total: Some(chunks.len() as i64),
                ..Default::default()
            };
            if chunks.is_empty() {
                return Ok(skipped("no chunks".into(), update));
            }
            Step::Next {
                update: DocumentUpdate {
                    status: Some(DocumentStatus::Chunked),
                    ..update
                },
                job_type: JobType::IngestScore,
                payload: json!({"chunks": chunks}),
            }
        }
        JobType::IngestScore => {
            let chunks: Vec<String> = payload_chunks(payload)?;
            let mut kept: Vec<HashedChunk> = Vec::new();
            for content in chunks {
                let scored = text::score_chunk(&content);
                if scored.verdict == ChunkVerdict::Drop {
                    continue;
                }
                let content_hash = text::content_hash(&content);
                if kept.iter().any(|c| c.content_hash == content_hash) {
                    continue;
                }
                kept.push(HashedChunk {
                    content,
                    content_hash,
                    score: scored.score,
                });
            }
            let update = DocumentUpdate {
                chunks_kept: Some(kept.len() as i64),
                ..Default::default()
            };
            if kept.is_empty() {
                return Ok(skipped("every chunk scored too low".into(), update));
            }
            Step::Next {
                update: DocumentUpdate {
                    status: Some(DocumentStatus::Scored),
                    ..update
                },
                job_type: JobType::IngestStore,
                payload: json!({"chunks": kept}),
            }
        }
        JobType::IngestStore => Step::Store(payload_chunks(payload)?),
        other => {
            return Err(JobError::Fatal(format!("{} is not an ingest stage", other.as_str())));
        }
    };
    Ok(step)
}

/// Write a stage's decision. Returns the document afterwards.
fn commit(db: &PipelineDb, document: &Document, step: Step) -> anyhow::Result<Option<Document>> {
    let now = Utc::now();
    match step {
        Step::Next {
            update,
            job_type,
            payload,
        } => {
            if let Some(hash) = &update.content_hash
                && let Some(first) = db.duplicate_document(document.run_id, hash, document.id)?
            {
                let update = DocumentUpdate {
                    status: Some(DocumentStatus::Skipped),
                    error_log: Some(format!("duplicate of document {}", first)),
                    ..update
                };
                return db.update_document(document.id, &update, now);
            }
            db.advance_document(
                document.id,
                &update,
                &NewJob::ingest(document.run_id, job_type, document.id, payload),
                now,
            )
        }
        Step::Settle(update) => db.update_document(document.id, &update, now),
        Step::Store(chunks) => {
            db.store_document_chunks(document, &chunks, now)?;
            db.get_document(document.id)
        }
    }
}

fn document_id(job: &Job) -> Result<i64, JobError> {
    job.payload
        .get("document_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| JobError::Fatal(format!("{} job {} has no document_id", job.job_type.as_str(), job.id)))
}

/// Load the document a stage job points at, or `None` when the job should
/// do nothing.
async fn stage_document(ctx: &PipelineContext, job: &Job) -> Result<Option<Document>, JobError> {
    let id = document_id(job)?;
    let run_id = job.run_id;
    let loaded = ctx
        .db
        .call(move |db| Ok((db.get_run(run_id)?, db.get_document(id)?)))
        .await?;
    match loaded {
        (Some(run), Some(document)) if !run.status.is_terminal() => Ok(Some(document)),
        (Some(run), Some(_)) => {
            debug!(run_id, document_id = id, status = %run.status, "run is terminal, skipping ingest stage");
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn announce(ctx: &PipelineContext, document: &Document) {
    if document.status.is_final() {
        info!(
            run_id = document.run_id,
            document_id = document.id,
            status = document.status.as_str(),
            chunks_stored = document.chunks_stored,
            reason = ?document.error_log,
            "document settled"
        );
        ctx.events.emit(&RunEvent::DocumentSettled {
            run_id: document.run_id,
            document_id: document.id,
            status: document.status,
        });
    }
}

/// Execute one ingestion stage.
pub async fn run_stage(ctx: &PipelineContext, job: &Job) -> Result<(), JobError> {
    let Some(document) = stage_document(ctx, job).await? else {
        return Ok(());
    };
    if expected_status(job.job_type) != Some(document.status) {
        debug!(
            document_id = document.id,
            stage = job.job_type.as_str(),
            status = document.status.as_str(),
            "document is not at this stage, skipping"
        );
        return Ok(());
    }
    let step = process(job.job_type, &job.payload, &ctx.settings.ingest)?;
    debug!(document_id = document.id, stage = job.job_type.as_str(), "ingest stage processed");
    let updated = ctx.db.call(move |db| commit(db, &document, step)).await?;
    if let Some(document) = updated {
        announce(ctx, &document);
    }
    Ok(())
}

/// Mark a document `FAILED` after its stage job gave up.
pub async fn abandon_document(ctx: &PipelineContext, job: &Job, error: &str) -> Result<(), JobError> {
    let id = document_id(job)?;
    let error = error.to_string();
    let updated = ctx
        .db
        .call(move |db| {
            let Some(document) = db.get_document(id)? else {
                return Ok(None);
            };
            if document.status.is_final() {
                return Ok(None);
            }
            let update = DocumentUpdate {
                error_log: Some(error),
                ..DocumentUpdate::status(DocumentStatus::Failed)
            };
            db.update_document(id, &update, Utc::now())
        })
        .await?;
    if let Some(document) = updated {
        warn!(run_id = document.run_id, document_id = id, error = ?document.error_log, "document ingestion failed");
        announce(ctx, &document);
    }
    Ok(())
}

/// Register a document and enqueue its first stage.
pub async fn submit(ctx: &PipelineContext, run_id: i64, new: NewDocument) -> Result<Document, PipelineError> {
    if new.name.trim().is_empty() {
        return Err(PipelineError::Validation("document name is required".into()));
    }
    if new.content.trim().is_empty() {
        return Err(PipelineError::Validation("document content is empty".into()));
    }
    let raw = capped(&new.content, ctx.settings.ingest.max_text_chars);
    let document = ctx
        .db
        .call(move |db| {
            let Some(run) = db.get_run(run_id)? else {
                return Err(PipelineError::RunNotFound { id: run_id }.into());
            };
            if run.status.is_terminal() {
                return Err(PipelineError::RunTerminal {
                    id: run_id,
                    status: run.status_label(),
                }
                .into());
            }
            let subdomain = new
                .subdomain
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(new.name.trim());
            let now = Utc::now();
            let document = db.create_document(run_id, new.name.trim(), subdomain, now)?;
            db.enqueue_job(
                &NewJob::ingest(run_id, JobType::IngestExtract, document.id, json!({"text": raw})),
                now,
            )?;
            Ok(document)
        })
        .await
        .map_err(store_error)?;
    info!(run_id, document_id = document.id, name = %document.name, "document queued for ingestion");
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(topic: &str, words: usize) -> String {
        (0..words)
            .map(|i| format!("{}{}", topic, i % 37))
            .collect::<Vec<_>>()
            .join(" ")
            + "."
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            min_words: 50,
            chunk_target_words: 100,
            chunk_max_words: 200,
            max_text_chars: 100_000,
        }
    }

    #[test]
    fn test_stages_follow_each_other() {
        assert_eq!(expected_status(JobType::IngestExtract), Some(DocumentStatus::Queued));
        assert_eq!(expected_status(JobType::IngestStore), Some(DocumentStatus::Scored));
        assert_eq!(expected_status(JobType::Synthesis), None);
    }

    #[test]
    fn test_extract_skips_thin_pages() {
        let payload = json!({"text": "<html><body><p>Just a few words.</p></body></html>"});
        let step = process(JobType::IngestExtract, &payload, &settings()).unwrap();
        let Step::Settle(update) = step else {
            panic!("Expected the document to settle, got {:?}", step);
        };
        assert_eq!(update.status, Some(DocumentStatus::Skipped));
        assert_eq!(update.word_count, Some(4));
        assert!(update.error_log.unwrap().contains("4 words"));
    }

    #[test]
    fn test_extract_hands_text_to_clean() {
        let html = format!("<p>{}</p><script>var x = 1;</script>", paragraph("alpha", 120));
        let step = process(JobType::IngestExtract, &json!({"text": html}), &settings()).unwrap();
        let Step::Next {
            update,
            job_type,
            payload,
        } = step
        else {
            panic!("Expected a next stage");
        };
        assert_eq!(job_type, JobType::IngestClean);
        assert_eq!(update.status, Some(DocumentStatus::Extracted));
        assert_eq!(update.extraction_quality.as_deref(), Some("low"));
        assert!(!payload["text"].as_str().unwrap().contains("var x"));
    }

    #[test]
    fn test_clean_records_the_content_hash() {
        let text = [paragraph("alpha", 120), paragraph("beta", 120)].join("\n\n");
        let step = process(JobType::IngestClean, &json!({"text": text}), &settings()).unwrap();
        let Step::Next { update, job_type, .. } = step else {
            panic!("Expected a next stage");
        };
        assert_eq!(job_type, JobType::IngestChunk);
        assert_eq!(update.content_hash.unwrap().len(), 64);
    }

    #[test]
    fn test_score_drops_short_chunks_and_repeats() {
        let long = paragraph("gamma", 120);
        let payload = json!({"chunks": [long.clone(), "too short to keep", long]});
        let step = process(JobType::IngestScore, &payload, &settings()).unwrap();
        let Step::Next { update, payload, .. } = step else {
            panic!("Expected a next stage");
        };
        assert_eq!(update.chunks_kept, Some(1));
        let kept: Vec<HashedChunk> = serde_json::from_value(payload["chunks"].clone()).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 100);
    }

    #[test]
    fn test_score_with_nothing_left_settles_skipped() {
        let payload = json!({"chunks": ["tiny", "also tiny"]});
        let step = process(JobType::IngestScore, &payload, &settings()).unwrap();
        assert!(matches!(
            step,
            Step::Settle(DocumentUpdate {
                status: Some(DocumentStatus::Skipped),
                chunks_kept: Some(0),
                ..
            })
        ));
    }

    #[test]
    fn test_missing_payload_is_fatal() {
        let err = process(JobType::IngestChunk, &json!({}), &settings()).unwrap_err();
        assert!(!err.is_transient());
        let err = process(JobType::Synthesis, &json!({}), &settings()).unwrap_err();
        assert!(err.message().contains("not an ingest stage"));
    }
}
