//! Questions answered from a run's knowledge base.
//!
//! The question is reduced to keywords, matching chunks are fetched with a
//! substring search and the reasoning service answers from those chunks
//! alone. Every question is logged, including the ones the knowledge base
//! could not answer.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::context::PipelineContext;
use super::prompts;
use super::reasoning::InvokeOptions;
use super::run_record::store_error;
use crate::errors::PipelineError;
use crate::store::{ChunkRecord, QueryRecord};
use crate::util::truncate;

/// Answer given when no chunk matches the question.
pub const NO_DATA_ANSWER: &str =
    "The knowledge base does not hold enough data to answer this question.";

const EXCERPT_CHARS: usize = 200;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W+").unwrap());

static CONFIDENCE_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*"confidence"\s*:\s*([0-9]*\.?[0-9]+)\s*\}"#).unwrap());

/// A chunk an answer drew on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySource {
    pub subdomain: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub query_id: i64,
    pub answer: String,
    pub sources: Vec<QuerySource>,
    pub confidence: f64,
}

/// Lowercase words of more than three characters, in question order,
/// without repeats.
pub fn keywords(question: &str) -> Vec<String> {
    let lowered = question.to_lowercase();
    let mut words: Vec<String> = Vec::new();
    for word in NON_WORD.split(&lowered) {
        if word.chars().count() > 3 && !words.iter().any(|w| w == word) {
            words.push(word.to_string());
        }
    }
    words
}

/// Split the trailing `{"confidence": x}` off an answer. The value is
/// clamped to `[0, 1]`; `default` applies when the answer states none.
pub fn parse_confidence(answer: &str, default: f64) -> (String, f64) {
    let Some(captures) = CONFIDENCE_TAIL.captures(answer) else {
        return (answer.trim().to_string(), default);
    };
    let confidence = captures[1]
        .parse::<f64>()
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(default);
    let stripped = CONFIDENCE_TAIL.replace_all(answer, "");
    (stripped.trim().to_string(), confidence)
}

fn distinct_subdomains(chunks: &[ChunkRecord]) -> Vec<String> {
    let mut subdomains: Vec<String> = Vec::new();
    for chunk in chunks {
        if !subdomains.contains(&chunk.subdomain) {
            subdomains.push(chunk.subdomain.clone());
        }
    }
    subdomains
}

/// Answer `question` from the chunks of run `run_id`.
pub async fn answer(ctx: &PipelineContext, run_id: i64, question: &str) -> Result<QueryAnswer, PipelineError> {
    let question = question.trim().to_string();
    if question.is_empty() {
        return Err(PipelineError::Validation("question is required".into()));
    }
    let run = ctx.records.get(run_id).await?;
    let terms = keywords(&question);
    let limit = ctx.settings.query.max_chunks;
    let (total, chunks) = ctx
        .db
        .call(move |db| Ok((db.count_chunks(run_id, None)?, db.search_chunks(run_id, &terms, limit)?)))
        .await
        .map_err(store_error)?;
    if total == 0 {
        return Err(PipelineError::Validation(format!(
            "run {} has no knowledge base yet",
            run_id
        )));
    }

    let (text, confidence) = if chunks.is_empty() {
        (NO_DATA_ANSWER.to_string(), 0.0)
    } else {
        let prompt = prompts::query(&run, &question, &chunks);
        let options = InvokeOptions {
            max_tokens: ctx.settings.reasoning.max_tokens,
            temperature: ctx.settings.query.temperature,
            ..Default::default()
        };
        let raw = ctx.reasoning.invoke(&prompt, &options).await?;
        parse_confidence(&raw, ctx.settings.query.default_confidence)
    };

    let sources_used = distinct_subdomains(&chunks);
    let (logged_question, logged_answer) = (question.clone(), text.clone());
    let record: QueryRecord = ctx
        .db
        .call(move |db| {
            db.log_query(
                run_id,
                &logged_question,
                &logged_answer,
                &sources_used,
                confidence,
                Utc::now(),
            )
        })
        .await
        .map_err(store_error)?;
    info!(run_id, query_id = record.id, chunks = chunks.len(), confidence, "question answered");

    Ok(QueryAnswer {
        query_id: record.id,
        answer: text,
        sources: chunks
            .iter()
            .map(|chunk| QuerySource {
                subdomain: chunk.subdomain.clone(),
                excerpt: truncate(&chunk.content, EXCERPT_CHARS),
            })
            .collect(),
        confidence,
    })
}
