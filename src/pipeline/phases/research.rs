//! Parsing of one research batch response into store rows.

use serde::Deserialize;
use serde_json::Value;

use crate::errors::ParseError;
use crate::pipeline::parse::parse_json;
use crate::store::{BatchOutput, NewChunk, NewContradiction, NewSource, NewVariable};

#[derive(Debug, Deserialize)]
struct RawBatch {
    #[serde(default)]
    sources: Option<Vec<Value>>,
    #[serde(default)]
    chunks: Option<Vec<Value>>,
    #[serde(default)]
    variables: Option<Vec<Value>>,
    #[serde(default)]
    contradictions: Option<Vec<Value>>,
}

/// Numbers sometimes arrive as strings ("8", "0.7").
pub(crate) fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn source_from(entry: &Value) -> Option<NewSource> {
    let name = text(entry.get("name"))?;
    Some(NewSource {
        name,
        url: text(entry.get("url")),
        source_type: text(entry.get("type").or_else(|| entry.get("source_type")))
            .unwrap_or_else(|| "unknown".into())
            .to_lowercase(),
        reliability: number(entry.get("reliability"))
            .unwrap_or(5.0)
            .clamp(0.0, 10.0),
        update_frequency: text(entry.get("update_frequency")).map(|f| f.to_lowercase()),
        tier: text(entry.get("tier")),
    })
}

fn chunk_from(entry: &Value) -> Option<NewChunk> {
    if let Some(content) = entry.as_str() {
        let content = content.trim();
        return (!content.is_empty()).then(|| NewChunk {
            content: content.to_string(),
            ..Default::default()
        });
    }
    Some(NewChunk {
        content: text(entry.get("content"))?,
        topic: text(entry.get("topic")),
        confidence: number(entry.get("confidence")).map(|c| c.clamp(0.0, 1.0)),
    })
}

fn variable_from(entry: &Value) -> Option<NewVariable> {
    if let Some(name) = entry.as_str() {
        return Some(NewVariable {
            name: name.trim().to_string(),
            variable_type: "unknown".into(),
            description: None,
        })
        .filter(|v| !v.name.is_empty());
    }
    Some(NewVariable {
        name: text(entry.get("name"))?,
        variable_type: text(entry.get("type")).unwrap_or_else(|| "unknown".into()),
        description: text(entry.get("description")),
    })
}

fn contradiction_from(entry: &Value) -> Option<NewContradiction> {
    Some(NewContradiction {
        claim_a: text(entry.get("claim_a"))?,
        claim_b: text(entry.get("claim_b"))?,
        severity: text(entry.get("severity")).unwrap_or_else(|| "medium".into()),
    })
}

/// Parse a research response. Entries missing their required fields are
/// dropped; a response with none of the expected sections is malformed.
pub fn parse_batch_output(raw: &str) -> Result<BatchOutput, ParseError> {
    let parsed: RawBatch = parse_json(raw)?;
    if parsed.sources.is_none()
        && parsed.chunks.is_none()
        && parsed.variables.is_none()
        && parsed.contradictions.is_none()
    {
        return Err(ParseError::Malformed {
            message: "response has none of sources, chunks, variables, contradictions".into(),
        });
    }
    Ok(BatchOutput {
        sources: parsed
            .sources
            .unwrap_or_default()
            .iter()
            .filter_map(source_from)
            .collect(),
        chunks: parsed
            .chunks
            .unwrap_or_default()
            .iter()
            .filter_map(chunk_from)
            .collect(),
        variables: parsed
            .variables
            .unwrap_or_default()
            .iter()
            .filter_map(variable_from)
            .collect(),
        contradictions: parsed
            .contradictions
            .unwrap_or_default()
            .iter()
            .filter_map(contradiction_from)
            .collect(),
    })
}
