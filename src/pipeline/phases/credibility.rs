//! Advisory credibility scoring of detected signals.
//!
//! The reasoning service rates each signal on four dimensions; the weighted
//! score and class are computed here. Nothing downstream blocks on this
//! step: any failure is stored as `{"error": ...}` and the phase goes on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::research::{number, text};
use crate::errors::ParseError;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::parse::parse_json;
use crate::pipeline::prompts;
use crate::store::{Run, SignalRecord};

const W_STABILITY: f64 = 0.30;
const W_REPLICATION: f64 = 0.25;
const W_ANTICIPATION: f64 = 0.25;
const W_SIGNAL_TO_NOISE: f64 = 0.20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub stability: f64,
    pub replication: f64,
    pub anticipation: f64,
    pub signal_to_noise: f64,
}

impl DimensionScores {
    pub fn weighted(&self) -> f64 {
        let score = W_STABILITY * self.stability
            + W_REPLICATION * self.replication
            + W_ANTICIPATION * self.anticipation
            + W_SIGNAL_TO_NOISE * self.signal_to_noise;
        (score * 1000.0).round() / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredibilityClass {
    Alpha,
    Beta,
    Fragile,
    Noise,
}

impl CredibilityClass {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::Alpha
        } else if score >= 0.6 {
            Self::Beta
        } else if score >= 0.4 {
            Self::Fragile
        } else {
            Self::Noise
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Fragile => "fragile",
            Self::Noise => "noise",
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, Self::Alpha | Self::Beta)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCredibility {
    pub signal: String,
    pub dimensions: DimensionScores,
    pub score: f64,
    pub class: CredibilityClass,
}

#[derive(Debug, Deserialize)]
struct RawAssessments {
    #[serde(default)]
    assessments: Vec<Value>,
}

fn dimension(entry: &Value, key: &str) -> f64 {
    number(entry.get(key)).unwrap_or(0.0).clamp(0.0, 1.0)
}

/// Scores for the known signals. Assessments naming a signal that was not
/// detected are dropped.
pub fn parse_assessments(raw: &str, signals: &[SignalRecord]) -> Result<Vec<SignalCredibility>, ParseError> {
    let parsed: RawAssessments = parse_json(raw)?;
    Ok(parsed
        .assessments
        .iter()
        .filter_map(|entry| {
            let name = text(entry.get("signal"))?;
            let known = signals.iter().find(|s| s.name.eq_ignore_ascii_case(&name))?;
            let dimensions = DimensionScores {
                stability: dimension(entry, "stability"),
                replication: dimension(entry, "replication"),
                anticipation: dimension(entry, "anticipation"),
                signal_to_noise: dimension(entry, "signal_to_noise"),
            };
            let score = dimensions.weighted();
            Some(SignalCredibility {
                signal: known.name.clone(),
                dimensions,
                score,
                class: CredibilityClass::from_score(score),
            })
        })
        .collect())
}

pub fn class_counts(scored: &[SignalCredibility]) -> BTreeMap<&'static str, usize> {
    let mut counts: BTreeMap<&'static str, usize> = [
        CredibilityClass::Alpha,
        CredibilityClass::Beta,
        CredibilityClass::Fragile,
        CredibilityClass::Noise,
    ]
    .iter()
    .map(|c| (c.as_str(), 0))
    .collect();
    for entry in scored {
        *counts.entry(entry.class.as_str()).or_default() += 1;
    }
    counts
}

/// Alpha plus Beta signals recorded in a `pattern_detection` result.
pub fn strong_signal_count(pattern_result: Option<&Value>) -> u64 {
    let counts = pattern_result
        .and_then(|r| r.get("credibility"))
        .and_then(|c| c.get("counts"));
    let read = |class: CredibilityClass| {
        counts
            .and_then(|c| c.get(class.as_str()))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    read(CredibilityClass::Alpha) + read(CredibilityClass::Beta)
}

/// Run the credibility step. Always returns a value to nest under the
/// pattern detection result.
pub async fn assess(ctx: &PipelineContext, run: &Run, signals: &[SignalRecord]) -> Value {
    if signals.is_empty() {
        return json!({ "assessments": [], "counts": class_counts(&[]), "advisory": true });
    }
    let raw = match ctx.invoke_json(&prompts::credibility(run, signals)).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(run_id = run.id, error = %e, "credibility step failed");
            return json!({ "error": e.to_string() });
        }
    };
    match parse_assessments(&raw, signals) {
        Ok(scored) => json!({
            "assessments": scored,
            "counts": class_counts(&scored),
            "advisory": true,
        }),
        Err(e) => {
            warn!(run_id = run.id, error = %e, "credibility response unusable");
            json!({ "error": e.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(name: &str) -> SignalRecord {
        SignalRecord {
            id: 1,
            run_id: 1,
            layer_id: 1,
            layer_name: "macro".into(),
            name: name.into(),
            description: String::new(),
            confidence: 0.5,
            impact: "high".into(),
            trend: "up".into(),
            devil_advocate: None,
            data_source: None,
        }
    }

    #[test]
    fn test_weighted_score() {
        let scores = DimensionScores {
            stability: 1.0,
            replication: 0.8,
            anticipation: 0.6,
            signal_to_noise: 0.5,
        };
        // 0.30 + 0.20 + 0.15 + 0.10
        assert_eq!(scores.weighted(), 0.75);
    }

    #[test]
    fn test_class_thresholds() {
        assert_eq!(CredibilityClass::from_score(0.8), CredibilityClass::Alpha);
        assert_eq!(CredibilityClass::from_score(0.79), CredibilityClass::Beta);
        assert_eq!(CredibilityClass::from_score(0.6), CredibilityClass::Beta);
        assert_eq!(CredibilityClass::from_score(0.4), CredibilityClass::Fragile);
        assert_eq!(CredibilityClass::from_score(0.39), CredibilityClass::Noise);
    }

    #[test]
    fn test_parse_drops_unknown_signals_and_clamps() {
        let raw = r#"{"assessments": [
            {"signal": "FLU SEASON", "stability": 2, "replication": 1, "anticipation": 1, "signal_to_noise": 1},
            {"signal": "invented", "stability": 1}
        ]}"#;
        let scored = parse_assessments(raw, &[signal("flu season")]).unwrap();
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].signal, "flu season");
        assert_eq!(scored[0].score, 1.0);
        assert_eq!(scored[0].class, CredibilityClass::Alpha);
    }

    #[test]
    fn test_strong_signal_count_reads_nested_counts() {
        let result = json!({"credibility": {"counts": {"alpha": 1, "beta": 2, "fragile": 4}}});
        assert_eq!(strong_signal_count(Some(&result)), 3);
        assert_eq!(strong_signal_count(Some(&json!({"credibility": {"error": "x"}}))), 0);
        assert_eq!(strong_signal_count(None), 0);
    }
}
