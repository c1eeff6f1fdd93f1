//! Phase 3: quality gate.
//!
//! Metrics are computed over the source registry. While gaps remain and the
//! autocorrection budget lasts, supplementary sources aimed at the gaps are
//! registered and the metrics recomputed. The verdict is rendered from the
//! final metrics whether or not the gaps closed; `FAIL` blocks the run.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::research::source_from;
use crate::errors::{JobError, ParseError};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::events::RunEvent;
use crate::pipeline::parse::parse_json;
use crate::pipeline::prompts;
use crate::pipeline::routing::sector_table;
use crate::settings::GateSettings;
use crate::store::{GateStatus, JobType, NewJob, NewSource, Phase, RunStatus, RunUpdate, SourceRecord};

/// Update frequencies that count as fresh.
const FRESH_FREQUENCIES: [&str; 8] = [
    "daily",
    "weekly",
    "monthly",
    "quarterly",
    "annual",
    "biannual",
    "semi-annual",
    "yearly",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceMetrics {
    pub source_count: usize,
    pub coverage_pct: f64,
    pub freshness_pct: f64,
    pub source_diversity: usize,
    pub avg_reliability: f64,
}

pub fn compute_metrics(sources: &[SourceRecord], settings: &GateSettings) -> SourceMetrics {
    let count = sources.len();
    if count == 0 {
        return SourceMetrics {
            source_count: 0,
            coverage_pct: 0.0,
            freshness_pct: 0.0,
            source_diversity: 0,
            avg_reliability: 0.0,
        };
    }
    let fresh = sources
        .iter()
        .filter(|s| {
            s.update_frequency
                .as_deref()
                .map(|f| f.trim().to_lowercase())
                .is_some_and(|f| FRESH_FREQUENCIES.contains(&f.as_str()))
        })
        .count();
    let types: BTreeSet<String> = sources
        .iter()
        .map(|s| s.source_type.trim().to_lowercase())
        .collect();
    let reliability = sources.iter().map(|s| s.reliability).sum::<f64>() / count as f64;

    SourceMetrics {
        source_count: count,
        coverage_pct: (count as f64 * settings.coverage_per_source).min(100.0),
        freshness_pct: (fresh as f64 / count as f64 * 100.0).round(),
        source_diversity: types.len(),
        avg_reliability: (reliability * 10.0).round() / 10.0,
    }
}

pub fn find_gaps(metrics: &SourceMetrics, settings: &GateSettings) -> Vec<String> {
    let mut gaps = Vec::new();
    if metrics.coverage_pct < settings.pass_coverage {
        gaps.push(format!(
            "coverage {}% below {}%",
            metrics.coverage_pct, settings.pass_coverage
        ));
    }
    if metrics.freshness_pct < settings.min_freshness {
        gaps.push(format!(
            "freshness {}% below {}%",
            metrics.freshness_pct, settings.min_freshness
        ));
    }
    if metrics.source_diversity < settings.min_diversity {
        gaps.push(format!(
            "only {} source types, need {}",
            metrics.source_diversity, settings.min_diversity
        ));
    }
    if metrics.avg_reliability < settings.min_reliability {
        gaps.push(format!(
            "average reliability {} below {}",
            metrics.avg_reliability, settings.min_reliability
        ));
    }
    gaps
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub status: GateStatus,
    /// Ceiling, in percent, for confidence reported downstream.
    pub confidence_cap: u32,
}

/// Final verdict. Coverage decides once gaps remain after autocorrection.
pub fn decide(metrics: &SourceMetrics, gaps: &[String], settings: &GateSettings) -> GateDecision {
    let (status, confidence_cap) = if gaps.is_empty() || metrics.coverage_pct >= settings.pass_coverage {
        (GateStatus::Pass, settings.pass_cap)
    } else if metrics.coverage_pct >= settings.conditional_coverage {
        (GateStatus::PassConditional, settings.conditional_cap)
    } else {
        (GateStatus::Fail, 0)
    };
    GateDecision {
        status,
        confidence_cap,
    }
}

#[derive(Debug, Deserialize)]
struct SupplementaryResponse {
    #[serde(default)]
    sources: Vec<Value>,
}

pub fn parse_supplementary(raw: &str) -> Result<Vec<NewSource>, ParseError> {
    let parsed: SupplementaryResponse = parse_json(raw)?;
    Ok(parsed
        .sources
        .iter()
        .filter_map(source_from)
        .map(|mut s| {
            s.tier.get_or_insert_with(|| "supplementary".into());
            s
        })
        .collect())
}

/// One autocorrection round, kept for the gate report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Autocorrection {
    pub iteration: u32,
    pub origin: String,
    pub added: usize,
    pub coverage_pct: f64,
    pub gaps: Vec<String>,
}

pub async fn run(ctx: &PipelineContext, run_id: i64) -> Result<(), JobError> {
    let Some(run) = ctx.begin_phase(run_id, Phase::QualityGate).await? else {
        return Ok(());
    };
    let settings = ctx.settings.gate.clone();

    let mut sources = ctx.db.call(move |db| db.list_sources(run_id)).await?;
    let mut metrics = compute_metrics(&sources, &settings);
    let mut gaps = find_gaps(&metrics, &settings);
    let mut rounds: Vec<Autocorrection> = Vec::new();

    let sector = sector_table()?.route(&run.subject).category;
    let max_sources = run.depth.budget().max_sources;

    for iteration in 1..=settings.max_autocorrect_iterations {
        if gaps.is_empty() {
            break;
        }
        let room = max_sources.saturating_sub(sources.len());
        if room == 0 {
            info!(run_id, max_sources, depth = %run.depth, "source budget spent, autocorrection stops");
            break;
        }
        let prompt = prompts::supplementary_sources(&run, &gaps, &sources, settings.supplementary_limit);
        let (mut candidates, origin) = match ctx.invoke_json(&prompt).await {
            Ok(raw) => match parse_supplementary(&raw) {
                Ok(found) => (found, "reasoning"),
                Err(e) => {
                    warn!(run_id, iteration, error = %e, "supplementary search unusable, using curated catalogue");
                    (sector.supplementary_catalogue(), "catalogue")
                }
            },
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                warn!(run_id, iteration, error = %e, "supplementary search failed, using curated catalogue");
                (sector.supplementary_catalogue(), "catalogue")
            }
        };
        candidates.truncate(settings.supplementary_limit.min(room));

        let (added, refreshed) = ctx
            .db
            .call(move |db| {
                let added = db.add_supplementary_sources(run_id, &candidates, Utc::now())?;
                Ok((added, db.list_sources(run_id)?))
            })
            .await?;
        sources = refreshed;
        metrics = compute_metrics(&sources, &settings);
        gaps = find_gaps(&metrics, &settings);
        info!(run_id, iteration, added, coverage = metrics.coverage_pct, "autocorrection round finished");
        rounds.push(Autocorrection {
            iteration,
            origin: origin.to_string(),
            added,
            coverage_pct: metrics.coverage_pct,
            gaps: gaps.clone(),
        });
    }

    let decision = decide(&metrics, &gaps, &settings);
    let report = json!({
        "status": decision.status,
        "confidence_cap": decision.confidence_cap,
        "metrics": metrics,
        "gaps": gaps,
        "iterations": rounds.len(),
        "autocorrections": rounds,
    });

    let details = report.clone();
    ctx.db
        .call(move |db| {
            db.insert_quality_check(
                run_id,
                "gate",
                decision.status.as_str(),
                metrics.coverage_pct,
                &details,
                Utc::now(),
            )
        })
        .await?;

    let mut update = RunUpdate {
        gate_status: Some(decision.status),
        quality_gate: Some(report.clone()),
        ..RunUpdate::default()
    }
    .with_phase(Phase::QualityGate.number())
    .with_result(Phase::QualityGate, report);

    let next = if decision.status.allows_continuation() {
        update.status = Some(RunStatus::PhaseComplete);
        Some(NewJob::phase(run_id, JobType::DataAssessment))
    } else {
        update.status = Some(RunStatus::Blocked);
        update.model_verdict = Some("BLOCKED".into());
        update.error_log = Some(format!("quality gate failed: {}", gaps.join("; ")));
        None
    };
    ctx.records.finish_phase(run_id, update, next).await?;

    ctx.events.emit(&RunEvent::GateVerdict {
        run_id,
        status: decision.status,
        coverage_pct: metrics.coverage_pct,
    });
    info!(run_id, status = decision.status.as_str(), coverage = metrics.coverage_pct, "quality gate verdict");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, kind: &str, reliability: f64, frequency: Option<&str>) -> SourceRecord {
        SourceRecord {
            id: 0,
            run_id: 1,
            batch_index: Some(0),
            subdomain: None,
            name: name.into(),
            url: None,
            source_type: kind.into(),
            reliability,
            update_frequency: frequency.map(str::to_string),
            tier: None,
            origin: "research".into(),
        }
    }

    fn metrics(coverage: f64) -> SourceMetrics {
        SourceMetrics {
            source_count: 0,
            coverage_pct: coverage,
            freshness_pct: 100.0,
            source_diversity: 5,
            avg_reliability: 8.0,
        }
    }

    #[test]
    fn test_metrics_over_sources() {
        let sources = vec![
            source("a", "regulatory", 9.0, Some("Weekly")),
            source("b", "Regulatory", 7.0, Some("ad hoc")),
            source("c", "climate", 8.0, None),
            source("d", "news", 6.0, Some("semi-annual")),
        ];
        let m = compute_metrics(&sources, &GateSettings::default());
        assert_eq!(m.coverage_pct, 48.0);
        assert_eq!(m.freshness_pct, 50.0);
        assert_eq!(m.source_diversity, 3);
        assert_eq!(m.avg_reliability, 7.5);
    }

    #[test]
    fn test_coverage_saturates_at_100() {
        let sources: Vec<SourceRecord> = (0..20)
            .map(|i| source(&format!("s{}", i), "x", 8.0, Some("daily")))
            .collect();
        assert_eq!(compute_metrics(&sources, &GateSettings::default()).coverage_pct, 100.0);
    }

    #[test]
    fn test_no_sources_reports_every_gap() {
        let settings = GateSettings::default();
        let m = compute_metrics(&[], &settings);
        assert_eq!(find_gaps(&m, &settings).len(), 4);
    }

    #[test]
    fn test_coverage_65_fails() {
        let settings = GateSettings::default();
        let m = metrics(65.0);
        let gaps = find_gaps(&m, &settings);
        assert_eq!(gaps.len(), 1);
        let decision = decide(&m, &gaps, &settings);
        assert_eq!(decision.status, GateStatus::Fail);
        assert!(!decision.status.allows_continuation());
    }

    #[test]
    fn test_conditional_band_caps_at_60() {
        let settings = GateSettings::default();
        let m = metrics(76.0);
        let decision = decide(&m, &find_gaps(&m, &settings), &settings);
        assert_eq!(decision.status, GateStatus::PassConditional);
        assert_eq!(decision.confidence_cap, 60);
    }

    #[test]
    fn test_pass_with_remaining_gaps_when_coverage_high() {
        let settings = GateSettings::default();
        let mut m = metrics(84.0);
        m.source_diversity = 1;
        let gaps = find_gaps(&m, &settings);
        assert_eq!(gaps.len(), 1);
        let decision = decide(&m, &gaps, &settings);
        assert_eq!(decision.status, GateStatus::Pass);
        assert_eq!(decision.confidence_cap, 70);
    }

    #[test]
    fn test_parse_supplementary_tags_tier() {
        let found = parse_supplementary(
            r#"{"sources": [{"name": "AEMET", "type": "climate", "reliability": 8, "update_frequency": "daily"}, {"type": "no name"}]}"#,
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tier.as_deref(), Some("supplementary"));
        assert!(parse_supplementary("nothing").is_err());
    }
}
