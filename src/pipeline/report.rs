//! Markdown export of a run.

use serde_json::Value;

use crate::store::{Phase, RunView, SignalRecord, SourceRecord, UnitStatus};

fn field(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn list_of<'a>(result: Option<&'a Value>, key: &str) -> Vec<&'a Value> {
    result
        .and_then(|r| r.get(key))
        .and_then(|v| v.as_array())
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

fn as_line(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("statement")
            .or_else(|| map.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Render the run, its sources and its signals as a markdown document.
pub fn render(view: &RunView, sources: &[SourceRecord], signals: &[SignalRecord]) -> String {
    let run = &view.run;
    let mut text = String::new();

    text.push_str(&format!("# {}\n\n", run.subject));
    text.push_str(&format!("- **Run:** {}\n", run.id));
    text.push_str(&format!("- **Status:** {}\n", view.status_label));
    text.push_str(&format!("- **Geography:** {}\n", field(run.geography.as_deref())));
    text.push_str(&format!("- **Time horizon:** {}\n", field(run.time_horizon.as_deref())));
    text.push_str(&format!("- **Objective:** {}\n", field(run.objective.as_deref())));
    text.push_str(&format!(
        "- **Gate:** {}\n",
        run.gate_status.map(|g| g.as_str()).unwrap_or("-")
    ));
    text.push_str(&format!(
        "- **Build verdict:** {}\n",
        run.build_verdict.map(|b| b.as_str()).unwrap_or("-")
    ));
    text.push_str(&format!("- **Model verdict:** {}\n", field(run.model_verdict.as_deref())));
    if let Some(cap) = run.confidence_cap {
        text.push_str(&format!("- **Confidence cap:** {:.0}%\n", cap * 100.0));
    }
    if let Some(error) = &run.error_log {
        text.push_str(&format!("- **Error:** {}\n", error));
    }
    text.push('\n');

    text.push_str("## Research\n\n");
    let completed = view
        .units
        .iter()
        .filter(|u| u.status == UnitStatus::Completed)
        .count();
    text.push_str(&format!(
        "{} of {} batches completed, {} sources, {} data points, {} variables, coverage {:.0}%.\n\n",
        completed,
        view.units.len(),
        run.sources_found,
        run.data_points,
        run.variables_found,
        run.coverage_pct
    ));

    if !sources.is_empty() {
        text.push_str("### Sources\n\n");
        text.push_str("| Name | Type | Reliability | Frequency | Origin |\n");
        text.push_str("|---|---|---|---|---|\n");
        for source in sources {
            let name = match &source.url {
                Some(url) => format!("[{}]({})", source.name, url),
                None => source.name.clone(),
            };
            text.push_str(&format!(
                "| {} | {} | {:.1} | {} | {} |\n",
                name,
                source.source_type,
                source.reliability,
                field(source.update_frequency.as_deref()),
                source.origin
            ));
        }
        text.push('\n');
    }

    if let Some(gate) = &run.quality_gate {
        text.push_str("## Quality gate\n\n");
        let gaps = list_of(Some(gate), "gaps");
        if gaps.is_empty() {
            text.push_str("No open gaps.\n\n");
        } else {
            for gap in gaps {
                text.push_str(&format!("- {}\n", as_line(gap)));
            }
            text.push('\n');
        }
    }

    if !signals.is_empty() {
        text.push_str("## Signals\n\n");
        for signal in signals {
            text.push_str(&format!(
                "- **{}** ({}, confidence {:.2}, {} / {}): {}\n",
                signal.name,
                signal.layer_name,
                signal.confidence,
                signal.impact,
                signal.trend,
                signal.description
            ));
            if let Some(against) = &signal.devil_advocate {
                text.push_str(&format!("  - Against: {}\n", against));
            }
        }
        text.push('\n');
    }

    let synthesis = run.phase_results.get(Phase::Synthesis.key());
    if synthesis.is_some() {
        text.push_str("## Synthesis\n\n");
        for (title, key) in [
            ("Hypotheses", "hypotheses"),
            ("Next actions", "next_actions"),
            ("Missing data", "missing_data"),
        ] {
            let items = list_of(synthesis, key);
            if items.is_empty() {
                continue;
            }
            text.push_str(&format!("### {}\n\n", title));
            for item in items {
                text.push_str(&format!("- {}\n", as_line(item)));
            }
            text.push('\n');
        }
    }

    text.push_str(&format!(
        "_Jobs: {} pending, {} running, {} retry, {} done, {} failed, {} dead-lettered._\n",
        view.job_counts.pending,
        view.job_counts.running,
        view.job_counts.retry,
        view.job_counts.done,
        view.job_counts.failed,
        view.job_counts.dlq
    ));
    text
}
