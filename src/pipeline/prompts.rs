//! Prompt construction for every reasoning call site.
//!
//! Each builder returns a [`Prompt`] tagged with the task name that also
//! identifies the call in logs and in scripted test responses.

use std::fmt::Write as _;

use serde_json::Value;

use super::reasoning::Prompt;
use crate::store::{ChainStep, ChunkRecord, Depth, Run, SignalRecord, SourceRecord};

pub const TASK_DOMAIN_ANALYSIS: &str = "domain_analysis";
pub const TASK_RESEARCH_BATCH: &str = "research_batch";
pub const TASK_KNOWLEDGE_GRAPH: &str = "knowledge_graph";
pub const TASK_TAXONOMY: &str = "taxonomy";
pub const TASK_CONTRADICTIONS: &str = "contradictions";
pub const TASK_SUPPLEMENTARY_SOURCES: &str = "supplementary_sources";
pub const TASK_PATTERN_DETECTION: &str = "pattern_detection";
pub const TASK_CREDIBILITY: &str = "credibility";
pub const TASK_BACKTESTING: &str = "backtesting";
pub const TASK_ECONOMIC_IMPACT: &str = "economic_impact";
pub const TASK_SYNTHESIS: &str = "synthesis";
pub const TASK_QUERY: &str = "query";
pub const TASK_TRANSLATE_INTENT: &str = "translate_intent";

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else.";

/// The five signal layers pattern detection reports on, in order.
pub const SIGNAL_LAYERS: [&str; 5] = [
    "Obvious public signals",
    "Sector-specific signals",
    "Cross-domain signals",
    "Weak signals",
    "Speculative signals",
];

fn run_context(run: &Run) -> String {
    let mut out = format!("Subject: {}\n", run.subject);
    if let Some(geo) = &run.geography {
        let _ = writeln!(out, "Geography: {}", geo);
    }
    if let Some(horizon) = &run.time_horizon {
        let _ = writeln!(out, "Time horizon: {}", horizon);
    }
    if let Some(objective) = &run.objective {
        let _ = writeln!(out, "Objective: {}", objective);
    }
    if !run.user_datasets.is_empty() {
        let _ = writeln!(out, "User datasets: {}", run.user_datasets.join(", "));
    }
    out
}

/// Sourcing rules for a research depth.
fn depth_rules(depth: Depth) -> &'static str {
    match depth {
        Depth::Standard => {
            "Use only legal, public, licensed sources and respect copyright strictly. No \
             aggressive scraping: official academic databases, open repositories and public \
             government sources only."
        }
        Depth::Deep => {
            "Search in depth: preprints, patents, doctoral theses, government data, ethical \
             scraping, open access papers and institutional repositories, covering at least \
             three languages."
        }
        Depth::Total => {
            "Exhaustive coverage of every legal source that exists, in five or more \
             languages: complete academic databases, institutional repositories of every \
             country, theses, international patents, government data of every jurisdiction, \
             preprints, conference proceedings, public datasets, technical reports, \
             standards, clinical guidelines, meta-analyses, systematic reviews and grey \
             literature."
        }
    }
}

fn summary_of(analysis: Option<&Value>) -> String {
    analysis
        .and_then(|a| a.get("summary"))
        .and_then(|s| s.as_str())
        .unwrap_or("(no domain summary available)")
        .to_string()
}

pub fn domain_analysis(run: &Run) -> Prompt {
    let budget = run.depth.budget();
    Prompt::new(
        TASK_DOMAIN_ANALYSIS,
        format!(
            "You are a domain analyst preparing a research plan. Break the subject into \
             research subdomains, each with a technical name, a colloquial name and a \
             priority (high, medium, low). List the critical variables to track, define \
             the baseline the analysis compares against, and name the main risk factors.\n\
             {}\nBudget: at most {} sources, an estimated {} to {} hours.\n\
             Output shape: {{\"summary\": str, \"subdomains\": [{{\"name\": str, \
             \"colloquial\": str, \"priority\": str}}], \"critical_variables\": [str], \
             \"baseline_definition\": str, \"risk_factors\": [str]}}\n{}",
            depth_rules(run.depth),
            budget.max_sources,
            budget.hours.0,
            budget.hours.1,
            JSON_ONLY
        ),
        run_context(run),
    )
}

pub fn research_batch(run: &Run, analysis: Option<&Value>, subdomain: &str, level: &str) -> Prompt {
    Prompt::new(
        TASK_RESEARCH_BATCH,
        format!(
            "You are a research specialist working at the '{}' research level. Find \
             concrete sources, extract self-contained knowledge chunks, name the \
             variables they measure and flag claims that contradict each other.\n{}\n\
             Output shape: {{\"sources\": [{{\"name\": str, \"url\": str, \"type\": str, \
             \"reliability\": number 0-10, \"update_frequency\": str}}], \"chunks\": \
             [{{\"content\": str, \"topic\": str, \"confidence\": number 0-1}}], \
             \"variables\": [{{\"name\": str, \"type\": str, \"description\": str}}], \
             \"contradictions\": [{{\"claim_a\": str, \"claim_b\": str, \"severity\": str}}]}}\n{}",
            level,
            depth_rules(run.depth),
            JSON_ONLY
        ),
        format!(
            "{}Domain summary: {}\nSubdomain: {}\nResearch level: {}",
            run_context(run),
            summary_of(analysis),
            subdomain,
            level
        ),
    )
}

pub fn chain_step(run: &Run, step: ChainStep, subdomain: &str, chunks: &[ChunkRecord]) -> Option<Prompt> {
    let (task, instructions) = match step {
        ChainStep::KnowledgeGraph => (
            TASK_KNOWLEDGE_GRAPH,
            "Build a knowledge graph from the chunks. Output shape: {\"nodes\": [{\"id\": str, \
             \"label\": str, \"type\": str}], \"edges\": [{\"from\": str, \"to\": str, \
             \"relation\": str}]}",
        ),
        ChainStep::Taxonomy => (
            TASK_TAXONOMY,
            "Organise the chunks into a taxonomy. Output shape: {\"categories\": [{\"name\": \
             str, \"children\": [str]}]}",
        ),
        ChainStep::Contradictions => (
            TASK_CONTRADICTIONS,
            "Find claims in the chunks that contradict each other. Output shape: \
             {\"contradictions\": [{\"claim_a\": str, \"claim_b\": str, \"severity\": str, \
             \"resolution\": str}]}",
        ),
        ChainStep::Quality => return None,
    };

    let mut user = format!("{}Subdomain: {}\n\nChunks:\n", run_context(run), subdomain);
    for chunk in chunks {
        let _ = writeln!(user, "- [{}] {}", chunk.id, chunk.content);
    }
    Some(Prompt::new(
        task,
        format!("You are a knowledge engineer. {}\n{}", instructions, JSON_ONLY),
        user,
    ))
}

pub fn supplementary_sources(run: &Run, gaps: &[String], known: &[SourceRecord], limit: usize) -> Prompt {
    let known_names: Vec<&str> = known.iter().map(|s| s.name.as_str()).collect();
    Prompt::new(
        TASK_SUPPLEMENTARY_SOURCES,
        format!(
            "You are a data sourcing specialist. Propose at most {} additional sources \
             that close the listed evidence gaps. Prefer official, frequently updated \
             sources of types not yet covered. Never repeat a known source.\n\
             Output shape: {{\"sources\": [{{\"name\": str, \"url\": str, \"type\": str, \
             \"reliability\": number 0-10, \"update_frequency\": str}}]}}\n{}",
            limit, JSON_ONLY
        ),
        format!(
            "{}Gaps:\n- {}\nKnown sources: {}",
            run_context(run),
            gaps.join("\n- "),
            known_names.join(", ")
        ),
    )
}

pub fn pattern_detection(run: &Run, analysis: Option<&Value>, variables: &[String], cap: f64) -> Prompt {
    let layers: Vec<String> = SIGNAL_LAYERS
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{}. {}", i + 1, name))
        .collect();
    Prompt::new(
        TASK_PATTERN_DETECTION,
        format!(
            "You are a pattern analyst. Report signals that move the subject, grouped in \
             these layers:\n{}\nEvery signal needs a devil's advocate argument against it. \
             Confidence values must not exceed {:.2}.\n\
             Output shape: {{\"layers\": [{{\"layer_id\": int, \"layer_name\": str, \
             \"signals\": [{{\"name\": str, \"description\": str, \"confidence\": number 0-1, \
             \"impact\": str, \"trend\": str, \"devil_advocate\": str, \"data_source\": str}}]}}]}}\n{}",
            layers.join("\n"),
            cap,
            JSON_ONLY
        ),
        format!(
            "{}Domain summary: {}\nVariables observed: {}",
            run_context(run),
            summary_of(analysis),
            variables.join(", ")
        ),
    )
}

pub fn credibility(run: &Run, signals: &[SignalRecord]) -> Prompt {
    let mut user = run_context(run);
    user.push_str("Signals:\n");
    for signal in signals {
        let _ = writeln!(user, "- {} (layer {}): {}", signal.name, signal.layer_id, signal.description);
    }
    Prompt::new(
        TASK_CREDIBILITY,
        format!(
            "You are a sceptical reviewer. Score each signal from 0 to 1 on temporal \
             stability, replication across sources, anticipation (does it lead the \
             outcome) and signal-to-noise ratio.\n\
             Output shape: {{\"assessments\": [{{\"signal\": str, \"stability\": number, \
             \"replication\": number, \"anticipation\": number, \"signal_to_noise\": number}}]}}\n{}",
            JSON_ONLY
        ),
        user,
    )
}

pub fn backtesting(run: &Run, signals: &[SignalRecord]) -> Prompt {
    let names: Vec<&str> = signals.iter().map(|s| s.name.as_str()).collect();
    Prompt::new(
        TASK_BACKTESTING,
        format!(
            "You are a quantitative analyst. Estimate how the signals would have \
             performed on past periods. These are estimates, not computed results.\n\
             Output shape: {{\"metrics\": {{\"win_rate\": number, \"precision\": number, \
             \"recall\": number, \"max_drawdown\": number}}, \"cases\": [{{\"period\": str, \
             \"prediction\": str, \"outcome\": str}}], \"notes\": str}}\n{}",
            JSON_ONLY
        ),
        format!("{}Signals: {}", run_context(run), names.join(", ")),
    )
}

pub fn economic_impact(run: &Run, sector: &str, params: &Value) -> Prompt {
    Prompt::new(
        TASK_ECONOMIC_IMPACT,
        format!(
            "You are a business analyst. Using the sector parameters given, estimate the \
             economic impact of acting on the detected signals in three scenarios \
             (conservative, base, optimistic).\n\
             Output shape: {{\"scenarios\": [{{\"name\": str, \"revenue_impact_pct\": number, \
             \"roi_pct\": number, \"payback_months\": number}}], \"summary\": str}}\n{}",
            JSON_ONLY
        ),
        format!("{}Sector: {}\nParameters: {}", run_context(run), sector, params),
    )
}

pub fn synthesis(run: &Run, context: &Value) -> Prompt {
    Prompt::new(
        TASK_SYNTHESIS,
        format!(
            "You are the lead analyst. Turn the accumulated evidence into testable \
             hypotheses, list the next actions and the data still missing, and state \
             whether the model is VALID or NOT_RELIABLE_YET.\n\
             Output shape: {{\"hypotheses\": [{{\"statement\": str, \"confidence\": number 0-1, \
             \"supporting_signals\": [str]}}], \"verdict\": str, \"next_actions\": [str], \
             \"missing_data\": [str]}}\n{}",
            JSON_ONLY
        ),
        format!("{}Evidence: {}", run_context(run), context),
    )
}

/// Answer a question from retrieved chunks only, citing their subdomains.
pub fn query(run: &Run, question: &str, chunks: &[ChunkRecord]) -> Prompt {
    let mut context = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let _ = writeln!(
            context,
            "[Chunk {} | Subdomain: {}]\n{}\n",
            i + 1,
            chunk.subdomain,
            chunk.content
        );
    }
    Prompt::new(
        TASK_QUERY,
        format!(
            "You are an expert on {}. Answer ONLY from the documents provided. When the \
             documents do not contain the answer, say so. Cite every claim as \
             [Source: subdomain]. End your answer with a line holding only \
             {{\"confidence\": number 0-1}}.",
            run.subject
        ),
        format!("Documents:\n{}\nQuestion: {}", context, question),
    )
}

/// Expand a plain business request into a technical analysis brief.
pub fn translate_intent(
    sector: &str,
    geography: Option<&str>,
    time_horizon: Option<&str>,
    objective: Option<&str>,
) -> Prompt {
    Prompt::new(
        TASK_TRANSLATE_INTENT,
        format!(
            "You are a senior data and business intelligence analyst. Translate a simple \
             description of what a user wants into a complete technical request for a \
             pattern detection system. Predictive variables must be specific to the sector \
             and geography; data sources must be real and accessible; be honest about \
             limitations.\n\
             Output shape: {{\"problem_definition\": str, \"target_variable\": str, \
             \"predictive_variables\": [str], \"recommended_model_type\": str, \
             \"success_metrics\": [str], \"likely_data_sources\": [str], \
             \"risks_and_limitations\": [str], \"suggested_baseline\": str, \
             \"prediction_horizons\": [str], \"expanded_objective\": str (3-5 paragraphs)}}\n{}",
            JSON_ONLY
        ),
        format!(
            "Sector: {}\nGeography: {}\nTime horizon: {}\nObjective in the user's words: {}",
            sector,
            geography.unwrap_or("not specified"),
            time_horizon.unwrap_or("not specified"),
            objective.unwrap_or("not specified")
        ),
    )
}
