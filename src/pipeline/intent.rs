//! Translate a plain business request into a technical analysis brief.
//!
//! Stateless: nothing is stored and no run is involved. The brief is meant
//! to seed the subject and objective of a new run.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::context::PipelineContext;
use super::parse::parse_json;
use super::prompts;
use crate::errors::PipelineError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentRequest {
    pub sector: String,
    #[serde(default)]
    pub geography: Option<String>,
    #[serde(default)]
    pub time_horizon: Option<String>,
    /// What the user wants, in their own words
    #[serde(default)]
    pub objective: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TechnicalBrief {
    pub problem_definition: String,
    pub target_variable: String,
    pub predictive_variables: Vec<String>,
    pub recommended_model_type: String,
    pub success_metrics: Vec<String>,
    pub likely_data_sources: Vec<String>,
    pub risks_and_limitations: Vec<String>,
    pub suggested_baseline: String,
    pub prediction_horizons: Vec<String>,
    pub expanded_objective: String,
}

fn filled(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub async fn translate(ctx: &PipelineContext, request: &IntentRequest) -> Result<TechnicalBrief, PipelineError> {
    let sector = request.sector.trim();
    if sector.is_empty() {
        return Err(PipelineError::Validation("sector is required".into()));
    }
    let prompt = prompts::translate_intent(
        sector,
        filled(&request.geography),
        filled(&request.time_horizon),
        filled(&request.objective),
    );
    let raw = ctx.invoke_json(&prompt).await?;
    let brief: TechnicalBrief = parse_json(&raw)?;
    info!(sector, target = %brief.target_variable, "intent translated");
    Ok(brief)
}
