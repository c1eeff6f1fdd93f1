use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Runs ──────────────────────────────────────────────────────────────

/// Lifecycle state of a run. The phase a run is in lives in the separate
/// `current_phase` counter; `label()` renders the combined legacy form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    PhaseComplete,
    Blocked,
    Failed,
    Cancelled,
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PhaseComplete => "phase_complete",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// States in which no automatic continuation may do further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Failed | Self::Cancelled)
    }

    /// Transition table. `Completed -> Running` is the recovery guard
    /// re-entering post-processing; `Failed -> Running` is an explicit
    /// operator resume.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(
                next,
                Running | PhaseComplete | Blocked | Failed | Cancelled | Completed
            ),
            PhaseComplete => matches!(next, Running | Failed | Cancelled),
            Completed => matches!(next, Running),
            Failed => matches!(next, Running),
            Blocked | Cancelled => false,
        }
    }

    /// Render `running_phase_N` / `phase_N_complete` style labels.
    pub fn label(&self, current_phase: i32) -> String {
        match self {
            Self::Running => format!("running_phase_{}", current_phase),
            Self::PhaseComplete => format!("phase_{}_complete", current_phase),
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "phase_complete" => Ok(Self::PhaseComplete),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// The seven ordered phases of a run. Each owns one `phase_results` key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DomainAnalysis,
    SourceDiscovery,
    QualityGate,
    DataAssessment,
    PatternDetection,
    Backtesting,
    Synthesis,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::DomainAnalysis,
        Phase::SourceDiscovery,
        Phase::QualityGate,
        Phase::DataAssessment,
        Phase::PatternDetection,
        Phase::Backtesting,
        Phase::Synthesis,
    ];

    pub fn number(&self) -> i32 {
        match self {
            Self::DomainAnalysis => 1,
            Self::SourceDiscovery => 2,
            Self::QualityGate => 3,
            Self::DataAssessment => 4,
            Self::PatternDetection => 5,
            Self::Backtesting => 6,
            Self::Synthesis => 7,
        }
    }

    pub fn from_number(n: i32) -> Option<Phase> {
        Self::ALL.iter().copied().find(|p| p.number() == n)
    }

    /// The `phase_results` key this phase writes.
    pub fn key(&self) -> &'static str {
        match self {
            Self::DomainAnalysis => "domain_analysis",
            Self::SourceDiscovery => "source_discovery",
            Self::QualityGate => "quality_gate",
            Self::DataAssessment => "data_assessment",
            Self::PatternDetection => "pattern_detection",
            Self::Backtesting => "backtesting",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Per-unit adjustment supplied at confirmation. Units are included unless
/// `include` is explicitly `false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitAdjustment {
    #[serde(default = "default_include")]
    pub include: bool,
}

fn default_include() -> bool {
    true
}

impl Default for UnitAdjustment {
    fn default() -> Self {
        Self { include: true }
    }
}

pub type Adjustments = BTreeMap<String, UnitAdjustment>;

/// How far research may reach. Sets the source budget and the sourcing
/// rules given to every research prompt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    /// Licensed and public sources only, official databases and open repositories.
    #[serde(alias = "estandar")]
    Standard,
    /// Preprints, patents, theses and ethical scraping, at least three languages.
    #[serde(alias = "profundo")]
    Deep,
    /// Every legal source in five or more languages.
    #[default]
    Total,
}

/// Budget attached to a [`Depth`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Budget {
    pub max_sources: usize,
    /// Estimated wall-clock range, in hours
    pub hours: (u32, u32),
    /// Research stops being worth it below this marginal gain
    pub marginal_gain_threshold: f64,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Deep => "deep",
            Self::Total => "total",
        }
    }

    pub fn budget(&self) -> Budget {
        match self {
            Self::Standard => Budget {
                max_sources: 500,
                hours: (2, 3),
                marginal_gain_threshold: 0.05,
            },
            Self::Deep => Budget {
                max_sources: 2_000,
                hours: (3, 5),
                marginal_gain_threshold: 0.02,
            },
            Self::Total => Budget {
                max_sources: 5_000,
                hours: (4, 8),
                marginal_gain_threshold: 0.0,
            },
        }
    }
}

impl std::fmt::Display for Depth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" | "estandar" => Ok(Self::Standard),
            "deep" | "profundo" => Ok(Self::Deep),
            "total" => Ok(Self::Total),
            _ => Err(format!("Invalid depth '{}'. Valid values: standard, deep, total", s)),
        }
    }
}

/// Parameters accepted when creating a run. Immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub geography: Option<String>,
    #[serde(default)]
    pub time_horizon: Option<String>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub user_datasets: Vec<String>,
    #[serde(default)]
    pub depth: Depth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub user_id: String,
    pub project_id: Option<String>,
    pub subject: String,
    pub geography: Option<String>,
    pub time_horizon: Option<String>,
    pub objective: Option<String>,
    pub user_datasets: Vec<String>,
    pub depth: Depth,
    pub status: RunStatus,
    pub current_phase: i32,
    pub phase_results: serde_json::Map<String, Value>,
    pub adjustments: Option<Adjustments>,
    pub gate_status: Option<GateStatus>,
    pub quality_gate: Option<Value>,
    pub confidence_cap: Option<f64>,
    pub build_verdict: Option<BuildVerdict>,
    pub model_verdict: Option<String>,
    pub dashboard: Option<Value>,
    pub sources_found: i64,
    pub data_points: i64,
    pub variables_found: i64,
    pub coverage_pct: f64,
    pub error_log: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Run {
    pub fn status_label(&self) -> String {
        self.status.label(self.current_phase)
    }

    pub fn has_phase_result(&self, phase: Phase) -> bool {
        self.phase_results.contains_key(phase.key())
    }
}

/// Cumulative counters recomputed from the store after each batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RunCounters {
    pub sources_found: i64,
    pub data_points: i64,
    pub variables_found: i64,
    pub coverage_pct: f64,
}

/// Partial update merged into a run. `None` fields are left untouched;
/// `phase_result` replaces only its own key inside `phase_results`.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub current_phase: Option<i32>,
    pub phase_result: Option<(Phase, Value)>,
    pub adjustments: Option<Adjustments>,
    pub gate_status: Option<GateStatus>,
    pub quality_gate: Option<Value>,
    pub confidence_cap: Option<f64>,
    pub build_verdict: Option<BuildVerdict>,
    pub model_verdict: Option<String>,
    pub dashboard: Option<Value>,
    pub counters: Option<RunCounters>,
    pub error_log: Option<String>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_phase(mut self, phase: i32) -> Self {
        self.current_phase = Some(phase);
        self
    }

    pub fn with_result(mut self, phase: Phase, result: Value) -> Self {
        self.phase_result = Some((phase, result));
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_log = Some(error.into());
        self
    }
}

// ── Quality verdicts ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Pass,
    PassConditional,
    Fail,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::PassConditional => "PASS_CONDITIONAL",
            Self::Fail => "FAIL",
        }
    }

    pub fn allows_continuation(&self) -> bool {
        !matches!(self, Self::Fail)
    }
}

impl FromStr for GateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Self::Pass),
            "PASS_CONDITIONAL" => Ok(Self::PassConditional),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("Invalid gate status: {}", s)),
        }
    }
}

/// Terminal verdict of the knowledge build, computed from measurable counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildVerdict {
    ProductionReady,
    GoodEnough,
    Incomplete,
    Degraded,
}

impl BuildVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProductionReady => "PRODUCTION_READY",
            Self::GoodEnough => "GOOD_ENOUGH",
            Self::Incomplete => "INCOMPLETE",
            Self::Degraded => "DEGRADED",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, Self::ProductionReady | Self::GoodEnough)
    }
}

impl FromStr for BuildVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRODUCTION_READY" => Ok(Self::ProductionReady),
            "GOOD_ENOUGH" => Ok(Self::GoodEnough),
            "INCOMPLETE" => Ok(Self::Incomplete),
            "DEGRADED" => Ok(Self::Degraded),
            _ => Err(format!("Invalid build verdict: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub id: i64,
    pub run_id: i64,
    pub check_type: String,
    pub verdict: String,
    pub score: f64,
    pub details: Value,
    pub created_at: String,
}

// ── Jobs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Retry,
    Done,
    Failed,
    Dlq,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Retry,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Dlq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Retry => "RETRY",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Dlq => "DLQ",
        }
    }

    /// Jobs in these states still hold (or will take) a slot for their work.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Retry)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "RETRY" => Ok(Self::Retry),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            "DLQ" => Ok(Self::Dlq),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DomainAnalysis,
    ResearchBatch,
    PostProcess,
    QualityGate,
    DataAssessment,
    PatternDetection,
    Backtesting,
    Synthesis,
    IngestExtract,
    IngestClean,
    IngestChunk,
    IngestScore,
    IngestStore,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DomainAnalysis => "domain_analysis",
            Self::ResearchBatch => "research_batch",
            Self::PostProcess => "post_process",
            Self::QualityGate => "quality_gate",
            Self::DataAssessment => "data_assessment",
            Self::PatternDetection => "pattern_detection",
            Self::Backtesting => "backtesting",
            Self::Synthesis => "synthesis",
            Self::IngestExtract => "ingest_extract",
            Self::IngestClean => "ingest_clean",
            Self::IngestChunk => "ingest_chunk",
            Self::IngestScore => "ingest_score",
            Self::IngestStore => "ingest_store",
        }
    }

    /// Stages of the document ingestion chain. Their failures stay with the
    /// document and never touch the run.
    pub fn is_ingest(&self) -> bool {
        matches!(
            self,
            Self::IngestExtract
                | Self::IngestClean
                | Self::IngestChunk
                | Self::IngestScore
                | Self::IngestStore
        )
    }

    /// Job type that executes a whole (non fan-out) phase.
    pub fn for_phase(phase: Phase) -> Option<JobType> {
        match phase {
            Phase::DomainAnalysis => Some(Self::DomainAnalysis),
            Phase::SourceDiscovery => None,
            Phase::QualityGate => Some(Self::QualityGate),
            Phase::DataAssessment => Some(Self::DataAssessment),
            Phase::PatternDetection => Some(Self::PatternDetection),
            Phase::Backtesting => Some(Self::Backtesting),
            Phase::Synthesis => Some(Self::Synthesis),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "domain_analysis" => Ok(Self::DomainAnalysis),
            "research_batch" => Ok(Self::ResearchBatch),
            "post_process" => Ok(Self::PostProcess),
            "quality_gate" => Ok(Self::QualityGate),
            "data_assessment" => Ok(Self::DataAssessment),
            "pattern_detection" => Ok(Self::PatternDetection),
            "backtesting" => Ok(Self::Backtesting),
            "synthesis" => Ok(Self::Synthesis),
            "ingest_extract" => Ok(Self::IngestExtract),
            "ingest_clean" => Ok(Self::IngestClean),
            "ingest_chunk" => Ok(Self::IngestChunk),
            "ingest_score" => Ok(Self::IngestScore),
            "ingest_store" => Ok(Self::IngestStore),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }
}

/// A job to insert. `dedupe_key` distinguishes jobs of the same type within
/// a run (for example the batch index); at most one active job exists per
/// `(run_id, job_type, dedupe_key)`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub run_id: i64,
    pub job_type: JobType,
    pub payload: Value,
    pub dedupe_key: String,
}

impl NewJob {
    pub fn phase(run_id: i64, job_type: JobType) -> Self {
        Self {
            run_id,
            job_type,
            payload: serde_json::json!({}),
            dedupe_key: String::new(),
        }
    }

    pub fn batch(run_id: i64, batch_index: usize) -> Self {
        Self {
            run_id,
            job_type: JobType::ResearchBatch,
            payload: serde_json::json!({ "batch_index": batch_index }),
            dedupe_key: format!("batch:{}", batch_index),
        }
    }

    pub fn chain(run_id: i64, chain_index: usize) -> Self {
        Self {
            run_id,
            job_type: JobType::PostProcess,
            payload: serde_json::json!({ "chain_index": chain_index }),
            dedupe_key: format!("chain:{}", chain_index),
        }
    }

    /// One stage of a document's ingestion. The stage's input travels in
    /// `payload` next to the document id.
    pub fn ingest(run_id: i64, job_type: JobType, document_id: i64, mut payload: Value) -> Self {
        if let Value::Object(map) = &mut payload {
            map.insert("document_id".into(), Value::from(document_id));
        }
        Self {
            run_id,
            job_type,
            payload,
            dedupe_key: format!("doc:{}", document_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub run_id: i64,
    pub job_type: JobType,
    pub payload: Value,
    pub dedupe_key: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub run_after: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

impl Job {
    /// Integer field from the payload, if present.
    pub fn payload_index(&self, field: &str) -> Option<usize> {
        self.payload
            .get(field)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub retry: i64,
    pub done: i64,
    pub failed: i64,
    pub dlq: i64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Retry => self.retry += count,
            JobStatus::Done => self.done += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Dlq => self.dlq += count,
        }
    }

    pub fn active(&self) -> i64 {
        self.pending + self.running + self.retry
    }
}

// ── Fan-out records ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Running,
    Completed,
    Failed,
    Orphaned,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Orphaned => "orphaned",
        }
    }

    /// Finished one way or the other. Orphaned units are not: they may still
    /// be alive, or be picked up again by resume.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for UnitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "orphaned" => Ok(Self::Orphaned),
            _ => Err(format!("Invalid unit status: {}", s)),
        }
    }
}

/// Per-(subdomain, level) research record of a fan-out batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRun {
    pub id: i64,
    pub run_id: i64,
    pub batch_index: i64,
    pub subdomain: String,
    pub level: String,
    pub status: UnitStatus,
    pub sources_found: i64,
    pub chunks_generated: i64,
    pub error_log: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewSource {
    pub name: String,
    pub url: Option<String>,
    pub source_type: String,
    pub reliability: f64,
    pub update_frequency: Option<String>,
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: i64,
    pub run_id: i64,
    pub batch_index: Option<i64>,
    pub subdomain: Option<String>,
    pub name: String,
    pub url: Option<String>,
    pub source_type: String,
    pub reliability: f64,
    pub update_frequency: Option<String>,
    pub tier: Option<String>,
    pub origin: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewChunk {
    pub content: String,
    pub topic: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub batch_index: i64,
    pub subdomain: String,
    pub content: String,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewVariable {
    pub name: String,
    pub variable_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewContradiction {
    pub claim_a: String,
    pub claim_b: String,
    pub severity: String,
}

/// Everything one research batch produced. Written atomically per batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    pub sources: Vec<NewSource>,
    pub chunks: Vec<NewChunk>,
    pub variables: Vec<NewVariable>,
    pub contradictions: Vec<NewContradiction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewSignal {
    pub layer_id: i64,
    pub layer_name: String,
    pub name: String,
    pub description: String,
    pub confidence: f64,
    pub impact: String,
    pub trend: String,
    pub devil_advocate: Option<String>,
    pub data_source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: i64,
    pub run_id: i64,
    pub layer_id: i64,
    pub layer_name: String,
    pub name: String,
    pub description: String,
    pub confidence: f64,
    pub impact: String,
    pub trend: String,
    pub devil_advocate: Option<String>,
    pub data_source: Option<String>,
}

// ── Post-processing ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainStep {
    KnowledgeGraph,
    Taxonomy,
    Contradictions,
    Quality,
}

impl ChainStep {
    pub const ALL: [ChainStep; 4] = [
        ChainStep::KnowledgeGraph,
        ChainStep::Taxonomy,
        ChainStep::Contradictions,
        ChainStep::Quality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KnowledgeGraph => "knowledge_graph",
            Self::Taxonomy => "taxonomy",
            Self::Contradictions => "contradictions",
            Self::Quality => "quality",
        }
    }
}

impl FromStr for ChainStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "knowledge_graph" => Ok(Self::KnowledgeGraph),
            "taxonomy" => Ok(Self::Taxonomy),
            "contradictions" => Ok(Self::Contradictions),
            "quality" => Ok(Self::Quality),
            _ => Err(format!("Invalid chain step: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub run_id: i64,
    pub step: ChainStep,
    pub unit_index: i64,
    pub subdomain: String,
    pub content: Value,
    pub is_error: bool,
    pub created_at: String,
}

impl Artifact {
    /// Counts toward the build verdict: a reasoning-backed step that did
    /// not error. Quality rows are computed locally and never count.
    pub fn is_usable(&self) -> bool {
        !self.is_error && self.step != ChainStep::Quality
    }
}

// ── Ingested documents ────────────────────────────────────────────────

/// Where a document is in the ingestion chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Queued,
    Extracted,
    Cleaned,
    Chunked,
    Scored,
    Stored,
    /// Too little text survived a stage, or the text duplicates another document
    Skipped,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Extracted => "EXTRACTED",
            Self::Cleaned => "CLEANED",
            Self::Chunked => "CHUNKED",
            Self::Scored => "SCORED",
            Self::Stored => "STORED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Stored | Self::Skipped | Self::Failed)
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "EXTRACTED" => Ok(Self::Extracted),
            "CLEANED" => Ok(Self::Cleaned),
            "CHUNKED" => Ok(Self::Chunked),
            "SCORED" => Ok(Self::Scored),
            "STORED" => Ok(Self::Stored),
            "SKIPPED" => Ok(Self::Skipped),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid document status: {}", s)),
        }
    }
}

/// A raw document handed to a run's knowledge base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDocument {
    pub name: String,
    /// Subdomain the chunks are filed under (default: the document name)
    #[serde(default)]
    pub subdomain: Option<String>,
    /// HTML or plain text
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub run_id: i64,
    pub name: String,
    pub subdomain: String,
    pub status: DocumentStatus,
    pub word_count: i64,
    pub extraction_quality: Option<String>,
    pub content_hash: Option<String>,
    pub chunks_total: i64,
    pub chunks_kept: i64,
    pub chunks_stored: i64,
    pub error_log: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Stage bookkeeping merged into a document row. `None` fields are kept.
#[derive(Debug, Clone, Default)]
pub struct DocumentUpdate {
    pub status: Option<DocumentStatus>,
    pub word_count: Option<i64>,
    pub extraction_quality: Option<String>,
    pub content_hash: Option<String>,
    pub chunks_total: Option<i64>,
    pub chunks_kept: Option<i64>,
    pub chunks_stored: Option<i64>,
    pub error_log: Option<String>,
}

impl DocumentUpdate {
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// A chunk ready to be filed into the knowledge base, keyed by the hash of
/// its normalized text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HashedChunk {
    pub content: String,
    pub content_hash: String,
    pub score: i64,
}

// ── Questions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: i64,
    pub run_id: i64,
    pub question: String,
    pub answer: String,
    /// Distinct subdomains of the chunks the answer drew on
    pub sources_used: Vec<String>,
    pub confidence: f64,
    pub created_at: String,
}

// ── Views ─────────────────────────────────────────────────────────────

/// Coherent status snapshot returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: Run,
    pub status_label: String,
    pub units: Vec<UnitRun>,
    pub job_counts: JobCounts,
    pub artifacts: i64,
    pub contradictions: i64,
    pub latest_quality_check: Option<QualityCheck>,
}
