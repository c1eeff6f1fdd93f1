//! The seven-phase analysis pipeline.
//!
//! [`Pipeline`] is the operator-facing controller (create, confirm, status,
//! resume, cancel) and doubles as the [`crate::dispatch::JobHandler`] that
//! executes every job type. Phase 2 is split into a batch fan-out
//! ([`fanout`]) and a post-processing chain ([`postprocess`]); the other
//! phases live under [`phases`].
//!
//! Next to the phases, a run keeps a knowledge base: documents go through
//! the [`ingest`] jobs into the run's chunks, [`query`] answers questions
//! from them, and [`intent`] drafts a technical brief for a new run.

pub mod context;
pub mod events;
pub mod executor;
pub mod fanout;
pub mod ingest;
pub mod intent;
pub mod parse;
pub mod phases;
pub mod postprocess;
pub mod prompts;
pub mod query;
pub mod reasoning;
pub mod report;
pub mod routing;
pub mod run_record;
pub mod text;

pub use context::PipelineContext;
pub use events::{EventBus, RunEvent};
pub use executor::{Pipeline, ResumeOutcome};
pub use intent::{IntentRequest, TechnicalBrief};
pub use query::{QueryAnswer, QuerySource};
pub use reasoning::{HttpReasoningClient, ReasoningService, ScriptedReasoning, TimeoutReasoning};
