//! SQLite persistence: run records, the job queue, research outputs,
//! ingested documents and the query log.

pub mod db;
pub mod documents;
pub mod jobs;
pub mod models;
pub mod queries;
pub mod research;

pub use db::{DbHandle, PipelineDb};
pub use jobs::{FailureKind, RetryPolicy};
pub use models::*;
pub use research::HealReport;
