//! Typed error hierarchy for phaseline.
//!
//! Four enums cover the seams where callers need to match on the failure:
//! - `PipelineError`: run record and orchestration failures
//! - `ReasoningError`: reasoning service calls (timeouts, rate limits, HTTP)
//! - `ParseError`: structured responses that could not be parsed
//! - `JobError`: handler outcome consumed by the dispatcher to pick
//!   retry, dead-letter or immediate failure

use thiserror::Error;

/// Errors from the run record manager and the pipeline controllers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Invalid run status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid run parameters: {0}")]
    Validation(String),

    #[error("Run {id} is not awaiting confirmation (status {status})")]
    NotAwaitingConfirmation { id: i64, status: String },

    #[error("Run {id} has no included units after applying adjustments")]
    NoActiveUnits { id: i64 },

    #[error("Run {id} is {status} and takes no new documents")]
    RunTerminal { id: i64, status: String },

    #[error("Reasoning call failed: {0}")]
    Reasoning(#[from] ReasoningError),

    #[error("Unusable reasoning response: {0}")]
    Malformed(#[from] ParseError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a reasoning service invocation.
#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("Reasoning call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Reasoning service rate limit exceeded")]
    RateLimited,

    #[error("Reasoning service rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Reasoning service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Reasoning transport error: {0}")]
    Transport(String),

    #[error("Reasoning service returned an empty response")]
    Empty,
}

impl ReasoningError {
    /// Timeouts, rate limits, transport hiccups and 5xx responses are worth
    /// retrying. Credential problems and 4xx responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ReasoningError::Timeout { .. }
            | ReasoningError::RateLimited
            | ReasoningError::Transport(_)
            | ReasoningError::Empty => true,
            ReasoningError::Http { status, .. } => *status >= 500,
            ReasoningError::Unauthorized(_) => false,
        }
    }
}

/// A structured response that could not be turned into the expected shape.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Response contains no JSON object")]
    NoJsonObject,

    #[error("Malformed JSON response: {message}")]
    Malformed { message: String },
}

/// Outcome classification for a failed job handler.
#[derive(Debug, Error)]
pub enum JobError {
    /// Retried with exponential backoff, dead-lettered once attempts run out.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Not retried. The job moves straight to `FAILED`.
    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Transient(msg) | JobError::Fatal(msg) => msg,
        }
    }
}

impl From<ReasoningError> for JobError {
    fn from(err: ReasoningError) -> Self {
        if err.is_transient() {
            JobError::Transient(err.to_string())
        } else {
            JobError::Fatal(err.to_string())
        }
    }
}

impl From<PipelineError> for JobError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Database(_) | PipelineError::Other(_) => {
                JobError::Transient(format!("{:#}", err))
            }
            PipelineError::Reasoning(inner) => inner.into(),
            other => JobError::Fatal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Transient(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_run_not_found_carries_id() {
        let err = PipelineError::RunNotFound { id: 42 };
        match &err {
            PipelineError::RunNotFound { id } => assert_eq!(*id, 42),
            _ => panic!("Expected RunNotFound"),
        }
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn pipeline_error_invalid_transition_names_both_states() {
        let err = PipelineError::InvalidTransition {
            from: "blocked".into(),
            to: "running".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("blocked"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn reasoning_timeout_and_rate_limit_are_transient() {
        assert!(ReasoningError::Timeout { secs: 50 }.is_transient());
        assert!(ReasoningError::RateLimited.is_transient());
        assert!(ReasoningError::Transport("reset".into()).is_transient());
    }

    #[test]
    fn reasoning_client_errors_are_not_transient() {
        assert!(!ReasoningError::Unauthorized("bad key".into()).is_transient());
        assert!(
            !ReasoningError::Http {
                status: 400,
                body: "bad".into()
            }
            .is_transient()
        );
        assert!(
            ReasoningError::Http {
                status: 503,
                body: "down".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn job_error_from_reasoning_error_keeps_class() {
        let job: JobError = ReasoningError::RateLimited.into();
        assert!(job.is_transient());
        let job: JobError = ReasoningError::Unauthorized("nope".into()).into();
        assert!(!job.is_transient());
        assert!(job.message().contains("nope"));
    }

    #[test]
    fn job_error_from_pipeline_validation_is_fatal() {
        let job: JobError = PipelineError::Validation("subject is required".into()).into();
        assert!(matches!(job, JobError::Fatal(_)));
    }

    #[test]
    fn job_error_from_database_error_is_transient() {
        let job: JobError = PipelineError::Database(anyhow::anyhow!("locked")).into();
        assert!(job.is_transient());
    }

    #[test]
    fn job_error_from_wrapped_reasoning_error_keeps_class() {
        let job: JobError = PipelineError::from(ReasoningError::Timeout { secs: 5 }).into();
        assert!(job.is_transient());
        let job: JobError = PipelineError::from(ParseError::NoJsonObject).into();
        assert!(!job.is_transient());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::RunNotFound { id: 1 });
        assert_std_error(&ReasoningError::Empty);
        assert_std_error(&ParseError::NoJsonObject);
        assert_std_error(&JobError::Fatal("x".into()));
    }
}
