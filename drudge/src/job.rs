//! The [`Job`] trait and the types describing how a job run ended.
//!
//! A job is a plain serializable value: its fields are the payload stored in the backend and
//! restored by the worker before [`Job::run`] is called.
//!
//! # Example
//!
//! ```
//! use drudge::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendWelcomeEmail {
//!     user_id: u64,
//! }
//!
//! #[async_trait]
//! impl Job for SendWelcomeEmail {
//!     const NAME: &'static str = "send_welcome_email";
//!     const QUEUE: &'static str = "emails";
//!     const MAX_ATTEMPTS: u16 = 3;
//!
//!     async fn run(&self) -> ExecutionResult {
//!         // deliver the message for self.user_id
//!         ExecutionResult::Done
//!     }
//! }
//! ```
use std::{error::Error, fmt::Display, str::FromStr};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod dispatch;
pub(crate) mod runner;

use crate::{backend::BackendError, rate_limit::RateLimit};
use dispatch::PendingDispatch;

/// The error type returned from [`Job::on_success`] and [`Job::on_failure`].
pub type HookError = Box<dyn Error + Send + Sync>;

/// A unit of work that can be dispatched to a backend and run by a worker.
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The stable identifier stored alongside the payload.
    ///
    /// The worker uses it to find the type a stored payload should be decoded into, so it must
    /// be unique among the jobs registered with a worker. Renaming the rust type does not break
    /// stored jobs as long as this stays the same.
    const NAME: &'static str;
    /// The queue the job is dispatched onto unless overridden with
    /// [`PendingDispatch::on_queue`].
    const QUEUE: &'static str = "default";
    /// How many times the job is run before it is recorded as failed.
    ///
    /// Rate limit denials count towards this budget.
    const MAX_ATTEMPTS: u16 = 1;
    /// The delay applied to every dispatch unless overridden with [`PendingDispatch::delay`].
    const DELAY: TimeDelta = TimeDelta::zero();

    /// Performs the work.
    async fn run(&self) -> ExecutionResult;

    /// How long to wait before the next attempt after a failed run.
    ///
    /// `attempts` is the number of attempts already made before the one that just failed.
    fn retry_after(&self, _attempts: u16) -> TimeDelta {
        TimeDelta::zero()
    }

    /// The rate limit the worker enforces before running this job, if any.
    ///
    /// Limits without an explicit key share the counter `job:{NAME}`.
    fn rate_limit(&self) -> Option<RateLimit> {
        None
    }

    /// Called once after a successful run.
    async fn on_success(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once when the job has failed its final attempt.
    async fn on_failure(&self, _failure: &JobFailure) -> Result<(), HookError> {
        Ok(())
    }

    /// Starts a dispatch of this job which can be customised before enqueuing.
    fn dispatch(self) -> PendingDispatch<Self> {
        PendingDispatch::new(self)
    }
}

/// The outcome of a single [`Job::run`].
pub enum ExecutionResult {
    /// The job completed and can be removed from the backend.
    Done,
    /// The job should be put back on its queue and retried after `delay`.
    ///
    /// This consumes an attempt.
    Release { delay: TimeDelta },
    /// The job failed.
    Error { error: Box<dyn ExecutionError> },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;
}

/// Identifier of a stored job.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on its queue, claimable once due.
    Pending,
    /// Claimed by a worker.
    Reserved,
    /// Moved to the failed store.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reserved => "reserved",
            Self::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "reserved" => Ok(Self::Reserved),
            "failed" => Ok(Self::Failed),
            other => Err(BackendError::Corrupt(format!("unknown job status {other:?}"))),
        }
    }
}

/// Why a job ended up in the failed store.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ErrorType {
    /// The job panicked while running.
    Panic,
    /// The job's attempts were used up by rate limit denials.
    RateLimited,
    /// The job kept releasing itself, or its reservation went stale on the final attempt, until
    /// no attempts were left.
    MaxAttemptsExceeded,
    /// No job with the stored name is registered with the worker.
    UnknownJob,
    /// The stored payload could not be decoded into the registered type.
    Decode,
    /// An [`ExecutionError`] returned from the job, tagged by [`ExecutionError::error_type`].
    Other(String),
}

impl ErrorType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Panic => "panic",
            Self::RateLimited => "rate_limited",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::UnknownJob => "unknown_job",
            Self::Decode => "decode",
            Self::Other(other) => other,
        }
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ErrorType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "panic" => Self::Panic,
            "rate_limited" => Self::RateLimited,
            "max_attempts_exceeded" => Self::MaxAttemptsExceeded,
            "unknown_job" => Self::UnknownJob,
            "decode" => Self::Decode,
            _ => Self::Other(value),
        }
    }
}

impl From<ErrorType> for String {
    fn from(value: ErrorType) -> Self {
        value.as_str().to_owned()
    }
}

/// The reason recorded when a job fails.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub error_type: ErrorType,
    pub message: String,
}

impl JobFailure {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl Error for JobFailure {}

impl From<Box<dyn ExecutionError>> for JobFailure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: ErrorType::from(value.error_type().to_owned()),
            message: value.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    #[derive(Debug)]
    pub(crate) struct MockError(pub &'static str);

    impl Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Error for MockError {}

    impl ExecutionError for MockError {
        fn error_type(&self) -> &'static str {
            "mock"
        }
    }

    #[test]
    fn execution_error_becomes_failure() {
        let result: ExecutionResult = MockError("smtp unreachable").into();
        let ExecutionResult::Error { error } = result else {
            panic!("expected an error result");
        };

        let failure = JobFailure::from(error);

        assert_eq!(failure.error_type, ErrorType::Other("mock".to_owned()));
        assert_eq!(failure.message, "smtp unreachable");
        assert_eq!(failure.to_string(), "mock: smtp unreachable");
    }

    #[test]
    fn error_type_string_form() {
        for error_type in [
            ErrorType::Panic,
            ErrorType::RateLimited,
            ErrorType::MaxAttemptsExceeded,
            ErrorType::UnknownJob,
            ErrorType::Decode,
            ErrorType::Other("timeout".to_owned()),
        ] {
            assert_eq!(ErrorType::from(String::from(error_type.clone())), error_type);
        }
    }

    #[test]
    fn job_status_parse() {
        assert_eq!("reserved".parse::<JobStatus>().unwrap(), JobStatus::Reserved);
        assert!("running".parse::<JobStatus>().is_err());
    }
}
