use chrono::{DateTime, Utc};
use drudge::{
    backend::{BackendError, FailedJob, JobRecord},
    job::JobId,
};
use sqlx::prelude::FromRow;

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct Failed {
    pub id: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub error_type: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

fn attempts(value: i32, column: &str) -> Result<u16, BackendError> {
    u16::try_from(value).map_err(|_| BackendError::Corrupt(format!("{column} out of range: {value}")))
}

impl TryFrom<Job> for JobRecord {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: JobId::from(value.id),
            queue: value.queue,
            job_type: value.job_type,
            payload: value.payload,
            status: value.status.parse()?,
            attempts: attempts(value.attempts, "attempts")?,
            max_attempts: attempts(value.max_attempts, "max_attempts")?,
            available_at: value.available_at,
            reserved_at: value.reserved_at,
            created_at: value.created_at,
        })
    }
}

impl TryFrom<Failed> for FailedJob {
    type Error = BackendError;

    fn try_from(value: Failed) -> Result<Self, Self::Error> {
        Ok(Self {
            id: JobId::from(value.id),
            queue: value.queue,
            job_type: value.job_type,
            payload: value.payload,
            attempts: attempts(value.attempts, "attempts")?,
            max_attempts: attempts(value.max_attempts, "max_attempts")?,
            created_at: value.created_at,
            error_type: value.error_type,
            message: value.message,
            failed_at: value.failed_at,
        })
    }
}
