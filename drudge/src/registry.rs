//! Mapping from stored job names to the types that run them.
use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde_json::Value;

use crate::{
    backend::JobRecord,
    job::{ErrorType, ExecutionResult, HookError, Job, JobFailure},
    rate_limit::RateLimit,
};

/// Object safe view of a [`Job`], produced by decoding a stored payload.
#[async_trait]
pub(crate) trait DynJob: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> ExecutionResult;
    fn retry_after(&self, attempts: u16) -> TimeDelta;
    fn rate_limit(&self) -> Option<RateLimit>;
    async fn on_success(&self) -> Result<(), HookError>;
    async fn on_failure(&self, failure: &JobFailure) -> Result<(), HookError>;
}

#[async_trait]
impl<J: Job> DynJob for J {
    fn name(&self) -> &'static str {
        J::NAME
    }

    async fn run(&self) -> ExecutionResult {
        Job::run(self).await
    }

    fn retry_after(&self, attempts: u16) -> TimeDelta {
        Job::retry_after(self, attempts)
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        Job::rate_limit(self)
    }

    async fn on_success(&self) -> Result<(), HookError> {
        Job::on_success(self).await
    }

    async fn on_failure(&self, failure: &JobFailure) -> Result<(), HookError> {
        Job::on_failure(self, failure).await
    }
}

type Decoder = fn(&Value) -> Result<Arc<dyn DynJob>, serde_json::Error>;

fn decode<J: Job>(payload: &Value) -> Result<Arc<dyn DynJob>, serde_json::Error> {
    Ok(Arc::new(J::deserialize(payload)?))
}

/// The set of job types a worker knows how to run.
///
/// ```
/// # use drudge::prelude::*;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # struct Ping;
/// # #[async_trait]
/// # impl Job for Ping {
/// #     const NAME: &'static str = "ping";
/// #     async fn run(&self) -> ExecutionResult { ExecutionResult::Done }
/// # }
/// let registry = JobRegistry::new().register::<Ping>();
/// assert!(registry.contains("ping"));
/// ```
#[derive(Clone, Default)]
pub struct JobRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `J` under [`Job::NAME`], replacing any earlier registration of that name.
    pub fn register<J: Job>(mut self) -> Self {
        if self.decoders.insert(J::NAME, decode::<J>).is_some() {
            tracing::warn!(job_type = J::NAME, "Job {} registered more than once", J::NAME);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Rebuilds the job stored in `record`.
    ///
    /// The error is the failure the record should be marked with.
    pub(crate) fn decode(&self, record: &JobRecord) -> Result<Arc<dyn DynJob>, JobFailure> {
        let decoder = self.decoders.get(record.job_type.as_str()).ok_or_else(|| {
            JobFailure::new(
                ErrorType::UnknownJob,
                format!("no job registered under the name {:?}", record.job_type),
            )
        })?;
        decoder(&record.payload).map_err(|error| {
            JobFailure::new(
                ErrorType::Decode,
                format!("failed to decode {} payload: {error}", record.job_type),
            )
        })
    }
}

impl Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::job::{JobId, JobStatus};

    #[derive(Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    #[async_trait]
    impl Job for Resize {
        const NAME: &'static str = "resize";

        async fn run(&self) -> ExecutionResult {
            ExecutionResult::Done
        }

        fn retry_after(&self, attempts: u16) -> TimeDelta {
            TimeDelta::seconds(i64::from(self.width) * i64::from(attempts))
        }
    }

    fn record(job_type: &str, payload: Value) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: JobId::from(1),
            queue: "default".to_owned(),
            job_type: job_type.to_owned(),
            payload,
            status: JobStatus::Reserved,
            attempts: 0,
            max_attempts: 1,
            available_at: now,
            reserved_at: Some(now),
            created_at: now,
        }
    }

    #[test]
    fn decode_registered_job() {
        let registry = JobRegistry::new().register::<Resize>();

        let job = registry
            .decode(&record("resize", serde_json::json!({ "width": 3 })))
            .unwrap();

        assert_eq!(job.name(), "resize");
        assert_eq!(job.retry_after(2), TimeDelta::seconds(6));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["resize"]);
    }

    #[test]
    fn decode_unknown_job() {
        let registry = JobRegistry::new().register::<Resize>();

        assert_matches!(
            registry.decode(&record("crop", Value::Null)).err(),
            Some(JobFailure { error_type: ErrorType::UnknownJob, .. })
        );
    }

    #[test]
    fn decode_malformed_payload() {
        let registry = JobRegistry::new().register::<Resize>();

        assert_matches!(
            registry
                .decode(&record("resize", serde_json::json!({ "height": 3 })))
                .err(),
            Some(JobFailure { error_type: ErrorType::Decode, .. })
        );
    }
}
