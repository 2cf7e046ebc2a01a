use std::sync::Arc;

use chrono::TimeDelta;
use tokio::task::JoinError;
use tracing::Instrument;

use crate::registry::DynJob;

use super::{ErrorType, ExecutionResult, HookError, JobFailure, JobId};

/// How a run ended once panics have been folded into failures.
#[derive(Debug)]
pub(crate) enum Outcome {
    Done,
    Release { delay: TimeDelta },
    Failed(JobFailure),
}

/// Runs the job on its own task so a panic surfaces as a failure instead of unwinding through
/// the caller.
pub(crate) async fn execute(job: Arc<dyn DynJob>) -> Outcome {
    let result = tokio::spawn(async move { job.run().await }.in_current_span()).await;
    match result {
        Ok(ExecutionResult::Done) => Outcome::Done,
        Ok(ExecutionResult::Release { delay }) => Outcome::Release { delay },
        Ok(ExecutionResult::Error { error }) => Outcome::Failed(error.into()),
        Err(error) => Outcome::Failed(error.into()),
    }
}

pub(crate) async fn after_success(job: Arc<dyn DynJob>, job_id: JobId) {
    let result = tokio::spawn(async move { job.on_success().await }.in_current_span()).await;
    report_hook("on_success", job_id, result);
}

pub(crate) async fn after_failure(job: Arc<dyn DynJob>, job_id: JobId, failure: JobFailure) {
    let result =
        tokio::spawn(async move { job.on_failure(&failure).await }.in_current_span()).await;
    report_hook("on_failure", job_id, result);
}

fn report_hook(
    hook: &'static str,
    job_id: JobId,
    result: Result<Result<(), HookError>, JoinError>,
) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(%job_id, hook, %error, "Hook {hook} for job {job_id} failed: {error}")
        }
        Err(error) => {
            let failure = JobFailure::from(error);
            tracing::warn!(%job_id, hook, %failure, "Hook {hook} for job {job_id} panicked: {failure}")
        }
    }
}

impl From<JoinError> for JobFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ErrorType::Panic,
            message,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::job::{test::MockError, ExecutionResult, Job};

    #[derive(Serialize, Deserialize)]
    enum Behaviour {
        Done,
        Release,
        Fail,
        Panic,
    }

    static FAILURE_HOOKS: AtomicUsize = AtomicUsize::new(0);

    #[async_trait]
    impl Job for Behaviour {
        const NAME: &'static str = "behaviour";

        async fn run(&self) -> ExecutionResult {
            match self {
                Self::Done => ExecutionResult::Done,
                Self::Release => ExecutionResult::Release {
                    delay: TimeDelta::seconds(5),
                },
                Self::Fail => MockError("nope").into(),
                Self::Panic => panic!("job panicked"),
            }
        }

        async fn on_success(&self) -> Result<(), HookError> {
            panic!("hook panicked")
        }

        async fn on_failure(&self, _failure: &JobFailure) -> Result<(), HookError> {
            FAILURE_HOOKS.fetch_add(1, Ordering::SeqCst);
            Err("hook failed".into())
        }
    }

    #[tokio::test]
    async fn execute_maps_results() {
        assert_matches!(execute(Arc::new(Behaviour::Done)).await, Outcome::Done);
        assert_matches!(
            execute(Arc::new(Behaviour::Release)).await,
            Outcome::Release { delay } if delay == TimeDelta::seconds(5)
        );
        assert_matches!(
            execute(Arc::new(Behaviour::Fail)).await,
            Outcome::Failed(JobFailure { error_type: ErrorType::Other(kind), message })
                if kind == "mock" && message == "nope"
        );
    }

    #[tokio::test]
    async fn execute_turns_panic_into_failure() {
        assert_matches!(
            execute(Arc::new(Behaviour::Panic)).await,
            Outcome::Failed(JobFailure { error_type: ErrorType::Panic, message })
                if message == "job panicked"
        );
    }

    #[tokio::test]
    async fn hooks_errors_and_panics_are_contained() {
        after_success(Arc::new(Behaviour::Done), JobId::from(1)).await;
        after_failure(
            Arc::new(Behaviour::Fail),
            JobId::from(1),
            JobFailure::new(ErrorType::Panic, "boom"),
        )
        .await;

        assert_eq!(FAILURE_HOOKS.load(Ordering::SeqCst), 1);
    }
}
