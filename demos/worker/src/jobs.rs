use drudge::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const RETRY_BACKOFF: Backoff = Backoff::exponential(TimeDelta::seconds(2))
    .with_max(TimeDelta::minutes(5))
    .with_jitter(Jitter::Relative(0.2));

/// Pretends to deliver an email, refusing addresses without an `@`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendMail {
    pub to: String,
    pub subject: String,
}

#[derive(Debug, Error)]
#[error("cannot deliver to {0:?}")]
pub struct Undeliverable(String);

impl ExecutionError for Undeliverable {
    fn error_type(&self) -> &'static str {
        "undeliverable"
    }
}

#[async_trait]
impl Job for SendMail {
    const NAME: &'static str = "send_mail";
    const QUEUE: &'static str = "mail";
    const MAX_ATTEMPTS: u16 = 3;

    async fn run(&self) -> ExecutionResult {
        if !self.to.contains('@') {
            return Undeliverable(self.to.clone()).into();
        }
        tracing::info!(to = %self.to, subject = %self.subject, "Sent mail");
        ExecutionResult::Done
    }

    fn retry_after(&self, attempts: u16) -> TimeDelta {
        RETRY_BACKOFF.delay(attempts)
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        Some(RateLimit::allow(10).minutes(1))
    }

    async fn on_failure(&self, failure: &JobFailure) -> Result<(), HookError> {
        tracing::warn!(to = %self.to, %failure, "Giving up on mail");
        Ok(())
    }
}
