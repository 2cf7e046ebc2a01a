use std::collections::HashMap;

use chrono::{DateTime, Utc};
use drudge::{
    backend::{BackendError, FailedJob, JobRecord},
    job::JobId,
};

/// Hash fields written for a newly enqueued job.
pub(crate) fn fields(job: &JobRecord) -> Result<Vec<(&'static str, String)>, BackendError> {
    Ok(vec![
        ("queue", job.queue.clone()),
        ("job_type", job.job_type.clone()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("status", job.status.as_str().to_owned()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("available_at", job.available_at.timestamp_millis().to_string()),
        ("created_at", job.created_at.timestamp_millis().to_string()),
    ])
}

/// The `reserved_at` value a job hash must hold for `job` to still own its reservation.
pub(crate) fn reservation(job: &JobRecord) -> String {
    job.reserved_at
        .map(|at| at.timestamp_millis().to_string())
        .unwrap_or_default()
}

/// The contents of a job or failed job hash.
#[derive(Debug)]
pub(crate) struct Stored(pub(crate) HashMap<String, String>);

impl Stored {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn take(&mut self, field: &str) -> Result<String, BackendError> {
        self.0
            .remove(field)
            .ok_or_else(|| BackendError::Corrupt(format!("missing field {field}")))
    }

    fn parse<T: std::str::FromStr>(&mut self, field: &str) -> Result<T, BackendError> {
        let value = self.take(field)?;
        value
            .parse()
            .map_err(|_| BackendError::Corrupt(format!("invalid {field}: {value}")))
    }

    fn instant(&mut self, field: &str) -> Result<DateTime<Utc>, BackendError> {
        let millis = self.parse(field)?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| BackendError::Corrupt(format!("{field} out of range: {millis}")))
    }

    fn payload(&mut self) -> Result<serde_json::Value, BackendError> {
        Ok(serde_json::from_str(&self.take("payload")?)?)
    }

    pub(crate) fn into_record(mut self, id: JobId) -> Result<JobRecord, BackendError> {
        let reserved_at = match self.0.contains_key("reserved_at") {
            true => Some(self.instant("reserved_at")?),
            false => None,
        };
        Ok(JobRecord {
            id,
            queue: self.take("queue")?,
            job_type: self.take("job_type")?,
            payload: self.payload()?,
            status: self.take("status")?.parse()?,
            attempts: self.parse("attempts")?,
            max_attempts: self.parse("max_attempts")?,
            available_at: self.instant("available_at")?,
            reserved_at,
            created_at: self.instant("created_at")?,
        })
    }

    pub(crate) fn into_failed(mut self, id: JobId) -> Result<FailedJob, BackendError> {
        Ok(FailedJob {
            id,
            queue: self.take("queue")?,
            job_type: self.take("job_type")?,
            payload: self.payload()?,
            attempts: self.parse("attempts")?,
            max_attempts: self.parse("max_attempts")?,
            created_at: self.instant("created_at")?,
            error_type: self.take("error_type")?,
            message: self.take("message")?,
            failed_at: self.instant("failed_at")?,
        })
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use drudge::{
        backend::EnqueuableJob,
        job::JobStatus,
    };

    use super::*;

    fn record() -> JobRecord {
        let now = DateTime::from_timestamp_millis(1_714_521_600_123).unwrap();
        EnqueuableJob {
            queue: "mail".to_owned(),
            job_type: "send_mail".to_owned(),
            payload: serde_json::json!({ "to": "ada@example.com" }),
            max_attempts: 3,
            delay: TimeDelta::zero(),
        }
        .into_record(JobId::from(7), now)
    }

    fn stored(job: &JobRecord) -> Stored {
        Stored(
            fields(job)
                .unwrap()
                .into_iter()
                .map(|(field, value)| (field.to_owned(), value))
                .collect(),
        )
    }

    #[test]
    fn enqueued_fields_decode_to_pending_record() {
        let job = record();

        let decoded = stored(&job).into_record(job.id).unwrap();

        assert_eq!(decoded.status, JobStatus::Pending);
        assert_eq!(decoded.payload, job.payload);
        assert_eq!(decoded.available_at, job.available_at);
        assert_eq!(decoded.reserved_at, None);
    }

    #[test]
    fn missing_fields_are_corrupt() {
        let job = record();
        let mut hash = stored(&job);
        hash.0.remove("queue");

        assert!(matches!(
            hash.into_record(job.id),
            Err(BackendError::Corrupt(_))
        ));
    }

    #[test]
    fn reservation_matches_stored_reserved_at() {
        let mut job = record();
        assert_eq!(reservation(&job), "");

        job.reserved_at = DateTime::from_timestamp_millis(1_714_521_660_000);
        assert_eq!(reservation(&job), "1714521660000");
    }

    #[test]
    fn reserved_at_is_read_when_present() {
        let job = record();
        let mut hash = stored(&job);
        hash.0.insert("status".to_owned(), "reserved".to_owned());
        hash.0.insert("reserved_at".to_owned(), "1714521660000".to_owned());

        let decoded = hash.into_record(job.id).unwrap();

        assert_eq!(decoded.status, JobStatus::Reserved);
        assert_eq!(
            decoded.reserved_at,
            DateTime::from_timestamp_millis(1_714_521_660_000)
        );
    }
}
