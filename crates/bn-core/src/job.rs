use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    #[serde(alias = "not_started")]
    NotStarted,
    #[serde(alias = "pending")]
    Pending,
    #[serde(alias = "complete")]
    Complete,
    #[serde(alias = "failed")]
    Failed,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::NotStarted => "not started",
            Self::Pending => "generating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Server-assigned job identifier, kept in the exact textual form the server sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(id) => Self(id),
            RawId::Number(id) => Self(id.to_string()),
        })
    }
}

/// Body of a job status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn pending() -> Self {
        Self { status: JobStatus::Pending, result: None, error: None }
    }

    pub fn complete(result: Value) -> Self {
        Self { status: JobStatus::Complete, result: Some(result), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: JobStatus::Failed, result: None, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// The server reported the job as failed.
    Server(String),
    /// Too many status queries in a row failed.
    PollingFailed,
    /// The job was still pending when the poll window closed.
    Timeout,
}

impl JobFailure {
    pub fn server(message: Option<String>) -> Self {
        Self::Server(message.unwrap_or_else(|| "Job failed on the server".to_string()))
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(message) => f.write_str(message),
            Self::PollingFailed => f.write_str("PollingFailed"),
            Self::Timeout => f.write_str("Timeout"),
        }
    }
}

/// One long-running server-side job as seen by the client.
///
/// The result payload and the failure are mutually exclusive and are only
/// ever set by leaving `Pending`. A new submission replaces the record
/// instead of editing its id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Job {
    job_id: Option<JobId>,
    status: JobStatus,
    result_payload: Option<Value>,
    failure: Option<JobFailure>,
    submitted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn not_started() -> Self {
        Self::default()
    }

    pub fn pending(job_id: JobId, submitted_at: DateTime<Utc>) -> Self {
        Self {
            job_id: Some(job_id),
            status: JobStatus::Pending,
            result_payload: None,
            failure: None,
            submitted_at: Some(submitted_at),
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result_payload(&self) -> Option<&Value> {
        self.result_payload.as_ref()
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    /// Moves a pending job to `Complete`. Returns false if the job was not pending.
    pub fn complete(&mut self, payload: Value) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Complete;
        self.result_payload = Some(payload);
        true
    }

    /// Moves a pending job to `Failed`. Returns false if the job was not pending.
    pub fn fail(&mut self, failure: JobFailure) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Failed;
        self.failure = Some(failure);
        true
    }

    pub fn reset(&mut self) {
        *self = Self::not_started();
    }
}
