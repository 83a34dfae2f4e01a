mod job;
mod request;

pub use job::{Job, JobFailure, JobId, JobStatus, StatusReport};
pub use request::{DesignRequest, JobRequest};
