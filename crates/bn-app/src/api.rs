mod error;
mod http;
mod schemas;

use async_trait::async_trait;
use bn_core::{JobId, JobRequest, StatusReport};
use uuid::Uuid;

pub use error::ApiError;
pub use http::HttpJobApi;
pub use schemas::JobCreateResponse;

/// The REST job API the tracker drives.
#[async_trait]
pub trait JobApi: Send + Sync + 'static {
    type Request: JobRequest;

    /// Creates a job. Not idempotent, so callers must not retry it blindly.
    async fn submit(&self, request: &Self::Request, idempotency_key: Uuid) -> Result<JobId, ApiError>;

    async fn status(&self, job_id: &JobId) -> Result<StatusReport, ApiError>;
}
