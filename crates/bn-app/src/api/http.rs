use std::marker::PhantomData;
use std::time::Duration;
use async_trait::async_trait;
use bn_core::{JobId, JobRequest, JobStatus, StatusReport};
use log::debug;
use reqwest::{Client, Response, Url};
use uuid::Uuid;
use crate::api::{ApiError, JobApi, JobCreateResponse};
use crate::config::TrackerConfig;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// `JobApi` over HTTP: `POST {base}/jobs` and `GET {base}/jobs/{id}`.
pub struct HttpJobApi<R> {
    client: Client,
    base_url: String,
    _request: PhantomData<fn(&R)>,
}

impl<R> HttpJobApi<R> {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|err| ApiError::Client(format!("bad base url {}: {}", base_url, err)))?;

        Ok(Self {
            client,
            base_url,
            _request: PhantomData,
        })
    }

    pub fn from_config(config: &TrackerConfig) -> Result<Self, ApiError> {
        Self::new(config.api_url.clone(), config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.base_url)
    }

    /// The id goes in as a single percent-encoded path segment.
    fn job_url(&self, job_id: &JobId) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.jobs_url()).map_err(|err| ApiError::Client(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Client(format!("{} cannot hold a path", self.base_url)))?
            .push(job_id.as_str());
        Ok(url)
    }
}

#[async_trait]
impl<R: JobRequest> JobApi for HttpJobApi<R> {
    type Request = R;

    #[tracing::instrument(skip(self, request))]
    async fn submit(&self, request: &R, idempotency_key: Uuid) -> Result<JobId, ApiError> {
        let response = self.client
            .post(self.jobs_url())
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(request)
            .send()
            .await?;

        let created: JobCreateResponse = ensure_success(response).await?.json().await?;
        debug!(
            "Server accepted job {} as {} ({:?})",
            created.id,
            created.status.unwrap_or(JobStatus::Pending).label(),
            created.message
        );

        Ok(created.id)
    }

    #[tracing::instrument(skip(self))]
    async fn status(&self, job_id: &JobId) -> Result<StatusReport, ApiError> {
        let response = self.client
            .get(self.job_url(job_id)?)
            .send()
            .await?;

        Ok(ensure_success(response).await?.json().await?)
    }
}

async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Http { status, body })
}
