use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use bn_core::{DesignRequest, JobId, StatusReport};
use uuid::Uuid;
use crate::api::{ApiError, JobApi};
use crate::notify::{Notice, Notifier};
use super::lock;
use super::poller::{PollObserver, PollState};

pub(crate) enum Step {
    Reply(Result<StatusReport, ApiError>),
    Delayed(Duration, Result<StatusReport, ApiError>),
}

/// In-memory `JobApi` that replays scripted answers. Once the status
/// script runs out every query reports `Pending`.
#[derive(Default)]
pub(crate) struct ScriptedApi {
    steps: Mutex<VecDeque<Step>>,
    submissions: Mutex<VecDeque<Result<JobId, ApiError>>>,
    submit_delay: Duration,
    idempotency_keys: Mutex<Vec<Uuid>>,
    status_calls: AtomicUsize,
    submit_calls: AtomicUsize,
}

impl ScriptedApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        lock(&self.steps).extend(steps);
        self
    }

    pub(crate) fn with_submissions(self, results: impl IntoIterator<Item = Result<JobId, ApiError>>) -> Self {
        lock(&self.submissions).extend(results);
        self
    }

    pub(crate) fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn idempotency_keys(&self) -> Vec<Uuid> {
        lock(&self.idempotency_keys).clone()
    }
}

#[async_trait]
impl JobApi for ScriptedApi {
    type Request = DesignRequest;

    async fn submit(&self, _request: &DesignRequest, idempotency_key: Uuid) -> Result<JobId, ApiError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.idempotency_keys).push(idempotency_key);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let scripted = lock(&self.submissions).pop_front();
        scripted.unwrap_or_else(|| Ok(JobId::new(format!("job-{}", n))))
    }

    async fn status(&self, _job_id: &JobId) -> Result<StatusReport, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        let step = lock(&self.steps).pop_front();
        match step {
            None => Ok(StatusReport::pending()),
            Some(Step::Reply(result)) => result,
            Some(Step::Delayed(delay, result)) => {
                tokio::time::sleep(delay).await;
                result
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    states: Mutex<Vec<PollState>>,
}

impl RecordingObserver {
    pub(crate) fn states(&self) -> Vec<PollState> {
        lock(&self.states).clone()
    }
}

impl PollObserver for RecordingObserver {
    fn on_transition(&self, _job_id: &JobId, state: &PollState) {
        lock(&self.states).push(state.clone());
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub(crate) fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        lock(&self.notices).push(notice);
    }
}
