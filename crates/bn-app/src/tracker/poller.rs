use std::sync::{Arc, Mutex};
use std::time::Duration;
use bn_core::{JobId, JobStatus};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::{Instant, sleep, sleep_until};
use crate::api::JobApi;
use crate::error::TrackerError;
use super::cancel::{CancelHandle, CancelSignal, cancel_pair};
use super::lock;
use super::registry::{PollClaim, PollRegistry};
use super::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Complete(Value),
    Failed(Option<String>),
    PollingFailed { consecutive_failures: u32, last_error: String },
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PollState {
    #[default]
    Idle,
    Polling(JobId),
    Stopped(PollOutcome),
    Cancelled,
}

impl PollState {
    pub fn is_polling(&self) -> bool {
        matches!(self, Self::Polling(_))
    }
}

/// Receives every poller state transition, in order.
///
/// Called with the poller's lock held, so implementations must not call
/// back into the poller.
pub trait PollObserver: Send + Sync {
    fn on_transition(&self, job_id: &JobId, state: &PollState);
}

struct PollShared {
    state: PollState,
    epoch: u64,
    cancel: Option<CancelHandle>,
    claim: Option<PollClaim>,
}

/// Queries a job's status on an interval until it reaches a terminal
/// state, runs out of time, fails too often, or is cancelled.
pub struct JobPoller<A: JobApi> {
    api: Arc<A>,
    retry: RetryPolicy,
    max_consecutive_failures: u32,
    registry: PollRegistry,
    observer: Arc<dyn PollObserver>,
    shared: Arc<Mutex<PollShared>>,
}

impl<A: JobApi> JobPoller<A> {
    pub fn new(
        api: Arc<A>,
        retry: RetryPolicy,
        max_consecutive_failures: u32,
        registry: PollRegistry,
        observer: Arc<dyn PollObserver>,
    ) -> Self {
        Self {
            api,
            retry,
            max_consecutive_failures: max_consecutive_failures.max(1),
            registry,
            observer,
            shared: Arc::new(Mutex::new(PollShared {
                state: PollState::Idle,
                epoch: 0,
                cancel: None,
                claim: None,
            })),
        }
    }

    pub fn state(&self) -> PollState {
        lock(&self.shared).state.clone()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.shared).state.is_polling()
    }

    /// Starts the poll loop on the current tokio runtime. The first query is
    /// issued right away.
    pub fn start(&self, job_id: JobId, interval: Duration, max_duration: Duration) -> Result<(), TrackerError> {
        self.start_if(job_id, interval, max_duration, || true)
    }

    /// Like `start`, but asks `current` under the poller's lock whether the
    /// job is still wanted and fails with `Cancelled` if not. `current` must
    /// not call back into the poller.
    pub fn start_if(
        &self,
        job_id: JobId,
        interval: Duration,
        max_duration: Duration,
        current: impl FnOnce() -> bool,
    ) -> Result<(), TrackerError> {
        let mut shared = lock(&self.shared);
        if !current() {
            debug!("Not polling job {}, it was cancelled", job_id);
            return Err(TrackerError::Cancelled);
        }
        if shared.state.is_polling() {
            return Err(TrackerError::InvalidState("poller is already running"));
        }

        let claim = self.registry
            .claim(&job_id)
            .ok_or_else(|| TrackerError::AlreadyTracked(job_id.clone()))?;
        let (handle, signal) = cancel_pair();

        shared.epoch += 1;
        shared.state = PollState::Polling(job_id.clone());
        shared.cancel = Some(handle);
        shared.claim = Some(claim);
        self.observer.on_transition(&job_id, &shared.state);

        info!("Polling job {} every {}ms", job_id, interval.as_millis());

        let run = PollRun {
            api: Arc::clone(&self.api),
            retry: self.retry.clone(),
            max_consecutive_failures: self.max_consecutive_failures,
            interval,
            deadline: Instant::now() + max_duration,
            signal,
            sink: RunSink {
                job_id,
                epoch: shared.epoch,
                shared: Arc::clone(&self.shared),
                observer: Arc::clone(&self.observer),
            },
        };
        drop(shared);

        tokio::spawn(run.run());
        Ok(())
    }

    /// Stops the loop. Results still in flight are dropped. Returns false
    /// when there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        self.cancel_after(|| ()).1
    }

    /// Runs `before` under the poller's lock, then cancels. No `start_if`
    /// can slip in between. `before` must not call back into the poller.
    pub fn cancel_after<T>(&self, before: impl FnOnce() -> T) -> (T, bool) {
        let mut shared = lock(&self.shared);
        let value = before();
        let PollState::Polling(job_id) = &shared.state else {
            return (value, false);
        };
        let job_id = job_id.clone();

        shared.epoch += 1;
        if let Some(handle) = shared.cancel.take() {
            handle.cancel();
        }
        shared.claim = None;
        shared.state = PollState::Cancelled;
        self.observer.on_transition(&job_id, &shared.state);

        info!("Stopped polling job {}", job_id);
        (value, true)
    }
}

impl<A: JobApi> Drop for JobPoller<A> {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.epoch += 1;
        if let Some(handle) = shared.cancel.take() {
            handle.cancel();
        }
        shared.claim = None;
    }
}

/// Where a single poll loop reports to. Reports from a loop whose epoch is
/// no longer current are dropped.
struct RunSink {
    job_id: JobId,
    epoch: u64,
    shared: Arc<Mutex<PollShared>>,
    observer: Arc<dyn PollObserver>,
}

impl RunSink {
    fn is_current(&self) -> bool {
        let shared = lock(&self.shared);
        shared.epoch == self.epoch && shared.state.is_polling()
    }

    fn finish(&self, outcome: PollOutcome) {
        let mut shared = lock(&self.shared);
        if shared.epoch != self.epoch || !shared.state.is_polling() {
            debug!("Discarding stale outcome for job {}", self.job_id);
            return;
        }

        match &outcome {
            PollOutcome::Complete(_) => info!("Job {} complete", self.job_id),
            PollOutcome::Failed(err) => warn!("Job {} failed: {}", self.job_id, err.as_deref().unwrap_or("no reason given")),
            PollOutcome::PollingFailed { consecutive_failures, last_error } => warn!(
                "Giving up on job {} after {} failed status queries: {}",
                self.job_id, consecutive_failures, last_error
            ),
            PollOutcome::Timeout => warn!("Job {} timed out", self.job_id),
        }

        shared.state = PollState::Stopped(outcome);
        shared.cancel = None;
        shared.claim = None;
        self.observer.on_transition(&self.job_id, &shared.state);
    }
}

struct PollRun<A: JobApi> {
    api: Arc<A>,
    retry: RetryPolicy,
    max_consecutive_failures: u32,
    interval: Duration,
    deadline: Instant,
    signal: CancelSignal,
    sink: RunSink,
}

impl<A: JobApi> PollRun<A> {
    async fn run(self) {
        let PollRun { api, retry, max_consecutive_failures, interval, deadline, mut signal, sink } = self;
        let api: &A = &api;
        let job_id = &sink.job_id;
        let mut consecutive_failures = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = signal.cancelled() => return,
                _ = sleep_until(deadline) => {
                    sink.finish(PollOutcome::Timeout);
                    return;
                }
                result = retry.run(move || api.status(job_id)) => result,
            };

            if signal.is_cancelled() || !sink.is_current() {
                debug!("Dropping status of job {} that arrived after cancel", job_id);
                return;
            }

            match result {
                Ok(report) => {
                    consecutive_failures = 0;
                    match report.status {
                        JobStatus::Complete => {
                            sink.finish(PollOutcome::Complete(report.result.unwrap_or(Value::Null)));
                            return;
                        }
                        JobStatus::Failed => {
                            sink.finish(PollOutcome::Failed(report.error));
                            return;
                        }
                        JobStatus::Pending | JobStatus::NotStarted => {
                            debug!("Job {} still {}", job_id, report.status.label());
                        }
                    }
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(
                        "Status query for job {} failed ({}/{}): {}",
                        job_id, consecutive_failures, max_consecutive_failures, err
                    );
                    if consecutive_failures >= max_consecutive_failures {
                        sink.finish(PollOutcome::PollingFailed {
                            consecutive_failures,
                            last_error: err.to_string(),
                        });
                        return;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = signal.cancelled() => return,
                _ = sleep_until(deadline) => {
                    sink.finish(PollOutcome::Timeout);
                    return;
                }
                _ = sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bn_core::StatusReport;
    use serde_json::json;
    use crate::api::ApiError;
    use super::*;
    use super::super::retry::Backoff;
    use super::super::testing::{RecordingObserver, ScriptedApi, Step};

    const SECOND: Duration = Duration::from_secs(1);

    fn poller(api: &Arc<ScriptedApi>, observer: &Arc<RecordingObserver>) -> JobPoller<ScriptedApi> {
        poller_with_retry(api, observer, RetryPolicy::no_retry())
    }

    fn poller_with_retry(
        api: &Arc<ScriptedApi>,
        observer: &Arc<RecordingObserver>,
        retry: RetryPolicy,
    ) -> JobPoller<ScriptedApi> {
        JobPoller::new(
            Arc::clone(api),
            retry,
            3,
            PollRegistry::new(),
            Arc::clone(observer) as Arc<dyn PollObserver>,
        )
    }

    fn network_error() -> Step {
        Step::Reply(Err(ApiError::Network("connection reset".into())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_forever_times_out_at_max_duration() {
        let api = Arc::new(ScriptedApi::new());
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 10 * SECOND).unwrap();

        sleep(Duration::from_millis(9_500)).await;
        assert!(poller.is_polling());

        sleep(SECOND).await;
        assert_eq!(poller.state(), PollState::Stopped(PollOutcome::Timeout));
        assert_eq!(api.status_calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_queries_after_terminal_state() {
        let api = Arc::new(ScriptedApi::new().with_steps([
            Step::Reply(Ok(StatusReport::pending())),
            Step::Reply(Ok(StatusReport::complete(json!({ "design_url": "x" })))),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        sleep(5 * SECOND).await;

        assert_eq!(
            poller.state(),
            PollState::Stopped(PollOutcome::Complete(json!({ "design_url": "x" })))
        );
        sleep(60 * SECOND).await;
        assert_eq!(api.status_calls(), 2);
        assert_eq!(
            observer.states(),
            vec![
                PollState::Polling(JobId::new("d-1")),
                PollState::Stopped(PollOutcome::Complete(json!({ "design_url": "x" }))),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_failure_stops_polling() {
        let api = Arc::new(ScriptedApi::new().with_steps([Step::Reply(Ok(StatusReport::failed("unsafe prompt")))]));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        sleep(3 * SECOND).await;

        assert_eq!(
            poller.state(),
            PollState::Stopped(PollOutcome::Failed(Some("unsafe prompt".into())))
        );
        assert_eq!(api.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_stop_polling() {
        let api = Arc::new(ScriptedApi::new().with_steps([network_error(), network_error(), network_error()]));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        sleep(10 * SECOND).await;

        match poller.state() {
            PollState::Stopped(PollOutcome::PollingFailed { consecutive_failures, .. }) => {
                assert_eq!(consecutive_failures, 3)
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(api.status_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let api = Arc::new(ScriptedApi::new().with_steps([
            network_error(),
            network_error(),
            Step::Reply(Ok(StatusReport::pending())),
            network_error(),
            network_error(),
            Step::Reply(Ok(StatusReport::complete(json!("done")))),
        ]));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        sleep(10 * SECOND).await;

        assert_eq!(poller.state(), PollState::Stopped(PollOutcome::Complete(json!("done"))));
        assert_eq!(api.status_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counts_only_after_retries_exhausted() {
        let api = Arc::new(ScriptedApi::new().with_steps((0..6).map(|_| network_error())));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller_with_retry(&api, &observer, RetryPolicy::new(2, Backoff::Fixed(SECOND)));

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();

        sleep(Duration::from_millis(3_500)).await;
        assert!(poller.is_polling());
        assert_eq!(api.status_calls(), 4);

        sleep(20 * SECOND).await;
        match poller.state() {
            PollState::Stopped(PollOutcome::PollingFailed { consecutive_failures, .. }) => {
                assert_eq!(consecutive_failures, 3)
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(api.status_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_backoff() {
        let api = Arc::new(ScriptedApi::new().with_steps([network_error()]));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller_with_retry(&api, &observer, RetryPolicy::new(3, Backoff::Fixed(5 * SECOND)));

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        sleep(SECOND).await;
        assert_eq!(api.status_calls(), 1);

        assert!(poller.cancel());
        sleep(30 * SECOND).await;

        assert_eq!(api.status_calls(), 1);
        assert_eq!(poller.state(), PollState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_if_refuses_cancelled_job() {
        let api = Arc::new(ScriptedApi::new());
        let observer = Arc::new(RecordingObserver::default());
        let registry = PollRegistry::new();
        let poller = JobPoller::new(
            Arc::clone(&api),
            RetryPolicy::no_retry(),
            3,
            registry.clone(),
            Arc::clone(&observer) as Arc<dyn PollObserver>,
        );

        let err = poller.start_if(JobId::new("d-1"), SECOND, 60 * SECOND, || false).unwrap_err();
        assert_eq!(err, TrackerError::Cancelled);

        sleep(5 * SECOND).await;
        assert_eq!(poller.state(), PollState::Idle);
        assert_eq!(api.status_calls(), 0);
        assert!(observer.states().is_empty());
        assert!(!registry.is_claimed(&JobId::new("d-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_interrupts_slow_query() {
        let api = Arc::new(ScriptedApi::new().with_steps([Step::Delayed(
            30 * SECOND,
            Ok(StatusReport::complete(json!("late"))),
        )]));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 5 * SECOND).unwrap();
        sleep(40 * SECOND).await;

        assert_eq!(poller.state(), PollState::Stopped(PollOutcome::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_polling_is_rejected() {
        let api = Arc::new(ScriptedApi::new());
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        let err = poller.start(JobId::new("d-2"), SECOND, 60 * SECOND).unwrap_err();

        assert!(matches!(err, TrackerError::InvalidState(_)));
        assert_eq!(poller.state(), PollState::Polling(JobId::new("d-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_in_flight_result() {
        let api = Arc::new(ScriptedApi::new().with_steps([Step::Delayed(
            2 * SECOND,
            Ok(StatusReport::complete(json!("late"))),
        )]));
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(api.status_calls(), 1);

        assert!(poller.cancel());
        assert_eq!(poller.state(), PollState::Cancelled);

        sleep(10 * SECOND).await;
        assert_eq!(poller.state(), PollState::Cancelled);
        assert_eq!(
            observer.states(),
            vec![PollState::Polling(JobId::new("d-1")), PollState::Cancelled]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let api = Arc::new(ScriptedApi::new());
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        assert!(!poller.cancel());
        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        assert!(poller.cancel());
        assert!(!poller.cancel());
        assert!(!poller.cancel());

        assert_eq!(observer.states().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_runs_before_stopping() {
        let api = Arc::new(ScriptedApi::new());
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        let (seen, stopped) = poller.cancel_after(|| observer.states().len());

        assert_eq!(seen, 1);
        assert!(stopped);
        assert_eq!(poller.state(), PollState::Cancelled);
        assert_eq!(poller.cancel_after(|| "again"), ("again", false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_cancel() {
        let api = Arc::new(ScriptedApi::new());
        let observer = Arc::new(RecordingObserver::default());
        let poller = poller(&api, &observer);

        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();
        poller.cancel();
        poller.start(JobId::new("d-1"), SECOND, 60 * SECOND).unwrap();

        assert_eq!(poller.state(), PollState::Polling(JobId::new("d-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_blocks_second_poller_on_same_job() {
        let api = Arc::new(ScriptedApi::new());
        let observer = Arc::new(RecordingObserver::default());
        let registry = PollRegistry::new();
        let make = || {
            JobPoller::new(
                Arc::clone(&api),
                RetryPolicy::no_retry(),
                3,
                registry.clone(),
                Arc::clone(&observer) as Arc<dyn PollObserver>,
            )
        };
        let first = make();
        let second = make();

        first.start(JobId::new("shared"), SECOND, 60 * SECOND).unwrap();
        let err = second.start(JobId::new("shared"), SECOND, 60 * SECOND).unwrap_err();
        assert_eq!(err, TrackerError::AlreadyTracked(JobId::new("shared")));

        first.cancel();
        assert!(second.start(JobId::new("shared"), SECOND, 60 * SECOND).is_ok());
    }
}
