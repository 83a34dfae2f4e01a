use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use bn_core::{Job, JobFailure, JobId, JobRequest, JobStatus};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use crate::api::JobApi;
use crate::error::TrackerError;
use crate::events::TrackerEvent;
use crate::notify::{Notice, Notifier};
use poller::{JobPoller, PollObserver, PollOutcome, PollState};
use registry::PollRegistry;
use retry::RetryPolicy;

pub mod poller;
pub mod registry;
pub mod retry;
mod cancel;
#[cfg(test)]
mod testing;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    pub max_poll_duration: Duration,
    pub max_consecutive_failures: u32,
    pub retry: RetryPolicy,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_poll_duration: Duration::from_secs(300),
            max_consecutive_failures: 3,
            retry: RetryPolicy::default(),
        }
    }
}

struct SlotState {
    job: Job,
    /// Bumped by every cancel; work started under an older epoch is stale.
    epoch: u64,
    /// Epoch of the submission currently waiting on the server, if any.
    submitting: Option<u64>,
}

/// The tracked job plus the outward channels. Also the poller's observer.
struct JobSlot {
    state: Mutex<SlotState>,
    events: UnboundedSender<TrackerEvent>,
    notifier: Arc<dyn Notifier>,
}

impl JobSlot {
    /// Must be called with `state` locked so events keep transition order.
    fn publish(&self, job: &Job) {
        if self.events.send(TrackerEvent::from_snapshot(job.clone())).is_err() {
            debug!("Nobody is listening for tracker events");
        }
    }
}

impl PollObserver for JobSlot {
    fn on_transition(&self, job_id: &JobId, state: &PollState) {
        let PollState::Stopped(outcome) = state else {
            return;
        };

        let mut slot = lock(&self.state);
        if slot.job.job_id() != Some(job_id) {
            debug!("Ignoring outcome for job {} that is no longer tracked", job_id);
            return;
        }

        let changed = match outcome {
            PollOutcome::Complete(payload) => slot.job.complete(payload.clone()),
            PollOutcome::Failed(message) => slot.job.fail(JobFailure::server(message.clone())),
            PollOutcome::PollingFailed { .. } => slot.job.fail(JobFailure::PollingFailed),
            PollOutcome::Timeout => slot.job.fail(JobFailure::Timeout),
        };
        if !changed {
            return;
        }

        self.publish(&slot.job);
        let failure = slot.job.failure().cloned();
        drop(slot);

        if let Some(failure) = failure {
            self.notifier.notify(failure_notice(&failure));
        }
    }
}

fn failure_notice(failure: &JobFailure) -> Notice {
    match failure {
        JobFailure::Server(message) => Notice::error(format!("Design generation failed: {}", message)),
        JobFailure::PollingFailed => Notice::error("Lost contact with the design service, please try again"),
        JobFailure::Timeout => Notice::error("Design generation is taking too long, please try again"),
    }
}

/// Clears the in-flight marker however `submit` exits.
struct Submission<'a> {
    slot: &'a JobSlot,
    epoch: u64,
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot.state);
        if slot.submitting == Some(self.epoch) {
            slot.submitting = None;
        }
    }
}

/// Owns one job at a time: submits it, polls it to a terminal state and
/// reports every transition on the event channel.
///
/// Submitting while a job is pending is rejected with `AlreadyActive`;
/// use `regenerate` to replace the active job.
pub struct JobTracker<A: JobApi> {
    api: Arc<A>,
    poller: JobPoller<A>,
    slot: Arc<JobSlot>,
    settings: TrackerSettings,
}

impl<A: JobApi> JobTracker<A> {
    /// Creates a tracker with a registry of its own. Trackers built this way
    /// do not see each other's jobs; use `with_registry` with one shared
    /// `PollRegistry` to keep several trackers off the same job id.
    pub fn new(
        api: Arc<A>,
        settings: TrackerSettings,
        events: UnboundedSender<TrackerEvent>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_registry(api, settings, PollRegistry::new(), events, notifier)
    }

    /// Like `new`, but refuses to poll any job another tracker sharing
    /// `registry` is already polling.
    pub fn with_registry(
        api: Arc<A>,
        settings: TrackerSettings,
        registry: PollRegistry,
        events: UnboundedSender<TrackerEvent>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let slot = Arc::new(JobSlot {
            state: Mutex::new(SlotState {
                job: Job::not_started(),
                epoch: 0,
                submitting: None,
            }),
            events,
            notifier,
        });

        let poller = JobPoller::new(
            Arc::clone(&api),
            settings.retry.clone(),
            settings.max_consecutive_failures,
            registry,
            Arc::clone(&slot) as Arc<dyn PollObserver>,
        );

        Self {
            api,
            poller,
            slot,
            settings,
        }
    }

    pub fn snapshot(&self) -> Job {
        lock(&self.slot.state).job.clone()
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.slot.state).job.status()
    }

    pub fn poll_state(&self) -> PollState {
        self.poller.state()
    }

    #[tracing::instrument(skip_all)]
    pub async fn submit(&self, request: A::Request) -> Result<JobId, TrackerError> {
        let epoch = {
            let mut slot = lock(&self.slot.state);
            if slot.job.status().is_active() || slot.submitting == Some(slot.epoch) {
                return Err(TrackerError::AlreadyActive);
            }
            slot.submitting = Some(slot.epoch);
            slot.epoch
        };
        let _submission = Submission { slot: &self.slot, epoch };

        if let Err(reason) = JobRequest::validate(&request) {
            return Err(self.submission_failed(reason));
        }

        let idempotency_key = Uuid::new_v4();
        debug!("Submitting job with idempotency key {}", idempotency_key);
        let created = self.api.submit(&request, idempotency_key).await;

        let job_id = {
            let mut slot = lock(&self.slot.state);
            if slot.epoch != epoch {
                info!("Submission finished after cancel, dropping it");
                return Err(TrackerError::Cancelled);
            }

            let job_id = match created {
                Ok(job_id) => job_id,
                Err(err) => {
                    drop(slot);
                    return Err(self.submission_failed(err.to_string()));
                }
            };

            slot.job = Job::pending(job_id.clone(), Utc::now());
            self.slot.publish(&slot.job);
            job_id
        };
        info!("Submitted job {}", job_id);

        // A cancel may land between the job going pending and the poller starting.
        let started = self.poller.start_if(
            job_id.clone(),
            self.settings.poll_interval,
            self.settings.max_poll_duration,
            || lock(&self.slot.state).epoch == epoch,
        );
        match started {
            Ok(()) => Ok(job_id),
            Err(TrackerError::Cancelled) => {
                info!("Job {} was cancelled before polling started", job_id);
                Err(TrackerError::Cancelled)
            }
            Err(err) => {
                warn!("Could not poll job {}: {}", job_id, err);
                let mut slot = lock(&self.slot.state);
                if slot.job.job_id() == Some(&job_id) {
                    slot.job.reset();
                    self.slot.publish(&slot.job);
                }
                Err(err)
            }
        }
    }

    /// Drops whatever is active and submits `request` in its place.
    pub async fn regenerate(&self, request: A::Request) -> Result<JobId, TrackerError> {
        self.cancel();
        self.submit(request).await
    }

    /// Stops polling and resets the job to `NotStarted`. Returns false when
    /// there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        // The epoch bump and the poller stop happen under one poller lock, so
        // `submit` either starts its poller before (and it is stopped here) or
        // sees the new epoch and does not start it.
        let (dropped_job, stopped_polling) = self.poller.cancel_after(|| {
            let mut slot = lock(&self.slot.state);
            slot.epoch += 1;
            let dropped_submission = slot.submitting.take().is_some();

            if slot.job.status() == JobStatus::NotStarted {
                return dropped_submission;
            }

            info!("Cancelled job {}", slot.job.job_id().map(JobId::as_str).unwrap_or("-"));
            slot.job.reset();
            self.slot.publish(&slot.job);
            true
        });
        dropped_job || stopped_polling
    }

    fn submission_failed(&self, reason: String) -> TrackerError {
        warn!("Job submission failed: {}", reason);
        self.slot
            .notifier
            .notify(Notice::error(format!("Could not start design generation: {}", reason)));
        TrackerError::SubmissionFailed(reason)
    }
}
