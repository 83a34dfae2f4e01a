use bn_core::{Job, JobStatus};

/// Job snapshots pushed to the UI layer, one per status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    JobSubmitted(Job),
    JobComplete(Job),
    JobFailed(Job),
    JobCancelled(Job),
}

impl TrackerEvent {
    pub fn from_snapshot(job: Job) -> Self {
        match job.status() {
            JobStatus::Pending => Self::JobSubmitted(job),
            JobStatus::Complete => Self::JobComplete(job),
            JobStatus::Failed => Self::JobFailed(job),
            JobStatus::NotStarted => Self::JobCancelled(job),
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            Self::JobSubmitted(job)
            | Self::JobComplete(job)
            | Self::JobFailed(job)
            | Self::JobCancelled(job) => job,
        }
    }
}
