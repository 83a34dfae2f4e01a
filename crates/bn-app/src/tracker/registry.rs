use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use bn_core::JobId;
use super::lock;

/// Job ids currently being polled, shared by every poller that must not
/// overlap with the others.
#[derive(Debug, Clone, Default)]
pub struct PollRegistry {
    active: Arc<Mutex<HashSet<JobId>>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `job_id`, or returns None if another poller holds it.
    pub fn claim(&self, job_id: &JobId) -> Option<PollClaim> {
        if !lock(&self.active).insert(job_id.clone()) {
            return None;
        }

        Some(PollClaim {
            registry: self.clone(),
            job_id: job_id.clone(),
        })
    }

    pub fn is_claimed(&self, job_id: &JobId) -> bool {
        lock(&self.active).contains(job_id)
    }
}

/// Releases the job id when dropped.
#[derive(Debug)]
pub struct PollClaim {
    registry: PollRegistry,
    job_id: JobId,
}

impl Drop for PollClaim {
    fn drop(&mut self) {
        lock(&self.registry.active).remove(&self.job_id);
    }
}
