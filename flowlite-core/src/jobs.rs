//! Job dispatcher: pull-style hand-off of work items to external workers.
//!
//! Jobs are created in ACTIVATABLE state; workers lease batches with
//! `activate`, then report back with `complete` or `fail`. A lease that
//! expires returns the job to ACTIVATABLE with one retry burned.

use crate::store::ProcessStore;
use crate::types::{Job, JobState, Variables};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Jobs whose activation lease expired: requeued ones go back to workers,
/// exhausted ones need an incident.
#[derive(Debug, Default)]
pub struct ReclaimOutcome {
    pub requeued: Vec<Job>,
    pub exhausted: Vec<Job>,
}

pub struct JobDispatcher {
    store: Arc<dyn ProcessStore>,
    default_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn ProcessStore>, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    pub async fn create(&self, job: &Job) -> Result<()> {
        self.store.save_job(job).await?;
        info!(job_key = %job.job_key, job_type = %job.job_type, "job created");
        Ok(())
    }

    /// Lease up to `max` ACTIVATABLE jobs of `job_type` to `worker`.
    pub async fn activate(
        &self,
        job_type: &str,
        worker: &str,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Job>> {
        let lease = timeout.unwrap_or(self.default_timeout);
        let mut activated = Vec::new();
        for mut job in self.store.load_activatable_jobs(job_type, max).await? {
            job.state = JobState::Activated;
            job.worker = Some(worker.to_string());
            job.deadline = Some(Utc::now() + chrono::Duration::from_std(lease)?);
            job.updated_at = Utc::now();
            self.store.save_job(&job).await?;
            activated.push(job);
        }
        if !activated.is_empty() {
            info!(job_type, worker, count = activated.len(), "jobs activated");
        }
        Ok(activated)
    }

    /// Worker reports success. Returns the completed job so the scheduler
    /// can resume its token with `variables`.
    pub async fn complete(&self, job_key: Uuid, variables: Variables) -> Result<Job> {
        let Some(mut job) = self.store.load_job(job_key).await? else {
            bail!("job not found: {job_key}");
        };
        if job.state.is_terminal() {
            bail!("job {job_key} already in terminal state {:?}", job.state);
        }
        job.state = JobState::Completed;
        job.variables = variables;
        job.deadline = None;
        job.updated_at = Utc::now();
        self.store.save_job(&job).await?;
        info!(job_key = %job.job_key, "job completed");
        Ok(job)
    }

    /// Worker reports failure with its remaining retry budget. `retries > 0`
    /// requeues; zero fails the job terminally.
    pub async fn fail(&self, job_key: Uuid, retries: u32, error: &str) -> Result<Job> {
        let Some(mut job) = self.store.load_job(job_key).await? else {
            bail!("job not found: {job_key}");
        };
        if job.state.is_terminal() {
            bail!("job {job_key} already in terminal state {:?}", job.state);
        }
        job.retries = retries;
        job.worker = None;
        job.deadline = None;
        job.state = if retries > 0 {
            JobState::Activatable
        } else {
            JobState::Failed
        };
        job.updated_at = Utc::now();
        self.store.save_job(&job).await?;
        warn!(job_key = %job.job_key, retries, error, "job failed");
        Ok(job)
    }

    /// Return expired activations to the queue, burning one retry each.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<ReclaimOutcome> {
        let mut outcome = ReclaimOutcome::default();
        for mut job in self.store.load_activated_jobs().await? {
            let expired = job.deadline.map(|d| d <= now).unwrap_or(false);
            if !expired {
                continue;
            }
            job.worker = None;
            job.deadline = None;
            job.retries = job.retries.saturating_sub(1);
            job.state = if job.retries > 0 {
                JobState::Activatable
            } else {
                JobState::Failed
            };
            job.updated_at = now;
            self.store.save_job(&job).await?;
            warn!(job_key = %job.job_key, retries = job.retries, "job lease expired");
            if job.state == JobState::Activatable {
                outcome.requeued.push(job);
            } else {
                outcome.exhausted.push(job);
            }
        }
        Ok(outcome)
    }

    /// Best-effort cancellation of every non-terminal job of the instance.
    pub async fn cancel_for_instance(&self, instance_id: Uuid) -> Result<Vec<Uuid>> {
        let mut cancelled = Vec::new();
        for mut job in self.store.load_jobs_by_instance(instance_id).await? {
            if job.state.is_terminal() {
                continue;
            }
            job.state = JobState::Cancelled;
            job.updated_at = Utc::now();
            self.store.save_job(&job).await?;
            cancelled.push(job.job_key);
        }
        Ok(cancelled)
    }

    pub async fn cancel_job(&self, job_key: Uuid) -> Result<()> {
        if let Some(mut job) = self.store.load_job(job_key).await? {
            if !job.state.is_terminal() {
                job.state = JobState::Cancelled;
                job.updated_at = Utc::now();
                self.store.save_job(&job).await?;
            }
        }
        Ok(())
    }
}
