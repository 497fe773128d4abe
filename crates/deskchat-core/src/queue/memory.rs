//! In-memory `PostJobStore`.
//!
//! Keeps jobs in a `BTreeMap` keyed by `JobId`, so iteration is already in
//! lane-then-sequence order. Nothing survives the process; use it for tests
//! and hosts that accept losing queued messages on restart.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use deskchat_types::error::QueueError;
use deskchat_types::job::{JobAddress, JobId, JobStatus, PostJob};
use tokio::sync::Mutex;

use super::store::{LaneHead, PostJobStore};

#[derive(Default)]
pub struct MemoryPostJobStore {
    jobs: Mutex<BTreeMap<JobId, PostJob>>,
}

impl MemoryPostJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: &JobId, apply: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut PostJob),
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        apply(job);
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Lanes with at least one job in `status`, ordered by earliest submission.
    async fn lanes_with(&self, status: JobStatus) -> Vec<String> {
        let jobs = self.jobs.lock().await;
        let mut earliest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for job in jobs.values().filter(|job| job.status == status) {
            earliest
                .entry(job.id.lane.as_str())
                .and_modify(|first| *first = (*first).min(job.submitted_at))
                .or_insert(job.submitted_at);
        }

        let mut lanes: Vec<(&str, DateTime<Utc>)> = earliest.into_iter().collect();
        lanes.sort_by_key(|(_, first)| *first);
        lanes.into_iter().map(|(lane, _)| lane.to_string()).collect()
    }
}

fn in_lane<'a>(lane: &'a str) -> impl Fn(&&PostJob) -> bool + 'a {
    move |job| job.id.lane == lane
}

impl PostJobStore for MemoryPostJobStore {
    async fn enqueue(&self, job: &PostJob) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::Duplicate(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn dequeue_next_ready(
        &self,
        lane: &str,
        now: DateTime<Utc>,
    ) -> Result<LaneHead, QueueError> {
        let jobs = self.jobs.lock().await;
        let head = jobs
            .values()
            .filter(in_lane(lane))
            .find(|job| job.status.is_outstanding())
            .cloned();
        Ok(LaneHead::from_head(head, now))
    }

    async fn ack(&self, id: &JobId, attempts: u32) -> Result<(), QueueError> {
        self.update(id, |job| {
            job.status = JobStatus::Delivered;
            job.attempts = attempts;
            job.next_attempt_at = None;
            job.last_error = None;
        })
        .await
    }

    async fn mark_failed(&self, id: &JobId, attempts: u32, error: &str) -> Result<(), QueueError> {
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.attempts = attempts;
            job.next_attempt_at = None;
            job.last_error = Some(error.to_string());
        })
        .await
    }

    async fn retry_after(
        &self,
        id: &JobId,
        attempts: u32,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        self.update(id, |job| {
            job.attempts = attempts;
            job.next_attempt_at = Some(at);
            job.last_error = Some(error.to_string());
        })
        .await
    }

    async fn release_deferred(&self, lane: &str, address: &JobAddress) -> Result<u64, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut released = 0;
        for job in jobs
            .values_mut()
            .filter(|job| job.id.lane == lane && job.status == JobStatus::Deferred)
        {
            job.address = Some(address.clone());
            job.status = JobStatus::Pending;
            job.updated_at = now;
            released += 1;
        }
        Ok(released)
    }

    async fn fail_deferred(&self, lane: &str, error: &str) -> Result<Vec<JobId>, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for job in jobs
            .values_mut()
            .filter(|job| job.id.lane == lane && job.status == JobStatus::Deferred)
        {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
            failed.push(job.id.clone());
        }
        Ok(failed)
    }

    async fn pending_lanes(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.lanes_with(JobStatus::Pending).await)
    }

    async fn deferred_lanes(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.lanes_with(JobStatus::Deferred).await)
    }

    async fn get(&self, id: &JobId) -> Result<Option<PostJob>, QueueError> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<PostJob>, QueueError> {
        let jobs = self.jobs.lock().await;
        let mut listed: Vec<PostJob> = jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(listed)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, QueueError> {
        let jobs = self.jobs.lock().await;
        let statuses = [
            JobStatus::Deferred,
            JobStatus::Pending,
            JobStatus::Delivered,
            JobStatus::Failed,
        ];
        Ok(statuses
            .into_iter()
            .map(|status| {
                let count = jobs.values().filter(|job| job.status == status).count() as u64;
                (status, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }

    async fn prune_delivered(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let len_before = jobs.len();
        jobs.retain(|_, job| !(job.status == JobStatus::Delivered && job.updated_at < before));
        Ok((len_before - jobs.len()) as u64)
    }
}
