//! PostJobStore trait definition.
//!
//! The minimal durable-queue capability the dispatcher needs. Implementations
//! live in this crate (`MemoryPostJobStore`) and in deskchat-infra
//! (`SqlitePostJobStore`). Follows the same RPITIT pattern as
//! `RemoteChatService`.

use chrono::{DateTime, Utc};
use deskchat_types::error::QueueError;
use deskchat_types::job::{JobAddress, JobId, JobStatus, PostJob};

/// What a lane should do next, derived from its lowest outstanding job.
#[derive(Debug, Clone, PartialEq)]
pub enum LaneHead {
    /// No deferred or pending jobs in the lane.
    Empty,
    /// The head is deferred; the whole lane waits for session identifiers.
    Held(JobId),
    /// The head is backing off until the given time.
    Waiting { job_id: JobId, until: DateTime<Utc> },
    /// The head may be attempted now.
    Ready(PostJob),
}

impl LaneHead {
    /// Classify a lane's lowest-sequence outstanding job.
    pub fn from_head(head: Option<PostJob>, now: DateTime<Utc>) -> Self {
        let Some(job) = head else {
            return LaneHead::Empty;
        };

        if job.status == JobStatus::Deferred || job.address.is_none() {
            return LaneHead::Held(job.id);
        }

        match job.next_attempt_at {
            Some(until) if until > now => LaneHead::Waiting {
                job_id: job.id,
                until,
            },
            _ => LaneHead::Ready(job),
        }
    }
}

/// Persistent storage for post jobs.
///
/// Every write must be durable when its future resolves. Writes to one job
/// record are serialized by the implementation; writes to distinct records
/// may run concurrently.
pub trait PostJobStore: Send + Sync + 'static {
    /// Record a new job. Fails with `QueueError::Duplicate` if the id exists.
    fn enqueue(
        &self,
        job: &PostJob,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Inspect the head of a lane: its lowest-sequence deferred or pending job.
    fn dequeue_next_ready(
        &self,
        lane: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<LaneHead, QueueError>> + Send;

    /// Mark a job delivered after the remote acknowledged it.
    fn ack(
        &self,
        id: &JobId,
        attempts: u32,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Mark a job terminal-failed. It will never be dispatched again.
    fn mark_failed(
        &self,
        id: &JobId,
        attempts: u32,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Record a transient failure and schedule the next attempt.
    fn retry_after(
        &self,
        id: &JobId,
        attempts: u32,
        at: DateTime<Utc>,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Address every deferred job in the lane and make it pending.
    ///
    /// Returns the number of jobs released.
    fn release_deferred(
        &self,
        lane: &str,
        address: &JobAddress,
    ) -> impl std::future::Future<Output = Result<u64, QueueError>> + Send;

    /// Mark every deferred job in the lane failed, returning their ids in
    /// sequence order.
    fn fail_deferred(
        &self,
        lane: &str,
        error: &str,
    ) -> impl std::future::Future<Output = Result<Vec<JobId>, QueueError>> + Send;

    /// Lanes holding pending jobs, ordered by their earliest submission.
    fn pending_lanes(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<String>, QueueError>> + Send;

    /// Lanes holding deferred jobs, ordered by their earliest submission.
    fn deferred_lanes(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<String>, QueueError>> + Send;

    fn get(
        &self,
        id: &JobId,
    ) -> impl std::future::Future<Output = Result<Option<PostJob>, QueueError>> + Send;

    /// List jobs, optionally filtered by status, in submission order.
    fn list(
        &self,
        status: Option<JobStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<PostJob>, QueueError>> + Send;

    /// Number of jobs per status. Statuses with no jobs are omitted.
    fn count_by_status(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<(JobStatus, u64)>, QueueError>> + Send;

    /// Delete delivered jobs last updated before `before`.
    fn prune_delivered(
        &self,
        before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, QueueError>> + Send;
}
