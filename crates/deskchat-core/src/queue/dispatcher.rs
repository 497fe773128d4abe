//! Background dispatcher for durable post jobs.
//!
//! One tokio task per lane pulls the lane's head from the store and posts it.
//! A lane never attempts a later job while an earlier one is deferred or
//! backing off, which keeps per-conversation submission order. Lanes run
//! independently of each other, bounded by a process-wide in-flight limit.
//!
//! ```text
//! enqueue/release ──► store (durable) ──► wake(lane)
//!                                            │
//!                      lane task ◄───────────┘
//!                        ├─ Ready    ─► post_message ─► ack | retry_after | mark_failed
//!                        ├─ Waiting  ─► sleep until next attempt (or woken)
//!                        ├─ Held     ─► wait for release
//!                        └─ Empty    ─► wait, then retire after idle timeout
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deskchat_types::config::QueueConfig;
use deskchat_types::error::{QueueError, RemoteError};
use deskchat_types::event::ChatEvent;
use deskchat_types::job::{JobAddress, JobId, JobStatus, PostJob};
use secrecy::ExposeSecret;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{RetryDecision, RetryPolicy};
use super::store::{LaneHead, PostJobStore};
use crate::event::EventBus;
use crate::identity::IdentityProvider;
use crate::remote::{OutboundMessage, RemoteChatService};

/// Pause before re-reading a lane after the store itself failed.
const STORE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

const ORPHANED_REASON: &str = "process restarted before a session was established";

/// Durable, ordered, retrying delivery of user messages.
///
/// Cheap to clone; all clones share the same lanes and store.
pub struct PostQueue<S: PostJobStore, R: RemoteChatService> {
    inner: Arc<Inner<S, R>>,
}

impl<S: PostJobStore, R: RemoteChatService> Clone for PostQueue<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S, R> {
    store: Arc<S>,
    remote: Arc<R>,
    identity: Arc<dyn IdentityProvider>,
    policy: RetryPolicy,
    events: EventBus,
    /// Live lane tasks, keyed by lane, with the handle used to wake them.
    lanes: DashMap<String, Arc<Notify>>,
    in_flight: Arc<Semaphore>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl<S: PostJobStore, R: RemoteChatService> PostQueue<S, R> {
    pub fn new(
        store: Arc<S>,
        remote: Arc<R>,
        identity: Arc<dyn IdentityProvider>,
        config: &QueueConfig,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                identity,
                policy: RetryPolicy::from_config(config),
                events,
                lanes: DashMap::new(),
                in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
                idle_timeout: config.lane_idle_timeout(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.inner.remote
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.inner.identity
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Durably record a job, then schedule it for dispatch.
    ///
    /// When this returns `Ok`, the job survives a crash.
    pub async fn enqueue(&self, job: PostJob) -> Result<(), QueueError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }

        self.inner.store.enqueue(&job).await?;

        let deferred = job.status == JobStatus::Deferred;
        debug!(job_id = %job.id, deferred, "post job recorded");
        self.inner.events.publish(ChatEvent::MessageQueued {
            job_id: job.id.clone(),
            deferred,
        });

        if !deferred {
            self.inner.wake(&job.id.lane);
        }
        Ok(())
    }

    /// Address a lane's deferred jobs and let them dispatch.
    pub async fn release(&self, lane: &str, address: &JobAddress) -> Result<u64, QueueError> {
        let released = self.inner.store.release_deferred(lane, address).await?;
        if released > 0 {
            info!(lane, released, "released deferred post jobs");
            self.inner.wake(lane);
        }
        Ok(released)
    }

    /// Fail every deferred job in a lane that can never be addressed.
    pub async fn abandon_deferred(&self, lane: &str, reason: &str) -> Result<Vec<JobId>, QueueError> {
        let failed = self.inner.store.fail_deferred(lane, reason).await?;
        for job_id in &failed {
            warn!(job_id = %job_id, reason, "abandoned deferred post job");
            self.inner.events.publish(ChatEvent::MessageFailed {
                job_id: job_id.clone(),
                error: reason.to_string(),
            });
        }
        if !failed.is_empty() {
            // Later pending jobs in the lane were held behind these.
            self.inner.wake(lane);
        }
        Ok(failed)
    }

    /// Resume dispatch for every lane with pending jobs left by a previous run.
    ///
    /// Deferred jobs from that run belonged to coordinators that no longer
    /// exist and can never be addressed, so they are failed and reported.
    /// Call this before spawning any coordinator on this queue.
    ///
    /// Returns the number of lanes resumed.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        for lane in self.inner.store.deferred_lanes().await? {
            self.abandon_deferred(&lane, ORPHANED_REASON).await?;
        }

        let lanes = self.inner.store.pending_lanes().await?;
        for lane in &lanes {
            self.inner.wake(lane);
        }
        info!(lanes = lanes.len(), "recovered post queue");
        Ok(lanes.len())
    }

    /// Number of lane tasks currently alive.
    pub fn active_lanes(&self) -> usize {
        self.inner.lanes.len()
    }

    /// Stop all lane tasks after their current attempt. Persisted jobs are
    /// left as they are and resume on the next `recover()`.
    pub fn shutdown(&self) {
        info!("shutting down post queue");
        self.inner.shutdown.cancel();
    }
}

impl<S: PostJobStore, R: RemoteChatService> Inner<S, R> {
    /// Wake the lane's task, spawning one if none is alive.
    fn wake(self: &Arc<Self>, lane: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        match self.lanes.entry(lane.to_string()) {
            Entry::Occupied(entry) => entry.get().notify_one(),
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(Arc::clone(&notify));
                tokio::spawn(Arc::clone(self).run_lane(lane.to_string(), notify));
            }
        }
    }

    async fn run_lane(self: Arc<Self>, lane: String, notify: Arc<Notify>) {
        debug!(lane = %lane, "lane started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let head = match self.store.dequeue_next_ready(&lane, Utc::now()).await {
                Ok(head) => head,
                Err(e) => {
                    error!(lane = %lane, error = %e, "failed to read lane head");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            match head {
                LaneHead::Ready(job) => self.dispatch(job).await,
                LaneHead::Waiting { job_id, until } => {
                    let delay = (until - Utc::now()).to_std().unwrap_or_default();
                    debug!(job_id = %job_id, ?delay, "lane head backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = notify.notified() => {}
                    }
                }
                LaneHead::Held(_) | LaneHead::Empty => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = notify.notified() => continue,
                        _ = tokio::time::sleep(self.idle_timeout) => {}
                    }
                    if !self.retire(&lane, &notify).await {
                        continue;
                    }
                    break;
                }
            }
        }

        debug!(lane = %lane, "lane stopped");
    }

    /// Remove an idle lane from the live set.
    ///
    /// Returns `false` if work arrived in the meantime and this task should
    /// keep running the lane.
    async fn retire(&self, lane: &str, notify: &Arc<Notify>) -> bool {
        self.lanes.remove(lane);

        // Re-check after removal: a job enqueued between our last read and
        // the removal notified a handle nobody will wait on.
        let has_work = match self.store.dequeue_next_ready(lane, Utc::now()).await {
            Ok(LaneHead::Ready(_)) | Ok(LaneHead::Waiting { .. }) | Err(_) => true,
            Ok(LaneHead::Held(_)) | Ok(LaneHead::Empty) => false,
        };
        if !has_work {
            return true;
        }

        match self.lanes.entry(lane.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(notify));
                false
            }
            // Another task already took the lane over.
            Entry::Occupied(_) => true,
        }
    }

    async fn dispatch(&self, job: PostJob) {
        let Some(address) = job.address.as_ref() else {
            return;
        };
        let attempt = job.attempts + 1;

        let _permit = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let result = match self.identity.conversation_token() {
            Some(token) => {
                let message = OutboundMessage {
                    client_id: &job.id,
                    body: &job.body,
                    guest_id: &address.guest_id,
                    guest_token: &address.guest_token,
                    conversation_token: token.expose_secret(),
                    case_link_id: &address.case_link_id,
                };
                self.remote.post_message(&message).await
            }
            None => Err(RemoteError::Transient(
                "no conversation token available".to_string(),
            )),
        };

        match result {
            Ok(()) => self.on_delivered(&job.id, attempt).await,
            Err(err) => self.on_failed(&job.id, attempt, &err).await,
        }
    }

    async fn on_delivered(&self, job_id: &JobId, attempt: u32) {
        if let Err(e) = self.store.ack(job_id, attempt).await {
            // The remote has the message but the store does not know it;
            // the job will be attempted again.
            error!(job_id = %job_id, error = %e, "failed to record delivery");
            tokio::time::sleep(STORE_ERROR_BACKOFF).await;
            return;
        }

        info!(job_id = %job_id, attempt, "message delivered");
        self.events.publish(ChatEvent::MessageDelivered {
            job_id: job_id.clone(),
            attempts: attempt,
        });
    }

    async fn on_failed(&self, job_id: &JobId, attempt: u32, err: &RemoteError) {
        let message = err.to_string();

        match self.policy.decide(attempt, err) {
            RetryDecision::RetryAfter(delay) => {
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                if let Err(e) = self
                    .store
                    .retry_after(job_id, attempt, next_attempt_at, &message)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to schedule retry");
                    tokio::time::sleep(STORE_ERROR_BACKOFF).await;
                    return;
                }

                warn!(job_id = %job_id, attempt, ?delay, error = %message, "delivery failed, will retry");
                self.events.publish(ChatEvent::MessageRetrying {
                    job_id: job_id.clone(),
                    attempt,
                    next_attempt_at,
                    error: message,
                });
            }
            RetryDecision::GiveUp => {
                if let Err(e) = self.store.mark_failed(job_id, attempt, &message).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job failed");
                    tokio::time::sleep(STORE_ERROR_BACKOFF).await;
                    return;
                }

                error!(job_id = %job_id, attempt, error = %message, "delivery failed permanently");
                self.events.publish(ChatEvent::MessageFailed {
                    job_id: job_id.clone(),
                    error: message,
                });
            }
        }
    }
}
