//! Durable outbound message jobs.
//!
//! A `PostJob` is one user-authored message awaiting delivery. Jobs are
//! grouped into lanes (one per conversation) and ordered within a lane by a
//! monotonic sequence number. `(lane, seq)` is the job's stable identity and
//! is never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use crate::chat::{ChatSession, GuestIdentity};

/// Stable identity of a post job: conversation lane plus sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub lane: String,
    pub seq: u64,
}

impl JobId {
    pub fn new(lane: impl Into<String>, seq: u64) -> Self {
        Self {
            lane: lane.into(),
            seq,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lane, self.seq)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lane, seq) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("invalid job id: '{s}'"))?;
        if lane.is_empty() {
            return Err(format!("invalid job id: '{s}'"));
        }
        let seq = seq
            .parse::<u64>()
            .map_err(|e| format!("invalid job sequence in '{s}': {e}"))?;
        Ok(JobId::new(lane, seq))
    }
}

/// Delivery status of a post job.
///
/// Maps to the CHECK constraint in the SQLite schema:
/// `CHECK (status IN ('deferred', 'pending', 'delivered', 'failed'))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for the conversation's session identifiers.
    Deferred,
    /// Addressed and dispatchable (possibly after a backoff delay).
    Pending,
    /// Acknowledged by the remote service. Never dispatched again.
    Delivered,
    /// Retries exhausted or rejected by the remote service.
    Failed,
}

impl JobStatus {
    /// Deferred and pending jobs still hold their lane.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, JobStatus::Deferred | JobStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Deferred => "deferred",
            JobStatus::Pending => "pending",
            JobStatus::Delivered => "delivered",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deferred" => Ok(JobStatus::Deferred),
            "pending" => Ok(JobStatus::Pending),
            "delivered" => Ok(JobStatus::Delivered),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status: '{other}'")),
        }
    }
}

/// Identifiers needed to post a message on behalf of a guest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAddress {
    pub guest_id: String,
    pub guest_token: String,
    pub session_id: String,
    pub case_link_id: String,
}

impl JobAddress {
    pub fn new(guest: &GuestIdentity, session: &ChatSession) -> Self {
        Self {
            guest_id: guest.id.clone(),
            guest_token: guest.token.clone(),
            session_id: session.id.clone(),
            case_link_id: session.case_link_id.clone(),
        }
    }
}

impl fmt::Debug for JobAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobAddress")
            .field("guest_id", &self.guest_id)
            .field("guest_token", &"[redacted]")
            .field("session_id", &self.session_id)
            .field("case_link_id", &self.case_link_id)
            .finish()
    }
}

/// One user message awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostJob {
    pub id: JobId,
    pub body: String,
    /// `None` while the job is deferred.
    pub address: Option<JobAddress>,
    pub status: JobStatus,
    /// Number of delivery attempts made so far.
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    /// Earliest time the next attempt may run (set after a transient failure).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PostJob {
    /// A job submitted before the conversation has a session.
    pub fn deferred(id: JobId, body: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            body: body.into(),
            address: None,
            status: JobStatus::Deferred,
            attempts: 0,
            submitted_at: now,
            next_attempt_at: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// A job submitted while the session is active, dispatchable immediately.
    pub fn addressed(
        id: JobId,
        body: impl Into<String>,
        address: JobAddress,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            address: Some(address),
            status: JobStatus::Pending,
            ..Self::deferred(id, body, now)
        }
    }
}
