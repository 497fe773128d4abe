//! SQLite post job store implementation.
//!
//! Implements `PostJobStore` from `deskchat-core` using sqlx with split
//! read/write pools. Timestamps are stored as fixed-width RFC 3339 text, so
//! string order in SQL matches time order.

use chrono::{DateTime, SecondsFormat, Utc};
use deskchat_core::queue::{LaneHead, PostJobStore};
use deskchat_types::error::{QueueError, RepositoryError};
use deskchat_types::job::{JobAddress, JobId, JobStatus, PostJob};
use sqlx::Row;
use sqlx::sqlite::SqliteQueryResult;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `PostJobStore`.
pub struct SqlitePostJobStore {
    pool: DatabasePool,
}

impl SqlitePostJobStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Lanes with at least one job in `status`, ordered by earliest submission.
    async fn lanes_with(&self, status: JobStatus) -> Result<Vec<String>, QueueError> {
        let rows = sqlx::query(
            r#"SELECT lane, MIN(submitted_at) AS first_submitted
               FROM post_jobs
               WHERE status = ?
               GROUP BY lane
               ORDER BY first_submitted ASC, lane ASC"#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut lanes = Vec::with_capacity(rows.len());
        for row in &rows {
            let lane: String = row.try_get("lane").map_err(query_error)?;
            lanes.push(lane);
        }
        Ok(lanes)
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct PostJobRow {
    lane: String,
    seq: i64,
    body: String,
    guest_id: Option<String>,
    guest_token: Option<String>,
    session_id: Option<String>,
    case_link_id: Option<String>,
    status: String,
    attempts: i64,
    submitted_at: String,
    next_attempt_at: Option<String>,
    last_error: Option<String>,
    updated_at: String,
}

impl PostJobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            lane: row.try_get("lane")?,
            seq: row.try_get("seq")?,
            body: row.try_get("body")?,
            guest_id: row.try_get("guest_id")?,
            guest_token: row.try_get("guest_token")?,
            session_id: row.try_get("session_id")?,
            case_link_id: row.try_get("case_link_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            submitted_at: row.try_get("submitted_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_job(self) -> Result<PostJob, RepositoryError> {
        let seq = u64::try_from(self.seq)
            .map_err(|e| RepositoryError::Query(format!("invalid seq: {e}")))?;
        let status: JobStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|e| RepositoryError::Query(format!("invalid attempts: {e}")))?;

        let address = match (
            self.guest_id,
            self.guest_token,
            self.session_id,
            self.case_link_id,
        ) {
            (Some(guest_id), Some(guest_token), Some(session_id), Some(case_link_id)) => {
                Some(JobAddress {
                    guest_id,
                    guest_token,
                    session_id,
                    case_link_id,
                })
            }
            _ => None,
        };

        Ok(PostJob {
            id: JobId::new(self.lane, seq),
            body: self.body,
            address,
            status,
            attempts,
            submitted_at: parse_datetime(&self.submitted_at)?,
            next_attempt_at: self
                .next_attempt_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            last_error: self.last_error,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_error(e: sqlx::Error) -> QueueError {
    QueueError::Repository(RepositoryError::Query(e.to_string()))
}

/// SQLite INTEGER is signed; sequence numbers never approach the limit.
fn seq_param(id: &JobId) -> i64 {
    i64::try_from(id.seq).unwrap_or(i64::MAX)
}

fn status_rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Deferred => 0,
        JobStatus::Pending => 1,
        JobStatus::Delivered => 2,
        JobStatus::Failed => 3,
    }
}

fn rows_to_jobs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<PostJob>, QueueError> {
    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let job_row = PostJobRow::from_row(row).map_err(query_error)?;
        jobs.push(job_row.into_job()?);
    }
    Ok(jobs)
}

/// A single-job update that matched no row names an unknown job.
fn ensure_updated(id: &JobId, result: SqliteQueryResult) -> Result<(), QueueError> {
    if result.rows_affected() == 0 {
        return Err(QueueError::NotFound(id.clone()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PostJobStore implementation
// ---------------------------------------------------------------------------

impl PostJobStore for SqlitePostJobStore {
    async fn enqueue(&self, job: &PostJob) -> Result<(), QueueError> {
        let address = job.address.as_ref();
        let result = sqlx::query(
            r#"INSERT INTO post_jobs
               (lane, seq, body, guest_id, guest_token, session_id, case_link_id,
                status, attempts, submitted_at, next_attempt_at, last_error, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&job.id.lane)
        .bind(seq_param(&job.id))
        .bind(&job.body)
        .bind(address.map(|a| a.guest_id.as_str()))
        .bind(address.map(|a| a.guest_token.as_str()))
        .bind(address.map(|a| a.session_id.as_str()))
        .bind(address.map(|a| a.case_link_id.as_str()))
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(format_datetime(&job.submitted_at))
        .bind(job.next_attempt_at.as_ref().map(format_datetime))
        .bind(&job.last_error)
        .bind(format_datetime(&job.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(QueueError::Duplicate(job.id.clone()))
            }
            Err(e) => Err(query_error(e)),
        }
    }

    async fn dequeue_next_ready(
        &self,
        lane: &str,
        now: DateTime<Utc>,
    ) -> Result<LaneHead, QueueError> {
        let row = sqlx::query(
            r#"SELECT * FROM post_jobs
               WHERE lane = ? AND status IN ('deferred', 'pending')
               ORDER BY seq ASC
               LIMIT 1"#,
        )
        .bind(lane)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let head = match row {
            Some(row) => Some(
                PostJobRow::from_row(&row)
                    .map_err(query_error)?
                    .into_job()?,
            ),
            None => None,
        };
        Ok(LaneHead::from_head(head, now))
    }

    async fn ack(&self, id: &JobId, attempts: u32) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE post_jobs
               SET status = 'delivered', attempts = ?, next_attempt_at = NULL,
                   last_error = NULL, updated_at = ?
               WHERE lane = ? AND seq = ?"#,
        )
        .bind(i64::from(attempts))
        .bind(format_datetime(&Utc::now()))
        .bind(&id.lane)
        .bind(seq_param(id))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_updated(id, result)
    }

    async fn mark_failed(&self, id: &JobId, attempts: u32, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE post_jobs
               SET status = 'failed', attempts = ?, next_attempt_at = NULL,
                   last_error = ?, updated_at = ?
               WHERE lane = ? AND seq = ?"#,
        )
        .bind(i64::from(attempts))
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(&id.lane)
        .bind(seq_param(id))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_updated(id, result)
    }

    async fn retry_after(
        &self,
        id: &JobId,
        attempts: u32,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE post_jobs
               SET attempts = ?, next_attempt_at = ?, last_error = ?, updated_at = ?
               WHERE lane = ? AND seq = ?"#,
        )
        .bind(i64::from(attempts))
        .bind(format_datetime(&at))
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(&id.lane)
        .bind(seq_param(id))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        ensure_updated(id, result)
    }

    async fn release_deferred(&self, lane: &str, address: &JobAddress) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"UPDATE post_jobs
               SET guest_id = ?, guest_token = ?, session_id = ?, case_link_id = ?,
                   status = 'pending', updated_at = ?
               WHERE lane = ? AND status = 'deferred'"#,
        )
        .bind(&address.guest_id)
        .bind(&address.guest_token)
        .bind(&address.session_id)
        .bind(&address.case_link_id)
        .bind(format_datetime(&Utc::now()))
        .bind(lane)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected())
    }

    async fn fail_deferred(&self, lane: &str, error: &str) -> Result<Vec<JobId>, QueueError> {
        let rows = sqlx::query(
            r#"UPDATE post_jobs
               SET status = 'failed', last_error = ?, updated_at = ?
               WHERE lane = ? AND status = 'deferred'
               RETURNING seq"#,
        )
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(lane)
        .fetch_all(&self.pool.writer)
        .await
        .map_err(query_error)?;

        let mut failed = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("seq").map_err(query_error)?;
            let seq = u64::try_from(seq)
                .map_err(|e| RepositoryError::Query(format!("invalid seq: {e}")))?;
            failed.push(JobId::new(lane, seq));
        }
        // RETURNING order is unspecified
        failed.sort();
        Ok(failed)
    }

    async fn pending_lanes(&self) -> Result<Vec<String>, QueueError> {
        self.lanes_with(JobStatus::Pending).await
    }

    async fn deferred_lanes(&self) -> Result<Vec<String>, QueueError> {
        self.lanes_with(JobStatus::Deferred).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<PostJob>, QueueError> {
        let row = sqlx::query("SELECT * FROM post_jobs WHERE lane = ? AND seq = ?")
            .bind(&id.lane)
            .bind(seq_param(id))
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let job_row = PostJobRow::from_row(&row).map_err(query_error)?;
                Ok(Some(job_row.into_job()?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<PostJob>, QueueError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM post_jobs WHERE status = ? ORDER BY submitted_at ASC, lane ASC, seq ASC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM post_jobs ORDER BY submitted_at ASC, lane ASC, seq ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        rows_to_jobs(&rows)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM post_jobs GROUP BY status")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status").map_err(query_error)?;
            let n: i64 = row.try_get("n").map_err(query_error)?;
            let status: JobStatus = status.parse().map_err(RepositoryError::Query)?;
            counts.push((status, u64::try_from(n).unwrap_or_default()));
        }
        counts.sort_by_key(|(status, _)| status_rank(*status));
        Ok(counts)
    }

    async fn prune_delivered(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let result =
            sqlx::query("DELETE FROM post_jobs WHERE status = 'delivered' AND updated_at < ?")
                .bind(format_datetime(&before))
                .execute(&self.pool.writer)
                .await
                .map_err(query_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use deskchat_types::chat::{ChatSession, GuestIdentity};

    async fn test_store() -> SqlitePostJobStore {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open(dir.path()).await.unwrap();
        std::mem::forget(dir);
        SqlitePostJobStore::new(pool)
    }

    fn address() -> JobAddress {
        JobAddress::new(
            &GuestIdentity::new("guest-1", "token-1"),
            &ChatSession::new("session-1", "case-1"),
        )
    }

    fn pending(lane: &str, seq: u64) -> PostJob {
        PostJob::addressed(JobId::new(lane, seq), format!("m{seq}"), address(), Utc::now())
    }

    #[tokio::test]
    async fn test_enqueue_get_roundtrip() {
        let store = test_store().await;
        let job = pending("lane-a", 1);
        store.enqueue(&job).await.unwrap();

        let got = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(got.id, job.id);
        assert_eq!(got.body, "m1");
        assert_eq!(got.address, Some(address()));
        assert_eq!(got.status, JobStatus::Pending);
        assert_eq!(
            format_datetime(&got.submitted_at),
            format_datetime(&job.submitted_at)
        );
    }

    #[tokio::test]
    async fn test_deferred_job_has_no_address() {
        let store = test_store().await;
        let job = PostJob::deferred(JobId::new("lane-a", 1), "early", Utc::now());
        store.enqueue(&job).await.unwrap();

        let got = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Deferred);
        assert!(got.address.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let store = test_store().await;
        store.enqueue(&pending("lane-a", 1)).await.unwrap();

        let err = store.enqueue(&pending("lane-a", 1)).await.unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(id) if id == JobId::new("lane-a", 1)));
    }

    #[tokio::test]
    async fn test_head_follows_sequence_not_insert_order() {
        let store = test_store().await;
        for seq in [3, 1, 2] {
            store.enqueue(&pending("lane-a", seq)).await.unwrap();
        }

        match store.dequeue_next_ready("lane-a", Utc::now()).await.unwrap() {
            LaneHead::Ready(job) => assert_eq!(job.id.seq, 1),
            other => panic!("expected Ready, got {other:?}"),
        }

        store.ack(&JobId::new("lane-a", 1), 1).await.unwrap();
        match store.dequeue_next_ready("lane-a", Utc::now()).await.unwrap() {
            LaneHead::Ready(job) => assert_eq!(job.id.seq, 2),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_after_holds_lane() {
        let store = test_store().await;
        store.enqueue(&pending("lane-a", 1)).await.unwrap();
        store.enqueue(&pending("lane-a", 2)).await.unwrap();

        let at = Utc::now() + Duration::seconds(30);
        store
            .retry_after(&JobId::new("lane-a", 1), 1, at, "503")
            .await
            .unwrap();

        match store.dequeue_next_ready("lane-a", Utc::now()).await.unwrap() {
            LaneHead::Waiting { job_id, .. } => assert_eq!(job_id.seq, 1),
            other => panic!("expected Waiting, got {other:?}"),
        }
        let job = store.get(&JobId::new("lane-a", 1)).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn test_mark_failed_is_terminal() {
        let store = test_store().await;
        store.enqueue(&pending("lane-a", 1)).await.unwrap();
        store
            .mark_failed(&JobId::new("lane-a", 1), 5, "gave up")
            .await
            .unwrap();

        assert_eq!(
            store.dequeue_next_ready("lane-a", Utc::now()).await.unwrap(),
            LaneHead::Empty
        );
        assert!(store.pending_lanes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_job_is_not_found() {
        let store = test_store().await;
        let err = store.ack(&JobId::new("lane-a", 9), 1).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_and_fail_deferred() {
        let store = test_store().await;
        for (lane, seq) in [("lane-a", 1), ("lane-a", 2), ("lane-b", 2), ("lane-b", 1)] {
            store
                .enqueue(&PostJob::deferred(JobId::new(lane, seq), "x", Utc::now()))
                .await
                .unwrap();
        }

        assert_eq!(store.release_deferred("lane-a", &address()).await.unwrap(), 2);
        let job = store.get(&JobId::new("lane-a", 2)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.address, Some(address()));

        let failed = store.fail_deferred("lane-b", "no session").await.unwrap();
        assert_eq!(failed, vec![JobId::new("lane-b", 1), JobId::new("lane-b", 2)]);
        assert!(store.fail_deferred("lane-b", "again").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_lanes_ordered_by_first_submission() {
        let store = test_store().await;
        let t0 = Utc::now();
        let mut late = pending("zzz", 1);
        late.submitted_at = t0;
        let mut early = pending("aaa", 1);
        early.submitted_at = t0 - Duration::seconds(10);
        store.enqueue(&late).await.unwrap();
        store.enqueue(&early).await.unwrap();

        assert_eq!(store.pending_lanes().await.unwrap(), vec!["aaa", "zzz"]);
    }

    #[tokio::test]
    async fn test_deferred_lanes_skip_addressed_lanes() {
        let store = test_store().await;
        store.enqueue(&pending("lane-a", 1)).await.unwrap();
        store
            .enqueue(&PostJob::deferred(JobId::new("lane-b", 1), "x", Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.deferred_lanes().await.unwrap(), vec!["lane-b"]);
        assert_eq!(store.pending_lanes().await.unwrap(), vec!["lane-a"]);

        store.fail_deferred("lane-b", "no session").await.unwrap();
        assert!(store.deferred_lanes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_counts_and_prune() {
        let store = test_store().await;
        store.enqueue(&pending("lane-a", 1)).await.unwrap();
        store.enqueue(&pending("lane-a", 2)).await.unwrap();
        store
            .enqueue(&PostJob::deferred(JobId::new("lane-b", 1), "x", Utc::now()))
            .await
            .unwrap();
        store.ack(&JobId::new("lane-a", 1), 1).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 3);
        let delivered = store.list(Some(JobStatus::Delivered)).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, JobId::new("lane-a", 1));

        assert_eq!(
            store.count_by_status().await.unwrap(),
            vec![
                (JobStatus::Deferred, 1),
                (JobStatus::Pending, 1),
                (JobStatus::Delivered, 1),
            ]
        );

        // Nothing delivered before an hour ago
        let pruned = store
            .prune_delivered(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(pruned, 0);

        let pruned = store
            .prune_delivered(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get(&JobId::new("lane-a", 1)).await.unwrap().is_none());
    }
}
