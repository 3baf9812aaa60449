use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 300;
/// Jobs with an identical idempotency key inside this window are dropped.
pub const DEDUP_WINDOW_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QueueName {
    #[serde(rename = "ingest")]
    Ingest,
    #[serde(rename = "session-compaction")]
    SessionCompaction,
    #[serde(rename = "label-assignment")]
    LabelAssignment,
    #[serde(rename = "title-generation")]
    TitleGeneration,
}

impl QueueName {
    pub const ALL: [Self; 4] = [
        Self::Ingest,
        Self::SessionCompaction,
        Self::LabelAssignment,
        Self::TitleGeneration,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::SessionCompaction => "session-compaction",
            Self::LabelAssignment => "label-assignment",
            Self::TitleGeneration => "title-generation",
        }
    }
}

/// Queue-level job lifecycle. `Failed` means a retry is scheduled;
/// `DeadLetter` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    DeadLetter,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum JobPayload {
    Ingest {
        episode_body: String,
        reference_time: DateTime<Utc>,
        episode_type: super::episode::EpisodeType,
        source: String,
        session_id: String,
        title: Option<String>,
        label_ids: Vec<String>,
        metadata: Option<serde_json::Value>,
        user_id: String,
        workspace_id: Option<String>,
    },
    SessionCompaction {
        session_id: String,
        user_id: String,
        workspace_id: Option<String>,
    },
    LabelAssignment {
        episode_id: String,
        user_id: String,
    },
    TitleGeneration {
        episode_id: String,
        user_id: String,
    },
}

impl JobPayload {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Ingest { user_id, .. }
            | Self::SessionCompaction { user_id, .. }
            | Self::LabelAssignment { user_id, .. }
            | Self::TitleGeneration { user_id, .. } => user_id,
        }
    }
}

stored_object!(QueueJob, "queue_job", {
    queue: QueueName,
    payload: JobPayload,
    state: JobState,
    attempts: u32,
    /// Jobs sharing a key execute strictly in enqueue order.
    serialization_key: Option<String>,
    idempotency_key: String,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    scheduled_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    lease_until: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    last_error: Option<String>,
    /// Episode rows written while processing this job.
    episode_ids: Vec<String>,
    user_id: String
});

impl QueueJob {
    pub fn new(queue: QueueName, payload: JobPayload, serialization_key: Option<String>) -> Self {
        let now = Utc::now();
        let user_id = payload.user_id().to_owned();
        let idempotency_key = idempotency_key(queue, &payload);
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            queue,
            payload,
            state: JobState::Queued,
            attempts: 0,
            serialization_key,
            idempotency_key,
            scheduled_at: now,
            lease_until: None,
            worker_id: None,
            last_error: None,
            episode_ids: Vec::new(),
            user_id,
        }
    }

    /// Delay delivery until `run_after`; the substrate never delivers early.
    pub fn delayed(mut self, run_after: DateTime<Utc>) -> Self {
        self.scheduled_at = run_after;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < MAX_ATTEMPTS
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(DEFAULT_LEASE_SECS as u64)
    }

    /// Number of unfinished jobs in a queue.
    pub async fn depth(db: &SurrealDbClient, queue: QueueName) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct Row {
            total: usize,
        }

        let mut response = db
            .client
            .query(
                "SELECT count() AS total FROM queue_job \
                 WHERE queue = $queue AND state IN ['Queued', 'InProgress', 'Failed'] \
                 GROUP ALL;",
            )
            .bind(("queue", queue))
            .await?;

        let rows: Vec<Row> = response.take(0)?;
        Ok(rows.into_iter().next().map_or(0, |row| row.total))
    }

    /// Store the job, enforcing backpressure and idempotent dedup. Returns
    /// the stored job id: the new one, or the existing one when a duplicate
    /// inside the deduplication window was dropped.
    pub async fn enqueue(
        self,
        db: &SurrealDbClient,
        max_depth: usize,
    ) -> Result<String, AppError> {
        let depth = Self::depth(db, self.queue).await?;
        if depth >= max_depth {
            return Err(AppError::QueueFull(format!(
                "queue {} is at capacity ({depth} jobs)",
                self.queue.as_str()
            )));
        }

        let window_start = Utc::now() - chrono::Duration::seconds(DEDUP_WINDOW_SECS);
        let mut response = db
            .client
            .query(
                "SELECT * FROM queue_job \
                 WHERE idempotency_key = $key \
                   AND state != 'DeadLetter' \
                   AND created_at >= $window_start \
                 LIMIT 1;",
            )
            .bind(("key", self.idempotency_key.clone()))
            .bind(("window_start", surrealdb::sql::Datetime::from(window_start)))
            .await?;

        let existing: Vec<Self> = response.take(0)?;
        if let Some(duplicate) = existing.into_iter().next() {
            tracing::debug!(
                queue = self.queue.as_str(),
                job_id = %duplicate.id,
                "duplicate enqueue dropped inside deduplication window"
            );
            return Ok(duplicate.id);
        }

        let id = self.id.clone();
        db.store_item(self).await?;
        Ok(id)
    }

    /// Claim the next ready job in a queue for this worker.
    ///
    /// Within one serialization key only the oldest unfinished job is ever
    /// claimable, so same-key jobs run in strict enqueue order; jobs without
    /// a key (and jobs of different keys) are independent. The claim itself
    /// is a conditional update so racing workers cannot double-claim.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        queue: QueueName,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM queue_job \
                 WHERE queue = $queue AND state IN ['Queued', 'InProgress', 'Failed'] \
                 ORDER BY created_at ASC;",
            )
            .bind(("queue", queue))
            .await?;

        let unfinished: Vec<Self> = response.take(0)?;

        let mut seen_keys: HashSet<String> = HashSet::new();
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();

        for job in unfinished {
            let key_is_fresh = match &job.serialization_key {
                Some(key) => seen_keys.insert(key.clone()),
                None => true,
            };
            // An older unfinished job with the same key blocks this one,
            // claimable or not.
            if !key_is_fresh {
                continue;
            }

            if !job.is_claimable(now) {
                continue;
            }

            let mut claim_response = db
                .client
                .query(
                    "UPDATE type::thing('queue_job', $id) SET \
                         state = 'InProgress', \
                         worker_id = $worker_id, \
                         lease_until = $lease_until, \
                         attempts = attempts + 1, \
                         updated_at = time::now() \
                     WHERE (state IN ['Queued', 'Failed'] AND scheduled_at <= $now) \
                        OR (state = 'InProgress' AND lease_until < $now) \
                     RETURN AFTER;",
                )
                .bind(("id", job.id.clone()))
                .bind(("worker_id", worker_id.to_owned()))
                .bind(("lease_until", surrealdb::sql::Datetime::from(lease_until)))
                .bind(("now", surrealdb::sql::Datetime::from(now)))
                .await?;

            let claimed: Vec<Self> = claim_response.take(0)?;
            if let Some(claimed_job) = claimed.into_iter().next() {
                return Ok(Some(claimed_job));
            }
        }

        Ok(None)
    }

    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => self.scheduled_at <= now,
            JobState::Failed => self.can_retry() && self.scheduled_at <= now,
            JobState::InProgress => self.lease_until.is_some_and(|lease| lease < now),
            JobState::Succeeded | JobState::DeadLetter | JobState::Cancelled => false,
        }
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        self.set_state(db, JobState::Succeeded, None, None).await
    }

    /// Record a failure and schedule the retry. The caller decides the delay.
    pub async fn mark_failed(
        &self,
        db: &SurrealDbClient,
        error: &str,
        retry_delay: Duration,
    ) -> Result<(), AppError> {
        let retry_at = Utc::now() + chrono::Duration::from_std(retry_delay).unwrap_or_default();
        self.set_state(db, JobState::Failed, Some(error.to_owned()), Some(retry_at))
            .await
    }

    pub async fn mark_dead_letter(&self, db: &SurrealDbClient, error: &str) -> Result<(), AppError> {
        self.set_state(db, JobState::DeadLetter, Some(error.to_owned()), None)
            .await
    }

    pub async fn mark_cancelled(&self, db: &SurrealDbClient, reason: &str) -> Result<(), AppError> {
        self.set_state(db, JobState::Cancelled, Some(reason.to_owned()), None)
            .await
    }

    async fn set_state(
        &self,
        db: &SurrealDbClient,
        state: JobState,
        error: Option<String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('queue_job', $id) SET \
                     state = $state, \
                     last_error = $error, \
                     scheduled_at = $scheduled_at ?? scheduled_at, \
                     lease_until = NONE, \
                     worker_id = NONE, \
                     updated_at = time::now();",
            )
            .bind(("id", self.id.clone()))
            .bind(("state", state))
            .bind(("error", error))
            .bind((
                "scheduled_at",
                scheduled_at.map(surrealdb::sql::Datetime::from),
            ))
            .await?
            .check()?;

        Ok(())
    }

    /// Record the episode rows produced while processing this job so status
    /// reads can surface them.
    pub async fn set_episode_ids(
        db: &SurrealDbClient,
        id: &str,
        episode_ids: Vec<String>,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('queue_job', $id) SET \
                     episode_ids = array::distinct(array::concat(episode_ids, $episodes));",
            )
            .bind(("id", id.to_owned()))
            .bind(("episodes", episode_ids))
            .await?
            .check()?;

        Ok(())
    }

    /// Reset a failed job so it re-enters the queue; used by the retry
    /// command on failed episodes.
    pub async fn requeue(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('queue_job', $id) SET \
                     state = 'Queued', \
                     attempts = 0, \
                     last_error = NONE, \
                     scheduled_at = time::now(), \
                     lease_until = NONE, \
                     worker_id = NONE, \
                     updated_at = time::now() \
                 WHERE state IN ['Failed', 'DeadLetter', 'Cancelled'];",
            )
            .bind(("id", id.to_owned()))
            .await?
            .check()?;

        Ok(())
    }
}

fn idempotency_key(queue: QueueName, payload: &JobPayload) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{canonical}", queue.as_str()).as_bytes(),
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::episode::EpisodeType;

    fn ingest_payload(session_id: &str, body: &str) -> JobPayload {
        JobPayload::Ingest {
            episode_body: body.to_owned(),
            reference_time: Utc::now(),
            episode_type: EpisodeType::Conversation,
            source: "core".into(),
            session_id: session_id.to_owned(),
            title: None,
            label_ids: Vec::new(),
            metadata: None,
            user_id: "user-1".into(),
            workspace_id: None,
        }
    }

    fn ingest_job(session_id: &str, body: &str) -> QueueJob {
        QueueJob::new(
            QueueName::Ingest,
            ingest_payload(session_id, body),
            Some(session_id.to_owned()),
        )
    }

    async fn setup_db() -> SurrealDbClient {
        SurrealDbClient::memory("queue_test", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn enqueue_applies_backpressure() {
        let db = setup_db().await;

        ingest_job("s1", "one")
            .enqueue(&db, 2)
            .await
            .expect("first enqueue");
        ingest_job("s2", "two")
            .enqueue(&db, 2)
            .await
            .expect("second enqueue");

        let err = ingest_job("s3", "three")
            .enqueue(&db, 2)
            .await
            .expect_err("queue should be full");
        assert!(matches!(err, AppError::QueueFull(_)));
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_dropped_within_window() {
        let db = setup_db().await;

        let first_id = ingest_job("s1", "same body")
            .enqueue(&db, 100)
            .await
            .expect("first enqueue");
        let second_id = ingest_job("s1", "same body")
            .enqueue(&db, 100)
            .await
            .expect("duplicate enqueue");
        assert_eq!(first_id, second_id);

        let all: Vec<QueueJob> = db.get_all_stored_items().await.expect("fetch all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn same_session_jobs_are_claimed_in_enqueue_order() {
        let db = setup_db().await;

        let mut ids = Vec::new();
        for (offset, body) in ["e1", "e2", "e3"].iter().enumerate() {
            let mut job = ingest_job("s1", body);
            // Distinct created_at so ordering is deterministic in the test.
            job.created_at = Utc::now() + chrono::Duration::milliseconds(offset as i64);
            let id = job.enqueue(&db, 100).await.expect("enqueue");
            ids.push(id);
        }

        let lease = Duration::from_secs(60);
        let first = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), lease)
            .await
            .expect("claim")
            .expect("job available");
        assert_eq!(first.id, ids[0]);

        // While e1 is in flight nothing else from s1 is claimable.
        let blocked = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w2", Utc::now(), lease)
            .await
            .expect("claim");
        assert!(blocked.is_none());

        first.mark_succeeded(&db).await.expect("succeed");

        let second = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w2", Utc::now(), lease)
            .await
            .expect("claim")
            .expect("job available");
        assert_eq!(second.id, ids[1]);
    }

    #[tokio::test]
    async fn distinct_sessions_run_in_parallel() {
        let db = setup_db().await;

        let mut a = ingest_job("s1", "a");
        a.created_at = Utc::now();
        let mut b = ingest_job("s2", "b");
        b.created_at = Utc::now() + chrono::Duration::milliseconds(1);
        let a_id = a.enqueue(&db, 100).await.expect("enqueue a");
        let b_id = b.enqueue(&db, 100).await.expect("enqueue b");

        let lease = Duration::from_secs(60);
        let first = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), lease)
            .await
            .expect("claim")
            .expect("first job");
        let second = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w2", Utc::now(), lease)
            .await
            .expect("claim")
            .expect("second job");

        let mut claimed = vec![first.id, second.id];
        claimed.sort();
        let mut expected = vec![a_id, b_id];
        expected.sort();
        assert_eq!(claimed, expected);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_delivered_early() {
        let db = setup_db().await;

        let run_after = Utc::now() + chrono::Duration::hours(1);
        ingest_job("s1", "later")
            .delayed(run_after)
            .enqueue(&db, 100)
            .await
            .expect("enqueue");

        let lease = Duration::from_secs(60);
        let now = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), lease)
            .await
            .expect("claim");
        assert!(now.is_none());

        let after = QueueJob::claim_next_ready(
            &db,
            QueueName::Ingest,
            "w1",
            run_after + chrono::Duration::seconds(1),
            lease,
        )
        .await
        .expect("claim");
        assert!(after.is_some());
    }

    #[tokio::test]
    async fn failed_jobs_retry_then_dead_letter() {
        let db = setup_db().await;

        ingest_job("s1", "flaky").enqueue(&db, 100).await.expect("enqueue");

        let lease = Duration::from_secs(60);
        for attempt in 1..=MAX_ATTEMPTS {
            let job = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), lease)
                .await
                .expect("claim")
                .expect("job available");
            assert_eq!(job.attempts, attempt);

            if job.can_retry() {
                job.mark_failed(&db, "transient", Duration::from_secs(0))
                    .await
                    .expect("fail");
            } else {
                job.mark_dead_letter(&db, "exhausted").await.expect("dead letter");
            }
        }

        let none = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), lease)
            .await
            .expect("claim");
        assert!(none.is_none(), "dead-lettered job must not be claimable");
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimable() {
        let db = setup_db().await;

        ingest_job("s1", "stuck").enqueue(&db, 100).await.expect("enqueue");

        let short_lease = Duration::from_secs(1);
        let job = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), short_lease)
            .await
            .expect("claim")
            .expect("job available");

        // Lease expired: another worker picks the same job up again.
        let later = Utc::now() + chrono::Duration::seconds(5);
        let reclaimed = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w2", later, short_lease)
            .await
            .expect("claim")
            .expect("reclaimable");
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn requeue_resets_failed_jobs() {
        let db = setup_db().await;

        let id = ingest_job("s1", "retry me")
            .enqueue(&db, 100)
            .await
            .expect("enqueue");
        let lease = Duration::from_secs(60);
        let job = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), lease)
            .await
            .expect("claim")
            .expect("job");
        job.mark_dead_letter(&db, "fatal").await.expect("dead letter");

        QueueJob::requeue(&db, &id).await.expect("requeue");

        let reclaimed = QueueJob::claim_next_ready(&db, QueueName::Ingest, "w1", Utc::now(), lease)
            .await
            .expect("claim")
            .expect("requeued job is claimable");
        assert_eq!(reclaimed.id, id);
    }
}
