//! Activity queue persistence
//!
//! SQLite-backed storage for [`FederatedActivity`] rows and their
//! per-target deliveries. Every state transition of the delivery
//! pipeline is a single SQL statement here.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::AppError;

/// Delivery target used for inbound activities
pub const LOCAL_INBOX_TARGET: &str = "local:inbox";

/// Lifecycle state of an activity or one of its deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityStatus {
    Queued,
    InFlight,
    Processed,
    FailedRetryable,
    Abandoned,
}

impl ActivityStatus {
    pub const ALL: [ActivityStatus; 5] = [
        ActivityStatus::Queued,
        ActivityStatus::InFlight,
        ActivityStatus::Processed,
        ActivityStatus::FailedRetryable,
        ActivityStatus::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Queued => "queued",
            ActivityStatus::InFlight => "in_flight",
            ActivityStatus::Processed => "processed",
            ActivityStatus::FailedRetryable => "failed_retryable",
            ActivityStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivityStatus::Processed | ActivityStatus::Abandoned)
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Unknown activity status {:?}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(AppError::Internal(anyhow::anyhow!(
                "Unknown direction {:?}",
                other
            ))),
        }
    }
}

/// One (activity, target) unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub activity_id: String,
    pub target_url: String,
    pub status: ActivityStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
}

/// An activity with its aggregate lifecycle state.
#[derive(Debug, Clone)]
pub struct FederatedActivity {
    pub id: String,
    pub direction: Direction,
    pub activity_type: Option<String>,
    pub payload: serde_json::Value,
    /// Inbound only
    pub source_actor_url: Option<String>,
    /// Outbound only
    pub target_urls: Vec<String>,
    pub status: ActivityStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub deliveries: Vec<Delivery>,
}

/// New inbound activity
#[derive(Debug, Clone)]
pub struct NewInbound<'a> {
    pub id: &'a str,
    pub activity_type: Option<&'a str>,
    /// Raw request body
    pub payload: &'a [u8],
    pub source_actor_url: Option<&'a str>,
    /// Serialized request metadata when verification is deferred
    pub request_meta: Option<String>,
    pub verified: bool,
}

/// A delivery claimed by a worker, joined with its activity.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub activity_id: String,
    pub target_url: String,
    pub direction: Direction,
    pub activity_type: Option<String>,
    pub payload: Vec<u8>,
    pub source_actor_url: Option<String>,
    pub request_meta: Option<String>,
    pub verified: bool,
    /// When the activity was recorded; for inbound, when the request arrived
    pub received_at: DateTime<Utc>,
    /// Attempt number of this claim, starting at 1
    pub attempt: u32,
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    id: String,
    direction: String,
    activity_type: Option<String>,
    payload: Vec<u8>,
    source_actor_url: Option<String>,
    request_meta: Option<String>,
    verified: bool,
    status: String,
    attempt_count: i64,
    last_error: Option<String>,
    created_at_ms: i64,
    next_attempt_at_ms: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    activity_id: String,
    target_url: String,
    status: String,
    attempt_count: i64,
    last_error: Option<String>,
    next_attempt_at_ms: i64,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = AppError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(Delivery {
            activity_id: row.activity_id,
            target_url: row.target_url,
            status: row.status.parse()?,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            next_attempt_at: from_millis(row.next_attempt_at_ms),
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Database-backed activity queue.
#[derive(Clone)]
pub struct ActivityStore {
    pool: SqlitePool,
}

impl ActivityStore {
    /// Open (creating if needed) the queue database and run migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Activity store connected and migrated");
        Ok(Self { pool })
    }

    /// Record an outbound activity with one delivery per target.
    ///
    /// Existing (activity, target) pairs are left untouched. Returns the
    /// number of newly queued deliveries.
    pub async fn enqueue_outbound(
        &self,
        id: &str,
        activity_type: Option<&str>,
        payload: &[u8],
        targets: &[String],
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let now_ms = to_millis(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO federated_activities
                (id, direction, activity_type, payload, verified, status, created_at_ms, next_attempt_at_ms)
            VALUES (?, 'outbound', ?, ?, 1, 'queued', ?, ?)
            "#,
        )
        .bind(id)
        .bind(activity_type)
        .bind(payload)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        let mut inserted = 0;
        for target in targets {
            inserted += sqlx::query(
                r#"
                INSERT OR IGNORE INTO deliveries
                    (activity_id, target_url, status, next_attempt_at_ms, updated_at_ms)
                VALUES (?, ?, 'queued', ?, ?)
                "#,
            )
            .bind(id)
            .bind(target)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        if inserted > 0 {
            self.refresh_activity_status(id).await?;
        }
        Ok(inserted)
    }

    /// Record an inbound activity under the dedup key
    /// `(id, "local:inbox")`. Returns `false` for a duplicate.
    ///
    /// A stored copy that was never authenticated and has been abandoned
    /// does not count: it is replaced by the new request, so an
    /// unauthenticated request cannot claim an id for good.
    pub async fn enqueue_inbound(
        &self,
        inbound: NewInbound<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let now_ms = to_millis(now);
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<bool, AppError> = async {
            let existing: Option<(String, bool, String)> = sqlx::query_as(
                "SELECT direction, verified, status FROM federated_activities WHERE id = ?",
            )
            .bind(inbound.id)
            .fetch_optional(&mut *conn)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO federated_activities
                            (id, direction, activity_type, payload, source_actor_url, request_meta,
                             verified, status, created_at_ms, next_attempt_at_ms)
                        VALUES (?, 'inbound', ?, ?, ?, ?, ?, 'queued', ?, ?)
                        "#,
                    )
                    .bind(inbound.id)
                    .bind(inbound.activity_type)
                    .bind(inbound.payload)
                    .bind(inbound.source_actor_url)
                    .bind(&inbound.request_meta)
                    .bind(inbound.verified)
                    .bind(now_ms)
                    .bind(now_ms)
                    .execute(&mut *conn)
                    .await?;

                    sqlx::query(
                        r#"
                        INSERT INTO deliveries
                            (activity_id, target_url, status, next_attempt_at_ms, updated_at_ms)
                        VALUES (?, ?, 'queued', ?, ?)
                        "#,
                    )
                    .bind(inbound.id)
                    .bind(LOCAL_INBOX_TARGET)
                    .bind(now_ms)
                    .bind(now_ms)
                    .execute(&mut *conn)
                    .await?;
                    Ok(true)
                }
                Some((direction, verified, status))
                    if direction == Direction::Inbound.as_str()
                        && !verified
                        && status == ActivityStatus::Abandoned.as_str() =>
                {
                    tracing::info!(activity = %inbound.id, "Replacing unauthenticated abandoned activity");
                    sqlx::query(
                        r#"
                        UPDATE federated_activities
                        SET activity_type = ?, payload = ?, source_actor_url = ?, request_meta = ?,
                            verified = ?, status = 'queued', attempt_count = 0, last_error = NULL,
                            created_at_ms = ?, next_attempt_at_ms = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(inbound.activity_type)
                    .bind(inbound.payload)
                    .bind(inbound.source_actor_url)
                    .bind(&inbound.request_meta)
                    .bind(inbound.verified)
                    .bind(now_ms)
                    .bind(now_ms)
                    .bind(inbound.id)
                    .execute(&mut *conn)
                    .await?;

                    sqlx::query(
                        r#"
                        UPDATE deliveries
                        SET status = 'queued', attempt_count = 0, last_error = NULL,
                            next_attempt_at_ms = ?1, updated_at_ms = ?1
                        WHERE activity_id = ?2 AND target_url = ?3
                        "#,
                    )
                    .bind(now_ms)
                    .bind(inbound.id)
                    .bind(LOCAL_INBOX_TARGET)
                    .execute(&mut *conn)
                    .await?;
                    Ok(true)
                }
                // Already handled, still pending, or our own outbound
                // activity echoed back.
                Some(_) => Ok(false),
            }
        }
        .await;

        match result {
            Ok(created) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(created)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Move due `failed_retryable` deliveries back to `queued`.
    pub async fn requeue_due(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'queued', updated_at_ms = ?1
            WHERE status = 'failed_retryable' AND next_attempt_at_ms <= ?1
            "#,
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Atomically claim the oldest due delivery, moving it to `in_flight`
    /// and counting the attempt.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<ClaimedJob>, AppError> {
        self.requeue_due(now).await?;

        let claimed: Option<(String, String, i64)> = sqlx::query_as(
            r#"
            UPDATE deliveries
            SET status = 'in_flight', attempt_count = attempt_count + 1, updated_at_ms = ?1
            WHERE rowid = (
                SELECT rowid FROM deliveries
                WHERE status = 'queued' AND next_attempt_at_ms <= ?1
                ORDER BY next_attempt_at_ms, rowid
                LIMIT 1
            )
            RETURNING activity_id, target_url, attempt_count
            "#,
        )
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some((activity_id, target_url, attempt)) = claimed else {
            return Ok(None);
        };

        let row = self.activity_row(&activity_id).await?.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "Delivery references missing activity {}",
                activity_id
            ))
        })?;
        self.refresh_activity_status(&activity_id).await?;

        Ok(Some(ClaimedJob {
            activity_id,
            target_url,
            direction: row.direction.parse()?,
            activity_type: row.activity_type,
            payload: row.payload,
            source_actor_url: row.source_actor_url,
            request_meta: row.request_meta,
            verified: row.verified,
            received_at: from_millis(row.created_at_ms),
            attempt: attempt.max(0) as u32,
        }))
    }

    pub async fn mark_processed(&self, activity_id: &str, target_url: &str) -> Result<(), AppError> {
        self.finish(
            activity_id,
            target_url,
            ActivityStatus::Processed,
            None,
            Utc::now(),
        )
        .await
    }

    pub async fn mark_retry(
        &self,
        activity_id: &str,
        target_url: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.finish(
            activity_id,
            target_url,
            ActivityStatus::FailedRetryable,
            Some(error),
            next_attempt_at,
        )
        .await
    }

    pub async fn mark_abandoned(
        &self,
        activity_id: &str,
        target_url: &str,
        error: &str,
    ) -> Result<(), AppError> {
        self.finish(
            activity_id,
            target_url,
            ActivityStatus::Abandoned,
            Some(error),
            Utc::now(),
        )
        .await
    }

    /// Flag an inbound activity as verified and record its signer.
    pub async fn mark_verified(
        &self,
        activity_id: &str,
        source_actor_url: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE federated_activities SET verified = 1, source_actor_url = ? WHERE id = ?",
        )
        .bind(source_actor_url)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        activity_id: &str,
        target_url: &str,
        status: ActivityStatus,
        error: Option<&str>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        // Processed rows are final; never move them again.
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = ?, last_error = COALESCE(?, last_error),
                next_attempt_at_ms = ?, updated_at_ms = ?
            WHERE activity_id = ? AND target_url = ? AND status != 'processed'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(to_millis(next_attempt_at))
        .bind(to_millis(Utc::now()))
        .bind(activity_id)
        .bind(target_url)
        .execute(&self.pool)
        .await?;

        self.refresh_activity_status(activity_id).await
    }

    /// Return deliveries left `in_flight` by a previous process to `queued`.
    pub async fn recover_in_flight(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE deliveries SET status = 'queued', updated_at_ms = ? WHERE status = 'in_flight'",
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered, "Requeued deliveries interrupted by shutdown");
            let ids: Vec<(String,)> = sqlx::query_as(
                "SELECT id FROM federated_activities WHERE status = 'in_flight'",
            )
            .fetch_all(&self.pool)
            .await?;
            for (id,) in ids {
                self.refresh_activity_status(&id).await?;
            }
        }
        Ok(recovered)
    }

    /// Recompute the activity's aggregate status from its deliveries.
    ///
    /// All processed: processed. All terminal with an abandonment:
    /// abandoned. Otherwise the least advanced live state. Read and write
    /// happen under one write lock so concurrent workers finishing
    /// different targets cannot leave a stale aggregate behind.
    pub async fn refresh_activity_status(&self, activity_id: &str) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            let deliveries = fetch_deliveries(&mut conn, activity_id).await?;
            if deliveries.is_empty() {
                return Ok(());
            }

            let status = aggregate_status(deliveries.iter().map(|delivery| delivery.status));
            let attempt_count = deliveries
                .iter()
                .map(|delivery| delivery.attempt_count)
                .max()
                .unwrap_or(0);
            let last_error = deliveries
                .iter()
                .filter(|delivery| delivery.last_error.is_some())
                .max_by_key(|delivery| delivery.next_attempt_at)
                .and_then(|delivery| delivery.last_error.clone());
            let next_attempt_at = deliveries
                .iter()
                .filter(|delivery| !delivery.status.is_terminal())
                .map(|delivery| to_millis(delivery.next_attempt_at))
                .min();

            sqlx::query(
                r#"
                UPDATE federated_activities
                SET status = ?, attempt_count = ?, last_error = ?, next_attempt_at_ms = ?
                WHERE id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(attempt_count as i64)
            .bind(last_error)
            .bind(next_attempt_at)
            .bind(activity_id)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Look up an activity with its deliveries.
    pub async fn activity(&self, id: &str) -> Result<Option<FederatedActivity>, AppError> {
        let Some(row) = self.activity_row(id).await? else {
            return Ok(None);
        };
        let deliveries = self.deliveries(id).await?;
        let direction: Direction = row.direction.parse()?;

        let target_urls = match direction {
            Direction::Outbound => deliveries
                .iter()
                .map(|delivery| delivery.target_url.clone())
                .collect(),
            Direction::Inbound => Vec::new(),
        };

        Ok(Some(FederatedActivity {
            id: row.id,
            direction,
            activity_type: row.activity_type,
            payload: serde_json::from_slice(&row.payload).unwrap_or(serde_json::Value::Null),
            source_actor_url: row.source_actor_url,
            target_urls,
            status: row.status.parse()?,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            created_at: from_millis(row.created_at_ms),
            next_attempt_at: row.next_attempt_at_ms.map(from_millis),
            deliveries,
        }))
    }

    /// Number of deliveries per status.
    pub async fn status_counts(&self) -> Result<Vec<(ActivityStatus, i64)>, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM deliveries GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: Vec<(ActivityStatus, i64)> =
            ActivityStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for (status, count) in rows {
            let status: ActivityStatus = status.parse()?;
            if let Some(slot) = counts.iter_mut().find(|(known, _)| *known == status) {
                slot.1 = count;
            }
        }
        Ok(counts)
    }

    /// Whether any delivery is queued or waiting for a retry.
    pub async fn has_pending(&self) -> Result<bool, AppError> {
        let (pending,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM deliveries WHERE status IN ('queued', 'in_flight', 'failed_retryable')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(pending > 0)
    }

    async fn activity_row(&self, id: &str) -> Result<Option<ActivityRow>, AppError> {
        Ok(
            sqlx::query_as::<_, ActivityRow>("SELECT * FROM federated_activities WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn deliveries(&self, activity_id: &str) -> Result<Vec<Delivery>, AppError> {
        let mut conn = self.pool.acquire().await?;
        fetch_deliveries(&mut conn, activity_id).await
    }
}

async fn fetch_deliveries(
    conn: &mut SqliteConnection,
    activity_id: &str,
) -> Result<Vec<Delivery>, AppError> {
    sqlx::query_as::<_, DeliveryRow>(
        r#"
        SELECT activity_id, target_url, status, attempt_count, last_error, next_attempt_at_ms
        FROM deliveries
        WHERE activity_id = ?
        ORDER BY rowid
        "#,
    )
    .bind(activity_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(Delivery::try_from)
    .collect()
}

/// Aggregate status of an activity from its deliveries' statuses.
pub fn aggregate_status(statuses: impl IntoIterator<Item = ActivityStatus>) -> ActivityStatus {
    let statuses: Vec<ActivityStatus> = statuses.into_iter().collect();

    if statuses.iter().all(|status| *status == ActivityStatus::Processed) {
        return ActivityStatus::Processed;
    }
    if statuses.iter().all(ActivityStatus::is_terminal) {
        return ActivityStatus::Abandoned;
    }
    [
        ActivityStatus::Queued,
        ActivityStatus::InFlight,
        ActivityStatus::FailedRetryable,
    ]
    .into_iter()
    .find(|live| statuses.contains(live))
    .unwrap_or(ActivityStatus::Queued)
}
