//! Durable ledger of registration attempts, queryable by any correlated key.
//!
//! The ledger is append-only: rows are mutated only by block/unblock and
//! removed only by an explicit administrative purge. Blocking by one key
//! never touches rows that merely share a different key.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::IdentityResult;

/// The correlated keys an attempt can be looked up by. Column mapping for
/// the Postgres implementation lives here and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptKey {
    Ip,
    Email,
    DeviceSignature,
    FingerprintId,
}

impl AttemptKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptKey::Ip => "ip",
            AttemptKey::Email => "email",
            AttemptKey::DeviceSignature => "device_signature",
            AttemptKey::FingerprintId => "fingerprint_id",
        }
    }

    /// Backing column. The enum is closed, so interpolating this into SQL
    /// cannot inject anything.
    fn column(&self) -> &'static str {
        match self {
            AttemptKey::Ip => "ip_address",
            AttemptKey::Email => "email",
            AttemptKey::DeviceSignature => "device_signature",
            AttemptKey::FingerprintId => "fingerprint_id",
        }
    }
}

impl std::fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded registration/fingerprint submission.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FingerprintAttempt {
    pub id: Uuid,
    pub ip_address: String,
    pub user_agent: String,
    pub device_signature: String,
    pub fingerprint_id: Option<String>,
    pub email: Option<String>,
    pub blocked: bool,
    pub blocked_at: Option<OffsetDateTime>,
    pub block_reason: Option<String>,
    /// Opaque side-channel payload submitted with the attempt.
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Insert model for a new attempt row.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub ip_address: String,
    pub user_agent: String,
    pub device_signature: String,
    pub fingerprint_id: Option<String>,
    pub email: Option<String>,
    pub payload: serde_json::Value,
}

/// Optional filters for administrative list/stats queries.
#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    pub ip: Option<String>,
    pub email: Option<String>,
    /// Trailing window in days; unset means all time.
    pub days: Option<i64>,
    pub limit: Option<i64>,
}

impl AttemptFilter {
    fn cutoff(&self) -> Option<OffsetDateTime> {
        self.days
            .map(|days| OffsetDateTime::now_utc() - Duration::days(days))
    }
}

/// Aggregate counts over the ledger, optionally filtered.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AttemptStats {
    pub total_attempts: i64,
    pub blocked_attempts: i64,
    pub distinct_ips: i64,
    pub distinct_emails: i64,
    pub distinct_devices: i64,
}

/// Storage seam for the attempt ledger. The decision engine depends on this
/// trait, not on Postgres.
#[async_trait]
pub trait AttemptLedger: Send + Sync {
    /// Append a new attempt. Appending never fails on duplicate content.
    async fn record(&self, attempt: NewAttempt) -> IdentityResult<FingerprintAttempt>;

    /// All attempts matching one key, most recent first.
    async fn find_by_key(
        &self,
        key: AttemptKey,
        value: &str,
    ) -> IdentityResult<Vec<FingerprintAttempt>>;

    /// Attempts matching one key inside the trailing window. Blocked and
    /// unblocked rows count alike; every attempt counts toward thresholds.
    async fn count_recent(
        &self,
        key: AttemptKey,
        value: &str,
        window_days: i64,
    ) -> IdentityResult<i64>;

    /// Whether any attempt matching this key is currently blocked.
    async fn any_blocked(&self, key: AttemptKey, value: &str) -> IdentityResult<bool>;

    /// Block every attempt matching one key in a single atomic update.
    /// Returns the number of newly blocked rows.
    async fn block(&self, key: AttemptKey, value: &str, reason: &str) -> IdentityResult<u64>;

    /// Unblock every attempt matching one key, clearing `blocked_at` and
    /// `block_reason` in the same atomic update. Returns rows cleared.
    async fn unblock(&self, key: AttemptKey, value: &str) -> IdentityResult<u64>;

    /// Administrative listing with optional ip/email/window filters.
    async fn list(&self, filter: &AttemptFilter) -> IdentityResult<Vec<FingerprintAttempt>>;

    /// Aggregate counts with the same optional filters.
    async fn stats(&self, filter: &AttemptFilter) -> IdentityResult<AttemptStats>;

    /// Delete attempts older than the given number of days. Administrative
    /// use only; nothing in the core schedules this.
    async fn purge_older_than(&self, days: i64) -> IdentityResult<u64>;
}

/// Postgres-backed ledger over the `fingerprint_attempts` table.
#[derive(Clone)]
pub struct PgAttemptLedger {
    pool: PgPool,
}

impl PgAttemptLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ATTEMPT_COLUMNS: &str = "id, ip_address, user_agent, device_signature, fingerprint_id, \
     email, blocked, blocked_at, block_reason, payload, created_at";

#[async_trait]
impl AttemptLedger for PgAttemptLedger {
    async fn record(&self, attempt: NewAttempt) -> IdentityResult<FingerprintAttempt> {
        let row: FingerprintAttempt = sqlx::query_as(&format!(
            r#"
            INSERT INTO fingerprint_attempts (
                ip_address,
                user_agent,
                device_signature,
                fingerprint_id,
                email,
                payload
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(&attempt.ip_address)
        .bind(&attempt.user_agent)
        .bind(&attempt.device_signature)
        .bind(&attempt.fingerprint_id)
        .bind(&attempt.email)
        .bind(&attempt.payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_by_key(
        &self,
        key: AttemptKey,
        value: &str,
    ) -> IdentityResult<Vec<FingerprintAttempt>> {
        let rows: Vec<FingerprintAttempt> = sqlx::query_as(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM fingerprint_attempts
            WHERE {column} = $1
            ORDER BY created_at DESC
            "#,
            column = key.column()
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_recent(
        &self,
        key: AttemptKey,
        value: &str,
        window_days: i64,
    ) -> IdentityResult<i64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(window_days);
        let count: i64 = sqlx::query_scalar(&format!(
            r#"
            SELECT COUNT(*)
            FROM fingerprint_attempts
            WHERE {column} = $1
              AND created_at >= $2
            "#,
            column = key.column()
        ))
        .bind(value)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn any_blocked(&self, key: AttemptKey, value: &str) -> IdentityResult<bool> {
        let blocked: bool = sqlx::query_scalar(&format!(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM fingerprint_attempts
                WHERE {column} = $1 AND blocked = TRUE
            )
            "#,
            column = key.column()
        ))
        .bind(value)
        .fetch_one(&self.pool)
        .await?;

        Ok(blocked)
    }

    async fn block(&self, key: AttemptKey, value: &str, reason: &str) -> IdentityResult<u64> {
        // Single statement, so the per-key update is all-or-nothing.
        // Already-blocked rows keep their original blocked_at and reason.
        let result = sqlx::query(&format!(
            r#"
            UPDATE fingerprint_attempts
            SET blocked = TRUE,
                blocked_at = NOW(),
                block_reason = $2
            WHERE {column} = $1
              AND blocked = FALSE
            "#,
            column = key.column()
        ))
        .bind(value)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn unblock(&self, key: AttemptKey, value: &str) -> IdentityResult<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE fingerprint_attempts
            SET blocked = FALSE,
                blocked_at = NULL,
                block_reason = NULL
            WHERE {column} = $1
              AND blocked = TRUE
            "#,
            column = key.column()
        ))
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list(&self, filter: &AttemptFilter) -> IdentityResult<Vec<FingerprintAttempt>> {
        let rows: Vec<FingerprintAttempt> = sqlx::query_as(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM fingerprint_attempts
            WHERE ($1::text IS NULL OR ip_address = $1)
              AND ($2::text IS NULL OR email = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#
        ))
        .bind(&filter.ip)
        .bind(&filter.email)
        .bind(filter.cutoff())
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn stats(&self, filter: &AttemptFilter) -> IdentityResult<AttemptStats> {
        let stats: AttemptStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total_attempts,
                COUNT(*) FILTER (WHERE blocked) AS blocked_attempts,
                COUNT(DISTINCT ip_address) AS distinct_ips,
                COUNT(DISTINCT email) AS distinct_emails,
                COUNT(DISTINCT device_signature) AS distinct_devices
            FROM fingerprint_attempts
            WHERE ($1::text IS NULL OR ip_address = $1)
              AND ($2::text IS NULL OR email = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            "#,
        )
        .bind(&filter.ip)
        .bind(&filter.email)
        .bind(filter.cutoff())
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    async fn purge_older_than(&self, days: i64) -> IdentityResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(days);
        let result = sqlx::query("DELETE FROM fingerprint_attempts WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
