//! User persistence behind the [`SyncUserStore`] seam.
//!
//! Two credentials live on a user row: `password_hash` is the Argon2 hash
//! used for local login and never leaves the database, while
//! `subscriber_password` is the plaintext mirror the tenant directory needs
//! for provisioning. The mirror is excluded from serialization.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use subflow_shared::PlanTier;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{IdentityError, IdentityResult};

const USER_COLUMNS: &str = "id, name, email, subscriber_password, tenant_id, has_used_free_plan, \
     free_plan_used_at, last_ip, last_device_fingerprint, last_login_at, status, created_at, updated_at";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SyncUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub subscriber_password: Option<String>,
    pub tenant_id: Option<String>,
    pub has_used_free_plan: bool,
    pub free_plan_used_at: Option<OffsetDateTime>,
    pub last_ip: Option<String>,
    pub last_device_fingerprint: Option<String>,
    pub last_login_at: Option<OffsetDateTime>,
    /// Negative status means the account is disabled and excluded from
    /// backfill selection.
    pub status: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub login_password: String,
    pub subscriber_password: Option<String>,
}

/// Storage seam for the registration and synchronization flows.
#[async_trait]
pub trait SyncUserStore: Send + Sync {
    async fn create_user(&self, new_user: NewUser) -> IdentityResult<SyncUser>;

    async fn find_by_email(&self, email: &str) -> IdentityResult<Option<SyncUser>>;

    async fn find_by_id(&self, id: Uuid) -> IdentityResult<Option<SyncUser>>;

    /// Take the per-user provisioning lease. Concurrent holders for the same
    /// email are serialized; `None` means no such user.
    async fn lock_for_provisioning(
        &self,
        email: &str,
    ) -> IdentityResult<Option<Box<dyn ProvisionLease>>>;

    /// Idempotent: a second call for the same user is a no-op.
    async fn mark_free_plan_used(&self, user_id: Uuid) -> IdentityResult<()>;

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        ip: &str,
        device_fingerprint: &str,
    ) -> IdentityResult<()>;

    /// Whether the user ever completed an order for a non-free tier.
    async fn has_completed_paid_order(&self, user_id: Uuid) -> IdentityResult<bool>;

    /// Users still missing a tenant id that backfill can provision: active,
    /// with a subscriber credential on record, oldest first.
    async fn tenant_backfill_candidates(
        &self,
        limit: Option<i64>,
        email: Option<&str>,
    ) -> IdentityResult<Vec<SyncUser>>;

    /// Users with a tenant whose credential bind may still be pending.
    async fn bind_backfill_candidates(
        &self,
        limit: Option<i64>,
        email: Option<&str>,
    ) -> IdentityResult<Vec<SyncUser>>;
}

/// Exclusive hold on one user row for the duration of a provisioning call.
///
/// The tenant id is write-once: persisting the value already stored is a
/// no-op, persisting a different one fails without touching the row.
/// Dropping the lease without [`ProvisionLease::commit`] discards any
/// pending write.
#[async_trait]
pub trait ProvisionLease: Send {
    fn user(&self) -> &SyncUser;

    async fn persist_tenant_id(&mut self, tenant_id: &str) -> IdentityResult<()>;

    async fn commit(&mut self) -> IdentityResult<()>;
}

#[derive(Clone)]
pub struct PgSyncUserStore {
    pool: PgPool,
}

impl PgSyncUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn hash_login_password(password: &str) -> IdentityResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| IdentityError::PasswordHash(e.to_string()))?;
    Ok(hash.to_string())
}

#[async_trait]
impl SyncUserStore for PgSyncUserStore {
    async fn create_user(&self, new_user: NewUser) -> IdentityResult<SyncUser> {
        let password_hash = hash_login_password(&new_user.login_password)?;
        let user: SyncUser = sqlx::query_as(&format!(
            r#"
            INSERT INTO users (name, email, password_hash, subscriber_password)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&new_user.name)
        .bind(&new_user.email)
        .bind(&password_hash)
        .bind(&new_user.subscriber_password)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(user_id = %user.id, email = %user.email, "User created");
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> IdentityResult<Option<SyncUser>> {
        let user: Option<SyncUser> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> IdentityResult<Option<SyncUser>> {
        let user: Option<SyncUser> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(user)
    }

    async fn lock_for_provisioning(
        &self,
        email: &str,
    ) -> IdentityResult<Option<Box<dyn ProvisionLease>>> {
        let mut tx = self.pool.begin().await?;
        let user: Option<SyncUser> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 FOR UPDATE"
        ))
        .bind(email)
        .fetch_optional(&mut *tx)
        .await?;

        match user {
            Some(user) => Ok(Some(Box::new(PgProvisionLease { tx: Some(tx), user }))),
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn mark_free_plan_used(&self, user_id: Uuid) -> IdentityResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET has_used_free_plan = TRUE, free_plan_used_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND has_used_free_plan = FALSE
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(user_id = %user_id, "Free plan marker already set");
        }
        Ok(())
    }

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        ip: &str,
        device_fingerprint: &str,
    ) -> IdentityResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET last_ip = $2, last_device_fingerprint = $3, last_login_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(ip)
        .bind(device_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_completed_paid_order(&self, user_id: Uuid) -> IdentityResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM orders
                WHERE user_id = $1 AND status = 'completed' AND plan_tier <> $2
            )
            "#,
        )
        .bind(user_id)
        .bind(PlanTier::Free.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn tenant_backfill_candidates(
        &self,
        limit: Option<i64>,
        email: Option<&str>,
    ) -> IdentityResult<Vec<SyncUser>> {
        let users: Vec<SyncUser> = sqlx::query_as(&format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE tenant_id IS NULL
              AND subscriber_password IS NOT NULL
              AND status >= 0
              AND ($1::text IS NULL OR email = $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(email)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn bind_backfill_candidates(
        &self,
        limit: Option<i64>,
        email: Option<&str>,
    ) -> IdentityResult<Vec<SyncUser>> {
        let users: Vec<SyncUser> = sqlx::query_as(&format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE tenant_id IS NOT NULL
              AND subscriber_password IS NOT NULL
              AND status >= 0
              AND ($1::text IS NULL OR email = $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(email)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}

struct PgProvisionLease {
    tx: Option<Transaction<'static, Postgres>>,
    user: SyncUser,
}

#[async_trait]
impl ProvisionLease for PgProvisionLease {
    fn user(&self) -> &SyncUser {
        &self.user
    }

    async fn persist_tenant_id(&mut self, tenant_id: &str) -> IdentityResult<()> {
        if let Some(existing) = &self.user.tenant_id {
            if existing == tenant_id {
                return Ok(());
            }
            return Err(IdentityError::TenantIdConflict {
                user_id: self.user.id,
                existing: existing.clone(),
                attempted: tenant_id.to_string(),
            });
        }

        let tx = self
            .tx
            .as_mut()
            .ok_or(IdentityError::Invariant("provisioning lease already closed"))?;
        sqlx::query("UPDATE users SET tenant_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(self.user.id)
            .bind(tenant_id)
            .execute(&mut **tx)
            .await?;
        self.user.tenant_id = Some(tenant_id.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> IdentityResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}
