//! Batch repair for users whose tenant sync is still pending.
//!
//! Three passes share one report shape: tenant assignment retry for users
//! with no tenant, credential bind retry for users whose bind never landed,
//! and a combined legacy pass that runs both. Items are isolated; one
//! failure never stops the batch, and dry runs select without calling the
//! directory or mutating anything.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use subflow_shared::BackfillConfig;

use crate::error::IdentityResult;
use crate::password_sync::{PasswordSynchronizer, SyncFailure, SyncFailureKind};
use crate::provisioner::TenantProvisioner;
use crate::users::{SyncUser, SyncUserStore};

pub const OP_RETRY_TENANT_ASSIGNMENT: &str = "retry-tenant-assignment";
pub const OP_RETRY_CREDENTIAL_BIND: &str = "retry-credential-bind";
pub const OP_BACKFILL_LEGACY_USERS: &str = "backfill-legacy-users";

/// Knobs for one backfill invocation.
#[derive(Debug, Clone, Default)]
pub struct BackfillOptions {
    /// `None` applies the configured batch limit; zero disables the cap.
    pub limit: Option<i64>,
    pub email: Option<String>,
    pub dry_run: bool,
    pub skip_password_check: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillError {
    pub email: String,
    pub kind: SyncFailureKind,
    pub message: String,
}

/// Summary of one pass. `errors` holds at most the configured sample size;
/// the counters stay exact regardless.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub operation: &'static str,
    pub started_at: OffsetDateTime,
    pub dry_run: bool,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<BackfillError>,
}

impl BackfillReport {
    fn new(operation: &'static str, dry_run: bool) -> Self {
        Self {
            operation,
            started_at: OffsetDateTime::now_utc(),
            dry_run,
            selected: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
        }
    }

    fn record_failure(&mut self, cap: usize, email: &str, kind: SyncFailureKind, message: String) {
        self.failed += 1;
        if self.errors.len() < cap {
            self.errors.push(BackfillError {
                email: email.to_string(),
                kind,
                message,
            });
        }
    }
}

fn effective_limit(batch_limit: i64, requested: Option<i64>) -> Option<i64> {
    match requested {
        None => Some(batch_limit),
        Some(n) if n > 0 => Some(n),
        Some(_) => None,
    }
}

fn failure_parts(failure: Option<SyncFailure>) -> (SyncFailureKind, String) {
    match failure {
        Some(failure) => (failure.kind, failure.message),
        None => (
            SyncFailureKind::Unexpected,
            "failure without detail".to_string(),
        ),
    }
}

/// Runs the repair passes the worker schedules.
#[derive(Clone)]
pub struct SyncBackfill {
    users: Arc<dyn SyncUserStore>,
    provisioner: Arc<TenantProvisioner>,
    synchronizer: PasswordSynchronizer,
    config: BackfillConfig,
}

impl SyncBackfill {
    pub fn new(
        users: Arc<dyn SyncUserStore>,
        provisioner: Arc<TenantProvisioner>,
        synchronizer: PasswordSynchronizer,
        config: BackfillConfig,
    ) -> Self {
        Self {
            users,
            provisioner,
            synchronizer,
            config,
        }
    }

    /// Re-attempt tenant provisioning for users still missing a tenant id.
    pub async fn retry_tenant_assignment(
        &self,
        options: &BackfillOptions,
    ) -> IdentityResult<BackfillReport> {
        let mut report = BackfillReport::new(OP_RETRY_TENANT_ASSIGNMENT, options.dry_run);
        let candidates = self
            .users
            .tenant_backfill_candidates(
                effective_limit(self.config.batch_limit, options.limit),
                options.email.as_deref(),
            )
            .await?;
        report.selected = candidates.len();

        for user in &candidates {
            self.provision_one(user, options, &mut report).await;
        }

        self.log_summary(&report);
        Ok(report)
    }

    /// Re-attempt the credential bind for users that have a tenant.
    pub async fn retry_credential_bind(
        &self,
        options: &BackfillOptions,
    ) -> IdentityResult<BackfillReport> {
        let mut report = BackfillReport::new(OP_RETRY_CREDENTIAL_BIND, options.dry_run);
        let candidates = self
            .users
            .bind_backfill_candidates(
                effective_limit(self.config.batch_limit, options.limit),
                options.email.as_deref(),
            )
            .await?;
        report.selected = candidates.len();

        for user in &candidates {
            self.bind_one(user, options, &mut report).await;
        }

        self.log_summary(&report);
        Ok(report)
    }

    /// Combined pass for imported accounts: provision users with no tenant
    /// (which chains a bind), then re-bind users whose tenant already
    /// exists. The limit applies to each phase separately.
    pub async fn backfill_legacy_users(
        &self,
        options: &BackfillOptions,
    ) -> IdentityResult<BackfillReport> {
        let mut report = BackfillReport::new(OP_BACKFILL_LEGACY_USERS, options.dry_run);
        let limit = effective_limit(self.config.batch_limit, options.limit);

        let missing_tenant = self
            .users
            .tenant_backfill_candidates(limit, options.email.as_deref())
            .await?;
        let missing_bind = self
            .users
            .bind_backfill_candidates(limit, options.email.as_deref())
            .await?;
        report.selected = missing_tenant.len() + missing_bind.len();

        for user in &missing_tenant {
            self.provision_one(user, options, &mut report).await;
        }
        for user in &missing_bind {
            self.bind_one(user, options, &mut report).await;
        }

        self.log_summary(&report);
        Ok(report)
    }

    async fn provision_one(
        &self,
        user: &SyncUser,
        options: &BackfillOptions,
        report: &mut BackfillReport,
    ) {
        if options.dry_run {
            info!(email = %user.email, "Dry run: would provision tenant");
            report.skipped += 1;
            return;
        }

        let outcome = self
            .provisioner
            .provision_user(&user.email, options.skip_password_check)
            .await;
        if outcome.success {
            report.succeeded += 1;
        } else {
            let (kind, message) = failure_parts(outcome.failure);
            report.record_failure(self.config.error_sample_size, &user.email, kind, message);
        }
    }

    async fn bind_one(
        &self,
        user: &SyncUser,
        options: &BackfillOptions,
        report: &mut BackfillReport,
    ) {
        if options.dry_run {
            info!(email = %user.email, "Dry run: would bind credential");
            report.skipped += 1;
            return;
        }

        let outcome = self
            .synchronizer
            .bind_user(&user.email, options.skip_password_check)
            .await;
        if outcome.success {
            report.succeeded += 1;
        } else {
            let (kind, message) = failure_parts(outcome.failure);
            report.record_failure(self.config.error_sample_size, &user.email, kind, message);
        }
    }

    fn log_summary(&self, report: &BackfillReport) {
        info!(
            operation = report.operation,
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            dry_run = report.dry_run,
            "Backfill pass finished"
        );
        for error in &report.errors {
            warn!(
                email = %error.email,
                kind = ?error.kind,
                detail = %error.message,
                "Backfill item failed"
            );
        }
    }
}
