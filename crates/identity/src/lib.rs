// Identity crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::large_enum_variant)] // RegistrationOutcome carries the created user row
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subflow Identity Module
//!
//! Handles registration abuse screening and synchronization of local accounts
//! into the upstream tenant directory.
//!
//! ## Features
//!
//! - **Device Fingerprinting**: SHA-256 signatures over perceptual browser signals
//! - **Attempt Ledger**: Append-only record of registration attempts per tracking key
//! - **Signup Gatekeeping**: Allow/deny verdicts with automatic block escalation
//! - **Free Plan Screening**: One free plan per account, checked against order history
//! - **Tenant Provisioning**: Create-or-adopt upstream tenants, serialized per email
//! - **Credential Sync**: Subscriber password binds with recoverable-conflict handling
//! - **Backfill**: Batch repair passes for users whose sync is still pending
//! - **Attempt Administration**: List, unblock, and purge ledger records

pub mod admin;
pub mod backfill;
pub mod error;
pub mod fingerprint;
pub mod gatekeeper;
pub mod ledger;
pub mod password_policy;
pub mod password_sync;
pub mod provisioner;
pub mod registration;
pub mod tenant_api;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support;


// Admin
pub use admin::AttemptAdmin;

// Backfill
pub use backfill::{
    BackfillError, BackfillOptions, BackfillReport, SyncBackfill, OP_BACKFILL_LEGACY_USERS,
    OP_RETRY_CREDENTIAL_BIND, OP_RETRY_TENANT_ASSIGNMENT,
};

// Error
pub use error::{IdentityError, IdentityResult};

// Fingerprint
pub use fingerprint::{ClientSignals, FingerprintStrategy, Sha256Fingerprinter};

// Gatekeeper
pub use gatekeeper::{
    AttemptKeys, DenyReason, SignupGatekeeper, Verdict, BLOCK_REASON_TOO_MANY_ATTEMPTS,
};

// Ledger
pub use ledger::{
    AttemptFilter, AttemptKey, AttemptLedger, AttemptStats, FingerprintAttempt, NewAttempt,
    PgAttemptLedger,
};

// Password Policy
pub use password_policy::{
    is_valid_subscriber_password, validate_subscriber_password, PasswordPolicyError,
};

// Password Sync
pub use password_sync::{BindOutcome, PasswordSynchronizer, SyncFailure, SyncFailureKind};

// Provisioner
pub use provisioner::{ProvisionOutcome, TenantProvisioner};

// Registration
pub use registration::{RegistrationOutcome, RegistrationService, SignupRequest};

// Tenant API
pub use tenant_api::{
    BindClass, BindPasswordRequest, CreateClass, CreateTenantRequest, HttpTenantDirectory,
    TenantApiResponse, TenantDirectory,
};

// Users
pub use users::{NewUser, PgSyncUserStore, ProvisionLease, SyncUser, SyncUserStore};

use std::sync::Arc;

use sqlx::PgPool;
use subflow_shared::AppConfig;

/// Main identity service that combines screening, registration, and sync
pub struct IdentityService {
    pub registration: RegistrationService,
    pub gatekeeper: SignupGatekeeper,
    pub provisioner: Arc<TenantProvisioner>,
    pub synchronizer: PasswordSynchronizer,
    pub backfill: SyncBackfill,
    pub admin: AttemptAdmin,
}

impl IdentityService {
    /// Create a new identity service from environment variables
    pub fn from_env(pool: PgPool) -> IdentityResult<Self> {
        let config = AppConfig::from_env()?;
        Self::new(config, pool)
    }

    /// Create a new identity service with explicit config
    pub fn new(config: AppConfig, pool: PgPool) -> IdentityResult<Self> {
        let ledger: Arc<dyn AttemptLedger> = Arc::new(PgAttemptLedger::new(pool.clone()));
        let users: Arc<dyn SyncUserStore> = Arc::new(PgSyncUserStore::new(pool));
        let directory: Arc<dyn TenantDirectory> =
            Arc::new(HttpTenantDirectory::new(config.tenant_api.clone())?);

        let gatekeeper = SignupGatekeeper::new(ledger.clone(), users.clone(), config.abuse);
        let synchronizer = PasswordSynchronizer::new(directory.clone(), users.clone());
        let provisioner = Arc::new(TenantProvisioner::new(
            directory,
            users.clone(),
            synchronizer.clone(),
            config.tenant_api,
        ));

        Ok(Self {
            registration: RegistrationService::new(
                Arc::new(Sha256Fingerprinter),
                gatekeeper.clone(),
                users.clone(),
                provisioner.clone(),
            ),
            gatekeeper,
            provisioner: provisioner.clone(),
            synchronizer: synchronizer.clone(),
            backfill: SyncBackfill::new(users, provisioner, synchronizer, config.backfill),
            admin: AttemptAdmin::new(ledger),
        })
    }
}
