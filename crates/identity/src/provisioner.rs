//! Tenant provisioning against the external directory.
//!
//! Provisioning happens under the per-email lease from
//! [`SyncUserStore::lock_for_provisioning`], held across the external call so
//! two workers can never race an upstream create for the same user. A user
//! whose tenant id is already set short-circuits before any network traffic.
//!
//! Provisioning failures never propagate as errors. The local user row stays
//! valid with a null tenant id and the backfill jobs repair it later.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use subflow_shared::TenantApiConfig;

use crate::error::IdentityResult;
use crate::password_policy::validate_subscriber_password;
use crate::password_sync::{kind_for_error, PasswordSynchronizer, SyncFailure, SyncFailureKind};
use crate::tenant_api::{CreateClass, CreateTenantRequest, TenantDirectory};
use crate::users::SyncUserStore;

/// Result of one provisioning attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub success: bool,
    pub tenant_id: Option<String>,
    /// True when an existing upstream tenant was adopted instead of created.
    pub recovered: bool,
    pub bind_attempted: bool,
    pub bound: bool,
    pub failure: Option<SyncFailure>,
}

impl ProvisionOutcome {
    fn succeeded(tenant_id: String, recovered: bool) -> Self {
        Self {
            success: true,
            tenant_id: Some(tenant_id),
            recovered,
            bind_attempted: false,
            bound: false,
            failure: None,
        }
    }

    fn failed(kind: SyncFailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            tenant_id: None,
            recovered: false,
            bind_attempted: false,
            bound: false,
            failure: Some(SyncFailure::new(kind, message)),
        }
    }
}

/// Creates upstream tenants for local users and records their ids.
#[derive(Clone)]
pub struct TenantProvisioner {
    directory: Arc<dyn TenantDirectory>,
    users: Arc<dyn SyncUserStore>,
    synchronizer: PasswordSynchronizer,
    config: TenantApiConfig,
}

impl TenantProvisioner {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        users: Arc<dyn SyncUserStore>,
        synchronizer: PasswordSynchronizer,
        config: TenantApiConfig,
    ) -> Self {
        Self {
            directory,
            users,
            synchronizer,
            config,
        }
    }

    /// Provision the upstream tenant for `email`, persist its id, then chain
    /// a best-effort credential bind. Never returns an error: anything that
    /// goes wrong is folded into the outcome.
    pub async fn provision_user(&self, email: &str, skip_password_check: bool) -> ProvisionOutcome {
        match self.try_provision(email, skip_password_check).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(email = %email, error = %err, "Tenant provisioning failed");
                ProvisionOutcome::failed(kind_for_error(&err), err.to_string())
            }
        }
    }

    async fn try_provision(
        &self,
        email: &str,
        skip_password_check: bool,
    ) -> IdentityResult<ProvisionOutcome> {
        let user = match self.users.find_by_email(email).await? {
            Some(user) => user,
            None => {
                return Ok(ProvisionOutcome::failed(
                    SyncFailureKind::Unexpected,
                    format!("no user with email {email}"),
                ));
            }
        };

        // Already provisioned: done, no network traffic
        if let Some(tenant_id) = user.tenant_id.clone() {
            return Ok(ProvisionOutcome::succeeded(tenant_id, false));
        }

        let password = match user.subscriber_password.clone() {
            Some(password) => password,
            None => {
                return Ok(ProvisionOutcome::failed(
                    SyncFailureKind::InvalidCredentialFormat,
                    "no subscriber credential on record",
                ));
            }
        };

        // Local validation runs before the lease and before any network call
        if !skip_password_check {
            if let Err(policy) = validate_subscriber_password(&password) {
                return Ok(ProvisionOutcome::failed(
                    SyncFailureKind::InvalidCredentialFormat,
                    policy.to_string(),
                ));
            }
        }

        let mut lease = match self.users.lock_for_provisioning(email).await? {
            Some(lease) => lease,
            None => {
                return Ok(ProvisionOutcome::failed(
                    SyncFailureKind::Unexpected,
                    format!("user {email} disappeared before provisioning"),
                ));
            }
        };

        // A concurrent holder may have provisioned while we waited
        if let Some(tenant_id) = lease.user().tenant_id.clone() {
            lease.commit().await?;
            return Ok(ProvisionOutcome::succeeded(tenant_id, false));
        }

        let request = CreateTenantRequest::for_admin(
            &lease.user().name,
            email,
            &password,
            &self.config.region_code,
        );
        let response = self.directory.create_tenant(&request).await?;

        let outcome = match response.classify_create() {
            CreateClass::Created => match response.tenant_id() {
                Some(tenant_id) => {
                    lease.persist_tenant_id(&tenant_id).await?;
                    lease.commit().await?;
                    info!(email = %email, tenant_id = %tenant_id, "Tenant created");
                    ProvisionOutcome::succeeded(tenant_id, false)
                }
                None => {
                    return Ok(ProvisionOutcome::failed(
                        SyncFailureKind::Unexpected,
                        "create succeeded but the reply carried no tenantId",
                    ));
                }
            },
            CreateClass::AlreadyRegistered => match response.tenant_id() {
                Some(tenant_id) => {
                    lease.persist_tenant_id(&tenant_id).await?;
                    lease.commit().await?;
                    warn!(
                        email = %email,
                        tenant_id = %tenant_id,
                        "Tenant already registered upstream, adopted existing id"
                    );
                    ProvisionOutcome::succeeded(tenant_id, true)
                }
                None => {
                    return Ok(ProvisionOutcome::failed(
                        SyncFailureKind::AlreadyRegisteredUnrecoverable,
                        format!(
                            "administrator already registered (code {}): {}",
                            response.code, response.message
                        ),
                    ));
                }
            },
            CreateClass::Rejected => {
                return Ok(ProvisionOutcome::failed(
                    SyncFailureKind::ApiRejected,
                    format!(
                        "tenant create rejected (code {}): {}",
                        response.code, response.message
                    ),
                ));
            }
        };

        Ok(self.chain_bind(outcome, email, skip_password_check).await)
    }

    /// Best-effort credential bind after a fresh provision. A failing bind
    /// leaves the user for the bind backfill and does not undo the provision.
    async fn chain_bind(
        &self,
        mut outcome: ProvisionOutcome,
        email: &str,
        skip_password_check: bool,
    ) -> ProvisionOutcome {
        outcome.bind_attempted = true;
        let bind = self.synchronizer.bind_user(email, skip_password_check).await;
        outcome.bound = bind.success;
        if !bind.success {
            let detail = bind
                .failure
                .map(|failure| failure.message)
                .unwrap_or_default();
            warn!(email = %email, detail = %detail, "Tenant provisioned but credential bind is pending");
        }
        outcome
    }
}
