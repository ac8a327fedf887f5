//! Registration flow: abuse gate, local user creation, deferred tenant sync.
//!
//! The external synchronizer runs on a spawned task after the user row is
//! committed. A sync failure never rolls the registration back; the user
//! stays in "sync pending" state until a backfill pass repairs it.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::{IdentityError, IdentityResult};
use crate::fingerprint::{ClientSignals, FingerprintStrategy};
use crate::gatekeeper::{AttemptKeys, DenyReason, SignupGatekeeper, Verdict};
use crate::ledger::NewAttempt;
use crate::provisioner::TenantProvisioner;
use crate::users::{NewUser, SyncUser, SyncUserStore};

/// One signup submission. The password doubles as the subscriber credential
/// mirrored for tenant provisioning.
#[derive(Debug, Clone)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub claim_free_plan: bool,
    pub signals: ClientSignals,
    /// Raw client context archived with the fingerprint attempt.
    pub payload: Value,
}

#[derive(Debug)]
pub enum RegistrationOutcome {
    Registered {
        user: SyncUser,
        free_plan_granted: bool,
        /// Tenant sync runs after this returns; backfill repairs it if the
        /// deferred attempt fails.
        sync_pending: bool,
    },
    Denied {
        reason: DenyReason,
        message: &'static str,
    },
}

/// Front door for new signups.
#[derive(Clone)]
pub struct RegistrationService {
    strategy: Arc<dyn FingerprintStrategy>,
    gatekeeper: SignupGatekeeper,
    users: Arc<dyn SyncUserStore>,
    provisioner: Arc<TenantProvisioner>,
}

impl RegistrationService {
    pub fn new(
        strategy: Arc<dyn FingerprintStrategy>,
        gatekeeper: SignupGatekeeper,
        users: Arc<dyn SyncUserStore>,
        provisioner: Arc<TenantProvisioner>,
    ) -> Self {
        Self {
            strategy,
            gatekeeper,
            users,
            provisioner,
        }
    }

    pub async fn register(&self, request: SignupRequest) -> IdentityResult<RegistrationOutcome> {
        let signature = self.strategy.derive(&request.signals);
        let keys = AttemptKeys {
            ip: request.signals.ip_address.clone(),
            email: Some(request.email.clone()),
            device_signature: signature.clone(),
            fingerprint_id: request.signals.fingerprint_id.clone(),
        };
        let attempt = NewAttempt {
            ip_address: request.signals.ip_address.clone(),
            user_agent: request.signals.user_agent.clone(),
            device_signature: signature.clone(),
            fingerprint_id: request.signals.fingerprint_id.clone(),
            email: Some(request.email.clone()),
            payload: request.payload.clone(),
        };

        let verdict = self.gatekeeper.assess(&keys, attempt).await?;
        if let Verdict::Deny(reason) = verdict {
            return Ok(RegistrationOutcome::Denied {
                reason,
                message: reason.public_message(),
            });
        }

        let user = self
            .users
            .create_user(NewUser {
                name: request.name.clone(),
                email: request.email.clone(),
                login_password: request.password.clone(),
                subscriber_password: Some(request.password.clone()),
            })
            .await?;
        self.users
            .touch_last_seen(user.id, &keys.ip, &signature)
            .await?;

        let free_plan_granted = if request.claim_free_plan {
            match self.gatekeeper.free_plan_verdict(&user).await? {
                Verdict::Allow => {
                    self.users.mark_free_plan_used(user.id).await?;
                    info!(user_id = %user.id, "Free plan granted at registration");
                    true
                }
                Verdict::Deny(reason) => {
                    info!(user_id = %user.id, reason = ?reason, "Free plan claim denied");
                    false
                }
            }
        } else {
            false
        };

        // Deferred tenant sync; the signup response never waits on it
        let provisioner = self.provisioner.clone();
        let email = request.email.clone();
        tokio::spawn(async move {
            let outcome = provisioner.provision_user(&email, false).await;
            if !outcome.success {
                warn!(email = %email, "Deferred tenant sync failed, leaving user for backfill");
            }
        });

        Ok(RegistrationOutcome::Registered {
            user,
            free_plan_granted,
            sync_pending: true,
        })
    }

    /// Free-plan claim for an existing account, with the same eligibility
    /// rule registration applies.
    pub async fn claim_free_plan(&self, email: &str) -> IdentityResult<Verdict> {
        let user = match self.users.find_by_email(email).await? {
            Some(user) => user,
            None => return Err(IdentityError::UserNotFound(email.to_string())),
        };

        let verdict = self.gatekeeper.free_plan_verdict(&user).await?;
        if verdict.is_allowed() {
            self.users.mark_free_plan_used(user.id).await?;
            info!(user_id = %user.id, "Free plan claimed");
        }
        Ok(verdict)
    }
}
