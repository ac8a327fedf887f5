//! Subscriber credential binding against the tenant directory.
//!
//! Binding is the second half of identity synchronization: the tenant must
//! already exist, then the stored subscriber credential is pushed upstream.
//! Expected failures are data, not errors; [`PasswordSynchronizer::bind_user`]
//! always returns a [`BindOutcome`] so batch callers can keep going.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{IdentityError, IdentityResult};
use crate::password_policy::validate_subscriber_password;
use crate::tenant_api::{BindClass, BindPasswordRequest, TenantDirectory};
use crate::users::SyncUserStore;

/// Why a synchronization step could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFailureKind {
    /// The stored credential fails the subscriber password policy.
    InvalidCredentialFormat,
    /// Bind was requested for a user that has no tenant yet.
    MissingTenantId,
    /// The tenant's application was never activated upstream.
    AppNotActivated,
    /// The admin is registered upstream but the reply carried no tenant id
    /// to adopt.
    AlreadyRegisteredUnrecoverable,
    /// The upstream gave a definitive business rejection.
    ApiRejected,
    /// Connection, timeout, or server-side failure; retryable later.
    Transport,
    Unexpected,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub kind: SyncFailureKind,
    pub message: String,
}

impl SyncFailure {
    pub fn new(kind: SyncFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Fold an internal error into the failure taxonomy.
pub(crate) fn kind_for_error(error: &IdentityError) -> SyncFailureKind {
    match error {
        IdentityError::Http(_) => SyncFailureKind::Transport,
        IdentityError::UpstreamStatus { status, .. } if *status >= 500 || *status == 429 => {
            SyncFailureKind::Transport
        }
        IdentityError::UpstreamStatus { .. } => SyncFailureKind::ApiRejected,
        _ => SyncFailureKind::Unexpected,
    }
}

/// Result of one bind attempt. `already_bound` marks the idempotent case
/// where the upstream had the credential before this call.
#[derive(Debug, Clone, Serialize)]
pub struct BindOutcome {
    pub success: bool,
    pub already_bound: bool,
    pub failure: Option<SyncFailure>,
}

impl BindOutcome {
    fn succeeded(already_bound: bool) -> Self {
        Self {
            success: true,
            already_bound,
            failure: None,
        }
    }

    fn failed(kind: SyncFailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            already_bound: false,
            failure: Some(SyncFailure::new(kind, message)),
        }
    }
}

/// Pushes stored subscriber credentials to the tenant directory.
#[derive(Clone)]
pub struct PasswordSynchronizer {
    directory: Arc<dyn TenantDirectory>,
    users: Arc<dyn SyncUserStore>,
}

impl PasswordSynchronizer {
    pub fn new(directory: Arc<dyn TenantDirectory>, users: Arc<dyn SyncUserStore>) -> Self {
        Self { directory, users }
    }

    /// Bind the stored credential for `email` upstream. Never returns an
    /// error: anything that goes wrong is folded into the outcome.
    pub async fn bind_user(&self, email: &str, skip_password_check: bool) -> BindOutcome {
        match self.try_bind(email, skip_password_check).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(email = %email, error = %err, "Credential bind failed");
                BindOutcome::failed(kind_for_error(&err), err.to_string())
            }
        }
    }

    async fn try_bind(
        &self,
        email: &str,
        skip_password_check: bool,
    ) -> IdentityResult<BindOutcome> {
        let user = match self.users.find_by_email(email).await? {
            Some(user) => user,
            None => {
                return Ok(BindOutcome::failed(
                    SyncFailureKind::Unexpected,
                    format!("no user with email {email}"),
                ));
            }
        };

        // Cheap local checks run before any network traffic
        if user.tenant_id.is_none() {
            return Ok(BindOutcome::failed(
                SyncFailureKind::MissingTenantId,
                "user has no tenant; provision before binding",
            ));
        }

        let password = match user.subscriber_password.as_deref() {
            Some(password) => password,
            None => {
                return Ok(BindOutcome::failed(
                    SyncFailureKind::InvalidCredentialFormat,
                    "no subscriber credential on record",
                ));
            }
        };

        if !skip_password_check {
            if let Err(policy) = validate_subscriber_password(password) {
                return Ok(BindOutcome::failed(
                    SyncFailureKind::InvalidCredentialFormat,
                    policy.to_string(),
                ));
            }
        }

        let request = BindPasswordRequest::new(email, password);
        let response = self.directory.bind_password(&request).await?;

        Ok(match response.classify_bind() {
            BindClass::Bound => {
                info!(email = %email, "Subscriber credential bound");
                BindOutcome::succeeded(false)
            }
            BindClass::AlreadyBound => {
                warn!(email = %email, "Credential already bound upstream, treating as success");
                BindOutcome::succeeded(true)
            }
            BindClass::AppNotActivated => BindOutcome::failed(
                SyncFailureKind::AppNotActivated,
                format!("tenant application not activated (code {})", response.code),
            ),
            BindClass::Rejected => BindOutcome::failed(
                SyncFailureKind::ApiRejected,
                format!(
                    "credential bind rejected (code {}): {}",
                    response.code, response.message
                ),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        already_bound_envelope, app_not_activated_envelope, success_envelope, MemoryUserStore,
        ScriptedDirectory, ScriptedReply,
    };

    fn synchronizer(
        directory: Arc<ScriptedDirectory>,
        users: Arc<MemoryUserStore>,
    ) -> PasswordSynchronizer {
        PasswordSynchronizer::new(directory, users)
    }

    #[tokio::test]
    async fn missing_tenant_fails_fast_without_network() {
        let users = Arc::new(MemoryUserStore::new());
        users.seed_user("a@x.com", Some("Abcdef1!"), None, 0);
        let directory = Arc::new(ScriptedDirectory::new());

        let outcome = synchronizer(directory.clone(), users)
            .bind_user("a@x.com", false)
            .await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.failure.unwrap().kind,
            SyncFailureKind::MissingTenantId
        );
        assert_eq!(directory.bind_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_credential_fails_fast_without_network() {
        let users = Arc::new(MemoryUserStore::new());
        users.seed_user("a@x.com", Some("weak"), Some("t-1"), 0);
        let directory = Arc::new(ScriptedDirectory::new());

        let outcome = synchronizer(directory.clone(), users)
            .bind_user("a@x.com", false)
            .await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.failure.unwrap().kind,
            SyncFailureKind::InvalidCredentialFormat
        );
        assert_eq!(directory.bind_calls(), 0);
    }

    #[tokio::test]
    async fn skip_flag_bypasses_the_format_check() {
        let users = Arc::new(MemoryUserStore::new());
        users.seed_user("a@x.com", Some("weak"), Some("t-1"), 0);
        let directory = Arc::new(ScriptedDirectory::new());
        directory.on_bind("a@x.com", ScriptedReply::Envelope(success_envelope("t-1")));

        let outcome = synchronizer(directory.clone(), users)
            .bind_user("a@x.com", true)
            .await;

        assert!(outcome.success);
        assert_eq!(directory.bind_calls(), 1);
    }

    #[tokio::test]
    async fn bound_and_already_bound_both_succeed() {
        let users = Arc::new(MemoryUserStore::new());
        users.seed_user("a@x.com", Some("Abcdef1!"), Some("t-1"), 0);
        let directory = Arc::new(ScriptedDirectory::new());
        directory.on_bind("a@x.com", ScriptedReply::Envelope(success_envelope("t-1")));
        directory.on_bind("a@x.com", ScriptedReply::Envelope(already_bound_envelope()));

        let sync = synchronizer(directory.clone(), users);

        let first = sync.bind_user("a@x.com", false).await;
        assert!(first.success);
        assert!(!first.already_bound);

        let second = sync.bind_user("a@x.com", false).await;
        assert!(second.success);
        assert!(second.already_bound);
        assert!(second.failure.is_none());
    }

    #[tokio::test]
    async fn app_not_activated_is_terminal() {
        let users = Arc::new(MemoryUserStore::new());
        users.seed_user("a@x.com", Some("Abcdef1!"), Some("t-1"), 0);
        let directory = Arc::new(ScriptedDirectory::new());
        directory.on_bind("a@x.com", ScriptedReply::Envelope(app_not_activated_envelope()));

        let outcome = synchronizer(directory, users).bind_user("a@x.com", false).await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.failure.unwrap().kind,
            SyncFailureKind::AppNotActivated
        );
    }

    #[tokio::test]
    async fn transport_failures_fold_into_the_outcome() {
        let users = Arc::new(MemoryUserStore::new());
        users.seed_user("a@x.com", Some("Abcdef1!"), Some("t-1"), 0);
        let directory = Arc::new(ScriptedDirectory::new());
        directory.on_bind("a@x.com", ScriptedReply::HttpStatus(503));

        let outcome = synchronizer(directory, users).bind_user("a@x.com", false).await;

        assert!(!outcome.success);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, SyncFailureKind::Transport);
        assert!(failure.message.contains("503"));
    }

    #[tokio::test]
    async fn unknown_user_reports_unexpected() {
        let users = Arc::new(MemoryUserStore::new());
        let directory = Arc::new(ScriptedDirectory::new());

        let outcome = synchronizer(directory, users).bind_user("ghost@x.com", false).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure.unwrap().kind, SyncFailureKind::Unexpected);
    }
}
