//! Abuse decision engine for the signup path.
//!
//! Combines attempt-ledger state into allow/deny verdicts. The decision
//! itself is a pure read of the ledger; block escalation and the attempt
//! write are composed around it, in that order, by `assess`.

use std::sync::Arc;

use serde::Serialize;
use subflow_shared::AbuseConfig;

use crate::error::IdentityResult;
use crate::ledger::{AttemptKey, AttemptLedger, NewAttempt};
use crate::users::{SyncUser, SyncUserStore};

/// Ledger reason written when the engine escalates a threshold overage.
pub const BLOCK_REASON_TOO_MANY_ATTEMPTS: &str = "too_many_attempts";

/// The correlated keys derived from one registration request.
#[derive(Debug, Clone)]
pub struct AttemptKeys {
    pub ip: String,
    pub email: Option<String>,
    pub device_signature: String,
    pub fingerprint_id: Option<String>,
}

impl AttemptKeys {
    /// The key/value pairs present on this request, in evaluation order.
    fn pairs(&self) -> Vec<(AttemptKey, &str)> {
        let mut pairs = vec![(AttemptKey::Ip, self.ip.as_str())];
        if let Some(email) = &self.email {
            pairs.push((AttemptKey::Email, email.as_str()));
        }
        pairs.push((AttemptKey::DeviceSignature, self.device_signature.as_str()));
        if let Some(fingerprint_id) = &self.fingerprint_id {
            pairs.push((AttemptKey::FingerprintId, fingerprint_id.as_str()));
        }
        pairs
    }
}

/// Why an attempt was denied. An abuse denial is a business decision, not
/// a fault; it always carries a reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A correlated key is already blocked.
    Blocked,
    /// The attempt-rate threshold was reached inside the tracking window.
    TooManyAttempts,
    /// The account has already consumed its one-time free plan.
    FreePlanAlreadyUsed,
}

impl DenyReason {
    /// User-facing message. Deliberately identical for fingerprint-based
    /// denials so callers cannot learn which key matched.
    pub fn public_message(&self) -> &'static str {
        match self {
            DenyReason::Blocked | DenyReason::TooManyAttempts => {
                "Registration is temporarily unavailable for this request."
            }
            DenyReason::FreePlanAlreadyUsed => {
                "The free plan has already been used for this account."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Decides whether a pending registration attempt may proceed.
#[derive(Clone)]
pub struct SignupGatekeeper {
    ledger: Arc<dyn AttemptLedger>,
    users: Arc<dyn SyncUserStore>,
    config: AbuseConfig,
}

impl SignupGatekeeper {
    pub fn new(
        ledger: Arc<dyn AttemptLedger>,
        users: Arc<dyn SyncUserStore>,
        config: AbuseConfig,
    ) -> Self {
        Self {
            ledger,
            users,
            config,
        }
    }

    /// A threshold of zero or less must never allow unbounded attempts;
    /// it collapses to "block on first repeat".
    fn effective_max_attempts(&self) -> i64 {
        if self.config.max_attempts <= 0 {
            1
        } else {
            self.config.max_attempts
        }
    }

    /// Pure verdict over current ledger state. Rule order is fixed: an
    /// existing block wins over the rate threshold.
    pub async fn evaluate(&self, keys: &AttemptKeys) -> IdentityResult<Verdict> {
        for (key, value) in keys.pairs() {
            if self.ledger.any_blocked(key, value).await? {
                return Ok(Verdict::Deny(DenyReason::Blocked));
            }
        }

        let max_attempts = self.effective_max_attempts();
        for (key, value) in keys.pairs() {
            let recent = self
                .ledger
                .count_recent(key, value, self.config.tracking_window_days)
                .await?;
            if recent >= max_attempts {
                return Ok(Verdict::Deny(DenyReason::TooManyAttempts));
            }
        }

        Ok(Verdict::Allow)
    }

    /// Full caller-side composition: decide, escalate on overage, then
    /// always record the attempt. Denied ones are recorded too, so the
    /// ledger reflects every submission.
    pub async fn assess(&self, keys: &AttemptKeys, attempt: NewAttempt) -> IdentityResult<Verdict> {
        let verdict = self.evaluate(keys).await?;

        if verdict == Verdict::Deny(DenyReason::TooManyAttempts) {
            self.escalate(keys).await?;
        }

        self.ledger.record(attempt).await?;

        if let Verdict::Deny(reason) = verdict {
            tracing::warn!(
                ip = %keys.ip,
                email = ?keys.email,
                reason = ?reason,
                "Registration attempt denied"
            );
        }

        Ok(verdict)
    }

    /// One overage blocks the whole identity cluster: every record matching
    /// each of the request's keys is marked blocked, not just the key that
    /// crossed the threshold.
    async fn escalate(&self, keys: &AttemptKeys) -> IdentityResult<()> {
        for (key, value) in keys.pairs() {
            let blocked = self
                .ledger
                .block(key, value, BLOCK_REASON_TOO_MANY_ATTEMPTS)
                .await?;
            if blocked > 0 {
                tracing::info!(key = %key, blocked = blocked, "Escalated block on attempt key");
            }
        }
        Ok(())
    }

    /// One-time free-plan eligibility: the marker must be unset and no
    /// completed paid order may exist. Independent of the fingerprint
    /// verdict.
    pub async fn free_plan_verdict(&self, user: &SyncUser) -> IdentityResult<Verdict> {
        if user.has_used_free_plan {
            return Ok(Verdict::Deny(DenyReason::FreePlanAlreadyUsed));
        }
        if self.users.has_completed_paid_order(user.id).await? {
            return Ok(Verdict::Deny(DenyReason::FreePlanAlreadyUsed));
        }
        Ok(Verdict::Allow)
    }
}
