//! Operator actions over the fingerprint ledger.

use std::sync::Arc;

use tracing::info;

use crate::error::{IdentityError, IdentityResult};
use crate::ledger::{AttemptFilter, AttemptKey, AttemptLedger, AttemptStats, FingerprintAttempt};

/// Manual ledger management: listing, unblocking, stats, retention.
#[derive(Clone)]
pub struct AttemptAdmin {
    ledger: Arc<dyn AttemptLedger>,
}

impl AttemptAdmin {
    pub fn new(ledger: Arc<dyn AttemptLedger>) -> Self {
        Self { ledger }
    }

    pub async fn list(&self, filter: &AttemptFilter) -> IdentityResult<Vec<FingerprintAttempt>> {
        self.ledger.list(filter).await
    }

    /// Clear blocks for the ip and/or email named in the filter. At least
    /// one of the two must be present.
    pub async fn unblock(&self, filter: &AttemptFilter) -> IdentityResult<u64> {
        if filter.ip.is_none() && filter.email.is_none() {
            return Err(IdentityError::InvalidFilter(
                "unblock requires an ip or email filter",
            ));
        }

        let mut cleared = 0;
        if let Some(ip) = &filter.ip {
            cleared += self.ledger.unblock(AttemptKey::Ip, ip).await?;
        }
        if let Some(email) = &filter.email {
            cleared += self.ledger.unblock(AttemptKey::Email, email).await?;
        }
        info!(cleared = cleared, "Attempt records unblocked");
        Ok(cleared)
    }

    pub async fn stats(&self, filter: &AttemptFilter) -> IdentityResult<AttemptStats> {
        self.ledger.stats(filter).await
    }

    /// Drop attempt rows older than `days`. Non-positive retention is
    /// rejected rather than treated as "purge everything".
    pub async fn purge_older_than(&self, days: i64) -> IdentityResult<u64> {
        if days < 1 {
            return Err(IdentityError::InvalidFilter(
                "retention must be at least one day",
            ));
        }
        let purged = self.ledger.purge_older_than(days).await?;
        info!(purged = purged, days = days, "Old attempt records purged");
        Ok(purged)
    }
}
