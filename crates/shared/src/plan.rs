//! Plan-tier vocabulary shared by the identity core and order queries.

use serde::{Deserialize, Serialize};

/// Subscription plan tiers. Stored in the database as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanTier::Free),
            "starter" => Some(PlanTier::Starter),
            "pro" => Some(PlanTier::Pro),
            _ => None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, PlanTier::Free)
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
