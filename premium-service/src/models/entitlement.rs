use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttemptId, Plan};

/// Premium access of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntitlement {
    pub user_id: String,
    pub is_premium: bool,
    /// `None` together with `is_premium` means a grant that never expires.
    pub premium_expires_at: Option<DateTime<Utc>>,
    /// Attempts whose extension has already been applied.
    #[serde(default)]
    pub premium_grants: Vec<String>,
}

impl UserEntitlement {
    pub fn none(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            is_premium: false,
            premium_expires_at: None,
            premium_grants: Vec::new(),
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.is_premium && self.premium_expires_at.map_or(true, |expires| now < expires)
    }

    pub fn has_grant(&self, grant: &AttemptId) -> bool {
        let grant = grant.to_string();
        self.premium_grants.iter().any(|g| *g == grant)
    }

    /// Expiry after stacking `plan` on top of the current entitlement:
    /// `max(now, current) + duration`. A never-expiring entitlement stays
    /// never-expiring.
    pub fn stacked_expiry(&self, plan: Plan, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.is_premium, self.premium_expires_at) {
            (true, None) => None,
            (true, Some(current)) if current > now => Some(plan.extend_from(current)),
            _ => Some(plan.extend_from(now)),
        }
    }

    /// The entitlement after applying `grant`. Returns `self` unchanged when
    /// the grant was already applied.
    pub fn extended(&self, plan: Plan, grant: &AttemptId, now: DateTime<Utc>) -> Self {
        if self.has_grant(grant) {
            return self.clone();
        }

        let mut next = self.clone();
        next.premium_expires_at = self.stacked_expiry(plan, now);
        next.is_premium = true;
        next.premium_grants.push(grant.to_string());
        next
    }
}
