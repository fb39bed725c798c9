use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Money;

/// Ledger id of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AttemptId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Monthly,
    Annual,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Monthly => "monthly",
            Plan::Annual => "annual",
        }
    }

    pub fn duration(&self) -> Months {
        match self {
            Plan::Monthly => Months::new(1),
            Plan::Annual => Months::new(12),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Plan::Monthly => "Premium Subscription (monthly)",
            Plan::Annual => "Premium Subscription (annual)",
        }
    }

    /// Calendar arithmetic: Jan 31 + 1 month clamps to the end of February.
    pub fn extend_from(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        base.checked_add_months(self.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" => Ok(Plan::Monthly),
            "annual" => Ok(Plan::Annual),
            other => Err(format!("unknown plan: {}", other)),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Paypal,
    Mpesa,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Paypal, Provider::Mpesa];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Paypal => "paypal",
            Provider::Mpesa => "mpesa",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paypal" => Ok(Provider::Paypal),
            "mpesa" | "m-pesa" => Ok(Provider::Mpesa),
            other => Err(format!("unknown payment provider: {}", other)),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Completed => "completed",
            AttemptState::Failed => "failed",
            AttemptState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One checkout attempt, from initiation to its single terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: AttemptId,
    pub user_id: String,
    pub plan: Plan,
    pub amount: Money,
    pub provider: Provider,
    /// Provider correlation id; `None` only between creation and the
    /// provider call returning.
    pub provider_reference: Option<String>,
    pub state: AttemptState,
    pub failure_reason: Option<String>,
    pub provider_receipt_id: Option<String>,
    /// Audit annotations (payer email, phone number). Never read by logic.
    pub metadata: BTreeMap<String, String>,
    pub entitlement_applied: bool,
    pub flagged_for_audit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn new_pending(user_id: &str, plan: Plan, amount: Money, provider: Provider) -> Self {
        let now = Utc::now();
        Self {
            id: AttemptId::new(),
            user_id: user_id.to_string(),
            plan,
            amount,
            provider,
            provider_reference: None,
            state: AttemptState::Pending,
            failure_reason: None,
            provider_receipt_id: None,
            metadata: BTreeMap::new(),
            entitlement_applied: false,
            flagged_for_audit: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed, but the entitlement extension has not been committed yet.
    pub fn needs_entitlement(&self) -> bool {
        self.state == AttemptState::Completed && !self.entitlement_applied
    }
}

/// The single terminal write applied to a pending attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalTransition {
    pub target: AttemptState,
    pub receipt_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub reason: Option<String>,
    pub flag_for_audit: bool,
}

impl TerminalTransition {
    pub fn completed(receipt_id: Option<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            target: AttemptState::Completed,
            receipt_id,
            metadata,
            reason: None,
            flag_for_audit: false,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            target: AttemptState::Failed,
            receipt_id: None,
            metadata: BTreeMap::new(),
            reason: Some(reason.into()),
            flag_for_audit: false,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            target: AttemptState::Cancelled,
            ..Self::failed(reason)
        }
    }

    pub fn flagged(mut self) -> Self {
        self.flag_for_audit = true;
        self
    }
}
