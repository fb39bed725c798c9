use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::Money;

/// Provider-agnostic result of a payment event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        provider_reference: String,
        /// Capture id / M-Pesa receipt number, when the channel reports one.
        receipt_id: Option<String>,
        /// `None` when the channel does not echo the amount (M-Pesa status
        /// query); the amount was then fixed server-side at charge creation.
        amount_confirmed: Option<Money>,
        metadata: BTreeMap<String, String>,
    },
    Failure {
        provider_reference: String,
        reason_code: String,
        cancelled_by_payer: bool,
    },
    Pending {
        provider_reference: String,
    },
}

impl Outcome {
    pub fn pending(provider_reference: impl Into<String>) -> Self {
        Outcome::Pending {
            provider_reference: provider_reference.into(),
        }
    }

    pub fn failure(provider_reference: impl Into<String>, reason_code: impl Into<String>) -> Self {
        Outcome::Failure {
            provider_reference: provider_reference.into(),
            reason_code: reason_code.into(),
            cancelled_by_payer: false,
        }
    }

    pub fn provider_reference(&self) -> &str {
        match self {
            Outcome::Success {
                provider_reference, ..
            }
            | Outcome::Failure {
                provider_reference, ..
            }
            | Outcome::Pending { provider_reference } => provider_reference,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Pending { .. } => "pending",
        }
    }
}

/// How an outcome reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Capture,
    Webhook,
    Poll,
    Sweep,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Capture => "capture",
            Channel::Webhook => "webhook",
            Channel::Poll => "poll",
            Channel::Sweep => "sweep",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
