use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AttemptId, Money, PaymentAttempt, Plan, Provider, TerminalTransition};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("payment attempt {0} not found")]
    NotFound(AttemptId),

    #[error("payment attempt {attempt_id} already carries reference {existing}")]
    AlreadyAttached {
        attempt_id: AttemptId,
        existing: String,
    },

    #[error("{provider} reference {reference} belongs to another attempt")]
    DuplicateReference { provider: Provider, reference: String },

    #[error("ledger storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<mongodb::error::Error> for LedgerError {
    fn from(err: mongodb::error::Error) -> Self {
        LedgerError::Storage(anyhow::Error::new(err))
    }
}

/// Resume point for paged sweep listings: the sort timestamp and id of the
/// last attempt already seen. Listings return attempts strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub at: DateTime<Utc>,
    pub id: AttemptId,
}

impl PageCursor {
    pub fn new(at: DateTime<Utc>, id: AttemptId) -> Self {
        Self { at, id }
    }

    /// Whether `(at, id)` sorts after this cursor. Ids compare as their
    /// string form, matching the stored `_id`.
    pub fn precedes(&self, at: DateTime<Utc>, id: &AttemptId) -> bool {
        at > self.at || (at == self.at && id.to_string() > self.id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionResult {
    /// `false` when the attempt had already left `pending`.
    pub applied: bool,
}

/// Durable record of every payment attempt. An attempt leaves `pending`
/// exactly once; `transition_terminal` is the only way out.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn create_pending(
        &self,
        user_id: &str,
        plan: Plan,
        amount: Money,
        provider: Provider,
    ) -> Result<AttemptId, LedgerError>;

    /// Idempotent for the same reference.
    async fn attach_provider_reference(
        &self,
        attempt_id: AttemptId,
        reference: &str,
    ) -> Result<(), LedgerError>;

    async fn find_by_provider_reference(
        &self,
        provider: Provider,
        reference: &str,
    ) -> Result<Option<PaymentAttempt>, LedgerError>;

    async fn find_by_id(&self, attempt_id: AttemptId)
        -> Result<Option<PaymentAttempt>, LedgerError>;

    /// Conditional on `state = pending`.
    async fn transition_terminal(
        &self,
        attempt_id: AttemptId,
        transition: TerminalTransition,
    ) -> Result<TransitionResult, LedgerError>;

    async fn mark_entitlement_applied(&self, attempt_id: AttemptId) -> Result<(), LedgerError>;

    /// Pending attempts with a provider reference created before `older_than`,
    /// ordered by `(created_at, id)` and starting after `after`.
    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError>;

    /// Completed attempts whose entitlement is not yet applied, ordered by
    /// `(updated_at, id)` and starting after `after`.
    async fn list_unapplied_completed(
        &self,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError>;

    /// Newest first.
    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError>;
}
