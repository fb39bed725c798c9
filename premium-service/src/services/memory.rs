//! In-process ledger and entitlement stores.
//!
//! Same semantics as the MongoDB stores, guarded by a single lock each.
//! Used by tests and by local runs without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::entitlements::{EntitlementError, EntitlementStore};
use super::ledger::{LedgerError, PageCursor, PaymentLedger, TransitionResult};
use crate::models::{
    AttemptId, AttemptState, Money, PaymentAttempt, Plan, Provider, TerminalTransition,
    UserEntitlement,
};

#[derive(Clone, Default)]
pub struct InMemoryPaymentLedger {
    attempts: Arc<RwLock<HashMap<AttemptId, PaymentAttempt>>>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an attempt as-is, e.g. one backdated for sweep tests.
    pub async fn seed(&self, attempt: PaymentAttempt) {
        self.attempts.write().await.insert(attempt.id, attempt);
    }

    pub async fn all(&self) -> Vec<PaymentAttempt> {
        let mut attempts: Vec<_> = self.attempts.read().await.values().cloned().collect();
        attempts.sort_by_key(|a| a.created_at);
        attempts
    }

    /// Matching attempts ordered by `(key, id)`, strictly after `after`.
    async fn page<F, K>(
        &self,
        matches: F,
        key: K,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Vec<PaymentAttempt>
    where
        F: Fn(&PaymentAttempt) -> bool,
        K: Fn(&PaymentAttempt) -> DateTime<Utc>,
    {
        let mut attempts: Vec<_> = self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| matches(*a))
            .filter(|a| after.map_or(true, |c| c.precedes(key(*a), &a.id)))
            .cloned()
            .collect();
        attempts.sort_by_key(|a| (key(a), a.id.to_string()));
        attempts.truncate(limit.max(0) as usize);
        attempts
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPaymentLedger {
    async fn create_pending(
        &self,
        user_id: &str,
        plan: Plan,
        amount: Money,
        provider: Provider,
    ) -> Result<AttemptId, LedgerError> {
        let attempt = PaymentAttempt::new_pending(user_id, plan, amount, provider);
        let id = attempt.id;
        self.attempts.write().await.insert(id, attempt);
        Ok(id)
    }

    async fn attach_provider_reference(
        &self,
        attempt_id: AttemptId,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let mut attempts = self.attempts.write().await;

        let provider = attempts
            .get(&attempt_id)
            .map(|a| a.provider)
            .ok_or(LedgerError::NotFound(attempt_id))?;
        let taken = attempts.values().any(|a| {
            a.id != attempt_id
                && a.provider == provider
                && a.provider_reference.as_deref() == Some(reference)
        });
        if taken {
            return Err(LedgerError::DuplicateReference {
                provider,
                reference: reference.to_string(),
            });
        }

        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or(LedgerError::NotFound(attempt_id))?;
        match &attempt.provider_reference {
            Some(existing) if existing == reference => Ok(()),
            Some(existing) => Err(LedgerError::AlreadyAttached {
                attempt_id,
                existing: existing.clone(),
            }),
            None => {
                attempt.provider_reference = Some(reference.to_string());
                attempt.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    async fn find_by_provider_reference(
        &self,
        provider: Provider,
        reference: &str,
    ) -> Result<Option<PaymentAttempt>, LedgerError> {
        Ok(self
            .attempts
            .read()
            .await
            .values()
            .find(|a| a.provider == provider && a.provider_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn find_by_id(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<PaymentAttempt>, LedgerError> {
        Ok(self.attempts.read().await.get(&attempt_id).cloned())
    }

    async fn transition_terminal(
        &self,
        attempt_id: AttemptId,
        transition: TerminalTransition,
    ) -> Result<TransitionResult, LedgerError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or(LedgerError::NotFound(attempt_id))?;

        if attempt.state.is_terminal() || !transition.target.is_terminal() {
            return Ok(TransitionResult { applied: false });
        }

        attempt.state = transition.target;
        if transition.target == AttemptState::Completed && transition.receipt_id.is_some() {
            attempt.provider_receipt_id = transition.receipt_id;
        }
        if transition.reason.is_some() {
            attempt.failure_reason = transition.reason;
        }
        attempt.flagged_for_audit |= transition.flag_for_audit;
        attempt.metadata.extend(transition.metadata);
        attempt.updated_at = Utc::now();

        Ok(TransitionResult { applied: true })
    }

    async fn mark_entitlement_applied(&self, attempt_id: AttemptId) -> Result<(), LedgerError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or(LedgerError::NotFound(attempt_id))?;
        attempt.entitlement_applied = true;
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError> {
        Ok(self
            .page(
                |a| {
                    a.state == AttemptState::Pending
                        && a.provider_reference.is_some()
                        && a.created_at < older_than
                },
                |a| a.created_at,
                after,
                limit,
            )
            .await)
    }

    async fn list_unapplied_completed(
        &self,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError> {
        Ok(self
            .page(PaymentAttempt::needs_entitlement, |a| a.updated_at, after, limit)
            .await)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError> {
        let mut attempts: Vec<_> = self
            .all()
            .await
            .into_iter()
            .filter(|a| a.user_id == user_id)
            .collect();
        attempts.reverse();
        attempts.truncate(limit.max(0) as usize);
        Ok(attempts)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryEntitlementStore {
    users: Arc<RwLock<HashMap<String, UserEntitlement>>>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, entitlement: UserEntitlement) {
        self.users
            .write()
            .await
            .insert(entitlement.user_id.clone(), entitlement);
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn extend(
        &self,
        user_id: &str,
        plan: Plan,
        grant: AttemptId,
    ) -> Result<Option<DateTime<Utc>>, EntitlementError> {
        let mut users = self.users.write().await;
        let current = users
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserEntitlement::none(user_id));

        let next = current.extended(plan, &grant, Utc::now());
        let expires_at = next.premium_expires_at;
        users.insert(user_id.to_string(), next);
        Ok(expires_at)
    }

    async fn get(&self, user_id: &str) -> Result<Option<UserEntitlement>, EntitlementError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }
}
