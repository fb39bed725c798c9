//! Applies provider outcomes to the ledger and the entitlement store.
//!
//! Every channel (capture return, webhook, status poll, sweep) funnels
//! through [`Reconciler::apply`]. The terminal transition is a conditional
//! write, so when the same outcome arrives on several channels at once only
//! one of them extends the entitlement.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use super::entitlements::{EntitlementError, EntitlementStore};
use super::ledger::{LedgerError, PaymentLedger};
use super::metrics;
use crate::models::{
    AttemptId, AttemptState, Channel, Outcome, PaymentAttempt, Provider, TerminalTransition,
};

pub const AMOUNT_MISMATCH: &str = "AMOUNT_MISMATCH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    /// This call moved the attempt to a terminal state.
    Applied {
        attempt_id: AttemptId,
        state: AttemptState,
    },
    /// The attempt was already terminal; the outcome was discarded.
    Duplicate {
        attempt_id: AttemptId,
        state: AttemptState,
    },
    StillPending {
        attempt_id: AttemptId,
    },
    UnknownReference,
}

impl ReconcileResult {
    pub fn state(&self) -> Option<AttemptState> {
        match self {
            ReconcileResult::Applied { state, .. } | ReconcileResult::Duplicate { state, .. } => {
                Some(*state)
            }
            ReconcileResult::StillPending { .. } => Some(AttemptState::Pending),
            ReconcileResult::UnknownReference => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn PaymentLedger>,
    entitlements: Arc<dyn EntitlementStore>,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn PaymentLedger>, entitlements: Arc<dyn EntitlementStore>) -> Self {
        Self {
            ledger,
            entitlements,
        }
    }

    pub async fn apply(
        &self,
        provider: Provider,
        outcome: Outcome,
        channel: Channel,
    ) -> Result<ReconcileResult, ReconcileError> {
        metrics::record_outcome(provider, channel, outcome.label());

        let reference = outcome.provider_reference();
        let Some(attempt) = self
            .ledger
            .find_by_provider_reference(provider, reference)
            .await?
        else {
            tracing::warn!(
                provider = %provider,
                provider_reference = %reference,
                channel = %channel,
                outcome = outcome.label(),
                "Outcome for unknown provider reference discarded"
            );
            metrics::record_unknown_reference(provider, channel);
            return Ok(ReconcileResult::UnknownReference);
        };

        self.apply_to(attempt, outcome, channel).await
    }

    /// Apply `outcome` to an attempt already loaded by the caller.
    pub async fn apply_to(
        &self,
        attempt: PaymentAttempt,
        outcome: Outcome,
        channel: Channel,
    ) -> Result<ReconcileResult, ReconcileError> {
        if attempt.state.is_terminal() {
            tracing::debug!(
                attempt_id = %attempt.id,
                state = %attempt.state,
                channel = %channel,
                "Attempt already terminal, outcome discarded"
            );
            if attempt.needs_entitlement() {
                self.grant_entitlement(&attempt).await?;
            }
            return Ok(ReconcileResult::Duplicate {
                attempt_id: attempt.id,
                state: attempt.state,
            });
        }

        let transition = match outcome {
            Outcome::Pending { .. } => {
                return Ok(ReconcileResult::StillPending {
                    attempt_id: attempt.id,
                });
            }
            Outcome::Success {
                receipt_id,
                amount_confirmed,
                mut metadata,
                ..
            } => match amount_confirmed {
                Some(confirmed) if !confirmed.same_as(&attempt.amount) => {
                    tracing::warn!(
                        attempt_id = %attempt.id,
                        provider = %attempt.provider,
                        expected = %attempt.amount,
                        confirmed = %confirmed,
                        channel = %channel,
                        "Provider confirmed a different amount, flagging attempt for audit"
                    );
                    metrics::record_amount_mismatch(attempt.provider);

                    // The receipt field is reserved for completed attempts.
                    metadata.insert("confirmed_amount".to_string(), confirmed.to_string());
                    if let Some(receipt) = receipt_id {
                        metadata.insert("provider_receipt_id".to_string(), receipt);
                    }
                    TerminalTransition {
                        metadata,
                        ..TerminalTransition::failed(AMOUNT_MISMATCH).flagged()
                    }
                }
                Some(_) => TerminalTransition::completed(receipt_id, metadata),
                // Daraja's STK status query reports no amount.
                None => {
                    tracing::debug!(
                        attempt_id = %attempt.id,
                        provider = %attempt.provider,
                        channel = %channel,
                        "Success carries no amount to verify"
                    );
                    TerminalTransition::completed(receipt_id, metadata)
                }
            },
            Outcome::Failure {
                reason_code,
                cancelled_by_payer,
                ..
            } => {
                if cancelled_by_payer {
                    TerminalTransition::cancelled(reason_code)
                } else {
                    TerminalTransition::failed(reason_code)
                }
            }
        };

        let target = transition.target;
        let result = self
            .ledger
            .transition_terminal(attempt.id, transition)
            .await?;

        if !result.applied {
            // Another channel won the race between our read and our write.
            let state = self
                .ledger
                .find_by_id(attempt.id)
                .await?
                .map(|a| a.state)
                .unwrap_or(target);
            tracing::debug!(
                attempt_id = %attempt.id,
                state = %state,
                channel = %channel,
                "Concurrent terminal transition, outcome discarded"
            );
            return Ok(ReconcileResult::Duplicate {
                attempt_id: attempt.id,
                state,
            });
        }

        metrics::record_attempt(attempt.provider, target);
        tracing::info!(
            attempt_id = %attempt.id,
            user_id = %attempt.user_id,
            provider = %attempt.provider,
            provider_reference = ?attempt.provider_reference,
            state = %target,
            channel = %channel,
            "Payment attempt reached terminal state"
        );

        if target == AttemptState::Completed {
            self.grant_entitlement(&attempt).await?;
        }

        Ok(ReconcileResult::Applied {
            attempt_id: attempt.id,
            state: target,
        })
    }

    /// Extend the user's entitlement for a completed attempt and record that
    /// it was applied. Safe to repeat: the extension is keyed by attempt id.
    pub async fn grant_entitlement(
        &self,
        attempt: &PaymentAttempt,
    ) -> Result<Option<DateTime<Utc>>, ReconcileError> {
        let expires_at = self
            .entitlements
            .extend(&attempt.user_id, attempt.plan, attempt.id)
            .await?;
        self.ledger.mark_entitlement_applied(attempt.id).await?;

        tracing::info!(
            attempt_id = %attempt.id,
            user_id = %attempt.user_id,
            plan = %attempt.plan,
            expires_at = ?expires_at,
            "Entitlement granted"
        );
        Ok(expires_at)
    }
}
