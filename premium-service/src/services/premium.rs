use backoff::future::retry;
use backoff::ExponentialBackoff;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::entitlements::{EntitlementError, EntitlementStore};
use super::ledger::{LedgerError, PaymentLedger};
use super::metrics;
use super::reconciler::{ReconcileError, ReconcileResult, Reconciler};
use crate::config::PlanPricing;
use crate::models::{
    AttemptId, AttemptState, Channel, Money, PaymentAttempt, Plan, Provider, TerminalTransition,
    UserEntitlement,
};
use crate::providers::{
    mpesa, ChargeInitiated, ChargeRequest, InboundCallback, PaymentProvider, ProviderError,
    ProviderRegistry, UserFacingAction,
};

pub const CHARGE_NOT_STARTED: &str = "CHARGE_NOT_STARTED";
/// The charge request may have reached the provider but its answer was lost.
pub const CHARGE_UNCONFIRMED: &str = "CHARGE_UNCONFIRMED";
pub const REFERENCE_NOT_RECORDED: &str = "REFERENCE_NOT_RECORDED";
pub const CANCELLED_BY_PAYER: &str = "CANCELLED_BY_PAYER";

#[derive(Debug, Error)]
pub enum PremiumError {
    #[error("payment could not be started, try again")]
    StartFailed(#[source] ProviderError),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0} payments are not available")]
    ProviderNotConfigured(Provider),

    #[error("payment attempt not found")]
    AttemptNotFound,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
}

impl From<ReconcileError> for PremiumError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Ledger(e) => PremiumError::Ledger(e),
            ReconcileError::Entitlement(e) => PremiumError::Entitlement(e),
        }
    }
}

impl From<PremiumError> for AppError {
    fn from(err: PremiumError) -> Self {
        match err {
            PremiumError::StartFailed(_) => AppError::ServiceUnavailable {
                message: err.to_string(),
                retry_after: Some(5),
            },
            PremiumError::InvalidRequest(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            PremiumError::ProviderNotConfigured(_) => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
            PremiumError::AttemptNotFound => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            PremiumError::Provider(e) if e.is_transient() => AppError::unavailable(e.to_string()),
            PremiumError::Provider(e) => AppError::BadGateway(e.to_string()),
            PremiumError::Ledger(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            PremiumError::Entitlement(e) => AppError::DatabaseError(anyhow::Error::new(e)),
        }
    }
}

/// Response to an inbound provider push. Anything short of a failed
/// authentication is acknowledged so providers stop redelivering; outcomes
/// that could not be applied are picked up by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Accepted,
    /// Authentication failed; nothing was applied.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargeStarted {
    pub attempt_id: AttemptId,
    pub provider: Provider,
    pub provider_reference: String,
    pub amount: Money,
    pub action: UserFacingAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureResult {
    pub attempt_id: AttemptId,
    pub success: bool,
    pub state: AttemptState,
    pub message: String,
}

impl CaptureResult {
    fn for_attempt(attempt_id: AttemptId, state: AttemptState) -> Self {
        let message = match state {
            AttemptState::Completed => "Payment completed, premium is active",
            AttemptState::Pending => "Payment is still being confirmed",
            AttemptState::Failed => "Payment failed",
            AttemptState::Cancelled => "Payment was cancelled",
        };
        Self {
            attempt_id,
            success: state == AttemptState::Completed,
            state,
            message: message.to_string(),
        }
    }
}

pub struct PremiumService {
    ledger: Arc<dyn PaymentLedger>,
    entitlements: Arc<dyn EntitlementStore>,
    providers: ProviderRegistry,
    reconciler: Reconciler,
    pricing: PlanPricing,
    charge_retry_max_elapsed: Duration,
}

impl PremiumService {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        entitlements: Arc<dyn EntitlementStore>,
        providers: ProviderRegistry,
        pricing: PlanPricing,
        charge_retry_max_elapsed: Duration,
    ) -> Self {
        let reconciler = Reconciler::new(ledger.clone(), entitlements.clone());
        Self {
            ledger,
            entitlements,
            providers,
            reconciler,
            pricing,
            charge_retry_max_elapsed,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn configured_providers(&self) -> Vec<Provider> {
        self.providers.configured()
    }

    fn adapter(&self, provider: Provider) -> Result<&Arc<dyn PaymentProvider>, PremiumError> {
        match self.providers.get(provider) {
            Ok(adapter) if adapter.is_configured() => Ok(adapter),
            _ => Err(PremiumError::ProviderNotConfigured(provider)),
        }
    }

    /// Record a pending attempt, start the charge with the provider and
    /// attach the provider's reference. A charge that cannot be started
    /// leaves a `failed` attempt behind (`CHARGE_NOT_STARTED`, or
    /// `CHARGE_UNCONFIRMED` flagged for audit when a non-deduplicating
    /// provider may have received the request), never a pending one.
    pub async fn initiate_charge(
        &self,
        user_id: &str,
        plan: Plan,
        provider: Provider,
        phone_number: Option<String>,
    ) -> Result<ChargeStarted, PremiumError> {
        let adapter = self.adapter(provider)?;

        if provider == Provider::Mpesa {
            let phone = phone_number.as_deref().ok_or_else(|| {
                PremiumError::InvalidRequest("phone number is required for M-Pesa".to_string())
            })?;
            mpesa::normalize_phone(phone).map_err(|e| PremiumError::InvalidRequest(e.to_string()))?;
        }

        let amount = self.pricing.price(provider, plan);
        let attempt_id = self
            .ledger
            .create_pending(user_id, plan, amount.clone(), provider)
            .await?;
        metrics::record_attempt(provider, AttemptState::Pending);

        let request = ChargeRequest {
            attempt_id,
            user_id: user_id.to_string(),
            plan,
            amount: amount.clone(),
            phone_number,
        };

        let initiated = match self.create_charge_with_retry(adapter.as_ref(), &request).await {
            Ok(initiated) => initiated,
            Err(e) => {
                tracing::error!(
                    attempt_id = %attempt_id,
                    provider = %provider,
                    error = %e,
                    "Charge could not be started"
                );
                // Without deduplication a lost answer may hide a live payment prompt.
                let unconfirmed =
                    e.is_transient() && !e.never_sent() && !adapter.deduplicates_charges();
                let transition = if unconfirmed {
                    TerminalTransition::failed(CHARGE_UNCONFIRMED).flagged()
                } else {
                    TerminalTransition::failed(CHARGE_NOT_STARTED)
                };
                self.ledger.transition_terminal(attempt_id, transition).await?;
                metrics::record_attempt(provider, AttemptState::Failed);

                return Err(match e {
                    ProviderError::InvalidRequest(msg) => PremiumError::InvalidRequest(msg),
                    ProviderError::NotConfigured(p) => PremiumError::ProviderNotConfigured(p),
                    other => PremiumError::StartFailed(other),
                });
            }
        };

        if let Err(e) = self
            .ledger
            .attach_provider_reference(attempt_id, &initiated.provider_reference)
            .await
        {
            tracing::error!(
                attempt_id = %attempt_id,
                provider = %provider,
                provider_reference = %initiated.provider_reference,
                error = %e,
                "Charge started but its reference could not be recorded"
            );
            let transition = TerminalTransition::failed(REFERENCE_NOT_RECORDED).flagged();
            if let Err(e) = self.ledger.transition_terminal(attempt_id, transition).await {
                tracing::error!(attempt_id = %attempt_id, error = %e, "Failed to close unreferenced attempt");
            }
            return Err(e.into());
        }

        Ok(ChargeStarted {
            attempt_id,
            provider,
            provider_reference: initiated.provider_reference,
            amount,
            action: initiated.action,
        })
    }

    async fn create_charge_with_retry(
        &self,
        adapter: &dyn PaymentProvider,
        request: &ChargeRequest,
    ) -> Result<ChargeInitiated, ProviderError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(self.charge_retry_max_elapsed),
            ..Default::default()
        };

        let deduplicated = adapter.deduplicates_charges();
        retry(backoff, || async {
            adapter.create_charge(request).await.map_err(|e| {
                if e.is_transient() && (deduplicated || e.never_sent()) {
                    tracing::warn!(
                        attempt_id = %request.attempt_id,
                        provider = %adapter.provider(),
                        error = %e,
                        "Charge creation failed, retrying"
                    );
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    /// Authenticate, parse and apply a provider push.
    pub async fn handle_provider_callback(
        &self,
        provider: Provider,
        callback: InboundCallback,
    ) -> Ack {
        let adapter = match self.providers.get(provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "Callback for unavailable provider");
                return Ack::Rejected;
            }
        };

        let outcome = match adapter.parse_callback(&callback).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return Ack::Accepted,
            Err(ProviderError::InvalidCallback(reason)) => {
                tracing::warn!(provider = %provider, reason = %reason, "Callback rejected");
                metrics::record_rejected_callback(provider);
                return Ack::Rejected;
            }
            Err(e) => {
                tracing::error!(
                    provider = %provider,
                    error = %e,
                    "Callback could not be verified, leaving it to the sweep"
                );
                return Ack::Accepted;
            }
        };

        match self
            .reconciler
            .apply(provider, outcome, Channel::Webhook)
            .await
        {
            Ok(_) => Ack::Accepted,
            Err(e) => {
                tracing::error!(
                    provider = %provider,
                    error = %e,
                    "Failed to apply callback, leaving it to the sweep"
                );
                Ack::Accepted
            }
        }
    }

    /// Capture an approved PayPal order after the payer returns. A capture
    /// that times out leaves the attempt pending for a later poll.
    pub async fn handle_capture_return(
        &self,
        user_id: &str,
        provider_reference: &str,
    ) -> Result<CaptureResult, PremiumError> {
        let attempt = self
            .ledger
            .find_by_provider_reference(Provider::Paypal, provider_reference)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or(PremiumError::AttemptNotFound)?;

        if attempt.state.is_terminal() {
            if attempt.needs_entitlement() {
                self.reconciler.grant_entitlement(&attempt).await?;
            }
            return Ok(CaptureResult::for_attempt(attempt.id, attempt.state));
        }

        let adapter = self.adapter(Provider::Paypal)?;
        let outcome = match adapter.capture_return(provider_reference).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    attempt_id = %attempt.id,
                    provider_reference = %provider_reference,
                    reason = %e,
                    "Capture outcome unknown, attempt stays pending"
                );
                return Ok(CaptureResult::for_attempt(attempt.id, AttemptState::Pending));
            }
            Err(e) => return Err(e.into()),
        };

        let attempt_id = attempt.id;
        let result = self
            .reconciler
            .apply_to(attempt, outcome, Channel::Capture)
            .await?;
        let state = result.state().unwrap_or(AttemptState::Pending);
        Ok(CaptureResult::for_attempt(attempt_id, state))
    }

    /// The payer abandoned the PayPal approval page. Only a still-pending
    /// attempt is cancelled.
    pub async fn handle_cancel_return(
        &self,
        user_id: &str,
        provider_reference: &str,
    ) -> Result<CaptureResult, PremiumError> {
        let attempt = self
            .ledger
            .find_by_provider_reference(Provider::Paypal, provider_reference)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or(PremiumError::AttemptNotFound)?;

        let result = self
            .ledger
            .transition_terminal(attempt.id, TerminalTransition::cancelled(CANCELLED_BY_PAYER))
            .await?;

        let state = if result.applied {
            metrics::record_attempt(Provider::Paypal, AttemptState::Cancelled);
            tracing::info!(attempt_id = %attempt.id, "Payment cancelled by payer");
            AttemptState::Cancelled
        } else {
            self.ledger
                .find_by_id(attempt.id)
                .await?
                .map(|a| a.state)
                .unwrap_or(attempt.state)
        };
        Ok(CaptureResult::for_attempt(attempt.id, state))
    }

    /// Ask the provider for the attempt's status and apply the answer.
    /// Returns the attempt as stored afterwards.
    pub async fn poll_and_reconcile_once(
        &self,
        attempt_id: AttemptId,
    ) -> Result<PaymentAttempt, PremiumError> {
        let attempt = self
            .ledger
            .find_by_id(attempt_id)
            .await?
            .ok_or(PremiumError::AttemptNotFound)?;

        match self.reconcile_attempt(attempt.clone(), Channel::Poll).await {
            Ok(_) => {}
            Err(PremiumError::Provider(e)) if e.is_transient() => {
                tracing::warn!(attempt_id = %attempt_id, error = %e, "Status poll failed, attempt unchanged");
                return Ok(attempt);
            }
            Err(e) => return Err(e),
        }

        self.ledger
            .find_by_id(attempt_id)
            .await?
            .ok_or(PremiumError::AttemptNotFound)
    }

    /// Shared by on-demand polls and the sweep. Terminal attempts are not
    /// polled; only a missing entitlement is healed.
    pub async fn reconcile_attempt(
        &self,
        attempt: PaymentAttempt,
        channel: Channel,
    ) -> Result<ReconcileResult, PremiumError> {
        if attempt.state.is_terminal() {
            if attempt.needs_entitlement() {
                self.reconciler.grant_entitlement(&attempt).await?;
            }
            return Ok(ReconcileResult::Duplicate {
                attempt_id: attempt.id,
                state: attempt.state,
            });
        }

        let Some(reference) = attempt.provider_reference.clone() else {
            return Ok(ReconcileResult::StillPending {
                attempt_id: attempt.id,
            });
        };

        let adapter = self.adapter(attempt.provider)?;
        let outcome = adapter.poll_status(&reference).await?;
        Ok(self.reconciler.apply_to(attempt, outcome, channel).await?)
    }

    pub async fn find_attempt(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<PaymentAttempt>, PremiumError> {
        Ok(self.ledger.find_by_id(attempt_id).await?)
    }

    pub async fn is_premium_active(&self, user_id: &str) -> Result<bool, PremiumError> {
        Ok(self.entitlements.is_active(user_id).await?)
    }

    pub async fn entitlement(&self, user_id: &str) -> Result<UserEntitlement, PremiumError> {
        Ok(self
            .entitlements
            .get(user_id)
            .await?
            .unwrap_or_else(|| UserEntitlement::none(user_id)))
    }

    pub async fn payment_history(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, PremiumError> {
        Ok(self.ledger.list_for_user(user_id, limit).await?)
    }
}
