use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SweepConfig;
use crate::models::{AttemptState, Channel, PaymentAttempt, TerminalTransition};
use crate::services::ledger::{LedgerError, PageCursor, PaymentLedger};
use crate::services::metrics;
use crate::services::reconciler::ReconcileResult;
use crate::services::PremiumService;

pub const ABANDONED: &str = "ABANDONED";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Completed attempts whose entitlement was re-applied.
    pub healed: usize,
    pub polled: usize,
    /// Pending attempts that reached a terminal state this cycle.
    pub resolved: usize,
    pub still_pending: usize,
    pub alerted: usize,
    pub abandoned: usize,
    pub errors: usize,
}

/// Periodic reconciliation for attempts whose callback never arrived.
pub struct ReconciliationSweep {
    service: Arc<PremiumService>,
    ledger: Arc<dyn PaymentLedger>,
    config: SweepConfig,
    shutdown_token: CancellationToken,
}

impl ReconciliationSweep {
    pub fn new(
        service: Arc<PremiumService>,
        ledger: Arc<dyn PaymentLedger>,
        config: SweepConfig,
    ) -> Self {
        Self {
            service,
            ledger,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(self) {
        if !self.config.enabled {
            tracing::info!("Reconciliation sweep disabled by configuration");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconciliation sweep"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Reconciliation sweep shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let start = Instant::now();
                    match self.run_once().await {
                        Ok(report) => {
                            metrics::record_sweep_run("ok", start.elapsed().as_secs_f64());
                            tracing::info!(
                                healed = report.healed,
                                polled = report.polled,
                                resolved = report.resolved,
                                still_pending = report.still_pending,
                                alerted = report.alerted,
                                abandoned = report.abandoned,
                                errors = report.errors,
                                duration_ms = start.elapsed().as_millis() as u64,
                                "Reconciliation sweep finished"
                            );
                        }
                        Err(e) => {
                            metrics::record_sweep_run("error", start.elapsed().as_secs_f64());
                            tracing::error!(error = %e, "Reconciliation sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// One full cycle. Errors on individual attempts are counted and logged;
    /// only a failure to list work aborts the cycle. Both passes page through
    /// every candidate, so attempts that stay unresolved never hide newer ones.
    pub async fn run_once(&self) -> Result<SweepReport, LedgerError> {
        let now = Utc::now();
        let mut report = SweepReport::default();
        self.heal_unapplied(&mut report).await?;
        self.poll_stale(now, &mut report).await?;
        Ok(report)
    }

    async fn heal_unapplied(&self, report: &mut SweepReport) -> Result<(), LedgerError> {
        let mut cursor = None;
        loop {
            let page = self
                .ledger
                .list_unapplied_completed(cursor, self.config.batch_size)
                .await?;
            let exhausted = page.len() < self.config.batch_size as usize;
            cursor = page.last().map(|a| PageCursor::new(a.updated_at, a.id));

            for attempt in page {
                match self.service.reconciler().grant_entitlement(&attempt).await {
                    Ok(_) => report.healed += 1,
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!(
                            attempt_id = %attempt.id,
                            user_id = %attempt.user_id,
                            error = %e,
                            "Failed to re-apply entitlement"
                        );
                    }
                }
            }

            if exhausted || cursor.is_none() || self.shutdown_token.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn poll_stale(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), LedgerError> {
        let shortest_grace = self.config.paypal_grace.min(self.config.mpesa_grace);
        let mut cursor = None;
        loop {
            let page = self
                .ledger
                .list_stale_pending(now - shortest_grace, cursor, self.config.batch_size)
                .await?;
            let exhausted = page.len() < self.config.batch_size as usize;
            cursor = page.last().map(|a| PageCursor::new(a.created_at, a.id));

            for attempt in page {
                if attempt.created_at > now - self.config.grace_for(attempt.provider) {
                    continue;
                }
                self.poll_one(attempt, now, report).await;
            }

            if exhausted || cursor.is_none() || self.shutdown_token.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn poll_one(&self, attempt: PaymentAttempt, now: DateTime<Utc>, report: &mut SweepReport) {
        report.polled += 1;

        match self
            .service
            .reconcile_attempt(attempt.clone(), Channel::Sweep)
            .await
        {
            Ok(ReconcileResult::StillPending { .. }) => {
                report.still_pending += 1;
                self.handle_overdue(&attempt, now, true, report).await;
            }
            Ok(ReconcileResult::Applied { state, .. }) => {
                report.resolved += 1;
                tracing::info!(
                    attempt_id = %attempt.id,
                    provider = %attempt.provider,
                    state = %state,
                    "Sweep resolved pending attempt"
                );
            }
            Ok(_) => {}
            Err(e) => {
                report.errors += 1;
                tracing::warn!(
                    attempt_id = %attempt.id,
                    provider = %attempt.provider,
                    error = %e,
                    "Sweep poll failed"
                );
                self.handle_overdue(&attempt, now, false, report).await;
            }
        }
    }

    /// Alert on, or cancel, an attempt that has been pending too long.
    /// Cancellation requires the provider to have just confirmed the
    /// attempt is still pending.
    async fn handle_overdue(
        &self,
        attempt: &PaymentAttempt,
        now: DateTime<Utc>,
        confirmed_pending: bool,
        report: &mut SweepReport,
    ) {
        let age = now - attempt.created_at;

        if let Some(abandon_after) = self.config.abandon_after {
            if confirmed_pending && age >= abandon_after {
                match self
                    .ledger
                    .transition_terminal(attempt.id, TerminalTransition::cancelled(ABANDONED))
                    .await
                {
                    Ok(result) if result.applied => {
                        report.abandoned += 1;
                        metrics::record_attempt(attempt.provider, AttemptState::Cancelled);
                        tracing::warn!(
                            attempt_id = %attempt.id,
                            provider = %attempt.provider,
                            age_hours = age.num_hours(),
                            "Abandoned payment attempt cancelled"
                        );
                        return;
                    }
                    Ok(_) => return,
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!(attempt_id = %attempt.id, error = %e, "Failed to cancel abandoned attempt");
                    }
                }
            }
        }

        if age >= self.config.alert_after {
            report.alerted += 1;
            metrics::record_stale_pending(attempt.provider);
            tracing::error!(
                attempt_id = %attempt.id,
                user_id = %attempt.user_id,
                provider = %attempt.provider,
                provider_reference = ?attempt.provider_reference,
                age_hours = age.num_hours(),
                "Payment attempt pending beyond alert threshold"
            );
        }
    }
}
