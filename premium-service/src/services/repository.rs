use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ledger::{LedgerError, PageCursor, PaymentLedger, TransitionResult};
use crate::models::{
    AttemptId, AttemptState, Money, PaymentAttempt, Plan, Provider, TerminalTransition,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptDocument {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    plan: Plan,
    amount_minor: i64,
    currency: String,
    provider: Provider,
    /// Absent until attached, so the partial unique index ignores it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_reference: Option<String>,
    state: AttemptState,
    failure_reason: Option<String>,
    provider_receipt_id: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    entitlement_applied: bool,
    #[serde(default)]
    flagged_for_audit: bool,
    created_at: mongodb::bson::DateTime,
    updated_at: mongodb::bson::DateTime,
}

impl From<&PaymentAttempt> for AttemptDocument {
    fn from(attempt: &PaymentAttempt) -> Self {
        Self {
            id: attempt.id.to_string(),
            user_id: attempt.user_id.clone(),
            plan: attempt.plan,
            amount_minor: attempt.amount.minor_units,
            currency: attempt.amount.currency.clone(),
            provider: attempt.provider,
            provider_reference: attempt.provider_reference.clone(),
            state: attempt.state,
            failure_reason: attempt.failure_reason.clone(),
            provider_receipt_id: attempt.provider_receipt_id.clone(),
            metadata: attempt.metadata.clone(),
            entitlement_applied: attempt.entitlement_applied,
            flagged_for_audit: attempt.flagged_for_audit,
            created_at: mongodb::bson::DateTime::from_chrono(attempt.created_at),
            updated_at: mongodb::bson::DateTime::from_chrono(attempt.updated_at),
        }
    }
}

impl TryFrom<AttemptDocument> for PaymentAttempt {
    type Error = LedgerError;

    fn try_from(doc: AttemptDocument) -> Result<Self, Self::Error> {
        let id = doc.id.parse::<AttemptId>().map_err(|e| {
            LedgerError::Storage(anyhow::anyhow!("corrupt attempt id {}: {}", doc.id, e))
        })?;

        Ok(Self {
            id,
            user_id: doc.user_id,
            plan: doc.plan,
            amount: Money::new(doc.amount_minor, doc.currency),
            provider: doc.provider,
            provider_reference: doc.provider_reference,
            state: doc.state,
            failure_reason: doc.failure_reason,
            provider_receipt_id: doc.provider_receipt_id,
            metadata: doc.metadata,
            entitlement_applied: doc.entitlement_applied,
            flagged_for_audit: doc.flagged_for_audit,
            created_at: doc.created_at.to_chrono(),
            updated_at: doc.updated_at.to_chrono(),
        })
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == 11000
    )
}

/// Mongo field names may not contain `.` or start with `$`.
fn metadata_field(key: &str) -> String {
    format!(
        "metadata.{}",
        key.trim_start_matches('$').replace('.', "_")
    )
}

/// Keyset filter on `(field, _id)` for resuming after `cursor`.
fn after_cursor(field: &str, cursor: Option<PageCursor>) -> Option<Document> {
    cursor.map(|c| {
        let at = mongodb::bson::DateTime::from_chrono(c.at);
        doc! {
            "$or": [
                { field: { "$gt": at } },
                { field: at, "_id": { "$gt": c.id.to_string() } },
            ]
        }
    })
}

#[derive(Clone)]
pub struct MongoPaymentLedger {
    attempts: Collection<AttemptDocument>,
}

impl MongoPaymentLedger {
    pub fn new(db: &Database) -> Self {
        Self {
            attempts: db.collection("payment_attempts"),
        }
    }

    pub async fn init_indexes(&self) -> anyhow::Result<()> {
        // One attempt per provider reference, once attached
        let reference_index = IndexModel::builder()
            .keys(doc! { "provider": 1, "provider_reference": 1 })
            .options(
                IndexOptions::builder()
                    .name("provider_reference_unique_idx".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! {
                        "provider_reference": { "$type": "string" }
                    })
                    .build(),
            )
            .build();

        // Sweep inputs
        let state_index = IndexModel::builder()
            .keys(doc! { "state": 1, "created_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("state_created_idx".to_string())
                    .build(),
            )
            .build();

        let unapplied_index = IndexModel::builder()
            .keys(doc! { "state": 1, "entitlement_applied": 1, "updated_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("state_entitlement_idx".to_string())
                    .build(),
            )
            .build();

        let user_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_history_idx".to_string())
                    .build(),
            )
            .build();

        self.attempts
            .create_indexes(
                [reference_index, state_index, unapplied_index, user_index],
                None,
            )
            .await?;

        tracing::info!("Payment ledger indexes initialized");
        Ok(())
    }

    async fn find_many(
        &self,
        filter: Document,
        sort: Document,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError> {
        let options = FindOptions::builder().sort(sort).limit(limit).build();
        let cursor = self.attempts.find(filter, Some(options)).await?;
        let docs: Vec<AttemptDocument> = cursor.try_collect().await?;
        docs.into_iter().map(PaymentAttempt::try_from).collect()
    }

    async fn require(&self, attempt_id: AttemptId) -> Result<PaymentAttempt, LedgerError> {
        self.find_by_id(attempt_id)
            .await?
            .ok_or(LedgerError::NotFound(attempt_id))
    }
}

#[async_trait]
impl PaymentLedger for MongoPaymentLedger {
    async fn create_pending(
        &self,
        user_id: &str,
        plan: Plan,
        amount: Money,
        provider: Provider,
    ) -> Result<AttemptId, LedgerError> {
        let attempt = PaymentAttempt::new_pending(user_id, plan, amount, provider);
        self.attempts
            .insert_one(AttemptDocument::from(&attempt), None)
            .await?;

        tracing::info!(
            attempt_id = %attempt.id,
            user_id = %user_id,
            provider = %provider,
            plan = %plan,
            amount = %attempt.amount,
            "Payment attempt recorded"
        );
        Ok(attempt.id)
    }

    async fn attach_provider_reference(
        &self,
        attempt_id: AttemptId,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let filter = doc! {
            "_id": attempt_id.to_string(),
            "provider_reference": { "$exists": false },
        };
        let update = doc! {
            "$set": {
                "provider_reference": reference,
                "updated_at": mongodb::bson::DateTime::now(),
            }
        };

        let result = match self.attempts.update_one(filter, update, None).await {
            Ok(result) => result,
            Err(e) if is_duplicate_key(&e) => {
                let attempt = self.require(attempt_id).await?;
                return Err(LedgerError::DuplicateReference {
                    provider: attempt.provider,
                    reference: reference.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if result.modified_count == 1 {
            return Ok(());
        }

        let attempt = self.require(attempt_id).await?;
        match attempt.provider_reference {
            Some(existing) if existing == reference => Ok(()),
            Some(existing) => Err(LedgerError::AlreadyAttached {
                attempt_id,
                existing,
            }),
            None => Err(LedgerError::Storage(anyhow::anyhow!(
                "reference for attempt {} was not written",
                attempt_id
            ))),
        }
    }

    async fn find_by_provider_reference(
        &self,
        provider: Provider,
        reference: &str,
    ) -> Result<Option<PaymentAttempt>, LedgerError> {
        let filter = doc! {
            "provider": provider.as_str(),
            "provider_reference": reference,
        };
        self.attempts
            .find_one(filter, None)
            .await?
            .map(PaymentAttempt::try_from)
            .transpose()
    }

    async fn find_by_id(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<PaymentAttempt>, LedgerError> {
        self.attempts
            .find_one(doc! { "_id": attempt_id.to_string() }, None)
            .await?
            .map(PaymentAttempt::try_from)
            .transpose()
    }

    async fn transition_terminal(
        &self,
        attempt_id: AttemptId,
        transition: TerminalTransition,
    ) -> Result<TransitionResult, LedgerError> {
        if !transition.target.is_terminal() {
            return Err(LedgerError::Storage(anyhow::anyhow!(
                "{} is not a terminal state",
                transition.target
            )));
        }

        let mut set = doc! {
            "state": transition.target.as_str(),
            "updated_at": mongodb::bson::DateTime::now(),
        };
        if let (AttemptState::Completed, Some(receipt)) = (transition.target, transition.receipt_id) {
            set.insert("provider_receipt_id", receipt);
        }
        if let Some(reason) = transition.reason {
            set.insert("failure_reason", reason);
        }
        if transition.flag_for_audit {
            set.insert("flagged_for_audit", true);
        }
        for (key, value) in transition.metadata {
            set.insert(metadata_field(&key), Bson::String(value));
        }

        let filter = doc! {
            "_id": attempt_id.to_string(),
            "state": AttemptState::Pending.as_str(),
        };
        let result = self
            .attempts
            .update_one(filter, doc! { "$set": set }, None)
            .await?;

        if result.modified_count == 1 {
            return Ok(TransitionResult { applied: true });
        }

        // Either already terminal or missing altogether.
        self.require(attempt_id).await?;
        Ok(TransitionResult { applied: false })
    }

    async fn mark_entitlement_applied(&self, attempt_id: AttemptId) -> Result<(), LedgerError> {
        let result = self
            .attempts
            .update_one(
                doc! { "_id": attempt_id.to_string() },
                doc! {
                    "$set": {
                        "entitlement_applied": true,
                        "updated_at": mongodb::bson::DateTime::now(),
                    }
                },
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(LedgerError::NotFound(attempt_id));
        }
        Ok(())
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError> {
        let mut filter = doc! {
            "state": AttemptState::Pending.as_str(),
            "provider_reference": { "$type": "string" },
            "created_at": { "$lt": mongodb::bson::DateTime::from_chrono(older_than) },
        };
        if let Some(keyset) = after_cursor("created_at", after) {
            filter.extend(keyset);
        }
        self.find_many(filter, doc! { "created_at": 1, "_id": 1 }, limit)
            .await
    }

    async fn list_unapplied_completed(
        &self,
        after: Option<PageCursor>,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError> {
        let mut filter = doc! {
            "state": AttemptState::Completed.as_str(),
            "entitlement_applied": false,
        };
        if let Some(keyset) = after_cursor("updated_at", after) {
            filter.extend(keyset);
        }
        self.find_many(filter, doc! { "updated_at": 1, "_id": 1 }, limit)
            .await
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<PaymentAttempt>, LedgerError> {
        self.find_many(
            doc! { "user_id": user_id },
            doc! { "created_at": -1 },
            limit,
        )
        .await
    }
}
