//! Premium entitlement storage.
//!
//! Extensions are keyed by the attempt that paid for them, so re-applying the
//! same attempt never extends twice. The MongoDB store writes the premium
//! fields of existing `users` documents and serialises concurrent extensions
//! for one user with a compare-and-swap on the previous expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AttemptId, Plan, UserEntitlement};

/// Upper bound on CAS retries before an extension is left to the sweep.
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("entitlement for user {0} changed concurrently too many times")]
    Contention(String),

    /// No user record to extend. Retried by the sweep.
    #[error("user {0} does not exist")]
    UnknownUser(String),

    #[error("entitlement storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<mongodb::error::Error> for EntitlementError {
    fn from(err: mongodb::error::Error) -> Self {
        EntitlementError::Storage(anyhow::Error::new(err))
    }
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Stack `plan` onto the user's entitlement, once per `grant`. Returns the
    /// resulting expiry (`None` for a never-expiring entitlement).
    async fn extend(
        &self,
        user_id: &str,
        plan: Plan,
        grant: AttemptId,
    ) -> Result<Option<DateTime<Utc>>, EntitlementError>;

    async fn get(&self, user_id: &str) -> Result<Option<UserEntitlement>, EntitlementError>;

    async fn is_active(&self, user_id: &str) -> Result<bool, EntitlementError> {
        Ok(self
            .get(user_id)
            .await?
            .is_some_and(|e| e.is_active_at(Utc::now())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserDocument {
    #[serde(default, rename = "isPremium")]
    is_premium: bool,
    #[serde(default, rename = "premiumExpiresAt")]
    premium_expires_at: Option<mongodb::bson::DateTime>,
    #[serde(default, rename = "premiumGrants")]
    premium_grants: Vec<String>,
}

impl UserDocument {
    fn into_entitlement(self, user_id: &str) -> UserEntitlement {
        UserEntitlement {
            user_id: user_id.to_string(),
            is_premium: self.is_premium,
            premium_expires_at: self.premium_expires_at.map(|d| d.to_chrono()),
            premium_grants: self.premium_grants,
        }
    }
}

/// `_id` of the user record: an `ObjectId` when the id is one, the raw
/// string otherwise.
fn user_key(user_id: &str) -> Bson {
    ObjectId::parse_str(user_id)
        .map(Bson::ObjectId)
        .unwrap_or_else(|_| Bson::String(user_id.to_string()))
}

fn to_bson_date(value: Option<DateTime<Utc>>) -> Bson {
    value
        .map(|d| Bson::DateTime(mongodb::bson::DateTime::from_chrono(d)))
        .unwrap_or(Bson::Null)
}

/// Entitlement fields on the shared `users` collection. Users are created
/// elsewhere; this store only updates them.
#[derive(Clone)]
pub struct MongoEntitlementStore {
    users: Collection<UserDocument>,
}

impl MongoEntitlementStore {
    pub fn new(db: &Database) -> Self {
        Self {
            users: db.collection("users"),
        }
    }

    pub async fn init_indexes(&self) -> anyhow::Result<()> {
        let grants_index = IndexModel::builder()
            .keys(doc! { "premiumGrants": 1 })
            .build();
        self.users.create_indexes([grants_index], None).await?;
        tracing::info!("Entitlement indexes initialized");
        Ok(())
    }

    async fn read(&self, user_id: &str) -> Result<Option<UserEntitlement>, EntitlementError> {
        Ok(self
            .users
            .find_one(doc! { "_id": user_key(user_id) }, None)
            .await?
            .map(|doc| doc.into_entitlement(user_id)))
    }

    /// Filter matching the user document exactly as it was read, and only if
    /// `grant` has not been applied in the meantime.
    fn cas_filter(user_id: &str, seen: &UserEntitlement, grant: &str) -> Document {
        let is_premium: Bson = if seen.is_premium {
            Bson::Boolean(true)
        } else {
            doc! { "$ne": true }.into()
        };

        doc! {
            "_id": user_key(user_id),
            "premiumGrants": { "$ne": grant },
            "premiumExpiresAt": to_bson_date(seen.premium_expires_at),
            "isPremium": is_premium,
        }
    }
}

#[async_trait]
impl EntitlementStore for MongoEntitlementStore {
    async fn extend(
        &self,
        user_id: &str,
        plan: Plan,
        grant: AttemptId,
    ) -> Result<Option<DateTime<Utc>>, EntitlementError> {
        let grant_key = grant.to_string();

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let seen = self
                .read(user_id)
                .await?
                .ok_or_else(|| EntitlementError::UnknownUser(user_id.to_string()))?;

            if seen.has_grant(&grant) {
                tracing::debug!(user_id = %user_id, grant = %grant_key, "Grant already applied");
                return Ok(seen.premium_expires_at);
            }

            let next = seen.extended(plan, &grant, Utc::now());
            let update = doc! {
                "$set": {
                    "isPremium": true,
                    "premiumExpiresAt": to_bson_date(next.premium_expires_at),
                },
                "$addToSet": { "premiumGrants": grant_key.as_str() },
            };

            let result = self
                .users
                .update_one(Self::cas_filter(user_id, &seen, &grant_key), update, None)
                .await?;

            if result.modified_count == 1 {
                tracing::info!(
                    user_id = %user_id,
                    grant = %grant_key,
                    plan = %plan,
                    expires_at = ?next.premium_expires_at,
                    "Premium entitlement extended"
                );
                return Ok(next.premium_expires_at);
            }

            tracing::debug!(user_id = %user_id, attempt, "Entitlement changed concurrently, retrying");
        }

        Err(EntitlementError::Contention(user_id.to_string()))
    }

    async fn get(&self, user_id: &str) -> Result<Option<UserEntitlement>, EntitlementError> {
        self.read(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_users_are_matched_by_object_id() {
        let hex = "65f1a2b3c4d5e6f708192a3b";
        assert_eq!(
            user_key(hex),
            Bson::ObjectId(ObjectId::parse_str(hex).unwrap())
        );
        assert_eq!(user_key("user-1"), Bson::String("user-1".to_string()));
    }

    #[test]
    fn cas_filter_pins_previous_state() {
        let seen = UserEntitlement::none("65f1a2b3c4d5e6f708192a3b");
        let filter = MongoEntitlementStore::cas_filter(&seen.user_id, &seen, "grant-1");
        assert!(matches!(filter.get("_id"), Some(Bson::ObjectId(_))));
        assert_eq!(filter.get("premiumExpiresAt"), Some(&Bson::Null));
        assert_eq!(
            filter.get_document("premiumGrants").unwrap().get_str("$ne").unwrap(),
            "grant-1"
        );
    }
}
