pub mod entitlements;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod premium;
pub mod reconciler;
pub mod repository;

pub use entitlements::{EntitlementError, EntitlementStore, MongoEntitlementStore};
pub use ledger::{LedgerError, PaymentLedger, TransitionResult};
pub use memory::{InMemoryEntitlementStore, InMemoryPaymentLedger};
pub use metrics::{get_metrics, init_metrics};
pub use premium::{Ack, CaptureResult, ChargeStarted, PremiumError, PremiumService};
pub use reconciler::{ReconcileError, ReconcileResult, Reconciler};
pub use repository::MongoPaymentLedger;
