//! Domain types for premium payments.

pub mod attempt;
pub mod entitlement;
pub mod money;
pub mod outcome;

pub use attempt::{AttemptId, AttemptState, PaymentAttempt, Plan, Provider, TerminalTransition};
pub use entitlement::UserEntitlement;
pub use money::{Money, MoneyError};
pub use outcome::{Channel, Outcome};
