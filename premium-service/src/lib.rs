//! Premium subscription payments: PayPal and M-Pesa checkout, callback and
//! poll reconciliation, and premium entitlement tracking.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod services;
pub mod startup;
pub mod workers;

pub use startup::{AppState, Application};
