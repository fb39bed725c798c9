//! Shared HTTP plumbing for the premium payment service: errors, request
//! signing, request ids, tracing and base configuration.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod utils;

pub use error::AppError;
