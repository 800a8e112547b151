//! Payment transaction processing core
//!
//! Sessions, captures, cancellations and refunds against an external gateway,
//! with an append-only audit trail, idempotent writes, webhook reconciliation
//! and a background job pipeline.

pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod startup;
pub mod workers;
