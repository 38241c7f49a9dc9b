//! Infrastructure layer for Stepwise.
//!
//! Implementations of the ports defined in `stepwise-core`: workflow
//! repositories (in-memory and SQLite), the `config.toml` loader, webhook
//! ingress verification, and the cron tick source that drives scheduled
//! triggers.

pub mod config;
pub mod scheduler;
pub mod sqlite;
pub mod webhook;

pub use stepwise_core::repository::memory;
