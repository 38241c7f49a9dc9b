//! Shared domain types for Stepwise.
//!
//! This crate contains the data model of the workflow engine: workflow
//! definitions with their triggers and steps, execution records, lifecycle
//! events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
