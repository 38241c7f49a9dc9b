//! Workflow orchestration engine for Stepwise.
//!
//! This crate defines the engine and the "ports" (repository and capability
//! traits) that the infrastructure layer implements. It depends only on
//! `stepwise-types` -- never on `stepwise-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
