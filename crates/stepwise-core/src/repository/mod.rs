//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any
//! specific storage technology; it only ships the in-memory store used by
//! embedded engines and tests.

pub mod memory;
pub mod workflow;
