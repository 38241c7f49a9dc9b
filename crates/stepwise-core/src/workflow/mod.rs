//! Workflow engine core.
//!
//! - `definition` -- YAML/JSON parsing, validation, lifecycle rules
//! - `dag` -- step graph construction and cycle detection
//! - `context` -- execution context, step outputs, template rendering
//! - `expression` -- condition trees and sandboxed JEXL evaluation
//! - `retry` -- backoff delays and retry decisions
//! - `trigger` -- trigger matching, schedules, debouncing, registration
//! - `step_runner` -- per-kind step execution with timeouts
//! - `orchestrator` -- drives one execution over the step graph
//! - `queue` -- per-workflow admission under a concurrency ceiling
//! - `history` -- execution history retention and analytics
//! - `engine` -- facade tying the above together
//! - `capability` -- traits for the external collaborators steps call

pub mod capability;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod history;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod step_runner;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;
