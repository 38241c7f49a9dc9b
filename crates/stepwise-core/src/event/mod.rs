//! Event bus for workflow lifecycle notifications.
//!
//! `EventBus` fans `WorkflowEvent`s out to subscribers over a
//! `tokio::sync::broadcast` channel; `ExecutionWatch` follows one execution.

pub mod bus;

pub use bus::{EventBus, ExecutionWatch};
