//! Logging and trace export setup for Stepwise processes.

pub mod tracing_setup;
