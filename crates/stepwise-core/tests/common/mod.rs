//! Shared fakes and builders for the engine integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use stepwise_core::workflow::capability::{ActionHandler, CapabilityError, CapabilityResult};
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use tokio::sync::broadcast;

/// Appends `start:<action>` / `end:<action>` to a shared journal.
pub struct Journal(pub Arc<Mutex<Vec<String>>>);

impl ActionHandler for Journal {
    fn invoke<'a>(&'a self, action_type: &'a str, _payload: Value) -> BoxFuture<'a, CapabilityResult<Value>> {
        Box::pin(async move {
            self.0.lock().unwrap().push(format!("start:{action_type}"));
            tokio::task::yield_now().await;
            self.0.lock().unwrap().push(format!("end:{action_type}"));
            Ok(json!({ "action": action_type }))
        })
    }
}

/// Always fails, recording the tokio instant of every call.
#[derive(Default)]
pub struct FailingClock {
    pub calls: Mutex<Vec<tokio::time::Instant>>,
}

impl ActionHandler for FailingClock {
    fn invoke<'a>(&'a self, _action_type: &'a str, _payload: Value) -> BoxFuture<'a, CapabilityResult<Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(tokio::time::Instant::now());
            Err(CapabilityError::Failed("service unavailable".to_string()))
        })
    }
}

pub fn step(id: &str, order: u32, config: StepConfig) -> StepDefinition {
    serde_json::from_value::<StepDefinition>(json!({
        "id": id,
        "order": order,
        "config": serde_json::to_value(config).unwrap(),
    }))
    .unwrap()
}

pub fn action(id: &str, order: u32) -> StepDefinition {
    step(
        id,
        order,
        StepConfig::Action {
            action_type: format!("do_{id}"),
            parameters: Map::new(),
        },
    )
}

pub fn wait(id: &str, order: u32, duration_ms: u64) -> StepDefinition {
    step(
        id,
        order,
        StepConfig::Wait {
            duration_ms: Some(duration_ms),
            until: None,
            timeout_ms: None,
        },
    )
}

pub fn workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
    let mut def: WorkflowDefinition = serde_json::from_value(json!({ "name": name, "steps": [] })).unwrap();
    def.steps = steps;
    def
}

/// Drain every event currently buffered on a receiver.
pub fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
