//! Builders shared by the workflow unit tests.

use serde_json::{Map, json};
use stepwise_types::workflow::{
    Condition, ConditionOperator, FieldCondition, StepConfig, StepDefinition, WorkflowDefinition,
};

pub fn step(id: &str, order: u32, config: StepConfig) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: String::new(),
        order,
        enabled: true,
        dependencies: Vec::new(),
        next_steps: Vec::new(),
        error_handling: Default::default(),
        timeout_secs: None,
        config,
        stats: Default::default(),
    }
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

pub fn condition_step(id: &str, order: u32, true_step: &str, false_step: &str) -> StepDefinition {
    step(
        id,
        order,
        StepConfig::Condition {
            condition: Condition::Compare(FieldCondition {
                field: "flag".to_string(),
                operator: ConditionOperator::Equals,
                value: json!(true),
            }),
            true_step: true_step.to_string(),
            false_step: false_step.to_string(),
        },
    )
}

pub fn parallel_step(id: &str, order: u32, branches: &[&str], wait_for_all: bool) -> StepDefinition {
    step(
        id,
        order,
        StepConfig::Parallel {
            branches: branches.iter().map(|b| b.to_string()).collect(),
            wait_for_all,
        },
    )
}

pub fn wait_step(id: &str, order: u32, duration_ms: u64) -> StepDefinition {
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

pub fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
    let mut def: WorkflowDefinition = serde_json::from_value(json!({
        "name": "test-workflow",
        "steps": []
    }))
    .expect("minimal workflow parses");
    def.steps = steps;
    def
}
