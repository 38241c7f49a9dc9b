//! Step graph construction and cycle detection.
//!
//! Uses `petgraph` to model the step graph of a workflow. Besides explicit
//! `dependencies`, the graph carries gated edges (condition branches,
//! `next_steps` guards, error routes, parallel releases) and, for every
//! workflow type except `parallel`, implicit ordering edges that serialise
//! ungated steps by ascending `order`.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use stepwise_types::workflow::{StepConfig, WorkflowDefinition, WorkflowType};

use super::definition::WorkflowError;

/// Kind of an edge between two steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Target waits until the source is terminal; never activates or blocks.
    Order,
    /// Explicit dependency: taken when the source succeeded or was skipped
    /// by policy, failed when the source failed or was blocked.
    Dependency,
    /// Condition branch: taken when the source evaluated to `when`.
    Branch { when: bool },
    /// `next_steps[index]` of the source; taken when its guard passes.
    Guard { index: usize },
    /// Error route: taken only when the source failed under `escalate`.
    OnError,
    /// Parallel release: taken as soon as the parallel step starts.
    Release,
}

/// The resolved step graph of one workflow definition.
///
/// Nodes are enabled steps that are not loop bodies. Loop bodies are run
/// by their loop step and never scheduled on their own.
#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<String, EdgeKind>,
    nodes: HashMap<String, NodeIndex>,
    topo: Vec<String>,
    loop_bodies: HashSet<String>,
}

impl StepGraph {
    /// Build the graph, rejecting unknown references and cycles.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let known: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();

        let loop_bodies: HashSet<String> = def
            .steps
            .iter()
            .filter(|s| s.enabled)
            .filter_map(|s| match &s.config {
                StepConfig::Loop { body, .. } => Some(body.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect();

        let mut graph = DiGraph::<String, EdgeKind>::new();
        let mut nodes = HashMap::new();
        for step in def.steps.iter().filter(|s| s.enabled && !loop_bodies.contains(&s.id)) {
            let idx = graph.add_node(step.id.clone());
            nodes.insert(step.id.clone(), idx);
        }

        let check = |from: &str, to: &str| -> Result<(), WorkflowError> {
            if !known.contains(to) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{from}' references unknown step '{to}'"
                )));
            }
            if loop_bodies.contains(to) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{from}' references loop body step '{to}'"
                )));
            }
            Ok(())
        };

        let mut gated_targets: HashSet<String> = HashSet::new();
        for step in def.steps.iter().filter(|s| nodes.contains_key(&s.id)) {
            let to_idx = nodes[&step.id];
            let link = |graph: &mut DiGraph<String, EdgeKind>, from: &str, to: &str, kind: EdgeKind| {
                if let (Some(&a), Some(&b)) = (nodes.get(from), nodes.get(to)) {
                    graph.add_edge(a, b, kind);
                }
            };

            for dep in &step.dependencies {
                check(step.id.as_str(), dep.as_str())?;
                if let Some(&from_idx) = nodes.get(dep) {
                    graph.add_edge(from_idx, to_idx, EdgeKind::Dependency);
                }
            }
            for (index, next) in step.next_steps.iter().enumerate() {
                check(step.id.as_str(), next.step_id.as_str())?;
                link(&mut graph, step.id.as_str(), next.step_id.as_str(), EdgeKind::Guard { index });
                gated_targets.insert(next.step_id.clone());
            }
            if let Some(error_step) = &step.error_handling.error_step {
                check(step.id.as_str(), error_step.as_str())?;
                link(&mut graph, step.id.as_str(), error_step.as_str(), EdgeKind::OnError);
                gated_targets.insert(error_step.clone());
            }
            match &step.config {
                StepConfig::Condition {
                    true_step,
                    false_step,
                    ..
                } => {
                    check(step.id.as_str(), true_step.as_str())?;
                    check(step.id.as_str(), false_step.as_str())?;
                    link(&mut graph, step.id.as_str(), true_step.as_str(), EdgeKind::Branch { when: true });
                    link(&mut graph, step.id.as_str(), false_step.as_str(), EdgeKind::Branch { when: false });
                    gated_targets.insert(true_step.clone());
                    gated_targets.insert(false_step.clone());
                }
                StepConfig::Parallel { branches, .. } => {
                    for branch in branches {
                        check(step.id.as_str(), branch.as_str())?;
                        link(&mut graph, step.id.as_str(), branch.as_str(), EdgeKind::Release);
                        gated_targets.insert(branch.clone());
                    }
                    if !branches.iter().any(|b| nodes.contains_key(b)) {
                        return Err(WorkflowError::ValidationError(format!(
                            "parallel step '{}' has no enabled branches",
                            step.id
                        )));
                    }
                }
                StepConfig::Loop { body, .. } => {
                    for member in body {
                        if !known.contains(member.as_str()) {
                            return Err(WorkflowError::UnknownDependency(format!(
                                "loop '{}' references unknown body step '{member}'",
                                step.id
                            )));
                        }
                    }
                }
                _ => {}
            }
        }

        if def.config.workflow_type != WorkflowType::Parallel {
            let mut chain: Vec<(usize, &stepwise_types::workflow::StepDefinition)> = def
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| nodes.contains_key(&s.id) && !gated_targets.contains(&s.id))
                .collect();
            chain.sort_by_key(|(i, s)| (s.order, *i));

            let mut prev: Option<NodeIndex> = None;
            for (_, step) in chain {
                let idx = nodes[&step.id];
                let has_deps = step.dependencies.iter().any(|d| nodes.contains_key(d));
                if let (Some(prev_idx), false) = (prev, has_deps) {
                    for source in gated_region(&graph, prev_idx) {
                        graph.add_edge(source, idx, EdgeKind::Order);
                    }
                }
                prev = Some(idx);
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            let node_id = &graph[cycle.node_id()];
            WorkflowError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
        })?;
        let topo = sorted.into_iter().map(|idx| graph[idx].clone()).collect();

        Ok(Self {
            graph,
            nodes,
            topo,
            loop_bodies,
        })
    }

    /// Scheduled step IDs in topological order.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.topo.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topo.is_empty()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.nodes.contains_key(step_id)
    }

    pub fn is_loop_body(&self, step_id: &str) -> bool {
        self.loop_bodies.contains(step_id)
    }

    /// Incoming edges of a step as `(source, kind)`.
    pub fn incoming(&self, step_id: &str) -> Vec<(&str, EdgeKind)> {
        let Some(&idx) = self.nodes.get(step_id) else {
            return Vec::new();
        };
        let mut edges: Vec<(&str, EdgeKind)> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (self.graph[e.source()].as_str(), *e.weight()))
            .collect();
        edges.sort_by(|a, b| a.0.cmp(b.0));
        edges
    }
}

/// The node itself plus everything reachable from it through branch,
/// guard and error edges. Parallel releases are excluded: a parallel step's
/// own completion already accounts for its branches.
fn gated_region(graph: &DiGraph<String, EdgeKind>, start: NodeIndex) -> Vec<NodeIndex> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for edge in graph.edges_directed(current, Direction::Outgoing) {
            let follows = matches!(
                edge.weight(),
                EdgeKind::Branch { .. } | EdgeKind::Guard { .. } | EdgeKind::OnError
            );
            if follows && seen.insert(edge.target()) {
                queue.push_back(edge.target());
            }
        }
    }
    let mut region: Vec<NodeIndex> = seen.into_iter().collect();
    region.sort();
    region
}

/// Validate that the steps form a schedulable graph.
pub fn validate_dag(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    StepGraph::build(def).map(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{action, condition_step, parallel_step, workflow};

    fn kinds<'a>(edges: &'a [(&'a str, EdgeKind)]) -> Vec<(&'a str, EdgeKind)> {
        edges.to_vec()
    }

    #[test]
    fn test_sequential_chain_gets_order_edges() {
        let def = workflow(vec![action("a", 1), action("b", 2), action("c", 3)]);
        let graph = StepGraph::build(&def).unwrap();
        assert_eq!(graph.step_ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(kinds(&graph.incoming("b")), vec![("a", EdgeKind::Order)]);
        assert_eq!(kinds(&graph.incoming("c")), vec![("b", EdgeKind::Order)]);
    }

    #[test]
    fn test_chain_follows_order_not_position() {
        let def = workflow(vec![action("late", 5), action("early", 1)]);
        let graph = StepGraph::build(&def).unwrap();
        assert_eq!(graph.step_ids().collect::<Vec<_>>(), vec!["early", "late"]);
    }

    #[test]
    fn test_parallel_workflow_has_no_implicit_edges() {
        let mut def = workflow(vec![action("a", 1), action("b", 2)]);
        def.config.workflow_type = WorkflowType::Parallel;
        let graph = StepGraph::build(&def).unwrap();
        assert!(graph.incoming("b").is_empty());
    }

    #[test]
    fn test_explicit_dependencies_replace_implicit_edge() {
        let mut b = action("b", 2);
        b.dependencies = vec!["a".to_string()];
        let def = workflow(vec![action("a", 1), b, action("c", 3)]);
        let graph = StepGraph::build(&def).unwrap();
        assert_eq!(kinds(&graph.incoming("b")), vec![("a", EdgeKind::Dependency)]);
    }

    #[test]
    fn test_condition_region_orders_following_step() {
        let def = workflow(vec![
            condition_step("check", 1, "yes", "no"),
            action("yes", 2),
            action("no", 3),
            action("after", 4),
        ]);
        let graph = StepGraph::build(&def).unwrap();
        assert_eq!(
            kinds(&graph.incoming("yes")),
            vec![("check", EdgeKind::Branch { when: true })]
        );
        assert_eq!(
            kinds(&graph.incoming("after")),
            vec![
                ("check", EdgeKind::Order),
                ("no", EdgeKind::Order),
                ("yes", EdgeKind::Order)
            ]
        );
    }

    #[test]
    fn test_parallel_branches_are_released_not_chained() {
        let def = workflow(vec![
            parallel_step("fan", 1, &["x", "y"], false),
            action("x", 2),
            action("y", 3),
            action("join", 4),
        ]);
        let graph = StepGraph::build(&def).unwrap();
        assert_eq!(kinds(&graph.incoming("x")), vec![("fan", EdgeKind::Release)]);
        assert_eq!(kinds(&graph.incoming("y")), vec![("fan", EdgeKind::Release)]);
        assert_eq!(kinds(&graph.incoming("join")), vec![("fan", EdgeKind::Order)]);
    }

    #[test]
    fn test_disabled_steps_are_excluded() {
        let mut b = action("b", 2);
        b.enabled = false;
        let mut c = action("c", 3);
        c.dependencies = vec!["b".to_string()];
        let def = workflow(vec![action("a", 1), b, c]);
        let graph = StepGraph::build(&def).unwrap();
        assert!(!graph.contains("b"));
        assert!(graph.incoming("c").is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let mut a = action("a", 1);
        a.dependencies = vec!["b".to_string()];
        let mut b = action("b", 2);
        b.dependencies = vec!["a".to_string()];
        let err = StepGraph::build(&workflow(vec![a, b])).unwrap_err();
        assert!(err.to_string().contains("cycle detected"), "got: {err}");
    }

    #[test]
    fn test_region_deadlock_is_a_cycle() {
        // "yes" waits on "after", which itself waits for check's region.
        let mut yes = action("yes", 2);
        yes.dependencies = vec!["after".to_string()];
        let def = workflow(vec![
            condition_step("check", 1, "yes", "no"),
            yes,
            action("no", 3),
            action("after", 4),
        ]);
        assert!(matches!(
            StepGraph::build(&def),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut a = action("a", 1);
        a.dependencies = vec!["ghost".to_string()];
        let err = validate_dag(&workflow(vec![a])).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
    }

    #[test]
    fn test_loop_bodies_are_not_scheduled() {
        let looped: stepwise_types::workflow::StepDefinition = serde_json::from_value(serde_json::json!({
            "id": "each",
            "order": 1,
            "config": { "type": "loop", "items": "rows", "body": ["work"] }
        }))
        .unwrap();
        let def = workflow(vec![looped, action("work", 2), action("done", 3)]);
        let graph = StepGraph::build(&def).unwrap();
        assert!(graph.is_loop_body("work"));
        assert!(!graph.contains("work"));
        assert_eq!(kinds(&graph.incoming("done")), vec![("each", EdgeKind::Order)]);
    }
}
