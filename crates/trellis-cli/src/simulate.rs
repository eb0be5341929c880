//! Randomised mutation simulator
//!
//! Drives a workspace through a seeded sequence of graph edits, undo/redo,
//! remote events and build-session curation, checking the structural
//! invariants after every step.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use trellis_graph::{GraphConfig, ManualClock, NodeId, Point, RemoteEvent, RemoteNodePayload, Workspace};

#[derive(Debug, Clone)]
pub(crate) struct SimulatorConfig {
    pub(crate) seed: u64,
    pub(crate) operations: u64,
    pub(crate) stop_on_violation: bool,
    pub(crate) graph: GraphConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            operations: 1_000,
            stop_on_violation: false,
            graph: GraphConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Op {
    AddNode,
    AddChild,
    Connect,
    DeleteNode,
    DeleteEdge,
    EditPrompt,
    Undo,
    Redo,
    Remote,
    Build,
}

impl Op {
    const ALL: [Op; 10] = [
        Op::AddNode,
        Op::AddChild,
        Op::Connect,
        Op::DeleteNode,
        Op::DeleteEdge,
        Op::EditPrompt,
        Op::Undo,
        Op::Redo,
        Op::Remote,
        Op::Build,
    ];

    fn name(self) -> &'static str {
        match self {
            Op::AddNode => "add-node",
            Op::AddChild => "add-child",
            Op::Connect => "connect",
            Op::DeleteNode => "delete-node",
            Op::DeleteEdge => "delete-edge",
            Op::EditPrompt => "edit-prompt",
            Op::Undo => "undo",
            Op::Redo => "redo",
            Op::Remote => "remote",
            Op::Build => "build",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SimulationReport {
    pub(crate) seed: u64,
    pub(crate) executed: u64,
    pub(crate) counts: BTreeMap<&'static str, u64>,
    pub(crate) rejected: u64,
    pub(crate) violations: Vec<String>,
    pub(crate) final_nodes: usize,
    pub(crate) final_edges: usize,
}

impl SimulationReport {
    pub(crate) fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub(crate) fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== Trellis Simulation Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.seed);
        let _ = writeln!(report, "Operations: {}", self.executed);
        for (op, count) in &self.counts {
            let _ = writeln!(report, "  {op}: {count}");
        }
        let _ = writeln!(report, "Rejected: {}", self.rejected);
        let _ = writeln!(report, "Final graph: {} nodes, {} edges", self.final_nodes, self.final_edges);
        let _ = writeln!(report, "Violations: {}", self.violations.len());
        for violation in &self.violations {
            let _ = writeln!(report, "  - {violation}");
        }
        let _ = writeln!(report, "\nResult: {}", if self.passed() { "PASS" } else { "FAIL" });
        report
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        json!({
            "seed": self.seed,
            "operations": self.executed,
            "counts": self.counts,
            "rejected": self.rejected,
            "violations": self.violations,
            "finalNodes": self.final_nodes,
            "finalEdges": self.final_edges,
            "passed": self.passed(),
        })
    }
}

fn pick<'a>(rng: &mut StdRng, ids: &'a [NodeId]) -> Option<&'a NodeId> {
    if ids.is_empty() {
        None
    } else {
        Some(&ids[rng.random_range(0..ids.len())])
    }
}

/// Run the simulation to completion (or to the first violation)
pub(crate) fn run_simulation(config: &SimulatorConfig) -> SimulationReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let clock = Arc::new(ManualClock::new());
    let mut ws = Workspace::new(config.graph.clone()).with_clock(clock.clone());
    let mut counts = BTreeMap::new();
    let mut rejected = 0_u64;
    let mut violations = Vec::new();
    let mut executed = 0_u64;

    for step in 0..config.operations {
        clock.advance(Duration::from_millis(rng.random_range(0..1_500)));
        let ids: Vec<NodeId> = ws.store().nodes().map(|n| n.id.clone()).collect();
        let op = if ids.is_empty() {
            Op::AddNode
        } else {
            Op::ALL[rng.random_range(0..Op::ALL.len())]
        };
        *counts.entry(op.name()).or_insert(0) += 1;
        executed += 1;

        if !apply(&mut ws, &mut rng, op, &ids, step, &mut violations) {
            rejected += 1;
        }

        if let Err(err) = ws.store().check_invariants() {
            violations.push(format!("step {step} ({}): {err}", op.name()));
        }
        if let Some(session) = ws.build_session() {
            if session.included().intersection(session.excluded()).next().is_some() {
                violations.push(format!("step {step} ({}): build include/exclude overlap", op.name()));
            }
        }
        if !violations.is_empty() && config.stop_on_violation {
            tracing::warn!(step, "stopping at first violation");
            break;
        }
    }

    SimulationReport {
        seed: config.seed,
        executed,
        counts,
        rejected,
        violations,
        final_nodes: ws.store().node_count(),
        final_edges: ws.store().edge_count(),
    }
}

/// Apply one operation; `false` when the workspace declined it
fn apply(
    ws: &mut Workspace,
    rng: &mut StdRng,
    op: Op,
    ids: &[NodeId],
    step: u64,
    violations: &mut Vec<String>,
) -> bool {
    match op {
        Op::AddNode => {
            let position = Point::new(rng.random_range(-500.0..500.0), rng.random_range(-500.0..500.0));
            ws.add_node_with_prompt(position, format!("prompt {step}"));
            true
        }
        Op::AddChild => pick(rng, ids)
            .cloned()
            .and_then(|parent| ws.create_child_node(&parent, format!("child {step}"), None))
            .is_some(),
        Op::Connect => {
            let (Some(source), Some(target)) = (pick(rng, ids).cloned(), pick(rng, ids).cloned()) else {
                return false;
            };
            match ws.connect(&source, &target) {
                Ok(Some(_)) => {
                    if source == target || ws.store().is_reachable(&target, &source) {
                        violations.push(format!("step {step}: connect closed a cycle {source} -> {target}"));
                    }
                    true
                }
                Ok(None) | Err(_) => false,
            }
        }
        Op::DeleteNode => pick(rng, ids).cloned().is_some_and(|id| ws.delete_node(&id)),
        Op::DeleteEdge => {
            let edges: Vec<_> = ws.store().edges().map(|e| e.id.clone()).collect();
            if edges.is_empty() {
                return false;
            }
            let edge = edges[rng.random_range(0..edges.len())].clone();
            ws.delete_edge(&edge)
        }
        Op::EditPrompt => pick(rng, ids)
            .cloned()
            .is_some_and(|id| ws.update_node_prompt(&id, format!("edited {step}"))),
        Op::Undo => {
            if rng.random_bool(0.5) {
                let before = ws.store().snapshot();
                if !ws.undo() {
                    return false;
                }
                if ws.redo() && ws.store().snapshot() != before {
                    violations.push(format!("step {step}: undo/redo did not round-trip"));
                }
                true
            } else {
                ws.undo()
            }
        }
        Op::Redo => ws.redo(),
        Op::Remote => remote_event(ws, rng, ids, step),
        Op::Build => build_step(ws, rng, ids),
    }
}

fn remote_event(ws: &mut Workspace, rng: &mut StdRng, ids: &[NodeId], step: u64) -> bool {
    let event = match rng.random_range(0..3) {
        0 => {
            let mut payload = RemoteNodePayload::new(NodeId::from(format!("remote-{step}").as_str()))
                .with_prompt(format!("remote {step}"))
                .with_status(if rng.random_bool(0.5) { "completed" } else { "generating" })
                .with_position(json!([rng.random_range(0..400), rng.random_range(0..400)]));
            if let Some(parent) = pick(rng, ids) {
                payload = payload.with_parents(vec![parent.clone()]);
            }
            RemoteEvent::Created { node: payload }
        }
        1 => {
            let Some(id) = pick(rng, ids) else {
                return false;
            };
            RemoteEvent::Updated {
                node: RemoteNodePayload::new(id.clone()).with_status("stale"),
            }
        }
        _ => {
            let Some(id) = pick(rng, ids) else {
                return false;
            };
            RemoteEvent::Deleted { id: id.clone() }
        }
    };
    ws.apply_remote(event).is_ok()
}

fn build_step(ws: &mut Workspace, rng: &mut StdRng, ids: &[NodeId]) -> bool {
    let Some(target) = pick(rng, ids).cloned() else {
        return false;
    };
    if ws.build_session().is_none() {
        return ws.start_build_session(&target).is_ok();
    }
    let result = match rng.random_range(0..6) {
        0 => ws.toggle_build_include(&target),
        1 => ws.toggle_build_exclude(&target),
        2 => ws.toggle_build_pin(&target).map(|_| ()),
        3 => ws.exclude_build_branch(&target),
        4 => ws.reset_build_to_suggested(),
        _ => {
            ws.end_build_session();
            Ok(())
        }
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn simulation_is_deterministic_per_seed() {
        let config = SimulatorConfig {
            seed: 7,
            operations: 300,
            ..SimulatorConfig::default()
        };
        let first = run_simulation(&config);
        let second = run_simulation(&config);
        assert_eq!(first.counts, second.counts);
        assert_eq!(first.final_nodes, second.final_nodes);
        assert_eq!(first.final_edges, second.final_edges);
    }

    #[test]
    fn simulation_finds_no_violations() {
        for seed in [1, 2, 3] {
            let report = run_simulation(&SimulatorConfig {
                seed,
                operations: 400,
                ..SimulatorConfig::default()
            });
            assert!(report.passed(), "{}", report.generate_text());
            assert_eq!(report.executed, 400);
        }
    }

    #[test]
    fn report_renders_result_line() {
        let report = run_simulation(&SimulatorConfig {
            operations: 10,
            ..SimulatorConfig::default()
        });
        assert!(report.generate_text().contains("Result: PASS"));
        assert_eq!(report.to_json()["passed"], serde_json::Value::Bool(true));
    }
}
