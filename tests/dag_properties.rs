// tests/dag_properties.rs

mod common;
use crate::common::{RecordingExecutor, manager_with};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use dagrunner::{DagDefinition, RunStatus, TaskDefinition, TaskStatus, ValidationError, validate};

// Task N may only depend on tasks 0..N-1, which keeps the graph acyclic.
fn acyclic_edges(max_tasks: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), num_tasks)
            .prop_map(|raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, potential)| {
                        let mut deps: Vec<usize> = potential
                            .into_iter()
                            .filter(|_| i > 0)
                            .map(|d| d % i.max(1))
                            .collect::<HashSet<_>>()
                            .into_iter()
                            .collect();
                        deps.sort_unstable();
                        deps
                    })
                    .collect()
            })
    })
}

fn name(i: usize) -> String {
    format!("task_{}", i)
}

fn build_dag(edges: &[Vec<usize>]) -> DagDefinition {
    edges.iter().enumerate().fold(DagDefinition::new("prop", "Prop"), |dag, (i, deps)| {
        dag.with_task(TaskDefinition::command(name(i), "true").depends_on(deps.iter().map(|&d| name(d))))
    })
}

proptest! {
    #[test]
    fn acyclic_dags_always_validate(edges in acyclic_edges(12)) {
        let dag = build_dag(&edges);
        prop_assert!(validate(&dag).is_ok());

        let order = dag.topological_order();
        prop_assert_eq!(order.len(), dag.tasks.len());
        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        for task in &dag.tasks {
            for dep in &task.dependencies {
                prop_assert!(position[dep.as_str()] < position[task.id.as_str()]);
            }
        }
    }

    #[test]
    fn back_edge_is_reported_as_cycle(
        edges in acyclic_edges(12).prop_filter("need two tasks", |e| e.len() >= 2),
        picks in (any::<usize>(), any::<usize>()),
    ) {
        let n = edges.len();
        let lo = picks.0 % (n - 1);
        let hi = lo + 1 + picks.1 % (n - 1 - lo);

        let mut edges = edges;
        if !edges[hi].contains(&lo) {
            edges[hi].push(lo);
        }
        let mut dag = build_dag(&edges);
        dag.tasks[lo].dependencies.push(name(hi));

        match validate(&dag) {
            Err(ValidationError::Cycle { tasks }) => {
                prop_assert!(tasks.len() >= 3);
                prop_assert_eq!(tasks.first(), tasks.last());
                prop_assert!(tasks.contains(&name(lo)));
                prop_assert!(tasks.contains(&name(hi)));
            }
            other => prop_assert!(false, "expected cycle, got {:?}", other),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn runs_settle_with_failures_propagated(
        edges in acyclic_edges(8),
        failing in proptest::collection::hash_set(0..8usize, 0..3),
    ) {
        let dag = build_dag(&edges);
        let mut executor = RecordingExecutor::new(Duration::ZERO);
        for &i in failing.iter().filter(|&&i| i < edges.len()) {
            executor = executor.failing(&name(i), u32::MAX);
        }
        let executor = Arc::new(executor);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let run = runtime.block_on(async {
            let manager = manager_with(executor.clone(), 3);
            manager.register_dag(dag.clone()).await.unwrap();
            let run = manager.trigger("prop").await.unwrap();
            manager.wait(&run.id).await.unwrap()
        });

        prop_assert!(run.all_tasks_terminal());

        // Expected outcome, computed in index order (dependencies come first).
        let mut expected: Vec<TaskStatus> = Vec::with_capacity(edges.len());
        for (i, deps) in edges.iter().enumerate() {
            let status = if deps.iter().any(|&d| expected[d] != TaskStatus::Success) {
                TaskStatus::Skipped
            } else if failing.contains(&i) {
                TaskStatus::Failed
            } else {
                TaskStatus::Success
            };
            expected.push(status);
        }

        for (i, status) in expected.iter().enumerate() {
            prop_assert_eq!(run.task_status(&name(i)), Some(*status));
            let calls = executor.calls(&name(i));
            prop_assert_eq!(calls, if *status == TaskStatus::Skipped { 0 } else { 1 });
        }

        let want = if expected.contains(&TaskStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        prop_assert_eq!(run.status, want);
    }
}
