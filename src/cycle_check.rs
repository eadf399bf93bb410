use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::dag::DagDefinition;
use crate::task::{TaskId, UnitOfWork};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("DAG has no tasks")]
    EmptyDag,
    #[error("task '{0}' is defined more than once")]
    DuplicateTask(TaskId),
    #[error("task '{task}' is invalid: {reason}")]
    InvalidTask { task: TaskId, reason: String },
    #[error("task '{0}' cannot depend on itself")]
    SelfDependency(TaskId),
    #[error("task '{task}' references undefined dependency '{dependency}'")]
    DanglingDependency { task: TaskId, dependency: TaskId },
    #[error("circular dependency detected: {}", .tasks.join(" -> "))]
    Cycle { tasks: Vec<TaskId> },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    InProgress,
    Done,
}

/// Structural checks run once when a DAG is registered.
///
/// An empty DAG is structurally fine; it is refused when a run is triggered.
pub fn validate(dag: &DagDefinition) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for task in &dag.tasks {
        if task.id.trim().is_empty() {
            return Err(ValidationError::InvalidTask {
                task: task.id.clone(),
                reason: "task id must not be empty".to_string(),
            });
        }
        if !seen.insert(task.id.as_str()) {
            return Err(ValidationError::DuplicateTask(task.id.clone()));
        }
        if task.work.target().trim().is_empty() {
            let reason = match task.work {
                UnitOfWork::Command(_) => "command must not be empty",
                UnitOfWork::Callable(_) => "callable name must not be empty",
            };
            return Err(ValidationError::InvalidTask {
                task: task.id.clone(),
                reason: reason.to_string(),
            });
        }
    }

    for task in &dag.tasks {
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(ValidationError::SelfDependency(task.id.clone()));
            }
            if !seen.contains(dep.as_str()) {
                return Err(ValidationError::DanglingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    match find_cycle(dag) {
        Some(tasks) => Err(ValidationError::Cycle { tasks }),
        None => Ok(()),
    }
}

/// Iterative depth-first search over dependency edges. Returns the ids on the
/// first cycle found, starting and ending with the same task.
fn find_cycle(dag: &DagDefinition) -> Option<Vec<TaskId>> {
    let adjacency: HashMap<&str, Vec<&str>> = dag
        .tasks
        .iter()
        .map(|t| {
            (
                t.id.as_str(),
                t.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut colors: HashMap<&str, Color> = HashMap::new();

    for root in dag.task_ids() {
        if colors.contains_key(root) {
            continue;
        }

        // (node, index of the next edge to follow)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        colors.insert(root, Color::InProgress);

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            let edges = adjacency.get(node).map(Vec::as_slice).unwrap_or_default();

            if next == edges.len() {
                colors.insert(node, Color::Done);
                stack.pop();
                continue;
            }
            frame.1 += 1;

            let dep = edges[next];
            match colors.get(dep) {
                Some(Color::InProgress) => {
                    let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<TaskId> =
                        stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Color::Done) => {}
                None => {
                    colors.insert(dep, Color::InProgress);
                    stack.push((dep, 0));
                }
            }
        }
    }

    None
}
