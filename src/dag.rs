use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::task::{TaskDefinition, TaskId};

/// A named graph of tasks. Task order is insertion order and is the order in
/// which ready tasks are dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
}

impl DagDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Maps every task id to the ids of the tasks that depend on it.
    pub fn dependents(&self) -> HashMap<&str, Vec<&str>> {
        let mut dependents: HashMap<&str, Vec<&str>> =
            self.task_ids().map(|id| (id, Vec::new())).collect();
        for task in &self.tasks {
            for dep in &task.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }
        dependents
    }

    /// Dependencies-first ordering. Ties are broken by insertion order, so
    /// the result is stable for a given definition.
    ///
    /// Tasks on a cycle are left out; call [`validate`](crate::validate)
    /// first if that matters.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let dependents = self.dependents();
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.dependencies.len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for &child in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> DagDefinition {
        DagDefinition::new("diamond", "Diamond")
            .with_task(TaskDefinition::command("d", "true").depends_on(["b", "c"]))
            .with_task(TaskDefinition::command("b", "true").depends_on(["a"]))
            .with_task(TaskDefinition::command("c", "true").depends_on(["a"]))
            .with_task(TaskDefinition::command("a", "true"))
    }

    #[test]
    fn test_topological_order_is_dependencies_first() {
        let order = diamond().topological_order();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_topological_order_linear() {
        let dag = DagDefinition::new("linear", "Linear")
            .with_task(TaskDefinition::command("task_a", "echo A"))
            .with_task(TaskDefinition::command("task_b", "echo B").depends_on(["task_a"]))
            .with_task(TaskDefinition::command("task_c", "echo C").depends_on(["task_b"]));
        assert_eq!(dag.topological_order(), vec!["task_a", "task_b", "task_c"]);
    }

    #[test]
    fn test_dependents_map() {
        let dag = diamond();
        let dependents = dag.dependents();
        assert_eq!(dependents["a"], vec!["b", "c"]);
        assert!(dependents["d"].is_empty());
    }

    #[test]
    fn test_dag_json_keeps_task_order() {
        let dag = diamond();
        let json = serde_json::to_string(&dag).unwrap();
        let back: DagDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_ids().collect::<Vec<_>>(), vec!["d", "b", "c", "a"]);
        assert_eq!(back, dag);
    }
}
