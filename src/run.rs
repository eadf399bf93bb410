use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::DagDefinition;
use crate::task::{TaskId, TaskState, TaskStatus};

pub type RunId = String;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        };
        f.pad(s)
    }
}

/// One execution of a DAG. Carries the snapshot of the definition it was
/// started from, so re-registering the DAG never affects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub dag_id: String,
    pub dag: DagDefinition,
    pub tasks: HashMap<TaskId, TaskState>,
    pub status: RunStatus,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(dag: DagDefinition) -> Self {
        let tasks = dag
            .task_ids()
            .map(|id| (id.to_string(), TaskState::default()))
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            dag_id: dag.id.clone(),
            dag,
            tasks,
            status: RunStatus::Pending,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskState> {
        self.tasks.get(id)
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// The terminal status this run settles on, or `None` while any task is
    /// still live. A cancellation request wins over task failures.
    pub fn settled_status(&self) -> Option<RunStatus> {
        if !self.all_tasks_terminal() {
            return None;
        }
        let any = |status: TaskStatus| self.tasks.values().any(|t| t.status == status);

        Some(if self.cancel_requested {
            RunStatus::Cancelled
        } else if any(TaskStatus::Failed) {
            RunStatus::Failed
        } else if any(TaskStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        })
    }

    /// Applies a run-level status change and stamps the matching timestamp.
    /// Terminal runs are left untouched.
    pub fn transition(&mut self, status: RunStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        match status {
            RunStatus::Running => {
                self.started_at.get_or_insert(now);
            }
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        true
    }
}
