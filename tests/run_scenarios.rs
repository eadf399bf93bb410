// tests/run_scenarios.rs

mod common;
use crate::common::{EventKind, RecordingExecutor, diamond, init_tracing, manager_with};

use std::sync::Arc;
use std::time::Duration;

use dagrunner::{DagDefinition, Run, RunStatus, TaskDefinition, TaskStatus};

/// Every dependency finished before its dependent's first attempt started.
fn assert_dependency_order(run: &Run) {
    for task in &run.dag.tasks {
        let Some(started) = run.task(&task.id).and_then(|s| s.started_at) else {
            continue;
        };
        for dep in &task.dependencies {
            let dep_state = run.task(dep).unwrap();
            assert_eq!(dep_state.status, TaskStatus::Success, "{} ran before {}", task.id, dep);
            assert!(
                dep_state.finished_at.unwrap() <= started,
                "{} started before {} finished",
                task.id,
                dep
            );
        }
    }
}

#[tokio::test]
async fn diamond_runs_in_dependency_order() {
    init_tracing();
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(30)));
    let manager = manager_with(executor.clone(), 4);
    manager.register_dag(diamond()).await.unwrap();

    let run = manager.trigger("diamond").await.unwrap();
    let run = manager.wait(&run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert!(run.started_at.is_some() && run.finished_at.is_some());
    for id in ["A", "B", "C", "D"] {
        assert_eq!(run.task_status(id), Some(TaskStatus::Success));
        assert_eq!(executor.calls(id), 1);
    }
    assert_dependency_order(&run);

    let a_done = executor.last("A", EventKind::Finished).unwrap();
    assert!(a_done <= executor.first("B", EventKind::Started).unwrap());
    assert!(a_done <= executor.first("C", EventKind::Started).unwrap());
    let d_start = executor.first("D", EventKind::Started).unwrap();
    assert!(executor.last("B", EventKind::Finished).unwrap() <= d_start);
    assert!(executor.last("C", EventKind::Finished).unwrap() <= d_start);

    // B and C have no edge between them and overlap.
    let b = executor.first("B", EventKind::Started).unwrap();
    let c_done = executor.last("C", EventKind::Finished).unwrap();
    assert!(b < c_done);
}

#[tokio::test]
async fn failed_branch_skips_dependents_only() {
    init_tracing();
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(10)).failing("B", u32::MAX));
    let manager = manager_with(executor.clone(), 4);
    manager.register_dag(diamond()).await.unwrap();

    let run = manager.trigger("diamond").await.unwrap();
    let run = manager.wait(&run.id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.task_status("A"), Some(TaskStatus::Success));
    assert_eq!(run.task_status("B"), Some(TaskStatus::Failed));
    assert_eq!(run.task_status("C"), Some(TaskStatus::Success));
    assert_eq!(run.task_status("D"), Some(TaskStatus::Skipped));

    assert_eq!(executor.calls("B"), 1);
    assert_eq!(executor.calls("D"), 0);
    let d = run.task("D").unwrap();
    assert_eq!(d.attempt, 0);
    assert!(d.started_at.is_none());
    assert_eq!(d.last_error.as_deref(), Some("dependency 'B' ended FAILED"));
    assert_eq!(
        run.task("B").unwrap().last_error.as_deref(),
        Some("command exited with status 1")
    );
}

#[tokio::test]
async fn retries_are_bounded_and_counted() {
    init_tracing();
    let executor = Arc::new(
        RecordingExecutor::new(Duration::from_millis(1))
            .failing("always", u32::MAX)
            .failing("eventually", 2),
    );
    let manager = manager_with(executor.clone(), 2);
    let dag = DagDefinition::new("retries", "Retries")
        .with_task(
            TaskDefinition::command("always", "false")
                .with_retries(3)
                .with_retry_delay(Duration::from_millis(10)),
        )
        .with_task(
            TaskDefinition::command("eventually", "flaky")
                .with_retries(3)
                .with_retry_delay(Duration::from_millis(10)),
        );
    manager.register_dag(dag).await.unwrap();

    let run = manager.trigger("retries").await.unwrap();
    let run = manager.wait(&run.id).await.unwrap();

    let always = run.task("always").unwrap();
    assert_eq!(always.status, TaskStatus::Failed);
    assert_eq!(always.attempt, 4);
    assert_eq!(executor.calls("always"), 4);
    assert_eq!(always.history.len(), 4);

    let eventually = run.task("eventually").unwrap();
    assert_eq!(eventually.status, TaskStatus::Success);
    assert_eq!(eventually.attempt, 3);
    assert_eq!(executor.calls("eventually"), 3);
    assert!(eventually.history[2].error.is_none());

    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn pool_bounds_parallelism() {
    init_tracing();
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(40)));
    let manager = manager_with(executor.clone(), 2);
    let mut dag = DagDefinition::new("fan", "Fan out");
    for i in 0..6 {
        dag = dag.with_task(TaskDefinition::command(format!("t{}", i), "true"));
    }
    manager.register_dag(dag).await.unwrap();

    let run = manager.trigger("fan").await.unwrap();
    let run = manager.wait(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let mut running = 0usize;
    let mut peak = 0usize;
    let mut events = executor.events();
    events.sort_by_key(|e| (e.at, e.kind == EventKind::Started));
    for event in events {
        match event.kind {
            EventKind::Started => running += 1,
            EventKind::Finished => running -= 1,
        }
        peak = peak.max(running);
    }
    assert!(peak <= 2, "peak concurrency was {}", peak);
}

#[tokio::test]
async fn runs_are_independent() {
    init_tracing();
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(20)));
    let manager = manager_with(executor.clone(), 4);
    manager.register_dag(diamond()).await.unwrap();

    let first = manager.trigger("diamond").await.unwrap();
    let second = manager.trigger("diamond").await.unwrap();
    assert_ne!(first.id, second.id);

    let first = manager.wait(&first.id).await.unwrap();
    let second = manager.wait(&second.id).await.unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(executor.calls("A"), 2);

    let listed = manager.list_runs(None).await.unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn reregistering_does_not_affect_existing_runs() {
    init_tracing();
    let executor = Arc::new(RecordingExecutor::new(Duration::from_millis(50)));
    let manager = manager_with(executor.clone(), 4);
    manager.register_dag(diamond()).await.unwrap();

    let run = manager.trigger("diamond").await.unwrap();
    manager
        .register_dag(diamond().with_task(TaskDefinition::command("E", "echo E")))
        .await
        .unwrap();

    let run = manager.wait(&run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.tasks.len(), 4);
    assert_eq!(executor.calls("E"), 0);
    assert_eq!(manager.get_dag("diamond").await.unwrap().tasks.len(), 5);
}
