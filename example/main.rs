use std::sync::Arc;
use std::time::Duration;

use dagrunner::{
    CallableRegistry, DagDefinition, EngineConfig, Metadata, ProcessExecutor, RunManager,
    TaskDefinition, logging,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::default().with_env_overrides(|key| std::env::var(key).ok())?;
    logging::init_logging(config.log_level.as_deref())?;

    let callables = Arc::new(CallableRegistry::new());
    callables.register_blocking("report", |metadata: Metadata| {
        let region = metadata
            .get("region")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        Ok(json!({ "region": region, "rows": 128 }))
    });

    let manager = RunManager::from_config(&config, Arc::new(ProcessExecutor::new(callables))).await?;

    let dag = DagDefinition::new("nightly", "Nightly build")
        .with_task(TaskDefinition::command("fetch", "echo fetching; sleep 0.2").named("Fetch sources"))
        .with_task(
            TaskDefinition::command("build", "echo building; sleep 0.3")
                .depends_on(["fetch"])
                .with_timeout(Duration::from_secs(10)),
        )
        .with_task(
            TaskDefinition::callable("summarise", "report")
                .depends_on(["fetch"])
                .with_metadata("region", json!("eu-west")),
        )
        .with_task(
            TaskDefinition::command("publish", "echo publishing")
                .depends_on(["build", "summarise"])
                .with_retries(2)
                .with_retry_delay(Duration::from_millis(500)),
        );

    println!("=== Task order ===");
    println!("{}", dag.topological_order().join(" -> "));

    manager.register_dag(dag).await?;

    println!("=== Running ===");
    let run = manager.trigger("nightly").await?;
    let run = manager.wait(&run.id).await?;

    println!("=== Finished: {} ===", run.status);
    for task in &run.dag.tasks {
        if let Some(state) = run.task(&task.id) {
            let stdout = state
                .output
                .as_ref()
                .map(|o| o.stdout.trim().to_string())
                .unwrap_or_default();
            println!(
                "{:<10} {:<10} attempts={} {}",
                task.id, state.status, state.attempt, stdout
            );
        }
    }

    manager.shutdown().await;
    Ok(())
}
