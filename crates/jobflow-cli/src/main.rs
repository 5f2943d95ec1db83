use std::sync::Arc;

use serde_json::json;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobflow_core::app::{AppBuilder, EngineConfig, WorkflowStatus};
use jobflow_core::domain::{
    ArgumentDef, AroundHook, BoxError, ErrorHook, Hook, OutputField, Task, TaskRetry,
    TaskThrottle, Workflow, WorkflowError,
};
use jobflow_core::impls::InMemoryQueue;

/// fetch -> price (one queued unit per order, two at a time) -> total
fn order_report() -> Result<Workflow, WorkflowError> {
    Workflow::builder("OrderReport")
        .argument(ArgumentDef::new("orders", "Array").with_default(json!([3, 5, 8, 13])))
        .argument(ArgumentDef::new("unit_price", "Integer").with_default(json!(120)))
        .task(
            Task::builder("fetch")
                .output(OutputField::new("quantities", "Array"))
                .body(|ctx| {
                    let orders: Vec<i64> = ctx.argument_as("orders")?;
                    Ok(json!({ "quantities": orders }))
                })
                .build(),
        )
        .task(
            Task::builder("price")
                .depends_on(["fetch"])
                .each(|ctx| {
                    let quantities: Vec<serde_json::Value> =
                        ctx.output().first("fetch")?.get_as("quantities")?;
                    Ok(quantities)
                })
                .concurrency_limit(2)
                .retry(TaskRetry::new(2).with_base_delay(Duration::from_millis(100)))
                .throttle(TaskThrottle::new(2).with_key("pricing-api"))
                .output(OutputField::new("amount", "Integer"))
                .body(|ctx| {
                    let quantity: i64 = ctx.each_value_as()?;
                    let unit_price: i64 = ctx.argument_as("unit_price")?;
                    Ok(json!({ "amount": quantity * unit_price }))
                })
                .build(),
        )
        .task(
            Task::builder("total")
                .depends_on(["price"])
                .output(OutputField::new("sum", "Integer"))
                .body(|ctx| {
                    let mut sum = 0;
                    for priced in ctx.output().get("price") {
                        sum += priced.get_as::<i64>("amount")?;
                    }
                    let sent = ctx.skip_in_dry_run("notify", || info!(sum, "report sent"));
                    info!(sent = sent.is_some(), "total computed");
                    Ok(json!({ "sum": sum }))
                })
                .build(),
        )
        .before(Hook::global(|ctx| {
            info!(task = ctx.current_task_name().unwrap_or_default(), "task starting");
            Ok(())
        }))
        .around(AroundHook::for_tasks(["total"], |_ctx, mut next| {
            Box::pin(async move {
                let started = tokio::time::Instant::now();
                next.call().await?;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "total finished");
                Ok(())
            })
        }))
        .on_error(ErrorHook::global(|ctx, err| {
            tracing::error!(task = ctx.current_task_name().unwrap_or_default(), error = %err, "task failed");
            Ok(())
        }))
        .build()
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;
    let app = AppBuilder::new()
        .config(config)
        .register(order_report()?)?
        .expect_workflows(&["OrderReport"])
        .build()?;

    let queue = Arc::new(InMemoryQueue::new());
    let runtime = app.runtime(queue.clone());
    let workers = app.spawn_workers(queue.clone(), Arc::clone(&runtime));

    let unit = runtime.prepare("OrderReport", serde_json::Map::new())?;
    let id = queue.enqueue(unit).await?;
    info!(job_id = %id, "enqueued workflow");

    let status = loop {
        let status = WorkflowStatus::find(id, queue.as_ref(), app.registry()).await?;
        if status.is_finished() {
            break status;
        }
        info!(
            job_id = %id,
            status = ?status.status(),
            current_task = status.current_task_name().unwrap_or("-"),
            "waiting"
        );
        sleep(Duration::from_millis(500)).await;
    };

    let sum: Option<i64> = status
        .output()
        .first("total")
        .ok()
        .and_then(|out| out.get_as("sum").ok());
    info!(
        job_id = %id,
        status = ?status.status(),
        sum = ?sum,
        last_error = ?status.last_error(),
        "workflow finished"
    );
    info!(counts = ?queue.counts().await, "queue");

    workers.shutdown_and_join().await;
    Ok(())
}
