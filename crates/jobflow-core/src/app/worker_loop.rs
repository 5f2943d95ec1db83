use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::runner::RunOutcome;
use crate::app::runtime::Runtime;
use crate::ports::WorkSource;

/// Worker group handle.
/// - `request_shutdown` stops every worker from taking new leases
/// - `shutdown_and_join` also waits for in-flight units to be reported
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(n: usize, source: Arc<dyn WorkSource>, runtime: Arc<Runtime>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let source = Arc::clone(&source);
            let rt = Arc::clone(&runtime);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, source, rt, &mut rx).await;
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Does not cancel a unit that is already executing.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    source: Arc<dyn WorkSource>,
    runtime: Arc<Runtime>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // lease may block, so race it against shutdown
        let lease = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            lease = source.lease() => lease,
        };

        let Some(lease) = lease else {
            // source closed
            break;
        };

        let job_id = lease.job_id();
        let unit = lease.unit().clone();
        debug!(worker_id, job_id = %job_id, workflow = %unit.workflow, "leased unit of work");

        let execution = runtime.execute(job_id, &unit).await;

        let reported = match execution.result {
            Ok(RunOutcome::Completed) => lease.ack(execution.context).await,
            Ok(RunOutcome::Suspended { delay }) => {
                info!(worker_id, job_id = %job_id, delay_ms = delay.as_millis() as u64, "unit suspended");
                lease.suspended().await
            }
            Err(err) => {
                warn!(worker_id, job_id = %job_id, error = %err, "unit failed");
                lease.fail(execution.context, err.to_string()).await
            }
        };
        if let Err(e) = reported {
            error!(worker_id, job_id = %job_id, error = %e, "failed to report unit result");
        }
    }
    debug!(worker_id, "worker stopped");
}
