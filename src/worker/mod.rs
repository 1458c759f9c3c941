use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::EngineContext;
use crate::engine::ExecutorError;

/// One poller loop: sweep expired leases on an interval, claim the next
/// eligible run, execute it synchronously, sleep when there is nothing to do.
/// Any number of pollers may run concurrently, in this process or others;
/// claiming is atomic at the store so they never collide.
pub(crate) async fn run_poller(ctx: EngineContext, shutdown: CancellationToken, poller: usize) {
    let mut last_sweep = Instant::now()
        .checked_sub(ctx.config.sweep_interval)
        .unwrap_or_else(Instant::now);

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if last_sweep.elapsed() >= ctx.config.sweep_interval {
            match ctx.runs.requeue_expired_leases().await {
                Ok(0) => {}
                Ok(requeued) => {
                    // A worker died mid-run; its runs resume from their last
                    // checkpoint on whichever poller claims them next.
                    warn!(poller, requeued, "requeued runs with expired leases");
                }
                Err(err) => {
                    warn!(poller, ?err, "lease sweep failed");
                }
            }
            last_sweep = Instant::now();
        }

        match ctx
            .runs
            .claim_next_eligible(&ctx.config.worker_id, ctx.config.lease_seconds)
            .await
        {
            Ok(Some(run)) => {
                if let Err(err) = crate::engine::execute_run(&ctx, &shutdown, run).await {
                    report_executor_error(poller, &err);
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(ctx.config.poll_interval) => {}
                }
            }
            Err(err) => {
                warn!(poller, ?err, "error claiming run");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(ctx.config.poll_interval) => {}
                }
            }
        }
    }

    info!(poller, "poller stopped");
}

fn report_executor_error(poller: usize, err: &ExecutorError) {
    // The run keeps its lease; once it expires the sweep requeues it, so a
    // persistence outage delays the run rather than losing it.
    error!(
        poller,
        run_id = %err.run_id(),
        operation = err.operation(),
        attempts = err.attempts(),
        "executor gave up on persistence; leaving run for lease recovery"
    );
}
