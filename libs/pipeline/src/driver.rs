use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ingest_api::{BatchSink, Broker, QueueSubscription};

use crate::config::PipelineConfig;
use crate::consumer::{Pipeline, StopReason};
use crate::error::PipelineError;

/// Outcome of a run that ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub stop: StopReason,
    /// Records decoded and buffered.
    pub reads: u64,
    /// Rows made visible in the store.
    pub committed_rows: u64,
    /// Successful commits, the final forced flush included.
    pub batches: u64,
    /// Messages rejected as undecodable.
    pub rejected: u64,
}

/// Run the consume-batch-flush pipeline once.
///
/// Subscribes to `config.queue`, consumes until `max_reads`, an idle
/// timeout, the end of the consumer stream, or cancellation of `token`,
/// then commits the partially filled batch and closes the subscription.
/// Shutdown after cancellation, as well as closing the subscription, is
/// bounded by `config.grace_period`.
///
/// Commit and broker failures abort the run; the buffered remainder is
/// still flushed on a best-effort basis before the error is returned.
pub async fn run(
    config: &PipelineConfig,
    broker: &dyn Broker,
    sink: &dyn BatchSink,
    token: CancellationToken,
) -> Result<RunSummary, PipelineError> {
    config.validate()?;

    let prefetch = config.prefetch();
    let mut subscription = broker.subscribe(&config.queue, prefetch).await?;
    tracing::info!(
        queue = %config.queue,
        strategy = %config.strategy,
        prefetch,
        decode = %config.decode,
        ack_mode = %config.ack_mode,
        max_batch_size = config.max_batch_size,
        max_reads = config.max_reads,
        "subscribed"
    );

    let mut pipeline = Pipeline::new(config, sink);
    let consumed = pipeline.consume(subscription.as_mut(), &token).await;

    let outcome = match consumed {
        Ok(stop) => {
            tracing::info!(%stop, buffered = pipeline.buffered(), "draining");
            final_flush(&mut pipeline, stop, config.grace_period)
                .await
                .map(|()| stop)
        }
        Err(error) => {
            tracing::error!(
                %error,
                kind = %error.kind(),
                buffered = pipeline.buffered(),
                "run aborted, flushing remainder"
            );
            match tokio::time::timeout(config.grace_period, pipeline.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(flush_error)) => {
                    tracing::error!(error = %flush_error, "best-effort flush failed");
                }
                Err(_) => tracing::warn!("best-effort flush exceeded grace period"),
            }
            Err(error)
        }
    };

    close_subscription(subscription.as_mut(), config.grace_period).await;

    let counters = pipeline.counters();
    tracing::info!(
        reads = counters.reads,
        committed_rows = counters.committed_rows,
        batches = counters.batches,
        rejected = counters.rejected,
        "pipeline stopped"
    );

    outcome.map(|stop| RunSummary {
        stop,
        reads: counters.reads,
        committed_rows: counters.committed_rows,
        batches: counters.batches,
        rejected: counters.rejected,
    })
}

/// Forced flush of the partial batch. After cancellation the flush gets at
/// most `grace` and is abandoned afterwards; the uncommitted records are
/// then redelivered or lost depending on the ack mode.
async fn final_flush(
    pipeline: &mut Pipeline<'_>,
    stop: StopReason,
    grace: Duration,
) -> Result<(), PipelineError> {
    if stop != StopReason::Cancelled {
        return pipeline.flush().await;
    }
    match tokio::time::timeout(grace, pipeline.flush()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "final flush did not finish within grace period, abandoning"
            );
            Ok(())
        }
    }
}

async fn close_subscription(subscription: &mut dyn QueueSubscription, grace: Duration) {
    match tokio::time::timeout(grace, subscription.close()).await {
        Ok(Ok(())) => tracing::debug!("subscription closed"),
        Ok(Err(error)) => tracing::warn!(%error, "subscription close failed"),
        Err(_) => tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            "subscription close timed out, proceeding"
        ),
    }
}
