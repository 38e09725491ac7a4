use tokio_util::sync::CancellationToken;

use broker_amqp::AmqpBroker;
use pipeline::RunSummary;
use storage_postgres::PostgresSink;

use super::config::ConsumeSettings;
use super::error::CliError;

pub async fn run(settings: &ConsumeSettings) -> Result<RunSummary, CliError> {
    let sink = PostgresSink::connect(&settings.postgres).await?;
    let broker = match AmqpBroker::connect(&settings.amqp_uri).await {
        Ok(b) => b,
        Err(e) => {
            sink.close().await;
            return Err(e.into());
        }
    };

    let token = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_shutdown_signal(token.clone()));

    let result = pipeline::run(&settings.pipeline, &broker, &sink, token).await;
    signals.abort();

    if let Err(e) = broker.close().await {
        tracing::debug!(error = %e, "amqp connection close failed");
    }
    sink.close().await;

    let summary = result?;
    tracing::info!(
        stop = %summary.stop,
        reads = summary.reads,
        committed_rows = summary.committed_rows,
        batches = summary.batches,
        rejected = summary.rejected,
        "run summary"
    );
    Ok(summary)
}

/// Cancel `token` on Ctrl+C, or SIGTERM on unix.
async fn cancel_on_shutdown_signal(token: CancellationToken) {
    match shutdown_signal().await {
        Ok(()) => {
            tracing::info!("shutdown signal received, finishing current batch");
            token.cancel();
        }
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signals"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
