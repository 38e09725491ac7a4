use std::time::{Duration, Instant};

use broker_amqp::AmqpBroker;
use ingest_api::{BrokerError, Publisher};

use super::config::PublishSettings;
use super::error::CliError;

pub async fn run(settings: &PublishSettings) -> Result<(), CliError> {
    let broker = AmqpBroker::connect(&settings.amqp_uri).await?;
    let result = publish_numbered(&broker, &settings.queue, settings.count, settings.delay).await;
    if let Err(e) = broker.close().await {
        tracing::debug!(error = %e, "amqp connection close failed");
    }
    result?;
    println!("Published {} messages", settings.count);
    Ok(())
}

/// Body of the `n`-th test message (1-based).
pub fn numbered_message(n: u64) -> Vec<u8> {
    serde_json::json!({
        "message_number": n,
        "content": format!("Message number {n}"),
    })
    .to_string()
    .into_bytes()
}

/// Publish messages `1..=count` to `queue`, pausing `delay` after each one.
pub async fn publish_numbered(
    publisher: &dyn Publisher,
    queue: &str,
    count: u64,
    delay: Duration,
) -> Result<(), BrokerError> {
    let start = Instant::now();
    for n in 1..=count {
        publisher.publish(queue, &numbered_message(n)).await?;
        tracing::debug!(queue, message_number = n, "published");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    tracing::info!(queue, count, elapsed_ms = start.elapsed().as_millis() as u64, "publish done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use broker_memory::MemoryBroker;
    use storage_memory::MemoryTable;
    use tokio_util::sync::CancellationToken;

    use ingest_api::DecodedRecord;
    use pipeline::{DecodeMethod, PipelineConfig, StopReason, Strategy};

    use super::*;

    #[test]
    fn message_shape() {
        let body = numbered_message(3);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["message_number"], 3);
        assert_eq!(value["content"], "Message number 3");
    }

    #[tokio::test(start_paused = true)]
    async fn delay_spaces_out_messages() {
        let broker = MemoryBroker::new();
        let start = tokio::time::Instant::now();
        publish_numbered(&broker, "q", 3, Duration::from_millis(200)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert_eq!(broker.ready("q"), 3);
    }

    #[tokio::test]
    async fn published_messages_land_in_table() {
        let broker = MemoryBroker::new();
        publish_numbered(&broker, "load", 5, Duration::ZERO).await.unwrap();

        let table = MemoryTable::new();
        let config = PipelineConfig {
            queue: "load".into(),
            max_batch_size: 2,
            decode: DecodeMethod::All,
            strategy: Strategy::IteratorTimeout,
            idle_timeout: Duration::from_millis(20),
            ..PipelineConfig::default()
        };
        let summary = pipeline::run(&config, &broker, &table, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.stop, StopReason::IdleTimeout);
        assert_eq!(summary.committed_rows, 5);
        assert_eq!(table.batch_sizes().await, vec![2, 2, 1]);
        let expected: Vec<_> = (1..=5)
            .map(|n| DecodedRecord::new(format!("Message number {n}"), n))
            .collect();
        assert_eq!(table.rows().await, expected);
    }
}
