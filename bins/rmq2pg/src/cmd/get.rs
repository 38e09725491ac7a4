use std::io::Write;
use std::time::Duration;

use broker_amqp::AmqpBroker;
use ingest_api::{Broker, QueueSubscription};

use super::config::GetSettings;
use super::error::CliError;

pub async fn run(settings: &GetSettings) -> Result<(), CliError> {
    let broker = AmqpBroker::connect(&settings.amqp_uri).await?;
    let mut stdout = std::io::stdout();
    let result = get_messages(
        &broker,
        &settings.queue,
        settings.count,
        settings.delay,
        settings.wait,
        &mut stdout,
    )
    .await;
    if let Err(e) = broker.close().await {
        tracing::debug!(error = %e, "amqp connection close failed");
    }
    let received = result?;
    tracing::info!(queue = %settings.queue, received, "get done");
    Ok(())
}

/// Take up to `count` messages off `queue`, acking and printing each one.
/// Stops early once the queue stays empty for `wait`.
pub async fn get_messages(
    broker: &dyn Broker,
    queue: &str,
    count: u64,
    delay: Duration,
    wait: Duration,
    out: &mut dyn Write,
) -> Result<u64, CliError> {
    let mut subscription = broker.subscribe(queue, 1).await?;
    let outcome = drain(subscription.as_mut(), count, delay, wait, out).await;
    if let Err(e) = subscription.close().await {
        tracing::debug!(queue, error = %e, "subscription close failed");
    }
    outcome
}

async fn drain(
    subscription: &mut dyn QueueSubscription,
    count: u64,
    delay: Duration,
    wait: Duration,
    out: &mut dyn Write,
) -> Result<u64, CliError> {
    let mut received = 0;
    while received < count {
        let delivery = match tokio::time::timeout(wait, subscription.recv()).await {
            Ok(Ok(Some(delivery))) => delivery,
            Ok(Ok(None)) | Err(_) => {
                writeln!(out, "No more messages in the queue.")?;
                break;
            }
            Ok(Err(e)) => return Err(e.into()),
        };
        let (body, handle) = delivery.into_parts();
        writeln!(out, "Received message: {}", String::from_utf8_lossy(&body))?;
        handle.ack().await?;
        received += 1;
        if !delay.is_zero() && received < count {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use broker_memory::MemoryBroker;

    use super::*;

    fn lines(out: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(out).lines().map(str::to_string).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_ends_early() {
        let broker = MemoryBroker::new();
        broker.push("q", r#"{"message_number":1}"#);
        broker.push("q", r#"{"message_number":2}"#);

        let mut out = Vec::new();
        let received = get_messages(&broker, "q", 5, Duration::ZERO, Duration::from_millis(50), &mut out)
            .await
            .unwrap();

        assert_eq!(received, 2);
        assert_eq!(
            lines(&out),
            vec![
                r#"Received message: {"message_number":1}"#,
                r#"Received message: {"message_number":2}"#,
                "No more messages in the queue.",
            ]
        );
        assert_eq!(broker.acked("q"), 2);
        assert_eq!(broker.ready("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_count_and_leaves_the_rest() {
        let broker = MemoryBroker::new();
        for n in 1..=3 {
            broker.push("q", format!("m{n}"));
        }

        let mut out = Vec::new();
        let start = tokio::time::Instant::now();
        let received = get_messages(&broker, "q", 2, Duration::from_millis(100), Duration::from_secs(1), &mut out)
            .await
            .unwrap();

        assert_eq!(received, 2);
        assert_eq!(lines(&out), vec!["Received message: m1", "Received message: m2"]);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(broker.acked("q"), 2);
        assert_eq!(broker.ready("q") + broker.unacked("q"), 1);
    }
}
