use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};

use ingest_api::{Acker, BoxFuture, Broker, BrokerError, Delivery, Publisher, QueueSubscription};

const CONSUMER_TAG: &str = "rmq2pg";
const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

fn connection_error(e: lapin::Error) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

fn queue_error(queue: &str) -> impl Fn(lapin::Error) -> BrokerError + '_ {
    move |e| BrokerError::Queue {
        queue: queue.to_string(),
        detail: e.to_string(),
    }
}

async fn declare(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(queue_error(queue))?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
//  AmqpBroker
// ═══════════════════════════════════════════════════════════════

/// RabbitMQ over AMQP 0-9-1.
///
/// Each subscription gets its own channel so its QoS and unacked set are
/// independent. Publishing shares one channel with confirms enabled.
pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Channel,
    declared: Mutex<HashSet<String>>,
}

impl AmqpBroker {
    pub async fn connect(uri: &str) -> Result<Self, BrokerError> {
        if !uri.starts_with("amqp://") && !uri.starts_with("amqps://") {
            return Err(BrokerError::Config(format!("not an amqp uri: '{uri}'")));
        }
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(connection_error)?;
        let publish_channel = connection.create_channel().await.map_err(connection_error)?;
        publish_channel
            .confirm_select(Default::default())
            .await
            .map_err(connection_error)?;
        tracing::info!("connected to amqp broker");
        Ok(Self {
            connection,
            publish_channel,
            declared: Mutex::new(HashSet::new()),
        })
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.connection
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(connection_error)
    }

    fn is_declared(&self, queue: &str) -> bool {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue)
    }

    fn mark_declared(&self, queue: &str) {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string());
    }
}

impl Broker for AmqpBroker {
    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<Box<dyn QueueSubscription>, BrokerError>> {
        Box::pin(async move {
            let channel = self.connection.create_channel().await.map_err(connection_error)?;
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(connection_error)?;
            declare(&channel, queue).await?;
            let consumer = channel
                .basic_consume(
                    queue,
                    CONSUMER_TAG,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(queue_error(queue))?;
            tracing::debug!(queue, prefetch, channel = channel.id(), "amqp consumer started");
            Ok(Box::new(AmqpSubscription {
                channel,
                consumer,
                queue: queue.to_string(),
                closed: false,
            }) as Box<dyn QueueSubscription>)
        })
    }
}

impl Publisher for AmqpBroker {
    fn publish<'a>(&'a self, queue: &'a str, body: &'a [u8]) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            if !self.is_declared(queue) {
                declare(&self.publish_channel, queue).await?;
                self.mark_declared(queue);
            }
            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(PERSISTENT);
            let confirm = self
                .publish_channel
                .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
                .await
                .map_err(queue_error(queue))?;
            let confirmation = confirm.await.map_err(queue_error(queue))?;
            if confirmation.is_nack() {
                return Err(BrokerError::Queue {
                    queue: queue.to_string(),
                    detail: "publish not confirmed".into(),
                });
            }
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  AmqpSubscription
// ═══════════════════════════════════════════════════════════════

struct AmqpSubscription {
    channel: Channel,
    consumer: Consumer,
    queue: String,
    closed: bool,
}

impl QueueSubscription for AmqpSubscription {
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Delivery>, BrokerError>> {
        Box::pin(async move {
            if self.closed {
                return Err(BrokerError::SubscriptionClosed);
            }
            match self.consumer.next().await {
                Some(Ok(delivery)) => Ok(Some(Delivery::new(
                    delivery.delivery_tag,
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                ))),
                Some(Err(e)) => Err(queue_error(&self.queue)(e)),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            let tag = self.consumer.tag();
            if let Err(e) = self
                .channel
                .basic_cancel(tag.as_str(), BasicCancelOptions::default())
                .await
            {
                tracing::debug!(queue = %self.queue, error = %e, "basic.cancel failed");
            }
            // Closing the channel returns every unacked delivery to the queue.
            self.channel
                .close(REPLY_SUCCESS, "consumer closed")
                .await
                .map_err(connection_error)
        })
    }
}

struct AmqpAcker(lapin::acker::Acker);

impl Acker for AmqpAcker {
    fn ack(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.0
                .ack(BasicAckOptions::default())
                .await
                .map(|_| ())
                .map_err(connection_error)
        })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            self.0
                .reject(BasicRejectOptions { requeue })
                .await
                .map(|_| ())
                .map_err(connection_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use ingest_api::ErrorKind;

    use super::*;

    #[tokio::test]
    async fn rejects_non_amqp_uri() {
        let err = match AmqpBroker::connect("postgres://localhost/db").await {
            Ok(_) => panic!("connected with a postgres uri"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn lapin_errors_keep_queue_name() {
        let err = queue_error("orders")(lapin::Error::ChannelsLimitReached);
        assert!(err.to_string().starts_with("queue 'orders':"), "{err}");
    }
}
