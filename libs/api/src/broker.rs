use crate::{BoxFuture, BrokerError};

// ═══════════════════════════════════════════════════════════════
//  Acknowledgement
// ═══════════════════════════════════════════════════════════════

/// Broker-side settlement of one delivery.
pub trait Acker: Send + Sync {
    /// Remove the message from the queue for good.
    fn ack(&self) -> BoxFuture<'_, Result<(), BrokerError>>;

    /// Hand the message back: `requeue = true` makes it eligible for
    /// redelivery, `false` drops it (or dead-letters it, per broker setup).
    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<(), BrokerError>>;
}

/// Settlement handle detached from the message body.
///
/// Consumed by `ack`/`reject`, so a delivery is settled at most once.
/// Dropping it unsettled leaves the message unacknowledged until the
/// subscription closes.
pub struct AckHandle {
    tag: u64,
    acker: Box<dyn Acker>,
}

impl AckHandle {
    pub fn new(tag: u64, acker: Box<dyn Acker>) -> Self {
        Self { tag, acker }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle").field("tag", &self.tag).finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Delivery
// ═══════════════════════════════════════════════════════════════

/// One message received from a queue: raw body plus its settlement handle.
#[derive(Debug)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub redelivered: bool,
    handle: AckHandle,
}

impl Delivery {
    pub fn new(tag: u64, body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            handle: AckHandle::new(tag, acker),
        }
    }

    pub fn tag(&self) -> u64 {
        self.handle.tag
    }

    /// Split into body and settlement handle, so the handle can outlive
    /// the decoded body (ack-on-commit keeps only handles around).
    pub fn into_parts(self) -> (Vec<u8>, AckHandle) {
        (self.body, self.handle)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Subscription / Broker
// ═══════════════════════════════════════════════════════════════

/// An open consumer on one queue.
pub trait QueueSubscription: Send {
    /// Wait for the next delivery. `Ok(None)` means the consumer stream
    /// ended (queue deleted, consumer cancelled by the broker).
    ///
    /// Must be cancel-safe: dropping the future before it resolves must
    /// not lose a message.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Delivery>, BrokerError>>;

    /// Stop consuming. Unsettled deliveries return to the queue.
    fn close(&mut self) -> BoxFuture<'_, Result<(), BrokerError>>;
}

/// Entry point to a message broker.
pub trait Broker: Send + Sync {
    /// Open a consumer on a durable queue, declaring it if needed.
    ///
    /// `prefetch` caps unacknowledged deliveries in flight; `0` = unbounded.
    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<Box<dyn QueueSubscription>, BrokerError>>;
}

/// Producer side, used by load generation.
pub trait Publisher: Send + Sync {
    fn publish<'a>(&'a self, queue: &'a str, body: &'a [u8]) -> BoxFuture<'a, Result<(), BrokerError>>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        settled: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Acker for Recorder {
        fn ack(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
            Box::pin(async {
                self.settled.lock().unwrap().push("ack");
                Ok(())
            })
        }

        fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<(), BrokerError>> {
            Box::pin(async move {
                let label = if requeue { "requeue" } else { "drop" };
                self.settled.lock().unwrap().push(label);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn handle_outlives_body() {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let delivery = Delivery::new(
            7,
            b"{}".to_vec(),
            false,
            Box::new(Recorder { settled: settled.clone() }),
        );
        assert_eq!(delivery.tag(), 7);

        let (body, handle) = delivery.into_parts();
        drop(body);
        assert_eq!(handle.tag(), 7);
        handle.reject(true).await.unwrap();

        assert_eq!(*settled.lock().unwrap(), vec!["requeue"]);
    }
}
