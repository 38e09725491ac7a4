//! In-process broker with AMQP-like delivery semantics: prefetch limits,
//! explicit ack/reject, requeue to the head of the queue, and return of
//! unsettled deliveries when a consumer goes away.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use ingest_api::{Acker, BoxFuture, Broker, BrokerError, Delivery, Publisher, QueueSubscription};

// ═══════════════════════════════════════════════════════════════
//  Queue state
// ═══════════════════════════════════════════════════════════════

struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    consumer: u64,
    message: Message,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_consumer: u64,
    acked: u64,
    dead_letters: Vec<Vec<u8>>,
    prefetch_requests: Vec<u16>,
    /// Consumer streams end once `ready` is empty.
    ended: bool,
    /// Every receive fails, as after a lost connection.
    severed: bool,
    /// `close` never completes.
    stall_close: bool,
}

impl QueueState {
    fn unacked_by(&self, consumer: u64) -> usize {
        self.unacked.values().filter(|u| u.consumer == consumer).count()
    }

    /// Put a consumer's unsettled deliveries back at the head, oldest first.
    fn release(&mut self, consumer: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(Unacked { message, .. }) = self.unacked.remove(&tag) {
                self.ready.push_front(Message {
                    body: message.body,
                    redelivered: true,
                });
            }
        }
    }
}

struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    changes: watch::Sender<u64>,
}

enum Poll {
    Ready(Delivery),
    Ended,
    Wait,
}

impl MemoryQueue {
    fn new(name: &str) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn push(&self, body: Vec<u8>) {
        self.lock().ready.push_back(Message {
            body,
            redelivered: false,
        });
        self.notify();
    }

    fn poll(self: &Arc<Self>, consumer: u64, prefetch: u16) -> Result<Poll, BrokerError> {
        let mut state = self.lock();
        if state.severed {
            return Err(BrokerError::Connection(format!("queue '{}': connection lost", self.name)));
        }
        if prefetch > 0 && state.unacked_by(consumer) >= usize::from(prefetch) {
            return Ok(Poll::Wait);
        }
        let Some(message) = state.ready.pop_front() else {
            return Ok(if state.ended { Poll::Ended } else { Poll::Wait });
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery::new(
            tag,
            message.body.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                queue: self.clone(),
                tag,
            }),
        );
        state.unacked.insert(tag, Unacked { consumer, message });
        Ok(Poll::Ready(delivery))
    }

    fn settle(&self, tag: u64, outcome: Settle) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            let Unacked { message, .. } = state
                .unacked
                .remove(&tag)
                .ok_or(BrokerError::UnknownDeliveryTag(tag))?;
            match outcome {
                Settle::Ack => state.acked += 1,
                Settle::Requeue => state.ready.push_front(Message {
                    body: message.body,
                    redelivered: true,
                }),
                Settle::Drop => state.dead_letters.push(message.body),
            }
        }
        self.notify();
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Drop,
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    tag: u64,
}

impl Acker for MemoryAcker {
    fn ack(&self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move { self.queue.settle(self.tag, Settle::Ack) })
    }

    fn reject(&self, requeue: bool) -> BoxFuture<'_, Result<(), BrokerError>> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Drop };
        Box::pin(async move { self.queue.settle(self.tag, outcome) })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemorySubscription
// ═══════════════════════════════════════════════════════════════

pub struct MemorySubscription {
    queue: Arc<MemoryQueue>,
    consumer: u64,
    prefetch: u16,
    changes: watch::Receiver<u64>,
    closed: bool,
}

impl MemorySubscription {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.queue.lock().release(self.consumer);
            self.queue.notify();
        }
    }
}

impl QueueSubscription for MemorySubscription {
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Delivery>, BrokerError>> {
        Box::pin(async move {
            if self.closed {
                return Err(BrokerError::SubscriptionClosed);
            }
            loop {
                self.changes.borrow_and_update();
                match self.queue.poll(self.consumer, self.prefetch)? {
                    Poll::Ready(delivery) => return Ok(Some(delivery)),
                    Poll::Ended => return Ok(None),
                    Poll::Wait => {}
                }
                if self.changes.changed().await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), BrokerError>> {
        Box::pin(async move {
            if self.queue.lock().stall_close {
                std::future::pending::<()>().await;
            }
            self.release();
            tracing::debug!(queue = %self.queue.name, consumer = self.consumer, "memory subscription closed");
            Ok(())
        })
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

/// Named in-memory queues, created on first use.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name)))
            .clone()
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut QueueState)) {
        let queue = self.queue(name);
        f(&mut queue.lock());
        queue.notify();
    }

    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.queue(queue).push(body.into());
    }

    /// End consumer streams once the ready messages are gone.
    pub fn end_stream(&self, queue: &str) {
        self.update(queue, |s| s.ended = true);
    }

    /// Make every receive on the queue fail like a dropped connection.
    pub fn sever(&self, queue: &str) {
        self.update(queue, |s| s.severed = true);
    }

    /// Make `close` on subscriptions of the queue hang forever.
    pub fn stall_close(&self, queue: &str) {
        self.update(queue, |s| s.stall_close = true);
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.queue(queue).lock().ready.len()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.queue(queue).lock().unacked.len()
    }

    pub fn acked(&self, queue: &str) -> u64 {
        self.queue(queue).lock().acked
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queue(queue).lock().dead_letters.clone()
    }

    /// Prefetch values requested by subscribers, in subscription order.
    pub fn prefetch_requests(&self, queue: &str) -> Vec<u16> {
        self.queue(queue).lock().prefetch_requests.clone()
    }
}

impl Broker for MemoryBroker {
    fn subscribe<'a>(
        &'a self,
        queue: &'a str,
        prefetch: u16,
    ) -> BoxFuture<'a, Result<Box<dyn QueueSubscription>, BrokerError>> {
        Box::pin(async move {
            let queue = self.queue(queue);
            let consumer = {
                let mut state = queue.lock();
                state.next_consumer += 1;
                state.prefetch_requests.push(prefetch);
                state.next_consumer
            };
            let changes = queue.changes.subscribe();
            Ok(Box::new(MemorySubscription {
                queue,
                consumer,
                prefetch,
                changes,
                closed: false,
            }) as Box<dyn QueueSubscription>)
        })
    }
}

impl Publisher for MemoryBroker {
    fn publish<'a>(&'a self, queue: &'a str, body: &'a [u8]) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.push(queue, body);
            Ok(())
        })
    }
}
