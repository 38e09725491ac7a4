use std::fmt;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use ingest_api::{AckHandle, BatchSink, BrokerError, Delivery, QueueSubscription};

use crate::buffer::BatchBuffer;
use crate::config::{AckMode, DecodeFailure, PipelineConfig};
use crate::decode::Decoder;
use crate::error::PipelineError;

/// Why the consumption loop left its receiving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `max_reads` records were buffered.
    MaxReads,
    /// No message arrived within the idle timeout.
    IdleTimeout,
    /// The cancellation token fired while waiting for a message.
    Cancelled,
    /// The broker ended the consumer stream.
    QueueClosed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxReads => f.write_str("max reads reached"),
            StopReason::IdleTimeout => f.write_str("idle timeout"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::QueueClosed => f.write_str("queue closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub reads: u64,
    pub committed_rows: u64,
    pub batches: u64,
    pub rejected: u64,
}

enum Received {
    Message(Delivery),
    Idle,
    Cancelled,
    Closed,
}

// ═══════════════════════════════════════════════════════════════
//  Pipeline state
// ═══════════════════════════════════════════════════════════════

/// All mutable state of one run, owned by the single task driving it.
pub(crate) struct Pipeline<'a> {
    config: &'a PipelineConfig,
    decoder: Decoder,
    sink: &'a dyn BatchSink,
    buffer: BatchBuffer,
    /// Ack-on-commit: handles of buffered messages awaiting their commit.
    unsettled: Vec<AckHandle>,
    counters: Counters,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, sink: &'a dyn BatchSink) -> Self {
        Self {
            config,
            decoder: Decoder::new(config.decode),
            sink,
            buffer: BatchBuffer::with_capacity(config.max_batch_size),
            unsettled: Vec::new(),
            counters: Counters::default(),
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Receive → decode → buffer → maybe flush → ack, until a stop condition.
    pub async fn consume(
        &mut self,
        subscription: &mut dyn QueueSubscription,
        token: &CancellationToken,
    ) -> Result<StopReason, PipelineError> {
        while self.counters.reads < self.config.max_reads {
            let delivery = match self.receive(subscription, token).await? {
                Received::Message(delivery) => delivery,
                Received::Idle => {
                    tracing::info!(
                        idle_timeout_ms = self.config.idle_timeout.as_millis() as u64,
                        "no messages during idle timeout, stopping"
                    );
                    return Ok(StopReason::IdleTimeout);
                }
                Received::Cancelled => {
                    tracing::info!("cancelled while waiting for messages");
                    return Ok(StopReason::Cancelled);
                }
                Received::Closed => {
                    tracing::warn!(queue = %self.config.queue, "consumer stream ended");
                    return Ok(StopReason::QueueClosed);
                }
            };
            self.handle(delivery).await?;
        }
        Ok(StopReason::MaxReads)
    }

    /// Wait for the next message, bounded by the idle timeout if the
    /// strategy has one. Cancellation wins over a ready message.
    async fn receive(
        &self,
        subscription: &mut dyn QueueSubscription,
        token: &CancellationToken,
    ) -> Result<Received, BrokerError> {
        let limit = self.config.receive_timeout();
        let next = async move {
            let recv = subscription.recv();
            let delivery = match limit {
                Some(limit) => match tokio::time::timeout(limit, recv).await {
                    Ok(result) => result?,
                    Err(_) => return Ok(Received::Idle),
                },
                None => recv.await?,
            };
            Ok::<_, BrokerError>(match delivery {
                Some(delivery) => Received::Message(delivery),
                None => Received::Closed,
            })
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(Received::Cancelled),
            received = next => received,
        }
    }

    async fn handle(&mut self, delivery: Delivery) -> Result<(), PipelineError> {
        let redelivered = delivery.redelivered;
        let (body, handle) = delivery.into_parts();

        let decoded = tracing::debug_span!("decode", method = %self.config.decode)
            .in_scope(|| self.decoder.decode(&body));
        let record = match decoded {
            Ok(record) => record,
            Err(error) => {
                let requeue = self.config.decode_failure == DecodeFailure::Requeue;
                tracing::warn!(
                    tag = handle.tag(),
                    redelivered,
                    requeue,
                    %error,
                    "undecodable message, rejecting"
                );
                handle.reject(requeue).await?;
                self.counters.rejected += 1;
                return Ok(());
            }
        };

        self.buffer.append(record);
        self.counters.reads += 1;
        let full = self.buffer.should_flush(self.config.max_batch_size);

        match self.config.ack_mode {
            AckMode::OnAppend => {
                if full {
                    if let Err(error) = self.flush().await {
                        if let Err(e) = handle.reject(true).await {
                            tracing::warn!(error = %e, "could not requeue message after failed commit");
                        }
                        return Err(error);
                    }
                }
                handle.ack().await?;
            }
            AckMode::OnCommit => {
                self.unsettled.push(handle);
                if full {
                    self.flush().await?;
                }
            }
        }
        Ok(())
    }

    /// Commit whatever is buffered as one batch. No-op on an empty buffer.
    pub async fn flush(&mut self) -> Result<(), PipelineError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = self.buffer.drain();
        let rows = batch.len();
        let started = Instant::now();

        let committed = self
            .sink
            .commit(&batch)
            .instrument(tracing::debug_span!("commit", rows))
            .await;
        if let Err(source) = committed {
            tracing::error!(rows, error = %source, kind = %source.kind(), "batch commit failed");
            self.requeue_unsettled().await;
            return Err(PipelineError::Commit { rows, source });
        }

        self.counters.batches += 1;
        self.counters.committed_rows += rows as u64;
        tracing::debug!(
            rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch committed"
        );

        for handle in std::mem::take(&mut self.unsettled) {
            handle.ack().await?;
        }
        Ok(())
    }

    async fn requeue_unsettled(&mut self) {
        for handle in std::mem::take(&mut self.unsettled) {
            let tag = handle.tag();
            if let Err(error) = handle.reject(true).await {
                tracing::warn!(tag, %error, "could not requeue message after failed commit");
            }
        }
    }
}
