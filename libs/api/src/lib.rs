//! Shared contracts of the queue → table ingestion pipeline.
//!
//! The pipeline core only talks to the outside world through the traits in
//! this crate: a [`Broker`] hands out [`QueueSubscription`]s that yield
//! [`Delivery`] values, and a [`BatchSink`] persists batches of
//! [`DecodedRecord`]s. Broker and storage plugins implement them.

mod broker;
mod error;
mod record;
mod sink;

use std::future::Future;
use std::pin::Pin;

pub use broker::{AckHandle, Acker, Broker, Delivery, Publisher, QueueSubscription};
pub use error::{BrokerError, CommitError, ErrorKind};
pub use record::DecodedRecord;
pub use sink::BatchSink;

/// Boxed `Send` future returned by the object-safe plugin traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
