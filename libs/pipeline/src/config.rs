use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

// ═══════════════════════════════════════════════════════════════
//  Selectors
// ═══════════════════════════════════════════════════════════════

/// Which decoder turns a message body into a record. Chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeMethod {
    /// Parse into a dynamic `serde_json::Value`, then pick fields.
    #[default]
    Value,
    /// Deserialize straight into an owned struct.
    Typed,
    /// Deserialize into a struct borrowing from the body where possible.
    Borrowed,
    /// Run every decoder and require identical output.
    All,
}

/// How the consumption loop pulls messages and when it gives up waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// One message at a time, unbounded prefetch, never stops on an idle queue.
    #[default]
    ManualAck,
    /// Prefetched stream; an idle wait longer than `idle_timeout` ends the run.
    IteratorTimeout,
    /// Prefetched stream without an idle limit.
    Iterator,
}

/// When a successfully buffered message is acknowledged to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// Right after the record is appended to the batch. A later commit
    /// failure loses records that were already acknowledged.
    #[default]
    OnAppend,
    /// After the batch holding the record commits. Commit failures send the
    /// messages back for redelivery, which may duplicate rows.
    OnCommit,
}

/// What happens to a message whose body cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeFailure {
    /// Reject without requeue (dropped or dead-lettered by the broker).
    #[default]
    Drop,
    /// Reject with requeue.
    Requeue,
}

macro_rules! selector {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const NAMES: &'static [&'static str] = &[$($name),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(ConfigError::UnknownSelector {
                        what: $what,
                        value: other.to_string(),
                        expected: Self::NAMES,
                    }),
                }
            }
        }
    };
}

selector!(DecodeMethod, "decode method", {
    Value => "value",
    Typed => "typed",
    Borrowed => "borrowed",
    All => "all",
});

selector!(Strategy, "strategy", {
    ManualAck => "manual-ack",
    IteratorTimeout => "iterator-timeout",
    Iterator => "iterator",
});

selector!(AckMode, "ack mode", {
    OnAppend => "on-append",
    OnCommit => "on-commit",
});

selector!(DecodeFailure, "decode failure policy", {
    Drop => "drop",
    Requeue => "requeue",
});

// ═══════════════════════════════════════════════════════════════
//  PipelineConfig
// ═══════════════════════════════════════════════════════════════

/// Immutable settings of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Durable queue to consume from.
    pub queue: String,
    /// Flush threshold: a batch is committed once it holds this many records.
    pub max_batch_size: usize,
    /// Stop after this many records were buffered.
    pub max_reads: u64,
    pub decode: DecodeMethod,
    pub strategy: Strategy,
    /// Longest wait for a message under `Strategy::IteratorTimeout`.
    pub idle_timeout: Duration,
    pub ack_mode: AckMode,
    pub decode_failure: DecodeFailure,
    /// Upper bound for the shutdown flush and for closing the subscription.
    pub grace_period: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: "test_queue".into(),
            max_batch_size: 100,
            max_reads: 10_000,
            decode: DecodeMethod::default(),
            strategy: Strategy::default(),
            idle_timeout: Duration::from_millis(100),
            ack_mode: AckMode::default(),
            decode_failure: DecodeFailure::default(),
            grace_period: Duration::from_secs(5),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::Invalid("queue name must not be empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be > 0".into()));
        }
        if self.max_reads == 0 {
            return Err(ConfigError::Invalid("max_reads must be > 0".into()));
        }
        // The broker stops delivering once a prefetch window of messages is
        // unsettled, so a batch must fit into one window.
        if self.strategy != Strategy::ManualAck && self.max_batch_size > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "max_batch_size must be <= {} for the {} strategy",
                u16::MAX,
                self.strategy
            )));
        }
        if self.strategy == Strategy::IteratorTimeout && self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "idle_timeout must be > 0 for the iterator-timeout strategy".into(),
            ));
        }
        Ok(())
    }

    /// Broker QoS for the chosen strategy: unbounded for manual-ack, one
    /// batch worth of messages for the iterator strategies.
    pub fn prefetch(&self) -> u16 {
        match self.strategy {
            Strategy::ManualAck => 0,
            Strategy::IteratorTimeout | Strategy::Iterator => {
                // `validate` keeps the batch within range.
                u16::try_from(self.max_batch_size).unwrap_or(u16::MAX)
            }
        }
    }

    /// Bounded wait per receive, if the strategy has one.
    pub fn receive_timeout(&self) -> Option<Duration> {
        match self.strategy {
            Strategy::IteratorTimeout => Some(self.idle_timeout),
            Strategy::ManualAck | Strategy::Iterator => None,
        }
    }
}
