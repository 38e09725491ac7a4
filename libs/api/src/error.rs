/// Category of a broker or store failure. Lets callers decide whether an
/// error is worth surfacing as transient (retry the run) or permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration. Permanent, fail at startup.
    Config,
    /// I/O or network error. Transient, the run may be restarted.
    Io,
    /// Data rejected by the other side (constraint violation, bad payload).
    Data,
    /// Logical error (unknown tag, invalid state).
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Data => f.write_str("data"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Failure talking to the message broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker config: {0}")]
    Config(String),

    #[error("broker connection: {0}")]
    Connection(String),

    #[error("queue '{queue}': {detail}")]
    Queue { queue: String, detail: String },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("subscription closed")]
    SubscriptionClosed,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Config(_) => ErrorKind::Config,
            BrokerError::Connection(_) | BrokerError::SubscriptionClosed => ErrorKind::Io,
            BrokerError::Queue { .. } => ErrorKind::Data,
            BrokerError::UnknownDeliveryTag(_) => ErrorKind::Logic,
        }
    }
}

/// Failure persisting a batch. A batch that failed to commit left no rows
/// behind in the store.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("store config: {0}")]
    Config(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("batch rejected: {0}")]
    Rejected(String),
}

impl CommitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommitError::Config(_) => ErrorKind::Config,
            CommitError::Unavailable(_) => ErrorKind::Io,
            CommitError::Rejected(_) => ErrorKind::Data,
        }
    }
}
