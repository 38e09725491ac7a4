use ingest_api::{BrokerError, CommitError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    InvalidConfig(#[from] pipeline::ConfigError),

    #[error("{0}")]
    Broker(#[from] BrokerError),

    #[error("{0}")]
    Store(#[from] CommitError),

    #[error("{0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("output: {0}")]
    Output(#[from] std::io::Error),
}
