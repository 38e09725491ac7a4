use ingest_api::{BrokerError, CommitError, DecodedRecord, ErrorKind};

use crate::config::DecodeMethod;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown {what} '{value}' (expected one of: {})", .expected.join(", "))]
    UnknownSelector {
        what: &'static str,
        value: String,
        expected: &'static [&'static str],
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a message body could not be turned into a record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("body is not a JSON object")]
    NotAnObject,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is not {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("decoders disagree: {method} produced {got:?}, {reference} produced {expected:?}")]
    Disagreement {
        method: DecodeMethod,
        got: DecodedRecord,
        reference: DecodeMethod,
        expected: DecodedRecord,
    },
}

/// Fatal failure of a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("commit of {rows} rows failed: {source}")]
    Commit { rows: usize, source: CommitError },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Broker(e) => e.kind(),
            PipelineError::Commit { source, .. } => source.kind(),
        }
    }
}
