pub mod config;
pub mod decode;
pub mod error;
mod buffer;
mod consumer;
mod driver;

pub use buffer::BatchBuffer;
pub use config::{AckMode, DecodeFailure, DecodeMethod, PipelineConfig, Strategy};
pub use consumer::StopReason;
pub use decode::Decoder;
pub use driver::{RunSummary, run};
pub use error::{ConfigError, DecodeError, PipelineError};
