pub mod config;
pub mod consume;
pub mod error;
pub mod get;
pub mod publish;
